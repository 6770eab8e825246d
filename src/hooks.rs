// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Observer callbacks attached to a call.
//!
//! Hooks are best-effort. An error returned from a hook, or a panic inside one, is logged at
//! `DEBUG` and discarded, and the call carries on as if the hook had succeeded.

use crate::envelope::ResponseEnvelope;
use crate::error::{Error, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use surf::Request;
use tracing::{event, Level};

/// Receives notifications about the lifecycle of a single call.
pub trait RequestEventHandler: Send + Sync {
    /// Called just before the request is handed to the transport.
    fn on_request(&self, _request: &Request) -> Result<()> {
        Ok(())
    }

    /// Called once the response headers have arrived, before the body is read.
    fn on_response(&self, _response: &ResponseEnvelope) -> Result<()> {
        Ok(())
    }

    /// Called when the call fails before a response is available.
    fn on_error(&self, _error: &Error) -> Result<()> {
        Ok(())
    }
}

/// A callback which may adjust the outgoing request right before it is sent.
pub type PreSendHook = Arc<dyn Fn(&mut Request) -> Result<()> + Send + Sync>;

/// Run `hook`, logging and discarding any failure.
pub(crate) fn invoke(name: &str, hook: impl FnOnce() -> Result<()>) {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            event!(Level::DEBUG, "{} hook failed: {}", name, err);
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            event!(Level::DEBUG, "{} hook panicked: {}", name, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn failures_are_discarded() {
        let calls = AtomicUsize::new(0);
        invoke("failing", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::invalid_argument("hook", "broken"))
        });
        invoke("panicking", || {
            calls.fetch_add(1, Ordering::SeqCst);
            panic!("observer bug")
        });
        invoke("fine", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
