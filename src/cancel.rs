// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Cooperative cancellation.
//!
//! Every asynchronous operation in this crate takes a [CancellationToken]. Cancellation is
//! observed at suspension points and reported as [Error::Cancelled].

use crate::error::{Error, Result};
use futures::future::{self, Either};
use std::future::Future;

pub use tokio_util::sync::CancellationToken;

/// Run `fut` until it completes or `cancel` is triggered, whichever happens first.
pub async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let cancelled = cancel.cancelled();
    futures::pin_mut!(fut);
    futures::pin_mut!(cancelled);
    match future::select(fut, cancelled).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(_) => Err(Error::Cancelled),
    }
}

/// Drive `fut` to completion on the calling thread.
///
/// Backs the blocking twin of every asynchronous entry point. It must not be called from within
/// an asynchronous task.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    futures::executor::block_on(fut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        assert_eq!(cancellable(&cancel, async { 3 }).await.unwrap(), 3);
    }

    #[async_std::test]
    async fn reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cancellable(&cancel, future::pending::<()>()).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[async_std::test]
    async fn stops_pending_work_when_cancelled_later() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        async_std::task::spawn(async move {
            async_std::task::sleep(std::time::Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = cancellable(&cancel, future::pending::<()>()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
