// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Postconditions over a completed response.
//!
//! An [AssertionBuilder] collects checks; [Assertions::evaluate] runs them in the order they
//! were added and stops at the first failure, which is reported as [Error::AssertionFailed]
//! with the expected and actual values. Arguments which can never be satisfied (an empty
//! status list, a zero duration) are rejected when the check is added, not when it runs.

use crate::cancel::{block_on, CancellationToken};
use crate::config::ServiceContext;
use crate::envelope::ResponseEnvelope;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

/// The response under test.
#[derive(Debug)]
pub struct AssertionContext {
    response: ResponseEnvelope,
}

impl AssertionContext {
    pub fn new(response: ResponseEnvelope) -> Self {
        Self { response }
    }

    pub fn status(&self) -> u16 {
        self.response.status()
    }

    pub fn is_success(&self) -> bool {
        self.response.is_success()
    }

    pub fn elapsed(&self) -> Duration {
        self.response.elapsed()
    }

    pub fn service_context(&self) -> Option<&Arc<ServiceContext>> {
        self.response.context()
    }

    pub fn response(&self) -> &ResponseEnvelope {
        &self.response
    }

    /// The body as text, read once and cached for later checks.
    pub async fn text(&mut self, cancel: &CancellationToken) -> Result<&str> {
        self.response.text(cancel).await
    }

    pub fn into_response(self) -> ResponseEnvelope {
        self.response
    }
}

impl From<ResponseEnvelope> for AssertionContext {
    fn from(response: ResponseEnvelope) -> Self {
        Self::new(response)
    }
}

#[async_trait]
pub trait Assertion: Send + Sync {
    /// Check the response, returning [Error::AssertionFailed] if the condition does not hold.
    async fn check(&self, context: &mut AssertionContext, cancel: &CancellationToken)
        -> Result<()>;
}

fn failed(message: String) -> Error {
    Error::AssertionFailed { message }
}

enum Check {
    Status(u16),
    StatusIn(Vec<u16>),
    Success,
    BodyContains(String),
    HeaderExists(String),
    HeaderEquals(String, String),
    HeaderContains(String, String),
    DurationUnder(Duration),
}

#[async_trait]
impl Assertion for Check {
    async fn check(
        &self,
        context: &mut AssertionContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let response = &context.response;
        match self {
            Check::Status(expected) => {
                if response.status() != *expected {
                    return Err(failed(format!(
                        "expected status code {}, got {}",
                        expected,
                        response.status()
                    )));
                }
            }
            Check::StatusIn(allowed) => {
                if !allowed.contains(&response.status()) {
                    return Err(failed(format!(
                        "expected status code in {:?}, got {}",
                        allowed,
                        response.status()
                    )));
                }
            }
            Check::Success => {
                if !response.is_success() {
                    return Err(failed(format!(
                        "expected a success status code (2xx), got {}",
                        response.status()
                    )));
                }
            }
            Check::BodyContains(needle) => {
                let body = context.text(cancel).await?;
                if !body.to_lowercase().contains(&needle.to_lowercase()) {
                    return Err(failed(format!(
                        "expected body to contain {:?}, got {:?}",
                        needle, body
                    )));
                }
            }
            Check::HeaderExists(name) => {
                if !response.headers().contains(name) && !response.content_headers().contains(name)
                {
                    return Err(failed(format!("expected header {} to be present", name)));
                }
            }
            Check::HeaderEquals(name, expected) => match response.header(name) {
                Some(actual) if actual == expected => {}
                Some(actual) => {
                    return Err(failed(format!(
                        "expected header {} to equal {:?}, got {:?}",
                        name, expected, actual
                    )))
                }
                None => {
                    return Err(failed(format!(
                        "expected header {} to equal {:?}, but it is missing",
                        name, expected
                    )))
                }
            },
            Check::HeaderContains(name, needle) => {
                let needle = needle.to_lowercase();
                let values: Vec<&str> = response
                    .headers()
                    .get_all(name)
                    .chain(response.content_headers().get_all(name))
                    .collect();
                if !values
                    .iter()
                    .any(|value| value.to_lowercase().contains(&needle))
                {
                    return Err(failed(format!(
                        "expected header {} to contain {:?}, got {:?}",
                        name, needle, values
                    )));
                }
            }
            Check::DurationUnder(limit) => {
                if response.elapsed() >= *limit {
                    return Err(failed(format!(
                        "expected request to complete in under {:?}, took {:?}",
                        limit,
                        response.elapsed()
                    )));
                }
            }
        }
        Ok(())
    }
}

struct FnAssertion<F>(F);

#[async_trait]
impl<F> Assertion for FnAssertion<F>
where
    F: Fn(&AssertionContext) -> Result<()> + Send + Sync,
{
    async fn check(&self, context: &mut AssertionContext, _: &CancellationToken) -> Result<()> {
        (self.0)(context)
    }
}

#[derive(Clone, Default)]
pub struct AssertionBuilder {
    steps: Vec<Arc<dyn Assertion>>,
}

impl AssertionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, assertion: impl Assertion + 'static) -> Self {
        self.steps.push(Arc::new(assertion));
        self
    }

    /// The status code equals `status`, given as a number or a [surf::StatusCode].
    pub fn status_code(self, status: impl Into<u16>) -> Self {
        self.push(Check::Status(status.into()))
    }

    /// The status code is one of `allowed`, which must not be empty.
    pub fn status_code_in<S: Into<u16>>(
        self,
        allowed: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        let allowed: Vec<u16> = allowed.into_iter().map(Into::into).collect();
        if allowed.is_empty() {
            return Err(Error::invalid_argument(
                "allowed",
                "at least one status code is required",
            ));
        }
        Ok(self.push(Check::StatusIn(allowed)))
    }

    pub fn success_status(self) -> Self {
        self.push(Check::Success)
    }

    /// The body contains `text`, ignoring case.
    pub fn body_contains(self, text: impl Into<String>) -> Self {
        self.push(Check::BodyContains(text.into()))
    }

    pub fn header_exists(self, name: impl Into<String>) -> Self {
        self.push(Check::HeaderExists(name.into()))
    }

    /// The first value of the header equals `value` exactly.
    pub fn header_equals(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(Check::HeaderEquals(name.into(), value.into()))
    }

    /// Some value of the header contains `value`, ignoring case.
    pub fn header_contains(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(Check::HeaderContains(name.into(), value.into()))
    }

    /// The request took strictly less than `limit`, which must be positive.
    pub fn duration_under(self, limit: Duration) -> Result<Self> {
        if limit == Duration::ZERO {
            return Err(Error::invalid_argument("limit", "duration must be positive"));
        }
        Ok(self.push(Check::DurationUnder(limit)))
    }

    pub fn with(self, assertion: impl Assertion + 'static) -> Self {
        self.push(assertion)
    }

    /// A synchronous check written as a closure.
    pub fn check<F>(self, f: F) -> Self
    where
        F: Fn(&AssertionContext) -> Result<()> + Send + Sync + 'static,
    {
        self.push(FnAssertion(f))
    }

    pub fn build(self) -> Assertions {
        Assertions { steps: self.steps }
    }
}

#[derive(Clone, Default)]
pub struct Assertions {
    steps: Vec<Arc<dyn Assertion>>,
}

impl Assertions {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every check in order, stopping at the first failure.
    pub async fn evaluate(
        &self,
        context: &mut AssertionContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for (index, step) in self.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Err(err) = step.check(context, cancel).await {
                event!(Level::DEBUG, "assertion {} failed: {}", index, err);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn evaluate_blocking(&self, context: &mut AssertionContext) -> Result<()> {
        block_on(self.evaluate(context, &CancellationToken::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use surf::StatusCode;

    fn context() -> AssertionContext {
        AssertionContext::new(
            ResponseEnvelope::new(200u16)
                .with_header("X-Request-Id", "Abc-123")
                .unwrap()
                .with_header("Vary", "Accept")
                .unwrap()
                .with_header("Vary", "Accept-Encoding")
                .unwrap()
                .with_header("Content-Type", "application/json")
                .unwrap()
                .with_body(r#"{"Status":"OK"}"#)
                .with_elapsed(Duration::from_millis(100)),
        )
    }

    fn message(err: Error) -> String {
        match err {
            Error::AssertionFailed { message } => message,
            other => panic!("unexpected error {}", other),
        }
    }

    #[async_std::test]
    async fn passing_checks() {
        let assertions = AssertionBuilder::new()
            .status_code(StatusCode::Ok)
            .status_code_in(vec![200u16, 201])
            .unwrap()
            .success_status()
            .body_contains("status\":\"ok")
            .header_exists("x-request-id")
            .header_exists("content-type")
            .header_equals("X-Request-Id", "Abc-123")
            .header_equals("Content-Type", "application/json")
            .header_contains("vary", "ENCODING")
            .duration_under(Duration::from_millis(101))
            .unwrap()
            .check(|ctx| {
                if ctx.elapsed() > Duration::ZERO {
                    Ok(())
                } else {
                    Err(Error::AssertionFailed {
                        message: "no timing".into(),
                    })
                }
            })
            .build();
        assert_eq!(assertions.len(), 11);
        assertions
            .evaluate(&mut context(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[test]
    fn header_equals_is_case_sensitive() {
        let err = AssertionBuilder::new()
            .header_equals("x-request-id", "abc-123")
            .build()
            .evaluate_blocking(&mut context())
            .unwrap_err();
        assert!(message(err).contains("\"Abc-123\""));

        AssertionBuilder::new()
            .header_contains("X-REQUEST-ID", "abc")
            .build()
            .evaluate_blocking(&mut context())
            .unwrap();
    }

    #[test]
    fn duration_under_is_strict() {
        let err = AssertionBuilder::new()
            .duration_under(Duration::from_millis(100))
            .unwrap()
            .build()
            .evaluate_blocking(&mut context())
            .unwrap_err();
        assert!(message(err).contains("100ms"));
    }

    #[test]
    fn invalid_arguments_fail_at_build_time() {
        assert!(matches!(
            AssertionBuilder::new().duration_under(Duration::ZERO),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            AssertionBuilder::new().status_code_in(Vec::<u16>::new()),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn stops_at_first_failure() {
        let later = Arc::new(AtomicUsize::new(0));
        let counter = later.clone();
        let err = AssertionBuilder::new()
            .status_code(404u16)
            .check(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build()
            .evaluate_blocking(&mut context())
            .unwrap_err();
        assert_eq!(message(err), "expected status code 404, got 200");
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_headers_fail() {
        for builder in vec![
            AssertionBuilder::new().header_exists("etag"),
            AssertionBuilder::new().header_equals("etag", "x"),
            AssertionBuilder::new().header_contains("etag", "x"),
            AssertionBuilder::new().body_contains("missing"),
        ] {
            assert!(builder.build().evaluate_blocking(&mut context()).is_err());
        }
    }

    struct ReadsBody;

    #[async_trait]
    impl Assertion for ReadsBody {
        async fn check(
            &self,
            context: &mut AssertionContext,
            cancel: &CancellationToken,
        ) -> Result<()> {
            let text = context.text(cancel).await?;
            if text.starts_with('{') {
                Ok(())
            } else {
                Err(failed(format!("expected a JSON object, got {:?}", text)))
            }
        }
    }

    #[async_std::test]
    async fn custom_assertions_share_the_cached_body() {
        let mut ctx = context();
        AssertionBuilder::new()
            .with(ReadsBody)
            .body_contains("ok")
            .with(ReadsBody)
            .build()
            .evaluate(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ctx.text(&CancellationToken::new()).await.unwrap(), r#"{"Status":"OK"}"#);
    }

    #[async_std::test]
    async fn cancelled_evaluation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = AssertionBuilder::new()
            .success_status()
            .build()
            .evaluate(&mut context(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
