// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! A read-only view of a completed response.
//!
//! The body of a [ResponseEnvelope] is read from the transport at most once. The first read
//! buffers it, and the decoded string is cached the first time it is requested, so converters
//! and assertions can all look at the body without re-reading the stream. Reads take
//! `&mut self`: the cache is not meant to be shared between tasks without external
//! synchronization.

use crate::cancel::{block_on, cancellable, CancellationToken};
use crate::config::ServiceContext;
use crate::content::{charset_of, parse_mime};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::convert::TryFrom;
use std::fmt::{self, Debug, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use surf::http::headers::{self, HeaderName, HeaderValue, HeaderValues};
use surf::http::Mime;
use surf::{Body, StatusCode};

/// Headers which describe the body rather than the response.
pub const CONTENT_HEADERS: [HeaderName; 10] = [
    headers::ALLOW,
    headers::CONTENT_ENCODING,
    headers::CONTENT_LANGUAGE,
    headers::CONTENT_LENGTH,
    headers::CONTENT_LOCATION,
    headers::CONTENT_MD5,
    headers::CONTENT_RANGE,
    headers::CONTENT_TYPE,
    headers::EXPIRES,
    headers::LAST_MODIFIED,
];

pub fn is_content_header(name: &HeaderName) -> bool {
    // http-types has no CONTENT_DISPOSITION constant and no public const constructor.
    CONTENT_HEADERS.contains(name) || name.as_str() == "content-disposition"
}

pub(crate) fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_str(name).map_err(|err| Error::invalid_argument(name, err.to_string()))
}

pub(crate) fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| Error::invalid_argument(name, err.to_string()))
}

/// Multi-valued headers in insertion order.
///
/// Names are [HeaderName]s, so lookups are case-insensitive.
#[derive(Clone, Default)]
pub struct HeaderCollection {
    entries: IndexMap<HeaderName, HeaderValues>,
}

impl Debug for HeaderCollection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl HeaderCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, validating the name and value.
    pub fn append(&mut self, name: &str, value: &str) -> Result<()> {
        self.append_value(header_name(name)?, header_value(name, value)?);
        Ok(())
    }

    pub fn append_value(&mut self, name: HeaderName, value: HeaderValue) {
        match self.entries.get_mut(&name) {
            Some(values) => values.append(&mut HeaderValues::from(value)),
            None => {
                self.entries.insert(name, HeaderValues::from(value));
            }
        }
    }

    /// Replace every value of `name` with `value`.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let value = header_value(name, value)?;
        self.entries.insert(header_name(name)?, HeaderValues::from(value));
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValues> {
        self.entries.shift_remove(&HeaderName::from_str(name).ok()?)
    }

    pub fn get_values(&self, name: &str) -> Option<&HeaderValues> {
        self.entries.get(&HeaderName::from_str(name).ok()?)
    }

    /// The first value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.get_values(name)
            .into_iter()
            .flat_map(|values| values.iter().map(HeaderValue::as_str))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_values(name).is_some()
    }

    /// Every `(name, value)` pair. Names are lowercase.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.as_str(), value.as_str()))
        })
    }

    /// Every header name with all of its values.
    pub fn entries(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValues)> {
        self.entries.iter()
    }

    /// The number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where the body of an envelope stands.
#[derive(Debug)]
enum BodyState {
    Unread(Body),
    Buffered(Vec<u8>),
    /// The stream was lost to a failed read.
    Failed(String),
    Taken,
}

#[derive(Debug)]
pub struct ResponseEnvelope {
    status: u16,
    headers: HeaderCollection,
    content_headers: HeaderCollection,
    body: BodyState,
    text: Option<String>,
    elapsed: Duration,
    context: Option<Arc<ServiceContext>>,
    json_response_wrapping: bool,
}

impl ResponseEnvelope {
    pub fn new(status: impl Into<u16>) -> Self {
        Self {
            status: status.into(),
            headers: HeaderCollection::new(),
            content_headers: HeaderCollection::new(),
            body: BodyState::Buffered(Vec::new()),
            text: None,
            elapsed: Duration::default(),
            context: None,
            json_response_wrapping: false,
        }
    }

    /// Wrap a response received from `surf`, which took `elapsed` to arrive.
    pub fn from_response(mut res: surf::Response, elapsed: Duration) -> Self {
        let mut envelope = Self::new(res.status());
        for (name, values) in res.iter() {
            for value in values.iter() {
                envelope.append_header(name.clone(), value.clone());
            }
        }
        envelope.body = BodyState::Unread(res.take_body());
        envelope.with_elapsed(elapsed)
    }

    /// Add a header, validating its name and value.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.append_header(header_name(name)?, header_value(name, value)?);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = BodyState::Unread(body.into());
        self.text = None;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn with_context(mut self, context: Arc<ServiceContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_json_response_wrapping(mut self, enabled: bool) -> Self {
        self.json_response_wrapping = enabled;
        self
    }

    fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        if is_content_header(&name) {
            self.content_headers.append_value(name, value);
        } else {
            self.headers.append_value(name, value);
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// The status as a known [StatusCode], if it is one.
    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::try_from(self.status).ok()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderCollection {
        &self.headers
    }

    pub fn content_headers(&self) -> &HeaderCollection {
        &self.content_headers
    }

    /// The first value of `name`, looking at response headers before content headers.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .or_else(|| self.content_headers.get(name))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_headers.get(headers::CONTENT_TYPE.as_str())
    }

    /// The parsed `Content-Type`. A missing or malformed header yields `None`.
    pub fn mime(&self) -> Option<Mime> {
        self.content_type().and_then(|ty| parse_mime(ty).ok())
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn context(&self) -> Option<&Arc<ServiceContext>> {
        self.context.as_ref()
    }

    /// Install `context` unless the envelope already has one.
    pub(crate) fn ensure_context(&mut self, context: &Arc<ServiceContext>) {
        if self.context.is_none() {
            self.context = Some(context.clone());
        }
    }

    pub fn json_response_wrapping(&self) -> bool {
        self.json_response_wrapping
    }

    /// The body bytes, reading the underlying stream on first use.
    ///
    /// A token cancelled before the read starts leaves the body untouched. A read which fails
    /// part way loses the stream, and every later read reports [Error::BodyRead].
    pub async fn bytes(&mut self, cancel: &CancellationToken) -> Result<&[u8]> {
        if matches!(self.body, BodyState::Unread(_)) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let BodyState::Unread(body) = std::mem::replace(&mut self.body, BodyState::Taken) {
                let read = match cancellable(cancel, body.into_bytes()).await {
                    Ok(read) => read.map_err(Error::body_read),
                    Err(err) => Err(err),
                };
                match read {
                    Ok(bytes) => self.body = BodyState::Buffered(bytes),
                    Err(err) => {
                        self.body = BodyState::Failed(err.to_string());
                        return Err(err);
                    }
                }
            }
        }
        match &self.body {
            BodyState::Buffered(bytes) => Ok(bytes),
            BodyState::Failed(message) => Err(Error::BodyRead {
                message: format!("body was lost to an earlier failed read: {}", message),
            }),
            BodyState::Taken | BodyState::Unread(_) => Err(Error::BodyRead {
                message: "body was already taken as a stream".to_string(),
            }),
        }
    }

    /// The body as text, decoded with the charset from `Content-Type` (UTF-8 by default).
    ///
    /// The first call reads and caches the string; later calls return the cached value.
    pub async fn text(&mut self, cancel: &CancellationToken) -> Result<&str> {
        if self.text.is_none() {
            let charset = self
                .mime()
                .and_then(|ty| charset_of(&ty))
                .unwrap_or_default();
            let bytes = self.bytes(cancel).await?.to_vec();
            self.text = Some(charset.decode(bytes)?);
        }
        Ok(self.text.as_deref().unwrap_or_default())
    }

    pub fn text_blocking(&mut self) -> Result<&str> {
        block_on(self.text(&CancellationToken::new()))
    }

    pub fn bytes_blocking(&mut self) -> Result<&[u8]> {
        block_on(self.bytes(&CancellationToken::new()))
    }

    /// Take the body as a stream. If it was already buffered, the buffer is streamed instead.
    pub fn take_body(&mut self) -> Result<Body> {
        match std::mem::replace(&mut self.body, BodyState::Taken) {
            BodyState::Unread(body) => Ok(body),
            BodyState::Buffered(bytes) => {
                let body = Body::from_bytes(bytes.clone());
                self.body = BodyState::Buffered(bytes);
                Ok(body)
            }
            BodyState::Failed(message) => {
                let err = Error::BodyRead {
                    message: format!("body was lost to an earlier failed read: {}", message),
                };
                self.body = BodyState::Failed(message);
                Err(err)
            }
            BodyState::Taken => Err(Error::BodyRead {
                message: "body was already taken as a stream".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::{AsyncRead, BufReader, Cursor};
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    /// Reader which counts how many bytes it has handed out.
    struct CountingReader {
        inner: Cursor<Vec<u8>>,
        served: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            let this = &mut *self;
            let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
            if let Poll::Ready(Ok(n)) = &poll {
                this.served.fetch_add(*n, Ordering::SeqCst);
            }
            poll
        }
    }

    /// Reader which fails after handing out its first chunk.
    struct BrokenReader {
        served: bool,
    }

    impl AsyncRead for BrokenReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            if self.served {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "connection reset")));
            }
            self.served = true;
            buf[0] = b'x';
            Poll::Ready(Ok(1))
        }
    }

    #[async_std::test]
    async fn body_is_read_once_and_cached() {
        let data = b"hello envelope".to_vec();
        let served = Arc::new(AtomicUsize::new(0));
        let reader = CountingReader {
            inner: Cursor::new(data.clone()),
            served: served.clone(),
        };
        let mut envelope = ResponseEnvelope::new(200u16)
            .with_header("Content-Type", "text/plain")
            .unwrap()
            .with_body(Body::from_reader(BufReader::new(reader), Some(data.len())));

        let cancel = CancellationToken::new();
        let first = envelope.text(&cancel).await.unwrap().to_string();
        let second = envelope.text(&cancel).await.unwrap().to_string();
        assert_eq!(first, "hello envelope");
        assert_eq!(first, second);
        assert_eq!(envelope.bytes(&cancel).await.unwrap(), &data[..]);
        assert_eq!(served.load(Ordering::SeqCst), data.len());
    }

    #[test]
    fn splits_content_headers() {
        let envelope = ResponseEnvelope::new(StatusCode::Ok)
            .with_header("Content-Type", "application/json")
            .unwrap()
            .with_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_header("X-Trace", "a")
            .unwrap()
            .with_header("x-trace", "b")
            .unwrap();
        assert_eq!(envelope.content_type(), Some("application/json"));
        assert!(envelope.headers().get("content-type").is_none());
        assert_eq!(envelope.headers().get_all("X-TRACE").collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(envelope.header("last-modified"), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert!(envelope.is_success());
        assert_eq!(envelope.status_code(), Some(StatusCode::Ok));
    }

    #[test]
    fn header_collection_is_case_insensitive() {
        let mut headers = HeaderCollection::new();
        headers.append("X-A", "1").unwrap();
        headers.append("x-a", "2").unwrap();
        headers.append("X-B", "b").unwrap();
        assert_eq!(headers.get_all("X-a").collect::<Vec<_>>(), ["1", "2"]);
        assert_eq!(headers.iter().collect::<Vec<_>>(), [("x-a", "1"), ("x-a", "2"), ("x-b", "b")]);

        headers.set("X-A", "3").unwrap();
        assert_eq!(headers.get_all("x-a").collect::<Vec<_>>(), ["3"]);
        assert!(headers.remove("X-B").is_some());
        assert!(!headers.contains("x-b"));
        assert_eq!(headers.len(), 1);
        assert!(matches!(
            headers.append("X-Bad", "caf\u{e9}"),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn decodes_declared_charset() {
        let mut envelope = ResponseEnvelope::new(200u16)
            .with_header("Content-Type", "text/plain; charset=iso-8859-1")
            .unwrap()
            .with_body(Body::from_bytes(b"caf\xe9".to_vec()));
        assert_eq!(envelope.text_blocking().unwrap(), "café");
    }

    #[async_std::test]
    async fn cancelled_reads_leave_body_unread() {
        let mut envelope = ResponseEnvelope::new(200u16).with_body("hello world");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(envelope.text(&cancel).await.unwrap_err().is_cancelled());
        assert_eq!(
            envelope.text(&CancellationToken::new()).await.unwrap(),
            "hello world"
        );
    }

    #[async_std::test]
    async fn failed_reads_are_not_replaced_by_empty_bodies() {
        let mut envelope = ResponseEnvelope::new(200u16).with_body(Body::from_reader(
            BufReader::new(BrokenReader { served: false }),
            None,
        ));
        let cancel = CancellationToken::new();
        assert!(matches!(
            envelope.bytes(&cancel).await,
            Err(Error::BodyRead { .. })
        ));
        assert!(matches!(
            envelope.text(&cancel).await,
            Err(Error::BodyRead { .. })
        ));
        assert!(matches!(envelope.take_body(), Err(Error::BodyRead { .. })));
    }

    #[test]
    fn missing_body_reads_empty() {
        let mut envelope = ResponseEnvelope::new(204u16);
        assert_eq!(envelope.text_blocking().unwrap(), "");
        assert!(!ResponseEnvelope::new(404u16).is_success());
    }

    #[test]
    fn buffered_bodies_can_still_be_streamed() {
        let mut envelope = ResponseEnvelope::new(200u16).with_body("abc");
        assert_eq!(envelope.bytes_blocking().unwrap(), b"abc");
        let body = envelope.take_body().unwrap();
        assert_eq!(futures::executor::block_on(body.into_bytes()).unwrap(), b"abc");
        assert_eq!(envelope.bytes_blocking().unwrap(), b"abc");
    }
}
