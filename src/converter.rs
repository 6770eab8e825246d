// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Inbound content conversion.
//!
//! A [Converter] materializes a value of some type from a [ResponseEnvelope]. The blocking
//! [Converter::read] and the asynchronous [Converter::read_async] produce the same result for
//! the same response; the blocking form drives the asynchronous one on the calling thread.
//!
//! Decoding failures are always reported as errors. A converter never substitutes a default
//! value for a body it cannot decode.

use crate::cancel::{block_on, CancellationToken};
use crate::config::serializer_options;
use crate::content::is_string_media_type;
use crate::envelope::ResponseEnvelope;
use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use std::marker::PhantomData;
use surf::http::mime;
use surf::Body;

#[async_trait]
pub trait Converter<T>: Send + Sync {
    async fn read_async(&self, response: ResponseEnvelope, cancel: &CancellationToken)
        -> Result<T>;

    fn read(&self, response: ResponseEnvelope) -> Result<T> {
        block_on(self.read_async(response, &CancellationToken::new()))
    }
}

/// Hands back the response itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResponseEnvelopeConverter;

#[async_trait]
impl Converter<ResponseEnvelope> for ResponseEnvelopeConverter {
    async fn read_async(
        &self,
        response: ResponseEnvelope,
        _cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        Ok(response)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StringContentConverter;

#[async_trait]
impl Converter<String> for StringContentConverter {
    async fn read_async(
        &self,
        mut response: ResponseEnvelope,
        cancel: &CancellationToken,
    ) -> Result<String> {
        Ok(response.text(cancel).await?.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ByteArrayContentConverter;

#[async_trait]
impl Converter<Vec<u8>> for ByteArrayContentConverter {
    async fn read_async(
        &self,
        mut response: ResponseEnvelope,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        Ok(response.bytes(cancel).await?.to_vec())
    }
}

/// Hands back the body as a stream without buffering it.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamContentConverter;

#[async_trait]
impl Converter<Body> for StreamContentConverter {
    async fn read_async(
        &self,
        mut response: ResponseEnvelope,
        _cancel: &CancellationToken,
    ) -> Result<Body> {
        response.take_body()
    }
}

/// Discards the response.
#[derive(Clone, Copy, Debug, Default)]
pub struct VoidContentConverter;

#[async_trait]
impl Converter<()> for VoidContentConverter {
    async fn read_async(
        &self,
        _response: ResponseEnvelope,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }
}

/// Deserializes JSON bodies.
///
/// When the response is marked as JSON-wrapped, the value is taken from the configured data
/// field of the top-level object instead of the object itself.
pub struct ObjectContentConverter<T>(PhantomData<fn() -> T>);

impl<T> Default for ObjectContentConverter<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> Converter<T> for ObjectContentConverter<T> {
    async fn read_async(
        &self,
        mut response: ResponseEnvelope,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let options = serializer_options(response.context().map(|context| &**context));
        let wrapped = response.json_response_wrapping();
        let text = response.text(cancel).await?;
        if wrapped {
            let mut value: serde_json::Value =
                serde_json::from_str(text).context(crate::error::JsonDecodeSnafu)?;
            let value = match value.get_mut(&options.json.data_field) {
                Some(data) => data.take(),
                None => value,
            };
            serde_json::from_value(value).context(crate::error::JsonDecodeSnafu)
        } else {
            serde_json::from_str(text).context(crate::error::JsonDecodeSnafu)
        }
    }
}

/// Deserializes XML bodies from the fully buffered text.
pub struct XmlObjectContentConverter<T>(PhantomData<fn() -> T>);

impl<T> Default for XmlObjectContentConverter<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> Converter<T> for XmlObjectContentConverter<T> {
    async fn read_async(
        &self,
        mut response: ResponseEnvelope,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let text = response.text(cancel).await?;
        quick_xml::de::from_str(text).context(crate::error::XmlDecodeSnafu)
    }
}

/// Deserializes `application/octet-stream` bodies written with `bincode`.
pub struct BincodeContentConverter<T>(PhantomData<fn() -> T>);

impl<T> Default for BincodeContentConverter<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> Converter<T> for BincodeContentConverter<T> {
    async fn read_async(
        &self,
        mut response: ResponseEnvelope,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let bytes = response.bytes(cancel).await?;
        bincode::deserialize(bytes).context(crate::error::BincodeDecodeSnafu)
    }
}

/// A response with no meaningful body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmptyResult {
    NoContent,
    StatusOnly {
        status: u16,
        /// Cache validators carried over from a `304 Not Modified` response.
        validators: Vec<(String, String)>,
    },
}

const VALIDATORS: [&str; 7] = [
    "cache-control",
    "content-location",
    "date",
    "etag",
    "expires",
    "last-modified",
    "vary",
];

/// The body-less result for statuses which never carry content, if `response` has one of
/// them. Consulted before the content type is looked at.
pub fn empty_result(response: &ResponseEnvelope) -> Option<EmptyResult> {
    match response.status() {
        204 => Some(EmptyResult::NoContent),
        304 => Some(EmptyResult::StatusOnly {
            status: 304,
            validators: VALIDATORS
                .iter()
                .filter_map(|name| {
                    response
                        .header(name)
                        .map(|value| (name.to_string(), value.to_string()))
                })
                .collect(),
        }),
        status @ 101 | status @ 102 | status @ 205 => Some(EmptyResult::StatusOnly {
            status,
            validators: Vec::new(),
        }),
        _ => None,
    }
}

/// A response materialized by media type: text for the string-like media types, a file for
/// everything else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentResult {
    Empty(EmptyResult),
    Text {
        status: u16,
        content: String,
        /// The `Content-Type` header exactly as received.
        content_type: String,
    },
    File {
        status: u16,
        data: Vec<u8>,
        content_type: String,
        file_name: Option<String>,
        last_modified: Option<String>,
    },
}

impl ContentResult {
    pub async fn from_response(
        mut response: ResponseEnvelope,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if let Some(empty) = empty_result(&response) {
            return Ok(ContentResult::Empty(empty));
        }
        let status = response.status();
        let is_text = response
            .mime()
            .map_or(false, |ty| is_string_media_type(&ty));
        let content_type = response.content_type().map(str::to_string);
        match content_type {
            Some(content_type) if is_text => Ok(ContentResult::Text {
                status,
                content: response.text(cancel).await?.to_string(),
                content_type,
            }),
            content_type => {
                let file_name = response
                    .header("content-disposition")
                    .and_then(content_disposition_file_name);
                let last_modified = response.header("last-modified").map(str::to_string);
                Ok(ContentResult::File {
                    status,
                    data: response.bytes(cancel).await?.to_vec(),
                    content_type: content_type
                        .unwrap_or_else(|| mime::BYTE_STREAM.essence().to_string()),
                    file_name,
                    last_modified,
                })
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ContentResultConverter;

#[async_trait]
impl Converter<ContentResult> for ContentResultConverter {
    async fn read_async(
        &self,
        response: ResponseEnvelope,
        cancel: &CancellationToken,
    ) -> Result<ContentResult> {
        ContentResult::from_response(response, cancel).await
    }
}

/// The file name in a `Content-Disposition` header value. An RFC 5987 `filename*` parameter is
/// preferred over a plain `filename`.
pub fn content_disposition_file_name(value: &str) -> Option<String> {
    let mut plain = None;
    for param in split_params(value).into_iter().skip(1) {
        let (name, raw) = match param.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        let raw = raw.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'language'percent-encoded-value
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
                if let Ok(decoded) = urlencoding::decode(encoded) {
                    return Some(decoded.into_owned());
                }
            }
            "filename" => plain = Some(unquote(raw)),
            _ => {}
        }
    }
    plain
}

/// Split a header value on the `;`s which are outside quoted strings.
fn split_params(value: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                params.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(&value[start..]);
    params
}

/// The contents of a quoted string with its escapes resolved, or `raw` itself if it is a token.
fn unquote(raw: &str) -> String {
    let inner = match raw.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) {
        Some(inner) => inner,
        None => return raw.to_string(),
    };
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if c == '\\' && !escaped {
            escaped = true;
        } else {
            out.push(c);
            escaped = false;
        }
    }
    out
}
