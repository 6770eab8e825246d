// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Outbound content negotiation.
//!
//! A [ContentProcessor] turns a [RawContent] into an [EncodedBody] for a given target content
//! type. Processors are consulted from the most recently registered to the first, and the first
//! one whose [ContentProcessor::can_process] returns `true` handles the body, so registering a
//! processor overrides any earlier processor accepting the same inputs. A processor may decline
//! a body it accepted by returning [Processed::Defer], in which case the body is encoded by the
//! [GeneralContentProcessor].

use crate::config::{serializer_options, SerializerOptions, ServiceContext};
use crate::content::{
    infer_content_type, is_json_media_type, is_media_type, is_string_media_type,
    is_xml_media_type, parse_mime, Charset, EncodedBody, Multipart, RawContent,
};
use crate::error::Result;
use snafu::ResultExt;
use std::sync::Arc;
use surf::http::mime::{self, Mime};
use tracing::{event, Level};

/// The outcome of [ContentProcessor::process].
#[derive(Debug)]
pub enum Processed {
    Body(EncodedBody),
    /// The processor declined; the raw content is handed to the general fallback.
    Defer(RawContent),
}

pub trait ContentProcessor: Send + Sync {
    /// Whether this processor handles `raw` for `content_type`. Must not have side effects.
    fn can_process(&self, raw: &RawContent, content_type: &Mime) -> bool;

    /// Encode `raw`. Errors are real failures; declining is expressed with [Processed::Defer].
    fn process(
        &self,
        raw: RawContent,
        content_type: &Mime,
        charset: Charset,
        options: &SerializerOptions,
    ) -> Result<Processed>;
}

fn is_text_like(raw: &RawContent) -> bool {
    matches!(
        raw,
        RawContent::Text(_) | RawContent::Json(_) | RawContent::Object(_)
    )
}

fn is_encoded_text(raw: &RawContent) -> bool {
    match raw {
        RawContent::Encoded(body) => body.as_bytes().is_some() && !raw.is_binary(),
        _ => false,
    }
}

fn json_text(value: &serde_json::Value, options: &SerializerOptions) -> Result<String> {
    if options.json.pretty {
        serde_json::to_string_pretty(value).context(crate::error::JsonEncodeSnafu)
    } else {
        serde_json::to_string(value).context(crate::error::JsonEncodeSnafu)
    }
}

/// Text for string-like media types: text and primitives as-is, JSON trees written directly,
/// other objects serialized as JSON with the ambient options.
fn string_body(
    raw: RawContent,
    content_type: &Mime,
    charset: Charset,
    options: &SerializerOptions,
) -> Result<Processed> {
    let text = match raw {
        RawContent::Encoded(body) => return Ok(Processed::Body(body)),
        RawContent::Text(text) => text,
        RawContent::Json(value) => value.to_string(),
        RawContent::Object(value) => json_text(&value, options)?,
        other => return Ok(Processed::Defer(other)),
    };
    Ok(Processed::Body(EncodedBody::text(
        &text,
        content_type.essence(),
        charset,
    )?))
}

/// Text, HTML and the other string-like media types.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringContentProcessor;

impl ContentProcessor for StringContentProcessor {
    fn can_process(&self, raw: &RawContent, content_type: &Mime) -> bool {
        (is_string_media_type(content_type) || content_type.basetype() == "text")
            && (is_text_like(raw) || is_encoded_text(raw))
    }

    fn process(
        &self,
        raw: RawContent,
        content_type: &Mime,
        charset: Charset,
        options: &SerializerOptions,
    ) -> Result<Processed> {
        string_body(raw, content_type, charset, options)
    }
}

/// JSON media types, including `+json` suffixes. Form fields are written as a JSON object.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonContentProcessor;

impl ContentProcessor for JsonContentProcessor {
    fn can_process(&self, raw: &RawContent, content_type: &Mime) -> bool {
        is_json_media_type(content_type)
            && (is_text_like(raw) || is_encoded_text(raw) || matches!(raw, RawContent::Form(_)))
    }

    fn process(
        &self,
        raw: RawContent,
        content_type: &Mime,
        charset: Charset,
        options: &SerializerOptions,
    ) -> Result<Processed> {
        let raw = match raw {
            RawContent::Form(fields) => RawContent::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect::<serde_json::Map<_, _>>()
                    .into(),
            ),
            raw => raw,
        };
        string_body(raw, content_type, charset, options)
    }
}

/// XML media types.
///
/// Like the other string-like types, objects are written as JSON unless the ambient
/// [XmlOptions](crate::config::XmlOptions) name a root element, in which case objects and JSON
/// trees are serialized as XML under that element.
#[derive(Clone, Copy, Debug, Default)]
pub struct XmlContentProcessor;

impl ContentProcessor for XmlContentProcessor {
    fn can_process(&self, raw: &RawContent, content_type: &Mime) -> bool {
        is_xml_media_type(content_type) && (is_text_like(raw) || is_encoded_text(raw))
    }

    fn process(
        &self,
        raw: RawContent,
        content_type: &Mime,
        charset: Charset,
        options: &SerializerOptions,
    ) -> Result<Processed> {
        let root = match &options.xml.root {
            Some(root) => root,
            None => return string_body(raw, content_type, charset, options),
        };
        let text = match raw {
            RawContent::Json(value) | RawContent::Object(value) => {
                quick_xml::se::to_string_with_root(root, &value)
                    .context(crate::error::XmlEncodeSnafu)?
            }
            raw => return string_body(raw, content_type, charset, options),
        };
        Ok(Processed::Body(EncodedBody::text(
            &text,
            content_type.essence(),
            charset,
        )?))
    }
}

/// `application/x-www-form-urlencoded`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FormUrlEncodedContentProcessor;

impl ContentProcessor for FormUrlEncodedContentProcessor {
    fn can_process(&self, raw: &RawContent, content_type: &Mime) -> bool {
        is_media_type(content_type, &mime::FORM)
            && matches!(
                raw,
                RawContent::Form(_)
                    | RawContent::Object(_)
                    | RawContent::Json(_)
                    | RawContent::Text(_)
                    | RawContent::Encoded(_)
            )
    }

    fn process(
        &self,
        raw: RawContent,
        _content_type: &Mime,
        _charset: Charset,
        _options: &SerializerOptions,
    ) -> Result<Processed> {
        let encoded = match raw {
            RawContent::Encoded(body) => return Ok(Processed::Body(body)),
            RawContent::Text(text) => text,
            RawContent::Form(fields) => {
                serde_urlencoded::to_string(&fields).context(crate::error::FormEncodeSnafu)?
            }
            RawContent::Object(value) | RawContent::Json(value) => {
                serde_urlencoded::to_string(&value).context(crate::error::FormEncodeSnafu)?
            }
            other => return Ok(Processed::Defer(other)),
        };
        Ok(Processed::Body(EncodedBody::bytes(
            encoded.into_bytes(),
            mime::FORM.essence(),
        )))
    }
}

/// `multipart/form-data`. Form fields become text parts and a lone file becomes a `file` part.
#[derive(Clone, Copy, Debug, Default)]
pub struct MultipartContentProcessor;

impl ContentProcessor for MultipartContentProcessor {
    fn can_process(&self, raw: &RawContent, content_type: &Mime) -> bool {
        is_media_type(content_type, &mime::MULTIPART_FORM)
            && matches!(
                raw,
                RawContent::Multipart(_) | RawContent::Form(_) | RawContent::File(_)
            )
    }

    fn process(
        &self,
        raw: RawContent,
        _content_type: &Mime,
        _charset: Charset,
        _options: &SerializerOptions,
    ) -> Result<Processed> {
        let multipart = match raw {
            RawContent::Multipart(multipart) => multipart,
            RawContent::Form(fields) => fields
                .into_iter()
                .fold(Multipart::new(), |multipart, (name, value)| {
                    multipart.text(name, value)
                }),
            RawContent::File(file) => Multipart::new().file("file", file),
            other => return Ok(Processed::Defer(other)),
        };
        Ok(Processed::Body(EncodedBody::bytes(
            multipart.encode(),
            multipart.content_type(),
        )))
    }
}

/// Bytes, streams and files, for any content type.
#[derive(Clone, Copy, Debug, Default)]
pub struct ByteArrayContentProcessor;

impl ContentProcessor for ByteArrayContentProcessor {
    fn can_process(&self, raw: &RawContent, _content_type: &Mime) -> bool {
        raw.is_binary()
    }

    fn process(
        &self,
        raw: RawContent,
        content_type: &Mime,
        _charset: Charset,
        _options: &SerializerOptions,
    ) -> Result<Processed> {
        Ok(Processed::Body(match raw {
            RawContent::Encoded(body) => body,
            RawContent::Bytes(bytes) => EncodedBody::bytes(bytes, content_type.to_string()),
            RawContent::Stream(body) => EncodedBody::stream(body, content_type.to_string()),
            RawContent::File(file) => {
                let content_type = match file.content_type {
                    Some(ty) if is_media_type(content_type, &mime::BYTE_STREAM) => ty,
                    _ => content_type.to_string(),
                };
                EncodedBody::bytes(file.data, content_type)
            }
            other => return Ok(Processed::Defer(other)),
        }))
    }
}

/// Last-resort encoder for bodies no registered processor handled.
#[derive(Clone, Copy, Debug, Default)]
pub struct GeneralContentProcessor;

impl GeneralContentProcessor {
    pub fn encode(
        &self,
        raw: RawContent,
        content_type: &Mime,
        charset: Charset,
        options: &SerializerOptions,
    ) -> Result<EncodedBody> {
        let ty = content_type.essence();
        Ok(match raw {
            RawContent::Encoded(body) => body,
            RawContent::Text(text) => EncodedBody::text(&text, ty, charset)?,
            RawContent::Json(value) => EncodedBody::text(&value.to_string(), ty, charset)?,
            RawContent::Object(value) => {
                EncodedBody::text(&json_text(&value, options)?, ty, charset)?
            }
            RawContent::Form(fields) => EncodedBody::bytes(
                serde_urlencoded::to_string(&fields)
                    .context(crate::error::FormEncodeSnafu)?
                    .into_bytes(),
                content_type.to_string(),
            ),
            RawContent::Bytes(bytes) => EncodedBody::bytes(bytes, content_type.to_string()),
            RawContent::Stream(body) => EncodedBody::stream(body, content_type.to_string()),
            RawContent::File(file) => EncodedBody::bytes(file.data, content_type.to_string()),
            RawContent::Multipart(multipart) => {
                EncodedBody::bytes(multipart.encode(), multipart.content_type())
            }
        })
    }
}

/// An ordered set of content processors.
#[derive(Clone)]
pub struct ContentProcessors {
    processors: Vec<Arc<dyn ContentProcessor>>,
}

impl Default for ContentProcessors {
    fn default() -> Self {
        Self::empty()
            .with(StringContentProcessor)
            .with(JsonContentProcessor)
            .with(XmlContentProcessor)
            .with(FormUrlEncodedContentProcessor)
            .with(MultipartContentProcessor)
            .with(ByteArrayContentProcessor)
    }
}

impl std::fmt::Debug for ContentProcessors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentProcessors")
            .field("len", &self.processors.len())
            .finish()
    }
}

impl ContentProcessors {
    pub fn empty() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    pub fn with(mut self, processor: impl ContentProcessor + 'static) -> Self {
        self.register(processor);
        self
    }

    pub fn register(&mut self, processor: impl ContentProcessor + 'static) -> &mut Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Encode `raw` as `content_type`, or as the inferred content type if none is given.
    pub fn encode(
        &self,
        raw: RawContent,
        content_type: Option<&str>,
        charset: Charset,
        context: Option<&ServiceContext>,
    ) -> Result<EncodedBody> {
        self.encode_with(raw, content_type, charset, context, &[])
    }

    /// Like [encode](Self::encode), with per-call processors taking precedence over the
    /// registered ones.
    pub fn encode_with(
        &self,
        raw: RawContent,
        content_type: Option<&str>,
        charset: Charset,
        context: Option<&ServiceContext>,
        custom: &[Arc<dyn ContentProcessor>],
    ) -> Result<EncodedBody> {
        let content_type = parse_mime(&match content_type {
            Some(ty) => ty.to_string(),
            None => infer_content_type(
                &raw,
                context.and_then(|ctx| ctx.config().default_content_type.as_deref()),
            ),
        })?;
        let options = serializer_options(context);
        let processor = self
            .processors
            .iter()
            .chain(custom)
            .rev()
            .find(|p| p.can_process(&raw, &content_type));
        event!(
            Level::TRACE,
            "encoding {} body as {} (processor found: {})",
            raw.kind(),
            content_type,
            processor.is_some()
        );
        let raw = match processor {
            Some(processor) => match processor.process(raw, &content_type, charset, &options)? {
                Processed::Body(body) => return Ok(body),
                Processed::Defer(raw) => raw,
            },
            None => raw,
        };
        GeneralContentProcessor.encode(raw, &content_type, charset, &options)
    }
}
