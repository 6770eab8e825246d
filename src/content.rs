// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Request body values before and after content negotiation.
//!
//! A [RawContent] is whatever the caller passed as the body of a call. The content processors
//! in [processor](crate::processor) turn it into an [EncodedBody], which carries the final
//! `Content-Type` header value alongside the bytes to put on the wire.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use surf::http::mime::{self, Mime};
use surf::Body;

pub mod media {
    //! Media types understood by the built-in processors and converters which have no constant
    //! in [surf::http::mime].

    pub const JSON_PATCH: &str = "application/json-patch+json";
    pub const XML_PATCH: &str = "application/xml-patch+xml";
    pub const TEXT_XML: &str = "text/xml";
    pub const SOAP: &str = "application/soap+xml";
}

/// Parse a `Content-Type` header value.
pub fn parse_mime(content_type: &str) -> Result<Mime> {
    Mime::from_str(content_type)
        .map_err(|err| Error::invalid_argument("Content-Type", err.to_string()))
}

/// The charset named by the `charset` parameter of `mime`, if it is one we support.
pub fn charset_of(ty: &Mime) -> Option<Charset> {
    ty.param("charset")
        .and_then(|charset| Charset::from_label(charset.as_str()))
}

/// Media types whose bodies are decoded as text.
pub fn is_string_media_type(ty: &Mime) -> bool {
    let essence = ty.essence();
    [mime::JSON, mime::XML, mime::HTML, mime::PLAIN]
        .iter()
        .any(|known| known.essence() == essence)
        || [media::JSON_PATCH, media::XML_PATCH, media::TEXT_XML, media::SOAP].contains(&essence)
}

pub fn is_json_media_type(ty: &Mime) -> bool {
    is_media_type(ty, &mime::JSON) || ty.subtype().ends_with("+json")
}

pub fn is_xml_media_type(ty: &Mime) -> bool {
    is_media_type(ty, &mime::XML)
        || ty.essence() == media::TEXT_XML
        || ty.subtype().ends_with("+xml")
}

/// Whether `ty` names the same media type as `expected`, ignoring parameters.
pub fn is_media_type(ty: &Mime, expected: &Mime) -> bool {
    ty.essence() == expected.essence()
}

/// Text encodings supported for request and response bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Charset {
    #[serde(rename = "utf-8", alias = "utf8", alias = "UTF-8")]
    Utf8,
    #[serde(rename = "utf-16le", alias = "UTF-16LE")]
    Utf16Le,
    #[serde(rename = "utf-16be", alias = "UTF-16BE")]
    Utf16Be,
    #[serde(rename = "us-ascii", alias = "ascii", alias = "US-ASCII")]
    Ascii,
    #[serde(rename = "iso-8859-1", alias = "latin1", alias = "ISO-8859-1")]
    Latin1,
}

impl Default for Charset {
    fn default() -> Self {
        Charset::Utf8
    }
}

impl Display for Charset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Charset {
    pub fn label(self) -> &'static str {
        match self {
            Charset::Utf8 => "utf-8",
            Charset::Utf16Le => "utf-16le",
            Charset::Utf16Be => "utf-16be",
            Charset::Ascii => "us-ascii",
            Charset::Latin1 => "iso-8859-1",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Charset::Utf8),
            "utf-16le" => Some(Charset::Utf16Le),
            "utf-16be" => Some(Charset::Utf16Be),
            "us-ascii" | "ascii" => Some(Charset::Ascii),
            "iso-8859-1" | "latin1" | "latin-1" => Some(Charset::Latin1),
            _ => None,
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        let limit = match self {
            Charset::Utf8 => return Ok(text.as_bytes().to_vec()),
            Charset::Utf16Le => {
                return Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect())
            }
            Charset::Utf16Be => {
                return Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect())
            }
            Charset::Ascii => 0x7f,
            Charset::Latin1 => 0xff,
        };
        text.chars()
            .map(|character| {
                if (character as u32) <= limit {
                    Ok(character as u8)
                } else {
                    Err(Error::Charset {
                        charset: self.label().to_string(),
                        character,
                    })
                }
            })
            .collect()
    }

    pub fn decode(self, bytes: Vec<u8>) -> Result<String> {
        let from_units: fn([u8; 2]) -> u16 = match self {
            Charset::Latin1 => return Ok(bytes.into_iter().map(char::from).collect()),
            Charset::Utf8 | Charset::Ascii => {
                return String::from_utf8(bytes).context(crate::error::Utf8Snafu)
            }
            Charset::Utf16Le => u16::from_le_bytes,
            Charset::Utf16Be => u16::from_be_bytes,
        };
        if bytes.len() % 2 != 0 {
            return Err(Error::Utf16 {
                message: format!("odd number of bytes ({})", bytes.len()),
            });
        }
        let units = bytes
            .chunks_exact(2)
            .map(|pair| from_units([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        String::from_utf16(&units).map_err(|err| Error::Utf16 {
            message: err.to_string(),
        })
    }
}

/// A body which has been through content negotiation.
#[derive(Debug)]
pub struct EncodedBody {
    content_type: String,
    payload: Payload,
}

#[derive(Debug)]
pub enum Payload {
    Bytes(Vec<u8>),
    Stream(Body),
}

impl EncodedBody {
    /// Encode `text` with `charset`, labelling it as `media_type` with a matching charset
    /// parameter.
    pub fn text(text: &str, media_type: &str, charset: Charset) -> Result<Self> {
        Ok(Self {
            content_type: format!("{}; charset={}", media_type, charset.label()),
            payload: Payload::Bytes(charset.encode(text)?),
        })
    }

    pub fn bytes(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            payload: Payload::Bytes(bytes),
        }
    }

    pub fn stream(body: Body, content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            payload: Payload::Stream(body),
        }
    }

    /// The full `Content-Type` header value, including parameters.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn mime(&self) -> Option<Mime> {
        parse_mime(&self.content_type).ok()
    }

    pub fn charset(&self) -> Option<Charset> {
        self.mime().as_ref().and_then(charset_of)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::Stream(_) => None,
        }
    }

    /// Decode the payload as text using the charset from the content type (UTF-8 if absent).
    pub fn to_text(&self) -> Option<String> {
        let bytes = self.as_bytes()?.to_vec();
        self.charset().unwrap_or_default().decode(bytes).ok()
    }

    /// A copy of this body, unless its payload is a stream.
    pub fn try_clone(&self) -> Option<Self> {
        Some(Self {
            content_type: self.content_type.clone(),
            payload: Payload::Bytes(self.as_bytes()?.to_vec()),
        })
    }

    pub fn into_body(self) -> Body {
        match self.payload {
            Payload::Bytes(bytes) => Body::from_bytes(bytes),
            Payload::Stream(body) => body,
        }
    }
}

/// A file to upload, either as a whole body or as a multipart part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContent {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl FileContent {
    pub fn new(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            data,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Read a file from disk. The file name of the upload is the last path component.
    pub async fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = async_std::fs::read(path)
            .await
            .map_err(|err| Error::BodyRead {
                message: format!("{}: {}", path.display(), err),
            })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(file_name, data))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// A `multipart/form-data` body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Multipart {
    boundary: String,
    parts: Vec<Part>,
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}

impl Multipart {
    pub fn new() -> Self {
        Self::with_boundary(format!("----remote-call-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.part(Part {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: value.into().into_bytes(),
        })
    }

    pub fn bytes(
        self,
        name: impl Into<String>,
        data: Vec<u8>,
        content_type: Option<String>,
    ) -> Self {
        self.part(Part {
            name: name.into(),
            file_name: None,
            content_type,
            data,
        })
    }

    pub fn file(self, name: impl Into<String>, file: FileContent) -> Self {
        self.part(Part {
            name: name.into(),
            file_name: Some(file.file_name),
            content_type: Some(
                file.content_type
                    .unwrap_or_else(|| mime::BYTE_STREAM.to_string()),
            ),
            data: file.data,
        })
    }

    pub fn content_type(&self) -> String {
        format!("{}; boundary={}", mime::MULTIPART_FORM, self.boundary)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
            let mut disposition = format!(
                "Content-Disposition: form-data; name=\"{}\"",
                escape_disposition(&part.name)
            );
            if let Some(file_name) = &part.file_name {
                disposition.push_str(&format!(
                    "; filename=\"{}\"",
                    escape_disposition(file_name)
                ));
            }
            out.extend_from_slice(disposition.as_bytes());
            out.extend_from_slice(b"\r\n");
            if let Some(content_type) = &part.content_type {
                out.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&part.data);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        out
    }
}

/// Percent-encode the characters which would end a quoted `Content-Disposition` parameter.
fn escape_disposition(value: &str) -> String {
    value
        .replace('\r', "%0D")
        .replace('\n', "%0A")
        .replace('"', "%22")
}

/// The body of a call, as supplied by the caller.
#[derive(Debug)]
pub enum RawContent {
    /// Text, or a primitive rendered as text.
    Text(String),
    /// A JSON tree, written out as-is.
    Json(serde_json::Value),
    /// An arbitrary serializable object, encoded according to the target content type.
    Object(serde_json::Value),
    /// Form fields.
    Form(Vec<(String, String)>),
    Bytes(Vec<u8>),
    Stream(Body),
    Multipart(Multipart),
    File(FileContent),
    /// A body which is already encoded and is sent unchanged.
    Encoded(EncodedBody),
}

impl RawContent {
    /// Capture an arbitrary serializable object as a body.
    pub fn object<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(RawContent::Object(
            serde_json::to_value(value).context(crate::error::JsonEncodeSnafu)?,
        ))
    }

    pub fn form<K: Into<String>, V: Into<String>>(
        fields: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        RawContent::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RawContent::Text(_) => "text",
            RawContent::Json(_) => "json",
            RawContent::Object(_) => "object",
            RawContent::Form(_) => "form",
            RawContent::Bytes(_) => "bytes",
            RawContent::Stream(_) => "stream",
            RawContent::Multipart(_) => "multipart",
            RawContent::File(_) => "file",
            RawContent::Encoded(_) => "encoded",
        }
    }

    /// A copy of this content. Streams can be read only once, so stream content has no copy.
    pub fn try_clone(&self) -> Option<Self> {
        Some(match self {
            RawContent::Text(text) => RawContent::Text(text.clone()),
            RawContent::Json(value) => RawContent::Json(value.clone()),
            RawContent::Object(value) => RawContent::Object(value.clone()),
            RawContent::Form(fields) => RawContent::Form(fields.clone()),
            RawContent::Bytes(bytes) => RawContent::Bytes(bytes.clone()),
            RawContent::Stream(_) => return None,
            RawContent::Multipart(form) => RawContent::Multipart(form.clone()),
            RawContent::File(file) => RawContent::File(file.clone()),
            RawContent::Encoded(body) => RawContent::Encoded(body.try_clone()?),
        })
    }

    /// Whether this is binary content: bytes, a stream, a file, or an already-encoded body
    /// with a non-textual media type.
    pub fn is_binary(&self) -> bool {
        match self {
            RawContent::Bytes(_) | RawContent::Stream(_) | RawContent::File(_) => true,
            RawContent::Encoded(body) => body
                .mime()
                .map_or(true, |ty| ty.basetype() != "text" && !is_string_media_type(&ty)),
            _ => false,
        }
    }
}

/// Infer the content type of a body which was not given one explicitly.
///
/// Files infer `application/octet-stream`; the byte processor then labels the body with the
/// file's own content type, if it has one.
pub fn infer_content_type(raw: &RawContent, default: Option<&str>) -> String {
    match raw {
        RawContent::Json(_) => mime::JSON.essence().to_string(),
        RawContent::Form(_) => mime::FORM.essence().to_string(),
        RawContent::Bytes(_) | RawContent::Stream(_) | RawContent::File(_) => {
            mime::BYTE_STREAM.essence().to_string()
        }
        RawContent::Multipart(_) => mime::MULTIPART_FORM.essence().to_string(),
        RawContent::Encoded(body) => body
            .mime()
            .map(|ty| ty.essence().to_string())
            .unwrap_or_else(|| body.content_type().to_string()),
        RawContent::Text(_) | RawContent::Object(_) => default
            .map(str::to_string)
            .unwrap_or_else(|| mime::PLAIN.essence().to_string()),
    }
}

impl From<String> for RawContent {
    fn from(text: String) -> Self {
        RawContent::Text(text)
    }
}

impl From<&str> for RawContent {
    fn from(text: &str) -> Self {
        RawContent::Text(text.to_string())
    }
}

impl From<serde_json::Value> for RawContent {
    fn from(value: serde_json::Value) -> Self {
        RawContent::Json(value)
    }
}

impl From<Vec<u8>> for RawContent {
    fn from(bytes: Vec<u8>) -> Self {
        RawContent::Bytes(bytes)
    }
}

impl From<Body> for RawContent {
    fn from(body: Body) -> Self {
        RawContent::Stream(body)
    }
}

impl From<Multipart> for RawContent {
    fn from(multipart: Multipart) -> Self {
        RawContent::Multipart(multipart)
    }
}

impl From<FileContent> for RawContent {
    fn from(file: FileContent) -> Self {
        RawContent::File(file)
    }
}

impl From<EncodedBody> for RawContent {
    fn from(body: EncodedBody) -> Self {
        RawContent::Encoded(body)
    }
}

macro_rules! primitive_content {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for RawContent {
                fn from(value: $ty) -> Self {
                    RawContent::Text(value.to_string())
                }
            }
        )*
    };
}

primitive_content!(bool, char, i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, f32, f64);
