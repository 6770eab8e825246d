// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use snafu::Snafu;

/// Errors produced anywhere in the remote call pipeline.
///
/// The variants fall into a few families which callers usually treat differently:
/// * configuration errors ([Error::InvalidArgument]) are raised while building extractors,
///   requests or assertions, never deferred until a request is sent;
/// * [Error::AssertionFailed] is raised by the first violated response assertion;
/// * decoding errors ([Error::JsonDecode], [Error::XmlDecode], [Error::BincodeDecode],
///   [Error::Utf8], [Error::Utf16]) mean a response body did not match the requested type;
/// * [Error::Cancelled] is cooperative cancellation and should not be reported as a failure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid argument `{}`: {}", name, reason))]
    InvalidArgument { name: String, reason: String },

    #[snafu(display("{}", message))]
    AssertionFailed { message: String },

    #[snafu(display("response body fails to deserialize as JSON: {}", source))]
    JsonDecode { source: serde_json::Error },

    #[snafu(display("response body fails to deserialize as XML: {}", source))]
    XmlDecode { source: quick_xml::DeError },

    #[snafu(display("response body fails to deserialize as bincode: {}", source))]
    BincodeDecode { source: bincode::Error },

    #[snafu(display("response body is not valid UTF-8: {}", source))]
    Utf8 { source: std::string::FromUtf8Error },

    #[snafu(display("body is not valid UTF-16: {}", message))]
    Utf16 { message: String },

    #[snafu(display("request body fails to serialize as JSON: {}", source))]
    JsonEncode { source: serde_json::Error },

    #[snafu(display("request body fails to serialize as XML: {}", source))]
    XmlEncode { source: quick_xml::DeError },

    #[snafu(display("request body fails to serialize as a form: {}", source))]
    FormEncode { source: serde_urlencoded::ser::Error },

    #[snafu(display("character {:?} cannot be encoded as {}", character, charset))]
    Charset { charset: String, character: char },

    #[snafu(display("operation was cancelled"))]
    Cancelled,

    #[snafu(display("request timed out after {:?}", timeout))]
    Timeout { timeout: std::time::Duration },

    #[snafu(display("invalid url {}: {}", url, message))]
    InvalidUrl { url: String, message: String },

    #[snafu(display("transport error (status {}): {}", status, message))]
    Transport { status: u16, message: String },

    #[snafu(display("failed to read response body: {}", message))]
    BodyRead { message: String },

    #[snafu(display("request failed with status {}: {}", status, body))]
    UnsuccessfulStatus { status: u16, body: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error reports a response payload that did not match the requested type.
    pub fn is_deserialization(&self) -> bool {
        matches!(
            self,
            Error::JsonDecode { .. }
                | Error::XmlDecode { .. }
                | Error::BincodeDecode { .. }
                | Error::Utf8 { .. }
                | Error::Utf16 { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Convert a client-side [surf::Error] into an [Error].
    ///
    /// [surf::Error] does not implement [std::error::Error], so only its status and message
    /// survive the conversion.
    pub fn from_client_error(source: surf::Error) -> Self {
        Error::Transport {
            status: source.status().into(),
            message: source.to_string(),
        }
    }

    pub(crate) fn body_read(source: surf::Error) -> Self {
        Error::BodyRead {
            message: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        let err: Error = serde_json::from_str::<u32>("nope")
            .map_err(|source| Error::JsonDecode { source })
            .unwrap_err();
        assert!(err.is_deserialization());
        assert!(!err.is_cancelled());
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::invalid_argument("name", "empty").is_deserialization());
    }

    #[test]
    fn invalid_argument_message_names_argument() {
        let err = Error::invalid_argument("header", "name must not be empty");
        assert_eq!(
            err.to_string(),
            "invalid argument `header`: name must not be empty"
        );
    }
}
