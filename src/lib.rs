// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! # Declarative HTTP remote calls.
//!
//! A remote method is described by its metadata: an HTTP method and URL template, annotations
//! on the method and on the contract it belongs to (headers, cookies, HTTP version, timeouts),
//! and annotated parameters (path, query, header, cookie, body and multipart bindings). This
//! crate turns such a description into a `surf` request and the response back into a Rust
//! value.
//!
//! A call flows through three stages:
//!
//! 1. the [ExtractionPipeline] runs an ordered table of extractors over the
//!    [DeclarativeContext] of the call, populating an [HttpRequestBuilder];
//! 2. the [ContentProcessors] chain encodes the request body for its content type (text,
//!    JSON, XML, form, multipart or raw bytes);
//! 3. the [ConverterRegistry] picks a [Converter] for the requested result type, falling back
//!    to a generic JSON or XML deserializer chosen by the response's media type.
//!
//! [RemoteClient] drives all three over a [surf::Client]. Responses can additionally be checked
//! with the fail-fast [AssertionBuilder].
//!
//! Every asynchronous entry point takes a [CancellationToken] and has a blocking twin.

pub mod assertion;
pub mod builder;
pub mod cancel;
pub mod client;
pub mod config;
pub mod content;
pub mod converter;
pub mod declarative;
pub mod envelope;
pub mod error;
pub mod extractor;
pub mod hooks;
pub mod pipeline;
pub mod processor;
pub mod registry;

pub use assertion::{Assertion, AssertionBuilder, AssertionContext, Assertions};
pub use builder::{HttpRequestBuilder, PreparedRequest, RequestBody};
pub use cancel::CancellationToken;
pub use client::RemoteClient;
pub use config::{ClientConfig, JsonOptions, SerializerOptions, ServiceContext, XmlOptions};
pub use content::{Charset, EncodedBody, FileContent, Multipart, RawContent};
pub use converter::{ContentResult, ContentResultConverter, Converter, EmptyResult};
pub use declarative::{
    Annotation, Argument, Binding, DeclarativeContext, MethodMetadata, Parameter,
    ParameterAnnotation,
};
pub use envelope::{HeaderCollection, ResponseEnvelope};
pub use error::*;
pub use extractor::{DeclarativeExtractor, FrozenParameterExtractor};
pub use hooks::{PreSendHook, RequestEventHandler};
pub use pipeline::ExtractionPipeline;
pub use processor::{ContentProcessor, ContentProcessors};
pub use registry::{ConverterEntry, ConverterRegistry, ObjectConverterFactory};
