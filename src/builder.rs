// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The in-progress description of an outgoing request.
//!
//! Extractors populate an [HttpRequestBuilder]; [HttpRequestBuilder::build] then turns it into a
//! [surf::Request], encoding the body through the [ContentProcessors] chain.

use crate::config::{validate_base_url, ServiceContext};
use crate::content::{Charset, RawContent};
use crate::envelope::{header_value, HeaderCollection};
use crate::error::{Error, Result};
use crate::hooks::{PreSendHook, RequestEventHandler};
use crate::processor::ContentProcessors;
use itertools::Itertools;
use serde_json::{Map, Value};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use surf::http::headers::{CONTENT_TYPE, COOKIE};
use surf::http::{self, Method, Version};
use surf::Url;

/// The body of a request, before encoding.
#[derive(Debug)]
pub struct RequestBody {
    pub content: RawContent,
    pub content_type: Option<String>,
    pub charset: Option<Charset>,
}

/// Per-request properties, attached to the outgoing request as an extension.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestProperties(pub Map<String, Value>);

pub struct HttpRequestBuilder {
    method: Method,
    url: String,
    route: Option<String>,
    path: Vec<(String, String)>,
    query: Vec<(String, String)>,
    headers: HeaderCollection,
    cookies: Vec<(String, String)>,
    body: Option<RequestBody>,
    version: Option<Version>,
    timeout: Option<Duration>,
    properties: Map<String, Value>,
    event_handlers: Vec<Arc<dyn RequestEventHandler>>,
    pre_send_hooks: Vec<PreSendHook>,
    profiler: bool,
    json_response_wrapping: bool,
    ensure_success: bool,
}

impl Default for HttpRequestBuilder {
    fn default() -> Self {
        Self::new(Method::Get, "")
    }
}

impl Debug for HttpRequestBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequestBuilder")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("route", &self.route)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("body", &self.body)
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .field("properties", &self.properties)
            .field("event_handlers", &self.event_handlers.len())
            .field("pre_send_hooks", &self.pre_send_hooks.len())
            .field("profiler", &self.profiler)
            .field("json_response_wrapping", &self.json_response_wrapping)
            .field("ensure_success", &self.ensure_success)
            .finish()
    }
}

impl HttpRequestBuilder {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            route: None,
            path: Vec::new(),
            query: Vec::new(),
            headers: HeaderCollection::new(),
            cookies: Vec::new(),
            body: None,
            version: None,
            timeout: None,
            properties: Map::new(),
            event_handlers: Vec::new(),
            pre_send_hooks: Vec::new(),
            profiler: false,
            json_response_wrapping: false,
            ensure_success: false,
        }
    }

    pub fn set_method(&mut self, method: Method) -> &mut Self {
        self.method = method;
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Set the URL, which may be a template with `{name}` path placeholders.
    pub fn set_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.url = url.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Name the route, selecting its per-route configuration.
    pub fn set_route(&mut self, route: impl Into<String>) -> &mut Self {
        self.route = Some(route.into());
        self
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// Bind a path placeholder, replacing any earlier binding of the same name.
    pub fn set_path_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        let name = name.into();
        self.path.retain(|(k, _)| *k != name);
        self.path.push((name, value.into()));
        self
    }

    pub fn add_query(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Parameters already bound to the path or the query string, in that order.
    pub fn bound_parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.path
            .iter()
            .chain(&self.query)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bound_parameters().any(|(k, _)| k == name)
    }

    /// Append a header value. Names and values are validated here, not at [Self::build].
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<&mut Self> {
        self.headers.append(name, value)?;
        Ok(self)
    }

    /// Replace every value of a header.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<&mut Self> {
        self.headers.set(name, value)?;
        Ok(self)
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        self.headers.remove(name);
        self
    }

    pub fn remove_headers<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) -> &mut Self {
        for name in names {
            self.headers.remove(name);
        }
        self
    }

    pub fn headers(&self) -> &HeaderCollection {
        &self.headers
    }

    /// Add a cookie, replacing an earlier cookie of the same name.
    pub fn add_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        self.cookies.retain(|(k, _)| *k != name);
        self.cookies.push((name, value.into()));
        self
    }

    pub fn remove_cookie(&mut self, name: &str) -> &mut Self {
        self.cookies.retain(|(k, _)| k != name);
        self
    }

    pub fn remove_cookies<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) -> &mut Self {
        for name in names {
            self.remove_cookie(name);
        }
        self
    }

    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn set_body(&mut self, body: RequestBody) -> &mut Self {
        self.body = Some(body);
        self
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }

    pub fn set_version(&mut self, version: Version) -> &mut Self {
        self.version = Some(version);
        self
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: Value) -> &mut Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Register an event handler. Handlers are notified in registration order.
    pub fn add_event_handler(&mut self, handler: Arc<dyn RequestEventHandler>) -> &mut Self {
        self.event_handlers.push(handler);
        self
    }

    pub fn event_handlers(&self) -> &[Arc<dyn RequestEventHandler>] {
        &self.event_handlers
    }

    /// Register a pre-send hook. Hooks run in registration order.
    pub fn add_on_pre_send_request(&mut self, hook: PreSendHook) -> &mut Self {
        self.pre_send_hooks.push(hook);
        self
    }

    pub fn on_pre_send_requests(&self) -> &[PreSendHook] {
        &self.pre_send_hooks
    }

    pub fn profiler(&mut self, enabled: bool) -> &mut Self {
        self.profiler = enabled;
        self
    }

    pub fn is_profiled(&self) -> bool {
        self.profiler
    }

    pub fn json_response_wrapping(&mut self, enabled: bool) -> &mut Self {
        self.json_response_wrapping = enabled;
        self
    }

    pub fn is_json_response_wrapping(&self) -> bool {
        self.json_response_wrapping
    }

    /// Turn non-success responses into [Error::UnsuccessfulStatus].
    pub fn ensure_success(&mut self, enabled: bool) -> &mut Self {
        self.ensure_success = enabled;
        self
    }

    pub fn ensures_success(&self) -> bool {
        self.ensure_success
    }

    fn resolve_url(&self, base_url: Option<&str>) -> Result<Url> {
        let path = expand_template(&self.url, &self.path)?;
        let mut url = match base_url {
            Some(base) => validate_base_url(base)?
                .join(&path)
                .map_err(|err| Error::InvalidUrl {
                    url: path.clone(),
                    message: err.to_string(),
                })?,
            None => validate_base_url(&path)?,
        };
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        Ok(url)
    }

    /// Produce the request described by this builder.
    ///
    /// The URL is resolved against the configured base URL, and the body is encoded with
    /// `processors` using the serializer options of this builder's route. A Content-Type header
    /// set on the builder takes precedence over the one reported by the processor.
    pub fn build(
        self,
        context: &ServiceContext,
        processors: &ContentProcessors,
    ) -> Result<PreparedRequest> {
        let context = Arc::new(match &self.route {
            Some(route) => context.for_route(route.as_str()),
            None => context.clone(),
        });
        let url = self.resolve_url(context.config().base_url.as_deref())?;
        let mut request = http::Request::new(self.method, url);
        if let Some(version) = self.version {
            request.set_version(Some(version));
        }
        for (name, values) in self.headers.entries() {
            request.append_header(name.clone(), values);
        }
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, urlencoding::encode(value)))
                .join("; ");
            request.append_header(COOKIE, header_value("Cookie", &cookie)?);
        }
        if let Some(body) = self.body {
            let charset = body
                .charset
                .unwrap_or(context.config().default_charset);
            let encoded = processors.encode(
                body.content,
                body.content_type.as_deref(),
                charset,
                Some(&context),
            )?;
            if !self.headers.contains("content-type") {
                request.insert_header(
                    CONTENT_TYPE,
                    header_value("Content-Type", encoded.content_type())?,
                );
            }
            request.set_body(encoded.into_body());
        }
        request
            .ext_mut()
            .insert(RequestProperties(self.properties.clone()));

        Ok(PreparedRequest {
            request: surf::Request::from(request),
            context,
            timeout: self.timeout,
            properties: self.properties,
            event_handlers: self.event_handlers,
            pre_send_hooks: self.pre_send_hooks,
            profiler: self.profiler,
            json_response_wrapping: self.json_response_wrapping,
            ensure_success: self.ensure_success,
        })
    }
}

/// A request ready to be sent, with the per-call settings that govern sending it.
pub struct PreparedRequest {
    pub request: surf::Request,
    /// The service context for this call, scoped to its route.
    pub context: Arc<ServiceContext>,
    pub timeout: Option<Duration>,
    pub properties: Map<String, Value>,
    pub event_handlers: Vec<Arc<dyn RequestEventHandler>>,
    pub pre_send_hooks: Vec<PreSendHook>,
    pub profiler: bool,
    pub json_response_wrapping: bool,
    pub ensure_success: bool,
}

/// Substitute `{name}` placeholders with percent-encoded path bindings.
fn expand_template(template: &str, bindings: &[(String, String)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let end = match rest[start..].find('}') {
            Some(offset) => start + offset,
            None => break,
        };
        out.push_str(&rest[..start]);
        let name = &rest[start + 1..end];
        let (_, value) = bindings
            .iter()
            .find(|(k, _)| k == name)
            .ok_or_else(|| Error::invalid_argument(name, "path parameter is not bound"))?;
        out.push_str(&urlencoding::encode(value));
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
