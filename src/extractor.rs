// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Extractors turn declarative metadata into mutations of an [HttpRequestBuilder].
//!
//! There are two kinds. A [DeclarativeExtractor] only reads the [DeclarativeContext] and may
//! run any number of times. A [FrozenParameterExtractor] runs once, after every ordinary
//! extractor, and freezes the parameters it consumes so that later frozen extractors no longer
//! see them.
//!
//! Each extractor declares an [order](DeclarativeExtractor::order). Extractors run in ascending
//! order; extractors with equal order run in registration order.

use crate::builder::{HttpRequestBuilder, RequestBody};
use crate::content::{Charset, Multipart, RawContent};
use crate::declarative::{
    expand_value, scalar_to_string, Annotation, Argument, Binding, DeclarativeContext,
    Parameter, ParameterAnnotation,
};
use crate::error::{Error, Result};
use itertools::Itertools;
use serde_json::Value;
use std::any::type_name;
use std::str::FromStr;
use surf::http::{mime, Method};

pub trait DeclarativeExtractor: Send + Sync {
    fn order(&self) -> i32;

    fn extract(&self, builder: &mut HttpRequestBuilder, context: &DeclarativeContext)
        -> Result<()>;

    fn name(&self) -> &'static str {
        type_name::<Self>()
    }
}

pub trait FrozenParameterExtractor: Send + Sync {
    fn order(&self) -> i32;

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &mut DeclarativeContext,
    ) -> Result<()>;

    fn name(&self) -> &'static str {
        type_name::<Self>()
    }
}

fn require_name(name: &str, what: &str) -> Result<()> {
    if name.trim().is_empty() {
        Err(Error::invalid_argument(what, "name must not be empty"))
    } else {
        Ok(())
    }
}

/// Unfrozen parameters carrying a binding of the kind selected by `select`, with that binding.
fn bound<'a>(
    context: &'a DeclarativeContext,
    select: impl Fn(&'a ParameterAnnotation) -> Option<&'a Binding> + 'a,
) -> impl Iterator<Item = (&'a Parameter, &'a Binding)> + 'a {
    context.unfrozen_parameters().flat_map(move |(_, param)| {
        param
            .annotations
            .iter()
            .filter_map(|ann| select(ann))
            .map(move |binding| (param, binding))
            .collect::<Vec<_>>()
    })
}

/// Validates the HTTP method and seeds the builder with the method, URL and route.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpMethodExtractor;

impl DeclarativeExtractor for HttpMethodExtractor {
    fn order(&self) -> i32 {
        -100
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        let metadata = context.method();
        require_name(&metadata.http_method, "http_method")?;
        let method = Method::from_str(&metadata.http_method.to_ascii_uppercase())
            .map_err(|err| Error::invalid_argument("http_method", err.to_string()))?;
        builder.set_method(method).set_url(metadata.url.as_str());
        if !metadata.name.is_empty() {
            builder.set_route(metadata.name.as_str());
        }
        Ok(())
    }
}

/// Binds path placeholders.
///
/// Parameters annotated as path bindings are bound, as are unannotated value parameters whose
/// name matches a `{placeholder}` of the URL template. Arrays are joined with commas.
#[derive(Clone, Copy, Debug, Default)]
pub struct PathExtractor;

fn path_value(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => Some(items.iter().filter_map(scalar_to_string).join(",")),
        value => scalar_to_string(value),
    }
}

fn path_bindings(key: String, value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Object(fields) => fields
            .iter()
            .filter_map(|(field, value)| path_value(value).map(|v| (field.clone(), v)))
            .collect(),
        value => path_value(value)
            .map(|v| vec![(key, v)])
            .unwrap_or_default(),
    }
}

impl DeclarativeExtractor for PathExtractor {
    fn order(&self) -> i32 {
        1
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        let explicit = bound(context, |ann| match ann {
            ParameterAnnotation::Path(binding) => Some(binding),
            _ => None,
        })
        .map(|(param, binding)| param.key(Some(binding)).map(|key| (param, key)));
        let template = context.method().url.as_str();
        let implicit = context
            .unfrozen_parameters()
            .filter(|(_, param)| param.is_unannotated())
            .map(|(_, param)| param.key(None).map(|key| (param, key)))
            .filter(|res| match res {
                Ok((_, key)) => template.contains(&format!("{{{}}}", key)),
                Err(_) => true,
            });
        for res in explicit.chain(implicit) {
            let (param, key) = res?;
            if let Some(value) = param.argument.as_value() {
                for (name, value) in path_bindings(key, value) {
                    builder.set_path_parameter(name, value);
                }
            }
        }
        Ok(())
    }
}

/// Adds query parameters from annotations and parameters.
///
/// Unannotated value parameters which are not already bound go to the query string.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryExtractor;

impl DeclarativeExtractor for QueryExtractor {
    fn order(&self) -> i32 {
        2
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        for ann in context.annotations() {
            if let Annotation::Query { name, value } = ann {
                require_name(name, "query")?;
                builder.add_query(name.as_str(), value.as_str());
            }
        }
        for (param, binding) in bound(context, |ann| match ann {
            ParameterAnnotation::Query(binding) => Some(binding),
            _ => None,
        }) {
            let key = param.key(Some(binding))?;
            if let Some(value) = param.argument.as_value() {
                for (name, value) in expand_value(&key, value) {
                    builder.add_query(name, value);
                }
            }
        }
        for (_, param) in context.unfrozen_parameters() {
            if !param.is_unannotated() {
                continue;
            }
            let value = match param.argument.as_value() {
                Some(value) => value,
                None => continue,
            };
            let key = param.key(None)?;
            if builder.is_bound(&key) {
                continue;
            }
            for (name, value) in expand_value(&key, value) {
                builder.add_query(name, value);
            }
        }
        Ok(())
    }
}

/// Applies header annotations and header parameters.
///
/// A header annotation without a value removes the header.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderExtractor;

impl DeclarativeExtractor for HeaderExtractor {
    fn order(&self) -> i32 {
        3
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        for ann in context.annotations() {
            if let Annotation::Header {
                name,
                value,
                replace,
            } = ann
            {
                require_name(name, "header")?;
                match value {
                    None => {
                        builder.remove_header(name);
                    }
                    Some(value) if *replace => {
                        builder.set_header(name, value)?;
                    }
                    Some(value) => {
                        builder.add_header(name, value)?;
                    }
                }
            }
        }
        for (param, binding) in bound(context, |ann| match ann {
            ParameterAnnotation::Header(binding) => Some(binding),
            _ => None,
        }) {
            let key = param.key(Some(binding))?;
            if let Some(value) = param.argument.as_value() {
                for (name, value) in expand_value(&key, value) {
                    builder.add_header(&name, &value)?;
                }
            }
        }
        Ok(())
    }
}

/// Applies cookie annotations and cookie parameters.
///
/// A cookie annotation without a value removes the cookie.
#[derive(Clone, Copy, Debug, Default)]
pub struct CookieExtractor;

impl DeclarativeExtractor for CookieExtractor {
    fn order(&self) -> i32 {
        4
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        for ann in context.annotations() {
            if let Annotation::Cookie { name, value } = ann {
                require_name(name, "cookie")?;
                match value {
                    Some(value) => builder.add_cookie(name.as_str(), value.as_str()),
                    None => builder.remove_cookie(name),
                };
            }
        }
        for (param, binding) in bound(context, |ann| match ann {
            ParameterAnnotation::Cookie(binding) => Some(binding),
            _ => None,
        }) {
            let key = param.key(Some(binding))?;
            if let Some(value) = param.argument.as_value() {
                for (name, value) in expand_value(&key, value) {
                    builder.add_cookie(name, value);
                }
            }
        }
        Ok(())
    }
}

/// Fills the per-request properties bag. Property values are stored as-is, without expansion.
#[derive(Clone, Copy, Debug, Default)]
pub struct PropertyExtractor;

impl DeclarativeExtractor for PropertyExtractor {
    fn order(&self) -> i32 {
        5
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        for ann in context.annotations() {
            if let Annotation::Property { name, value } = ann {
                require_name(name, "property")?;
                builder.set_property(name.as_str(), value.clone());
            }
        }
        for (param, binding) in bound(context, |ann| match ann {
            ParameterAnnotation::Property(binding) => Some(binding),
            _ => None,
        }) {
            let key = param.key(Some(binding))?;
            match param.argument.as_value() {
                Some(Value::Null) | None => {}
                Some(value) => {
                    builder.set_property(key, value.clone());
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HttpVersionExtractor;

impl DeclarativeExtractor for HttpVersionExtractor {
    fn order(&self) -> i32 {
        6
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        for ann in context.annotations() {
            if let Annotation::HttpVersion(version) = ann {
                builder.set_version(*version);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TimeoutExtractor;

impl DeclarativeExtractor for TimeoutExtractor {
    fn order(&self) -> i32 {
        7
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        for ann in context.annotations() {
            if let Annotation::Timeout(timeout) = ann {
                if timeout.as_nanos() == 0 {
                    return Err(Error::invalid_argument("timeout", "must be positive"));
                }
                builder.set_timeout(*timeout);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProfilerExtractor;

impl DeclarativeExtractor for ProfilerExtractor {
    fn order(&self) -> i32 {
        8
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        for ann in context.annotations() {
            if let Annotation::Profiler(enabled) = ann {
                builder.profiler(*enabled);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonResponseWrappingExtractor;

impl DeclarativeExtractor for JsonResponseWrappingExtractor {
    fn order(&self) -> i32 {
        9
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        for ann in context.annotations() {
            if let Annotation::JsonResponseWrapping(enabled) = ann {
                builder.json_response_wrapping(*enabled);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EnsureSuccessStatusCodeExtractor;

impl DeclarativeExtractor for EnsureSuccessStatusCodeExtractor {
    fn order(&self) -> i32 {
        10
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        if context
            .annotations()
            .any(|ann| matches!(ann, Annotation::EnsureSuccessStatusCode))
        {
            builder.ensure_success(true);
        }
        Ok(())
    }
}

/// Sets the request body.
///
/// The body comes from the parameter annotated as the body, or from an unannotated parameter
/// holding raw content or a file. When several parameters qualify, the last one wins. Content
/// is copied, so the context can be extracted again; stream content is left to
/// [StreamBodyExtractor].
#[derive(Clone, Copy, Debug, Default)]
pub struct BodyExtractor;

/// The content type and charset under which `param` is sent as the body, if it is a body.
fn body_target(param: &Parameter) -> Option<(Option<String>, Option<Charset>)> {
    param
        .annotations
        .iter()
        .find_map(|ann| match ann {
            ParameterAnnotation::Body {
                content_type,
                charset,
            } => Some((content_type.clone(), *charset)),
            _ => None,
        })
        .or_else(|| param.is_unannotated().then(|| (None, None)))
}

fn value_content(value: &Value) -> Option<RawContent> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(RawContent::Text(text.clone())),
        Value::Bool(_) | Value::Number(_) => Some(RawContent::Text(value.to_string())),
        value => Some(RawContent::Object(value.clone())),
    }
}

impl DeclarativeExtractor for BodyExtractor {
    fn order(&self) -> i32 {
        11
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &DeclarativeContext,
    ) -> Result<()> {
        for (_, param) in context.unfrozen_parameters() {
            let (content_type, charset) = match body_target(param) {
                Some(target) => target,
                None => continue,
            };
            let annotated = !param.is_unannotated();
            let content = match &param.argument {
                Argument::Content(slot) => slot.cloned(),
                Argument::File(file) => Some(RawContent::File(file.clone())),
                Argument::Value(value) if annotated => value_content(value),
                _ => None,
            };
            if let Some(content) = content {
                builder.set_body(RequestBody {
                    content,
                    content_type,
                    charset,
                });
            }
        }
        Ok(())
    }
}

/// Sets a stream body. A stream can be read once, so its parameter is consumed and frozen.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamBodyExtractor;

impl FrozenParameterExtractor for StreamBodyExtractor {
    fn order(&self) -> i32 {
        0
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &mut DeclarativeContext,
    ) -> Result<()> {
        let mut claimed = Vec::new();
        for (index, param) in context.unfrozen_parameters() {
            let slot = match &param.argument {
                Argument::Content(slot) if slot.is_single_use() => slot,
                _ => continue,
            };
            let (content_type, charset) = match body_target(param) {
                Some(target) => target,
                None => continue,
            };
            if let Some(content) = slot.take() {
                builder.set_body(RequestBody {
                    content,
                    content_type,
                    charset,
                });
            }
            claimed.push(index);
        }
        for index in claimed {
            context.freeze(index);
        }
        Ok(())
    }
}

/// Collects parameters annotated as multipart parts into a `multipart/form-data` body.
#[derive(Clone, Copy, Debug, Default)]
pub struct MultipartExtractor;

impl MultipartExtractor {
    fn add_part(
        form: Multipart,
        key: String,
        argument: &Argument,
        file_name: Option<&String>,
        content_type: Option<&String>,
    ) -> Result<Multipart> {
        let content = match argument {
            Argument::Value(value) => match value_content(value) {
                Some(content) => content,
                None => return Ok(form),
            },
            Argument::File(file) => RawContent::File(file.clone()),
            Argument::Content(slot) => match slot.take() {
                Some(content) => content,
                None => return Ok(form),
            },
            _ => return Err(Error::invalid_argument(key, "cannot be sent as a multipart part")),
        };
        Ok(match content {
            RawContent::Text(text) => match content_type {
                Some(ty) => form.bytes(key, text.into_bytes(), Some(ty.clone())),
                None => form.text(key, text),
            },
            RawContent::Json(value) | RawContent::Object(value) => form.bytes(
                key,
                value.to_string().into_bytes(),
                Some(
                    content_type
                        .cloned()
                        .unwrap_or_else(|| mime::JSON.essence().to_string()),
                ),
            ),
            RawContent::Bytes(bytes) => form.bytes(key, bytes, content_type.cloned()),
            RawContent::File(mut file) => {
                if let Some(name) = file_name {
                    file.file_name = name.clone();
                }
                if let Some(ty) = content_type {
                    file.content_type = Some(ty.clone());
                }
                form.file(key, file)
            }
            other => {
                return Err(Error::invalid_argument(
                    key,
                    format!("{} content cannot be sent as a multipart part", other.kind()),
                ))
            }
        })
    }
}

impl FrozenParameterExtractor for MultipartExtractor {
    fn order(&self) -> i32 {
        1
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &mut DeclarativeContext,
    ) -> Result<()> {
        let mut claimed = Vec::new();
        let mut form = Multipart::new();
        for (index, param) in context.unfrozen_parameters() {
            let (name, file_name, content_type) =
                match param.annotations.iter().find_map(|ann| match ann {
                    ParameterAnnotation::Multipart {
                        name,
                        file_name,
                        content_type,
                    } => Some((name, file_name, content_type)),
                    _ => None,
                }) {
                    Some(part) => part,
                    None => continue,
                };
            let binding = Binding {
                name: name.clone(),
                alias: None,
            };
            let key = param.key(Some(&binding))?;
            form = Self::add_part(
                form,
                key,
                &param.argument,
                file_name.as_ref(),
                content_type.as_ref(),
            )?;
            claimed.push(index);
        }
        for index in claimed {
            context.freeze(index);
        }
        if !form.is_empty() {
            builder.set_body(RequestBody {
                content: RawContent::Multipart(form),
                content_type: None,
                charset: None,
            });
        }
        Ok(())
    }
}

/// Registers the event handlers and pre-send hooks passed as parameters, in parameter order.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventHandlerExtractor;

impl FrozenParameterExtractor for EventHandlerExtractor {
    fn order(&self) -> i32 {
        2
    }

    fn extract(
        &self,
        builder: &mut HttpRequestBuilder,
        context: &mut DeclarativeContext,
    ) -> Result<()> {
        let mut claimed = Vec::new();
        for (index, param) in context.unfrozen_parameters() {
            match &param.argument {
                Argument::Events(handler) => {
                    builder.add_event_handler(handler.clone());
                }
                Argument::OnPreSend(hook) => {
                    builder.add_on_pre_send_request(hook.clone());
                }
                _ => continue,
            }
            claimed.push(index);
        }
        for index in claimed {
            context.freeze(index);
        }
        Ok(())
    }
}
