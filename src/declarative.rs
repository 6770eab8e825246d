// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The metadata of a declarative call site.
//!
//! A [DeclarativeContext] describes one invocation of a remote method: the method's
//! [MethodMetadata] (including the annotations of the contract it belongs to) and the
//! [Parameter]s it was called with. Extractors read the context and populate an
//! [HttpRequestBuilder](crate::builder::HttpRequestBuilder).

use crate::content::{Charset, FileContent, RawContent};
use crate::error::{Error, Result};
use crate::hooks::{PreSendHook, RequestEventHandler};
use serde::Serialize;
use serde_json::Value;
use snafu::ResultExt;
use std::collections::BTreeSet;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use surf::http::Version;

/// A method-level or contract-level annotation.
#[derive(Clone, Debug, PartialEq)]
pub enum Annotation {
    /// Add a header, replace it (`replace`), or remove it when there is no value.
    Header {
        name: String,
        value: Option<String>,
        replace: bool,
    },
    /// Add a cookie, or remove it when there is no value.
    Cookie { name: String, value: Option<String> },
    Query { name: String, value: String },
    Property { name: String, value: Value },
    HttpVersion(Version),
    Timeout(Duration),
    Profiler(bool),
    JsonResponseWrapping(bool),
    EnsureSuccessStatusCode,
}

impl Annotation {
    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Annotation::Header {
            name: name.into(),
            value: Some(value.into()),
            replace: false,
        }
    }

    pub fn set_header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Annotation::Header {
            name: name.into(),
            value: Some(value.into()),
            replace: true,
        }
    }

    pub fn remove_header(name: impl Into<String>) -> Self {
        Annotation::Header {
            name: name.into(),
            value: None,
            replace: false,
        }
    }

    pub fn cookie(name: impl Into<String>, value: impl Into<String>) -> Self {
        Annotation::Cookie {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn remove_cookie(name: impl Into<String>) -> Self {
        Annotation::Cookie {
            name: name.into(),
            value: None,
        }
    }

    pub fn query(name: impl Into<String>, value: impl Into<String>) -> Self {
        Annotation::Query {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn property(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Annotation::Property {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Explicit naming on a parameter binding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Binding {
    pub name: Option<String>,
    pub alias: Option<String>,
}

impl Binding {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            alias: None,
        }
    }

    pub fn aliased(alias: impl Into<String>) -> Self {
        Self {
            name: None,
            alias: Some(alias.into()),
        }
    }
}

/// An annotation on a single parameter, saying where its argument goes.
#[derive(Clone, Debug, PartialEq)]
pub enum ParameterAnnotation {
    Path(Binding),
    Query(Binding),
    Header(Binding),
    Cookie(Binding),
    Property(Binding),
    Body {
        content_type: Option<String>,
        charset: Option<Charset>,
    },
    Multipart {
        name: Option<String>,
        file_name: Option<String>,
        content_type: Option<String>,
    },
}

impl ParameterAnnotation {
    pub fn path() -> Self {
        ParameterAnnotation::Path(Binding::default())
    }

    pub fn query() -> Self {
        ParameterAnnotation::Query(Binding::default())
    }

    pub fn header() -> Self {
        ParameterAnnotation::Header(Binding::default())
    }

    pub fn cookie() -> Self {
        ParameterAnnotation::Cookie(Binding::default())
    }

    pub fn property() -> Self {
        ParameterAnnotation::Property(Binding::default())
    }

    pub fn body() -> Self {
        ParameterAnnotation::Body {
            content_type: None,
            charset: None,
        }
    }

    pub fn body_as(content_type: impl Into<String>) -> Self {
        ParameterAnnotation::Body {
            content_type: Some(content_type.into()),
            charset: None,
        }
    }

    pub fn multipart() -> Self {
        ParameterAnnotation::Multipart {
            name: None,
            file_name: None,
            content_type: None,
        }
    }
}

/// Raw content passed as an argument.
///
/// Ordinary extractors read a copy with [ContentSlot::cloned], which leaves the slot intact.
/// Content without a copy (streams) can only be moved out with [ContentSlot::take], which is
/// reserved for frozen extractors; later takes see nothing.
#[derive(Clone, Default)]
pub struct ContentSlot(Arc<Mutex<Option<RawContent>>>);

impl ContentSlot {
    pub fn new(content: RawContent) -> Self {
        Self(Arc::new(Mutex::new(Some(content))))
    }

    fn with<R>(&self, f: impl FnOnce(&mut Option<RawContent>) -> R) -> R {
        match self.0.lock() {
            Ok(mut content) => f(&mut content),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// A copy of the content, if there is content and it can be copied.
    pub fn cloned(&self) -> Option<RawContent> {
        self.with(|content| content.as_ref().and_then(RawContent::try_clone))
    }

    /// Whether the slot holds content which can only be moved out.
    pub fn is_single_use(&self) -> bool {
        self.with(|content| matches!(content, Some(c) if c.try_clone().is_none()))
    }

    pub fn take(&self) -> Option<RawContent> {
        self.with(|content| content.take())
    }
}

impl Debug for ContentSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("ContentSlot")
    }
}

/// The value a parameter was called with.
#[derive(Clone)]
pub enum Argument {
    Null,
    Value(Value),
    Content(ContentSlot),
    File(FileContent),
    Events(Arc<dyn RequestEventHandler>),
    OnPreSend(PreSendHook),
}

impl Debug for Argument {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Null => f.write_str("Null"),
            Argument::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Argument::Content(slot) => f.debug_tuple("Content").field(slot).finish(),
            Argument::File(file) => f.debug_tuple("File").field(&file.file_name).finish(),
            Argument::Events(_) => f.write_str("Events"),
            Argument::OnPreSend(_) => f.write_str("OnPreSend"),
        }
    }
}

impl Argument {
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Argument::Value(
            serde_json::to_value(value).context(crate::error::JsonEncodeSnafu)?,
        ))
    }

    pub fn content(content: impl Into<RawContent>) -> Self {
        Argument::Content(ContentSlot::new(content.into()))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Argument::Value(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    /// An alias set on the parameter itself, overriding any annotation naming.
    pub alias: Option<String>,
    pub annotations: Vec<ParameterAnnotation>,
    pub argument: Argument,
}

impl Parameter {
    pub fn new(name: impl Into<String>, argument: Argument) -> Self {
        Self {
            name: name.into(),
            alias: None,
            annotations: Vec::new(),
            argument,
        }
    }

    /// A parameter holding a serializable value.
    pub fn value<T: Serialize + ?Sized>(name: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(name, Argument::value(value)?))
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn annotate(mut self, annotation: ParameterAnnotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn is_unannotated(&self) -> bool {
        self.annotations.is_empty()
    }

    /// The effective key for a binding on this parameter.
    ///
    /// The parameter's own alias wins, then the binding's alias, then the binding's name, then
    /// the parameter's name.
    pub fn key(&self, binding: Option<&Binding>) -> Result<String> {
        let key = self
            .alias
            .as_deref()
            .or_else(|| binding.and_then(|b| b.alias.as_deref()))
            .or_else(|| binding.and_then(|b| b.name.as_deref()))
            .unwrap_or(&self.name);
        if key.trim().is_empty() {
            return Err(Error::invalid_argument(
                &self.name,
                "parameter binding resolves to an empty name",
            ));
        }
        Ok(key.to_string())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MethodMetadata {
    /// Method name, also used as the route name for per-route configuration.
    pub name: String,
    pub http_method: String,
    pub url: String,
    pub annotations: Vec<Annotation>,
    /// Annotations on the contract which declares the method.
    pub contract_annotations: Vec<Annotation>,
}

impl MethodMetadata {
    pub fn new(
        name: impl Into<String>,
        http_method: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            http_method: http_method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn annotate(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn annotate_contract(mut self, annotation: Annotation) -> Self {
        self.contract_annotations.push(annotation);
        self
    }
}

#[derive(Debug)]
pub struct DeclarativeContext {
    method: MethodMetadata,
    parameters: Vec<Parameter>,
    frozen: BTreeSet<usize>,
}

impl DeclarativeContext {
    pub fn new(method: MethodMetadata) -> Self {
        Self {
            method,
            parameters: Vec::new(),
            frozen: BTreeSet::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn method(&self) -> &MethodMetadata {
        &self.method
    }

    /// All annotations in processing order: contract-level first, then method-level.
    pub fn annotations(&self) -> impl Iterator<Item = &Annotation> {
        self.method
            .contract_annotations
            .iter()
            .chain(&self.method.annotations)
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Parameters not yet claimed by a frozen extractor, with their positions.
    pub fn unfrozen_parameters(&self) -> impl Iterator<Item = (usize, &Parameter)> {
        self.parameters
            .iter()
            .enumerate()
            .filter(move |(index, _)| !self.frozen.contains(index))
    }

    pub fn is_frozen(&self, index: usize) -> bool {
        self.frozen.contains(&index)
    }

    /// Claim the parameter at `index`. Claims are permanent.
    pub fn freeze(&mut self, index: usize) {
        self.frozen.insert(index);
    }
}

/// Expand an argument value into `(key, value)` bindings.
///
/// Scalars bind directly under `key` and arrays bind each element under `key`. Objects expand
/// into one or more bindings per field, keyed by the field name. `null` binds nothing.
pub fn expand_value(key: &str, value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Object(fields) => fields
            .iter()
            .flat_map(|(field, value)| expand_scalar(field, value))
            .collect(),
        value => expand_scalar(key, value),
    }
}

fn expand_scalar(key: &str, value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .iter()
            .filter_map(scalar_to_string)
            .map(|item| (key.to_string(), item))
            .collect(),
        value => scalar_to_string(value)
            .map(|item| vec![(key.to_string(), item)])
            .unwrap_or_default(),
    }
}

/// Render a scalar as a binding value. Nested objects and arrays are rendered as JSON.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    #[serde(rename_all = "lowercase")]
    enum Color {
        Red,
    }

    #[test]
    fn key_priority() {
        let param = Parameter::new("user_id", Argument::Null);
        assert_eq!(param.key(None).unwrap(), "user_id");
        assert_eq!(param.key(Some(&Binding::named("id"))).unwrap(), "id");

        let binding = Binding {
            name: Some("id".into()),
            alias: Some("uid".into()),
        };
        assert_eq!(param.key(Some(&binding)).unwrap(), "uid");
        let param = param.with_alias("user");
        assert_eq!(param.key(Some(&binding)).unwrap(), "user");
    }

    #[test]
    fn empty_names_are_rejected() {
        let param = Parameter::new("", Argument::Null);
        assert!(matches!(
            param.key(None),
            Err(Error::InvalidArgument { .. })
        ));
        let param = Parameter::new("p", Argument::Null);
        assert!(param.key(Some(&Binding::named(" "))).is_err());
    }

    #[test]
    fn expands_values() {
        assert_eq!(expand_value("n", &json!(3)), vec![("n".into(), "3".into())]);
        assert_eq!(
            expand_value("tag", &json!(["a", "b"])),
            vec![("tag".into(), "a".into()), ("tag".into(), "b".into())]
        );
        assert_eq!(
            expand_value("filter", &json!({"page": 2, "size": null, "q": "x"})),
            vec![("page".into(), "2".into()), ("q".into(), "x".into())]
        );
        assert!(expand_value("gone", &Value::Null).is_empty());
        let color = Argument::value(&Color::Red).unwrap();
        assert_eq!(
            expand_value("color", color.as_value().unwrap()),
            vec![("color".into(), "red".into())]
        );
    }

    #[test]
    fn freezing_hides_parameters() {
        let mut context = DeclarativeContext::new(MethodMetadata::new("m", "GET", "/"))
            .with_parameter(Parameter::new("a", Argument::Null))
            .with_parameter(Parameter::new("b", Argument::Null));
        context.freeze(0);
        let names: Vec<_> = context
            .unfrozen_parameters()
            .map(|(_, p)| p.name.as_str())
            .collect();
        assert_eq!(names, ["b"]);
        assert!(context.is_frozen(0));
    }

    #[test]
    fn content_is_taken_once() {
        let arg = Argument::content("body");
        let slot = match &arg {
            Argument::Content(slot) => slot.clone(),
            _ => unreachable!(),
        };
        assert!(matches!(slot.cloned(), Some(RawContent::Text(t)) if t == "body"));
        assert!(!slot.is_single_use());
        assert!(matches!(slot.take(), Some(RawContent::Text(t)) if t == "body"));
        assert!(slot.take().is_none());
        assert!(slot.cloned().is_none());
    }

    #[test]
    fn streams_are_single_use() {
        let slot = ContentSlot::new(RawContent::Stream(surf::Body::from_bytes(vec![1, 2])));
        assert!(slot.is_single_use());
        assert!(slot.cloned().is_none());
        assert!(matches!(slot.take(), Some(RawContent::Stream(_))));
        assert!(!slot.is_single_use());
    }
}
