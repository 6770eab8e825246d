// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Converter resolution.
//!
//! The [ConverterRegistry] holds one [ConverterEntry] per concrete converter type, seeded with
//! the built-in converters. Each resolution works on a copy of that map into which the
//! caller's converters are inserted, so the shared map is never mutated and resolution can run
//! concurrently from any number of threads.
//!
//! Resolution for a target type `T`:
//! 1. among the merged entries, the *last* one converting to `T` wins, so converters supplied
//!    with a call take precedence over built-ins converting to the same type;
//! 2. otherwise the [ObjectConverterFactory] picks a generic deserializer by media type (XML for
//!    XML media types, JSON for everything else).
//!
//! Resolution itself never fails. A body which does not match `T` fails when it is read.

use crate::cancel::{block_on, CancellationToken};
use crate::config::ServiceContext;
use crate::content::is_xml_media_type;
use crate::converter::{
    ByteArrayContentConverter, Converter, ObjectContentConverter, ResponseEnvelopeConverter,
    StreamContentConverter, StringContentConverter, VoidContentConverter,
    XmlObjectContentConverter,
};
use crate::envelope::ResponseEnvelope;
use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use std::any::{type_name, Any, TypeId};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use tracing::{event, Level};

/// A converter whose target type is only known at run time.
#[async_trait]
pub trait ErasedConverter: Send + Sync {
    fn target_name(&self) -> &'static str;

    async fn read_any(
        &self,
        response: ResponseEnvelope,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Any + Send>>;

    fn read_any_blocking(&self, response: ResponseEnvelope) -> Result<Box<dyn Any + Send>> {
        block_on(self.read_any(response, &CancellationToken::new()))
    }
}

struct Erased<T> {
    inner: Arc<dyn Converter<T>>,
}

#[async_trait]
impl<T: Send + 'static> ErasedConverter for Erased<T> {
    fn target_name(&self) -> &'static str {
        type_name::<T>()
    }

    async fn read_any(
        &self,
        response: ResponseEnvelope,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Any + Send>> {
        let value = self.inner.read_async(response, cancel).await?;
        Ok(Box::new(value))
    }
}

/// A registered converter, tagged with its concrete type and its target type.
#[derive(Clone)]
pub struct ConverterEntry {
    concrete: TypeId,
    concrete_name: &'static str,
    target: TypeId,
    typed: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn ErasedConverter>,
}

impl Debug for ConverterEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterEntry")
            .field("converter", &self.concrete_name)
            .field("target", &self.erased.target_name())
            .finish()
    }
}

impl ConverterEntry {
    pub fn new<T, C>(converter: C) -> Self
    where
        T: Send + 'static,
        C: Converter<T> + 'static,
    {
        let typed: Arc<dyn Converter<T>> = Arc::new(converter);
        Self {
            concrete: TypeId::of::<C>(),
            concrete_name: type_name::<C>(),
            target: TypeId::of::<T>(),
            typed: Arc::new(typed.clone()),
            erased: Arc::new(Erased { inner: typed }),
        }
    }

    pub fn converter_name(&self) -> &'static str {
        self.concrete_name
    }

    pub fn target_name(&self) -> &'static str {
        self.erased.target_name()
    }

    pub fn converts_to(&self, target: TypeId) -> bool {
        self.target == target
    }

    /// The converter as a `Converter<T>`, if `T` is its target type.
    pub fn converter<T: 'static>(&self) -> Option<Arc<dyn Converter<T>>> {
        self.typed.downcast_ref::<Arc<dyn Converter<T>>>().cloned()
    }

    pub fn erased(&self) -> Arc<dyn ErasedConverter> {
        self.erased.clone()
    }
}

/// Chooses a generic deserializer for target types no registered converter handles.
pub trait ObjectConverterFactory: Send + Sync {
    fn object_converter<T: DeserializeOwned + Send + 'static>(
        &self,
        response: &ResponseEnvelope,
    ) -> Arc<dyn Converter<T>>;

    /// The fallback for dynamic resolution, which decodes into a [serde_json::Value].
    fn dynamic_converter(&self, response: &ResponseEnvelope) -> Arc<dyn ErasedConverter> {
        Arc::new(Erased {
            inner: self.object_converter::<serde_json::Value>(response),
        })
    }
}

/// XML for XML media types, JSON otherwise.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultObjectConverterFactory;

impl ObjectConverterFactory for DefaultObjectConverterFactory {
    fn object_converter<T: DeserializeOwned + Send + 'static>(
        &self,
        response: &ResponseEnvelope,
    ) -> Arc<dyn Converter<T>> {
        if response.mime().map_or(false, |ty| is_xml_media_type(&ty)) {
            Arc::new(XmlObjectContentConverter::<T>::default())
        } else {
            Arc::new(ObjectContentConverter::<T>::default())
        }
    }
}

pub struct ConverterRegistry<F = DefaultObjectConverterFactory> {
    builtins: IndexMap<TypeId, ConverterEntry>,
    factory: F,
    context: Arc<ServiceContext>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::with_factory(DefaultObjectConverterFactory)
    }
}

impl<F> Debug for ConverterRegistry<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("builtins", &self.builtins.values().collect::<Vec<_>>())
            .finish()
    }
}

impl<F: ObjectConverterFactory> ConverterRegistry<F> {
    pub fn with_factory(factory: F) -> Self {
        let builtins = vec![
            ConverterEntry::new::<ResponseEnvelope, _>(ResponseEnvelopeConverter),
            ConverterEntry::new::<String, _>(StringContentConverter),
            ConverterEntry::new::<Vec<u8>, _>(ByteArrayContentConverter),
            ConverterEntry::new::<surf::Body, _>(StreamContentConverter),
            ConverterEntry::new::<(), _>(VoidContentConverter),
        ]
        .into_iter()
        .map(|entry| (entry.concrete, entry))
        .collect();
        Self {
            builtins,
            factory,
            context: Arc::default(),
        }
    }

    /// The context installed in responses which arrive without one.
    pub fn with_context(mut self, context: Arc<ServiceContext>) -> Self {
        self.context = context;
        self
    }

    pub fn builtins(&self) -> impl Iterator<Item = &ConverterEntry> {
        self.builtins.values()
    }

    fn merged(&self, custom: &[ConverterEntry]) -> IndexMap<TypeId, ConverterEntry> {
        let mut merged = self.builtins.clone();
        for entry in custom {
            merged.insert(entry.concrete, entry.clone());
        }
        merged
    }

    fn find(&self, target: TypeId, custom: &[ConverterEntry]) -> Option<ConverterEntry> {
        let entry = self
            .merged(custom)
            .into_iter()
            .rev()
            .map(|(_, entry)| entry)
            .find(|entry| entry.converts_to(target))?;
        event!(
            Level::TRACE,
            "resolved {} to {}",
            entry.target_name(),
            entry.converter_name()
        );
        Some(entry)
    }

    /// Resolve a converter for `T` among the registered converters only.
    ///
    /// This is the resolution path for targets which cannot be deserialized generically, such
    /// as [ResponseEnvelope] and [surf::Body].
    pub fn try_resolve<T: 'static>(
        &self,
        response: &mut ResponseEnvelope,
        custom: &[ConverterEntry],
    ) -> Option<Arc<dyn Converter<T>>> {
        response.ensure_context(&self.context);
        self.find(TypeId::of::<T>(), custom)?.converter::<T>()
    }

    /// Resolve a converter for `T`, falling back to a generic deserializer.
    pub fn resolve<T: DeserializeOwned + Send + 'static>(
        &self,
        response: &mut ResponseEnvelope,
        custom: &[ConverterEntry],
    ) -> Arc<dyn Converter<T>> {
        match self.try_resolve::<T>(response, custom) {
            Some(converter) => converter,
            None => {
                event!(
                    Level::TRACE,
                    "no converter registered for {}, using generic object converter",
                    type_name::<T>()
                );
                self.factory.object_converter::<T>(response)
            }
        }
    }

    /// Resolve a converter for a target type known only by its [TypeId].
    pub fn resolve_dynamic(
        &self,
        target: TypeId,
        response: &mut ResponseEnvelope,
        custom: &[ConverterEntry],
    ) -> Arc<dyn ErasedConverter> {
        response.ensure_context(&self.context);
        match self.find(target, custom) {
            Some(entry) => entry.erased(),
            None => self.factory.dynamic_converter(response),
        }
    }

    /// Resolve a converter for `T` and read `response` with it.
    pub async fn read<T: DeserializeOwned + Send + 'static>(
        &self,
        mut response: ResponseEnvelope,
        custom: &[ConverterEntry],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let converter = self.resolve::<T>(&mut response, custom);
        converter.read_async(response, cancel).await
    }

    /// Read `response` as `T` with a registered converter only.
    ///
    /// Unlike [Self::read], `T` need not be deserializable, so this reaches targets such as
    /// [ResponseEnvelope] or [ContentResult](crate::ContentResult). Fails with
    /// [Error::InvalidArgument] if no converter produces `T`.
    pub async fn read_registered<T: Send + 'static>(
        &self,
        mut response: ResponseEnvelope,
        custom: &[ConverterEntry],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let converter = self
            .try_resolve::<T>(&mut response, custom)
            .ok_or_else(|| Error::invalid_argument(type_name::<T>(), "no converter registered"))?;
        converter.read_async(response, cancel).await
    }

    pub fn read_blocking<T: DeserializeOwned + Send + 'static>(
        &self,
        response: ResponseEnvelope,
        custom: &[ConverterEntry],
    ) -> Result<T> {
        block_on(self.read(response, custom, &CancellationToken::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::converter::{ContentResult, ContentResultConverter};
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }

    struct Prefixing(&'static str);

    #[async_trait]
    impl Converter<String> for Prefixing {
        async fn read_async(
            &self,
            mut response: ResponseEnvelope,
            cancel: &CancellationToken,
        ) -> Result<String> {
            Ok(format!("{}{}", self.0, response.text(cancel).await?))
        }
    }

    struct Fixed;

    #[async_trait]
    impl Converter<Item> for Fixed {
        async fn read_async(
            &self,
            _response: ResponseEnvelope,
            _cancel: &CancellationToken,
        ) -> Result<Item> {
            Ok(Item { id: 99 })
        }
    }

    fn response(content_type: &str, body: &str) -> ResponseEnvelope {
        ResponseEnvelope::new(200u16)
            .with_header("Content-Type", content_type)
            .unwrap()
            .with_body(body.to_string())
    }

    #[test]
    fn built_ins_resolve_by_target() {
        let registry = ConverterRegistry::new();
        let text: String = registry
            .read_blocking(response("text/plain", "hello"), &[])
            .unwrap();
        assert_eq!(text, "hello");
        let mut envelope = response("text/plain", "x");
        assert!(registry
            .try_resolve::<ResponseEnvelope>(&mut envelope, &[])
            .is_some());
        assert!(registry.try_resolve::<surf::Body>(&mut envelope, &[]).is_some());
        assert!(registry.try_resolve::<Item>(&mut envelope, &[]).is_none());
        assert_eq!(registry.builtins().count(), 5);
    }

    #[test]
    fn registered_targets_need_not_deserialize() {
        let registry = ConverterRegistry::new();
        let cancel = CancellationToken::new();
        let envelope: ResponseEnvelope = block_on(registry.read_registered(
            response("text/plain", "kept"),
            &[],
            &cancel,
        ))
        .unwrap();
        assert_eq!(envelope.status(), 200);

        let custom = [ConverterEntry::new::<ContentResult, _>(ContentResultConverter)];
        let result: ContentResult = block_on(registry.read_registered(
            response("text/plain", "hi"),
            &custom,
            &cancel,
        ))
        .unwrap();
        assert!(matches!(result, ContentResult::Text { content, .. } if content == "hi"));

        let err = block_on(registry.read_registered::<ContentResult>(
            response("text/plain", "hi"),
            &[],
            &cancel,
        ))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn custom_converters_override_built_ins() {
        let registry = ConverterRegistry::new();
        let custom = [ConverterEntry::new::<String, _>(Prefixing("> "))];
        let text: String = registry
            .read_blocking(response("text/plain", "hello"), &custom)
            .unwrap();
        assert_eq!(text, "> hello");

        let custom = [ConverterEntry::new::<Item, _>(Fixed)];
        let item: Item = registry
            .read_blocking(response("application/json", r#"{"id":1}"#), &custom)
            .unwrap();
        assert_eq!(item, Item { id: 99 });
    }

    #[test]
    fn later_entries_of_the_same_type_replace_earlier_ones() {
        let registry = ConverterRegistry::new();
        let custom = [
            ConverterEntry::new::<String, _>(Prefixing("first ")),
            ConverterEntry::new::<String, _>(Prefixing("second ")),
        ];
        let text: String = registry
            .read_blocking(response("text/plain", "x"), &custom)
            .unwrap();
        assert_eq!(text, "second x");
        // the shared built-ins are untouched
        let text: String = registry.read_blocking(response("text/plain", "x"), &[]).unwrap();
        assert_eq!(text, "x");
    }

    #[test]
    fn falls_back_by_media_type() {
        let registry = ConverterRegistry::new();
        let item: Item = registry
            .read_blocking(response("application/xml", "<item><id>3</id></item>"), &[])
            .unwrap();
        assert_eq!(item, Item { id: 3 });

        let item: Item = registry
            .read_blocking(response("application/json", r#"{"id":4}"#), &[])
            .unwrap();
        assert_eq!(item, Item { id: 4 });

        // JSON is the fallback for anything which is not XML, so this fails when read
        let err = registry
            .read_blocking::<Item>(response("text/plain", "<item><id>3</id></item>"), &[])
            .unwrap_err();
        assert!(err.is_deserialization());
    }

    #[test]
    fn dynamic_resolution() {
        let registry = ConverterRegistry::new();
        let mut envelope = response("text/plain", "dyn");
        let converter = registry.resolve_dynamic(TypeId::of::<String>(), &mut envelope, &[]);
        let value = converter.read_any_blocking(envelope).unwrap();
        assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("dyn"));

        let mut envelope = response("application/json", r#"{"id":5}"#);
        let converter = registry.resolve_dynamic(TypeId::of::<Item>(), &mut envelope, &[]);
        assert_eq!(converter.target_name(), type_name::<serde_json::Value>());
        let value = converter.read_any_blocking(envelope).unwrap();
        assert_eq!(
            value.downcast_ref::<serde_json::Value>(),
            Some(&serde_json::json!({"id": 5}))
        );
    }

    #[test]
    fn installs_context_when_missing() {
        let mut config = ClientConfig::default();
        config.default_content_type = Some("text/csv".into());
        let context = Arc::new(ServiceContext::from(config));
        let registry = ConverterRegistry::new().with_context(context.clone());

        let mut envelope = response("text/plain", "x");
        registry.resolve::<String>(&mut envelope, &[]);
        assert!(Arc::ptr_eq(envelope.context().unwrap(), &context));

        let own = Arc::new(ServiceContext::default());
        let mut envelope = response("text/plain", "x").with_context(own.clone());
        registry.resolve::<String>(&mut envelope, &[]);
        assert!(Arc::ptr_eq(envelope.context().unwrap(), &own));
    }

    #[test]
    fn resolves_concurrently() {
        let registry = Arc::new(ConverterRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let custom = [ConverterEntry::new::<String, _>(Prefixing("t"))];
                    let text: String = registry
                        .read_blocking(response("text/plain", &i.to_string()), &custom)
                        .unwrap();
                    text
                })
            })
            .collect();
        let mut results: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort();
        assert_eq!(results, vec!["t0", "t1", "t2", "t3"]);
    }
}
