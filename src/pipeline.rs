// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use crate::builder::HttpRequestBuilder;
use crate::declarative::DeclarativeContext;
use crate::error::Result;
use crate::extractor::{
    BodyExtractor, CookieExtractor, DeclarativeExtractor, EnsureSuccessStatusCodeExtractor,
    EventHandlerExtractor, FrozenParameterExtractor, HeaderExtractor, HttpMethodExtractor,
    HttpVersionExtractor, JsonResponseWrappingExtractor, MultipartExtractor, PathExtractor,
    ProfilerExtractor, PropertyExtractor, QueryExtractor, StreamBodyExtractor, TimeoutExtractor,
};
use itertools::Itertools;
use std::sync::Arc;
use tracing::{event, Level};

/// The registration table of extractors applied to every call.
#[derive(Clone)]
pub struct ExtractionPipeline {
    extractors: Vec<Arc<dyn DeclarativeExtractor>>,
    frozen: Vec<Arc<dyn FrozenParameterExtractor>>,
}

impl Default for ExtractionPipeline {
    fn default() -> Self {
        Self::empty()
            .with_extractor(HttpMethodExtractor)
            .with_extractor(PathExtractor)
            .with_extractor(QueryExtractor)
            .with_extractor(HeaderExtractor)
            .with_extractor(CookieExtractor)
            .with_extractor(PropertyExtractor)
            .with_extractor(HttpVersionExtractor)
            .with_extractor(TimeoutExtractor)
            .with_extractor(ProfilerExtractor)
            .with_extractor(JsonResponseWrappingExtractor)
            .with_extractor(EnsureSuccessStatusCodeExtractor)
            .with_extractor(BodyExtractor)
            .with_frozen_extractor(StreamBodyExtractor)
            .with_frozen_extractor(MultipartExtractor)
            .with_frozen_extractor(EventHandlerExtractor)
    }
}

impl std::fmt::Debug for ExtractionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionPipeline")
            .field(
                "extractors",
                &self.extractors.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .field(
                "frozen",
                &self.frozen.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ExtractionPipeline {
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
            frozen: Vec::new(),
        }
    }

    pub fn with_extractor(mut self, extractor: impl DeclarativeExtractor + 'static) -> Self {
        self.extractors.push(Arc::new(extractor));
        self
    }

    pub fn with_frozen_extractor(
        mut self,
        extractor: impl FrozenParameterExtractor + 'static,
    ) -> Self {
        self.frozen.push(Arc::new(extractor));
        self
    }

    pub fn register(&mut self, extractor: Arc<dyn DeclarativeExtractor>) -> &mut Self {
        self.extractors.push(extractor);
        self
    }

    pub fn register_frozen(&mut self, extractor: Arc<dyn FrozenParameterExtractor>) -> &mut Self {
        self.frozen.push(extractor);
        self
    }

    /// Apply every extractor to `builder`.
    ///
    /// Ordinary extractors run first, then frozen extractors, each group in ascending order
    /// with ties kept in registration order. The first error aborts the run.
    pub fn run(
        &self,
        context: &mut DeclarativeContext,
        builder: &mut HttpRequestBuilder,
    ) -> Result<()> {
        for extractor in self.extractors.iter().sorted_by_key(|e| e.order()) {
            event!(
                Level::TRACE,
                "running extractor {} (order {})",
                extractor.name(),
                extractor.order()
            );
            extractor.extract(builder, context)?;
        }
        for extractor in self.frozen.iter().sorted_by_key(|e| e.order()) {
            event!(
                Level::TRACE,
                "running frozen extractor {} (order {})",
                extractor.name(),
                extractor.order()
            );
            extractor.extract(builder, context)?;
        }
        Ok(())
    }

    /// Run the pipeline against a fresh builder.
    pub fn build(&self, context: &mut DeclarativeContext) -> Result<HttpRequestBuilder> {
        let mut builder = HttpRequestBuilder::default();
        self.run(context, &mut builder)?;
        Ok(builder)
    }
}
