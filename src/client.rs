// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the Remote Call library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use crate::builder::{HttpRequestBuilder, PreparedRequest};
use crate::cancel::{block_on, cancellable, CancellationToken};
use crate::config::{validate_base_url, ClientConfig, ServiceContext};
use crate::declarative::DeclarativeContext;
use crate::envelope::ResponseEnvelope;
use crate::error::{Error, Result};
use crate::hooks;
use crate::pipeline::ExtractionPipeline;
use crate::processor::ContentProcessors;
use crate::registry::{
    ConverterEntry, ConverterRegistry, DefaultObjectConverterFactory, ObjectConverterFactory,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use surf::{Client, Request, Response};
use tracing::{event, Level};

/// Dispatches declarative calls over a [surf::Client].
///
/// A call goes through the [ExtractionPipeline], which produces an [HttpRequestBuilder]. The
/// builder is turned into a request, with its body encoded by the [ContentProcessors]. The
/// response is wrapped in a [ResponseEnvelope] and materialized by the [ConverterRegistry].
pub struct RemoteClient<F = DefaultObjectConverterFactory> {
    client: Client,
    context: Arc<ServiceContext>,
    pipeline: ExtractionPipeline,
    processors: ContentProcessors,
    registry: ConverterRegistry<F>,
}

impl RemoteClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_client(Client::new(), config)
    }

    /// Use an existing `surf` client, with whatever middleware and backend it was built with.
    pub fn with_client(client: Client, config: ClientConfig) -> Result<Self> {
        if let Some(base_url) = &config.base_url {
            validate_base_url(base_url)?;
        }
        let context = Arc::new(ServiceContext::from(config));
        Ok(Self {
            client,
            registry: ConverterRegistry::new().with_context(context.clone()),
            context,
            pipeline: ExtractionPipeline::default(),
            processors: ContentProcessors::default(),
        })
    }
}

impl<F: ObjectConverterFactory> RemoteClient<F> {
    pub fn with_pipeline(mut self, pipeline: ExtractionPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_processors(mut self, processors: ContentProcessors) -> Self {
        self.processors = processors;
        self
    }

    pub fn with_registry<G: ObjectConverterFactory>(
        self,
        registry: ConverterRegistry<G>,
    ) -> RemoteClient<G> {
        RemoteClient {
            client: self.client,
            registry: registry.with_context(self.context.clone()),
            context: self.context,
            pipeline: self.pipeline,
            processors: self.processors,
        }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.context
    }

    pub fn pipeline(&self) -> &ExtractionPipeline {
        &self.pipeline
    }

    pub fn processors(&self) -> &ContentProcessors {
        &self.processors
    }

    pub fn registry(&self) -> &ConverterRegistry<F> {
        &self.registry
    }

    /// Run the extraction pipeline for a call site.
    pub fn prepare(&self, context: &mut DeclarativeContext) -> Result<HttpRequestBuilder> {
        self.pipeline.build(context)
    }

    async fn dispatch(
        &self,
        request: Request,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let send = self.client.send(request);
        let res = match timeout {
            Some(timeout) => cancellable(cancel, async_std::future::timeout(timeout, send))
                .await?
                .map_err(|_| Error::Timeout { timeout })?,
            None => cancellable(cancel, send).await?,
        };
        res.map_err(Error::from_client_error)
    }

    /// Send the request described by `builder`.
    ///
    /// The pre-send hooks run first, then the event handlers are notified, each in registration
    /// order. Failures inside any of them are logged and ignored. If the builder asks for a
    /// successful status, a non-2xx response fails with [Error::UnsuccessfulStatus] carrying the
    /// response body.
    pub async fn send(
        &self,
        builder: HttpRequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        let PreparedRequest {
            mut request,
            context,
            timeout,
            event_handlers,
            pre_send_hooks,
            profiler,
            json_response_wrapping,
            ensure_success,
            ..
        } = builder.build(&self.context, &self.processors)?;

        for hook in &pre_send_hooks {
            hooks::invoke("pre-send", || hook(&mut request));
        }
        for handler in &event_handlers {
            hooks::invoke("request", || handler.on_request(&request));
        }
        if profiler {
            event!(
                Level::INFO,
                "--> sending request {{method: {}, url: {}, content-type: {:?}}}",
                request.method(),
                request.url(),
                request.header("Content-Type").map(|v| v.as_str().to_string()),
            );
        }

        let start = Instant::now();
        let timeout = timeout.or(self.context.config().timeout);
        let res = match self.dispatch(request, timeout, cancel).await {
            Ok(res) => res,
            Err(err) => {
                for handler in &event_handlers {
                    hooks::invoke("error", || handler.on_error(&err));
                }
                return Err(err);
            }
        };
        let mut envelope = ResponseEnvelope::from_response(res, start.elapsed())
            .with_context(context)
            .with_json_response_wrapping(json_response_wrapping);

        if profiler {
            event!(
                Level::INFO,
                "<-- received response {{status: {}, content-type: {:?}, elapsed: {:?}}}",
                envelope.status(),
                envelope.content_type(),
                envelope.elapsed(),
            );
        }
        for handler in &event_handlers {
            hooks::invoke("response", || handler.on_response(&envelope));
        }
        if ensure_success && !envelope.is_success() {
            let status = envelope.status();
            let body = envelope.text(cancel).await?.to_string();
            return Err(Error::UnsuccessfulStatus { status, body });
        }
        Ok(envelope)
    }

    /// Send the request and convert the response to `T`.
    pub async fn send_as<T: DeserializeOwned + Send + 'static>(
        &self,
        builder: HttpRequestBuilder,
        custom: &[ConverterEntry],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let envelope = self.send(builder, cancel).await?;
        self.registry.read(envelope, custom, cancel).await
    }

    /// Make a declarative call and convert the response to `T`.
    pub async fn invoke<T: DeserializeOwned + Send + 'static>(
        &self,
        mut context: DeclarativeContext,
        custom: &[ConverterEntry],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let builder = self.prepare(&mut context)?;
        self.send_as(builder, custom, cancel).await
    }

    /// Send the request and convert the response with a converter registered for `T`.
    ///
    /// `T` need not be deserializable, so this reaches targets such as
    /// [ContentResult](crate::ContentResult) when its converter is passed in `custom`.
    pub async fn send_as_registered<T: Send + 'static>(
        &self,
        builder: HttpRequestBuilder,
        custom: &[ConverterEntry],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let envelope = self.send(builder, cancel).await?;
        self.registry.read_registered(envelope, custom, cancel).await
    }

    /// Make a declarative call and convert the response with a converter registered for `T`.
    pub async fn invoke_registered<T: Send + 'static>(
        &self,
        mut context: DeclarativeContext,
        custom: &[ConverterEntry],
        cancel: &CancellationToken,
    ) -> Result<T> {
        let builder = self.prepare(&mut context)?;
        self.send_as_registered(builder, custom, cancel).await
    }

    pub fn send_blocking(&self, builder: HttpRequestBuilder) -> Result<ResponseEnvelope> {
        block_on(self.send(builder, &CancellationToken::new()))
    }

    pub fn send_as_blocking<T: DeserializeOwned + Send + 'static>(
        &self,
        builder: HttpRequestBuilder,
        custom: &[ConverterEntry],
    ) -> Result<T> {
        block_on(self.send_as(builder, custom, &CancellationToken::new()))
    }

    pub fn invoke_blocking<T: DeserializeOwned + Send + 'static>(
        &self,
        context: DeclarativeContext,
        custom: &[ConverterEntry],
    ) -> Result<T> {
        block_on(self.invoke(context, custom, &CancellationToken::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use surf::http::Method;

    #[test]
    fn rejects_invalid_base_url() {
        let mut config = ClientConfig::default();
        config.base_url = Some("::not a url".into());
        assert!(matches!(
            RemoteClient::with_client(Client::new(), config),
            Err(Error::InvalidUrl { .. })
        ));
    }

    #[async_std::test]
    async fn cancelled_before_sending() {
        let mut config = ClientConfig::default();
        config.base_url = Some("http://127.0.0.1:9/".into());
        let client = RemoteClient::with_client(Client::new(), config).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .send(HttpRequestBuilder::new(Method::Get, "ping"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
