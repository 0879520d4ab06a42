use crate::catalog::{Capability, ModelCatalog, ModelInfo};
use crate::client::policy::RetryOrchestrator;
use crate::config::ClientConfig;
use crate::resilience::{RateLimiter, RateLimiterSnapshot};
use crate::transport::HttpTransport;
use crate::types::{CallOptions, ChatRequest, ChatResponse, KeyInfo, StreamFragment};
use crate::{BoxStream, Result};
use futures::{stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Chat completions against the aggregator, behind admission control and retry.
///
/// Cheap to clone; clones share the limiter, catalog and connection pool.
#[derive(Clone)]
pub struct ChatClient {
    config: Arc<ClientConfig>,
    transport: Arc<HttpTransport>,
    limiter: RateLimiter,
    catalog: Arc<ModelCatalog>,
    retry: RetryOrchestrator,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("base_url", &self.config.base_url)
            .field("retry", self.retry.policy())
            .finish_non_exhaustive()
    }
}

impl ChatClient {
    pub(crate) fn from_parts(
        config: Arc<ClientConfig>,
        transport: Arc<HttpTransport>,
        limiter: RateLimiter,
        catalog: Arc<ModelCatalog>,
        retry: RetryOrchestrator,
    ) -> Self {
        Self {
            config,
            transport,
            limiter,
            catalog,
            retry,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.chat_with(request, &CallOptions::default()).await
    }

    /// Unary completion. Every attempt takes its own admission; backoff
    /// sleeps hold none.
    pub async fn chat_with(&self, request: &ChatRequest, opts: &CallOptions) -> Result<ChatResponse> {
        request.validate(self.config.max_message_chars)?;
        self.retry
            .execute_with_retry(opts, move |attempt| async move {
                let admission = self.limiter.acquire(&request.model, opts).await?;
                debug!(
                    model = %request.model,
                    attempt = attempt + 1,
                    queued = admission.was_queued(),
                    "dispatching chat request"
                );
                let response = self.transport.execute(request, opts).await;
                drop(admission);
                response
            })
            .await
    }

    pub async fn chat_stream(&self, request: &ChatRequest) -> Result<BoxStream<'static, StreamFragment>> {
        self.chat_stream_with(request, &CallOptions::default()).await
    }

    /// Streaming completion.
    ///
    /// Retries cover failures up to and including the first fragment; once a
    /// fragment has been yielded, errors end the stream instead. The in-flight
    /// slot is held until the returned stream is dropped.
    pub async fn chat_stream_with(
        &self,
        request: &ChatRequest,
        opts: &CallOptions,
    ) -> Result<BoxStream<'static, StreamFragment>> {
        request.validate(self.config.max_message_chars)?;
        self.retry
            .execute_with_retry(opts, move |attempt| async move {
                let admission = self.limiter.acquire(&request.model, opts).await?;
                debug!(
                    model = %request.model,
                    attempt = attempt + 1,
                    queued = admission.was_queued(),
                    "opening chat stream"
                );
                let mut fragments = self.transport.execute_stream(request, opts).await?;
                let first = match fragments.next().await {
                    Some(Err(e)) => return Err(e),
                    first => first,
                };
                let held: BoxStream<'static, StreamFragment> = Box::pin(
                    stream::iter(first)
                        .chain(fragments)
                        .map(move |item| {
                            let _slot = &admission;
                            item
                        }),
                );
                Ok(held)
            })
            .await
    }

    /// [`chat_with`](Self::chat_with), reissuing once against the cheapest
    /// alternative when the model is unavailable.
    ///
    /// When the catalog has no qualifying alternative the original error is
    /// returned; the reissued request never falls back again.
    pub async fn chat_with_fallback(
        &self,
        request: &ChatRequest,
        opts: &CallOptions,
        required: &[Capability],
    ) -> Result<ChatResponse> {
        let err = match self.chat_with(request, opts).await {
            Ok(resp) => return Ok(resp),
            Err(err) => err,
        };
        if !err.classified().is_some_and(|c| c.fallbackable()) {
            return Err(err);
        }

        match self.catalog.fallback(&request.model, required).await? {
            Some(alt) => {
                info!(from = %request.model, to = %alt.id, "model unavailable, reissuing on fallback");
                self.chat_with(&request.with_model(alt.id), opts).await
            }
            None => {
                warn!(model = %request.model, "model unavailable and no fallback qualifies");
                Err(err)
            }
        }
    }

    /// Catalog contents, refreshed first when `refresh` is set or the cache is stale.
    pub async fn models(&self, refresh: bool) -> Result<Vec<ModelInfo>> {
        self.catalog.list(refresh).await
    }

    pub async fn key_info(&self) -> Result<KeyInfo> {
        self.key_info_with(&CallOptions::default()).await
    }

    /// `GET /key`. Retried like chat calls but not rate limited.
    pub async fn key_info_with(&self, opts: &CallOptions) -> Result<KeyInfo> {
        self.retry
            .execute_with_retry(opts, move |_| self.transport.key_info(opts))
            .await
    }

    pub async fn limiter_snapshot(&self, model: &str) -> Result<RateLimiterSnapshot> {
        self.limiter.snapshot(model).await
    }

    /// Stop the rate limiter. Queued requests fail with
    /// [`Error::Cancelled`](crate::Error::Cancelled); returns how many.
    pub async fn shutdown(&self) -> usize {
        self.limiter.shutdown().await
    }
}
