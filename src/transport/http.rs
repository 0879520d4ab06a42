use crate::catalog::wire::ModelsEnvelope;
use crate::catalog::{ModelInfo, ModelSource};
use crate::config::ClientConfig;
use crate::credentials::CredentialProvider;
use crate::error_code::{ErrorClassifier, Outcome, TransportFailure};
use crate::pipeline::decode_stream;
use crate::resilience::RateLimiter;
use crate::types::key::KeyEnvelope;
use crate::types::{CallOptions, ChatRequest, ChatResponse, KeyInfo, StreamFragment};
use crate::{BoxStream, Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Method, Proxy};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const REFERER_HEADER: &str = "http-referer";
const TITLE_HEADER: &str = "x-title";
const REMAINING_HEADER: &str = "x-ratelimit-remaining-requests";
const RESET_HEADER: &str = "x-ratelimit-reset-requests";

/// HTTP client for the aggregator API.
///
/// Every call is bounded by the configured timeout and by the caller's
/// [`CallOptions`]; dropping the in-flight future aborts the request.
pub struct HttpTransport {
    client: reqwest::Client,
    config: Arc<ClientConfig>,
    credentials: Arc<dyn CredentialProvider>,
    /// Resolved once, then reused by every request.
    key: OnceCell<String>,
    classifier: ErrorClassifier,
    budget: Option<RateLimiter>,
}

impl HttpTransport {
    pub fn new(
        config: Arc<ClientConfig>,
        credentials: Arc<dyn CredentialProvider>,
        classifier: ErrorClassifier,
    ) -> Result<Self> {
        // Timeouts are applied per call and per stream chunk, not client-wide.
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Some(config.pool_idle_timeout))
            .user_agent(concat!("chatlink/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy_url) = &config.proxy_url {
            let proxy = Proxy::all(proxy_url).map_err(|e| {
                Error::configuration_with_context(
                    "invalid proxy_url",
                    ErrorContext::new()
                        .with_field_path("proxy_url")
                        .with_details(e.to_string())
                        .with_source("transport"),
                )
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            Error::configuration_with_context(
                "failed to build HTTP client",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("transport"),
            )
        })?;

        Ok(Self {
            client,
            config,
            credentials,
            key: OnceCell::new(),
            classifier,
            budget: None,
        })
    }

    /// Seed the key cache with an already resolved key.
    pub fn with_resolved_key(mut self, key: impl Into<String>) -> Self {
        self.key = OnceCell::new_with(Some(key.into()));
        self
    }

    /// Feed `X-RateLimit-*` response headers into `limiter`.
    pub fn with_budget_feedback(mut self, limiter: RateLimiter) -> Self {
        self.budget = Some(limiter);
        self
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    async fn prepare(
        &self,
        method: Method,
        path: &str,
        request_id: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let key = self
            .key
            .get_or_try_init(|| self.credentials.get_key())
            .await?;
        let mut req = self
            .client
            .request(method, self.config.endpoint(path))
            .bearer_auth(key)
            .header(REQUEST_ID_HEADER, request_id);
        if let Some(url) = &self.config.app_url {
            req = req.header(REFERER_HEADER, url);
        }
        if let Some(title) = &self.config.app_title {
            req = req.header(TITLE_HEADER, title);
        }
        Ok(req)
    }

    fn transport_error(&self, e: &reqwest::Error) -> Error {
        Error::Api(self.classifier.classify(Outcome::Transport(e.into())))
    }

    fn timeout_error(&self, after: Duration) -> Error {
        Error::Api(
            self.classifier
                .classify(Outcome::Transport(TransportFailure::timeout(after))),
        )
    }

    /// Run `fut` under the per-call timeout and the caller's cancellation.
    async fn bounded<T>(&self, opts: &CallOptions, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.timeout;
        tokio::select! {
            res = tokio::time::timeout(timeout, fut) => {
                res.unwrap_or_else(|_| Err(self.timeout_error(timeout)))
            }
            err = opts.interrupted() => Err(err),
        }
    }

    async fn failure(&self, resp: reqwest::Response) -> Error {
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        Error::Api(self.classifier.classify(Outcome::Http {
            status,
            headers: &headers,
            body: &body,
        }))
    }

    fn decode_body<T: DeserializeOwned>(&self, body: &str) -> Result<T> {
        serde_json::from_str::<T>(body).map_err(|e| {
            // Some failures arrive as 200 with an error envelope.
            let has_error = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .is_some_and(|v| v.get("error").is_some());
            let outcome = if has_error {
                Outcome::StreamError { body }
            } else {
                Outcome::MalformedResponse {
                    detail: e.to_string(),
                }
            };
            Error::Api(self.classifier.classify(outcome))
        })
    }

    fn record_budget(&self, model: &str, headers: &HeaderMap) {
        let Some(limiter) = &self.budget else {
            return;
        };
        let remaining = header_first(headers, &[REMAINING_HEADER]).and_then(|s| s.parse::<u64>().ok());
        if remaining.is_none() {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let reset_after = header_first(headers, &[RESET_HEADER]).and_then(|s| parse_reset(&s, now));
        debug!(model, remaining, reset_after_ms = reset_after.map(|d| d.as_millis() as u64), "provider budget");
        limiter.update_budget(model, remaining, reset_after);
    }

    /// `POST /chat/completions` without streaming.
    pub async fn execute(&self, request: &ChatRequest, opts: &CallOptions) -> Result<ChatResponse> {
        let request_id = Uuid::new_v4().to_string();
        let mut payload = request.to_payload();
        payload.stream = None;
        let started = Instant::now();

        let result = self
            .bounded(opts, async {
                let resp = self
                    .prepare(Method::POST, "chat/completions", &request_id)
                    .await?
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| self.transport_error(&e))?;
                self.record_budget(&request.model, resp.headers());
                if !resp.status().is_success() {
                    return Err(self.failure(resp).await);
                }
                let body = resp.text().await.map_err(|e| self.transport_error(&e))?;
                self.decode_body::<ChatResponse>(&body)
            })
            .await;

        debug!(
            request_id = %request_id,
            model = %request.model,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat completion"
        );
        result
    }

    /// `POST /chat/completions` with `stream: true`.
    ///
    /// The returned stream ends after the terminal fragment or the first error.
    /// Each chunk must arrive within the configured timeout.
    pub async fn execute_stream(
        &self,
        request: &ChatRequest,
        opts: &CallOptions,
    ) -> Result<BoxStream<'static, StreamFragment>> {
        let request_id = Uuid::new_v4().to_string();
        let mut payload = request.to_payload();
        payload.stream = Some(true);

        let resp = self
            .bounded(opts, async {
                let resp = self
                    .prepare(Method::POST, "chat/completions", &request_id)
                    .await?
                    .header(ACCEPT, "text/event-stream")
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| self.transport_error(&e))?;
                self.record_budget(&request.model, resp.headers());
                if !resp.status().is_success() {
                    return Err(self.failure(resp).await);
                }
                Ok(resp)
            })
            .await?;
        debug!(request_id = %request_id, model = %request.model, "stream opened");

        let idle = self.config.timeout;
        let body = Box::pin(resp.bytes_stream());
        let state = Some((body, opts.clone(), self.classifier.clone()));
        let guarded = stream::unfold(state, move |state| async move {
            let (mut body, opts, classifier) = state?;
            let item = tokio::select! {
                next = tokio::time::timeout(idle, body.next()) => match next {
                    Ok(Some(Ok(chunk))) => Ok(chunk),
                    Ok(Some(Err(e))) => Err(Error::Api(
                        classifier.classify(Outcome::Transport((&e).into())),
                    )),
                    Ok(None) => return None,
                    Err(_) => Err(Error::Api(
                        classifier.classify(Outcome::Transport(TransportFailure::timeout(idle))),
                    )),
                },
                err = opts.interrupted() => Err(err),
            };
            let next = item.is_ok().then_some((body, opts, classifier));
            Some((item, next))
        });

        Ok(decode_stream(Box::pin(guarded), self.classifier.clone()))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, opts: &CallOptions) -> Result<T> {
        let request_id = Uuid::new_v4().to_string();
        self.bounded(opts, async {
            let resp = self
                .prepare(Method::GET, path, &request_id)
                .await?
                .send()
                .await
                .map_err(|e| self.transport_error(&e))?;
            if !resp.status().is_success() {
                return Err(self.failure(resp).await);
            }
            let body = resp.text().await.map_err(|e| self.transport_error(&e))?;
            self.decode_body::<T>(&body)
        })
        .await
    }

    /// `GET /models`.
    pub async fn list_models(&self, opts: &CallOptions) -> Result<Vec<ModelInfo>> {
        let envelope: ModelsEnvelope = self.get_json("models", opts).await?;
        Ok(envelope.into_models())
    }

    /// `GET /key`.
    pub async fn key_info(&self, opts: &CallOptions) -> Result<KeyInfo> {
        let envelope: KeyEnvelope = self.get_json("key", opts).await?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl ModelSource for HttpTransport {
    async fn fetch_models(&self) -> Result<Vec<ModelInfo>> {
        self.list_models(&CallOptions::default()).await
    }
}

/// First non-empty value among `names`.
fn header_first(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Interpret a reset header as seconds from now, epoch seconds, or epoch milliseconds.
fn parse_reset(value: &str, now_since_epoch: Duration) -> Option<Duration> {
    let v = value.trim();
    let (num, scale) = if let Some(ms) = v.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(s) = v.strip_suffix('s') {
        (s, 1.0)
    } else {
        (v, 1.0)
    };
    let n: f64 = num.trim().parse().ok()?;
    // Out-of-range and non-finite values are dropped, never converted.
    if scale == 1.0 && n > 1e12 {
        let at = Duration::try_from_secs_f64(n / 1000.0).ok()?;
        return Some(at.saturating_sub(now_since_epoch));
    }
    if scale == 1.0 && n > 1e9 {
        let at = Duration::try_from_secs_f64(n).ok()?;
        return Some(at.saturating_sub(now_since_epoch));
    }
    Duration::try_from_secs_f64(n * scale).ok()
}
