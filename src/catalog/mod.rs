//! # Model Catalog
//!
//! Cached view of the aggregator's `/models` listing.
//!
//! The cache is one immutable snapshot swapped atomically on refresh, so readers
//! never observe a partial update. Refreshes are serialized; a snapshot older
//! than the TTL is refreshed before any query is answered, and a failed refresh
//! is reported instead of serving the stale data.
//!
//! | Query | Description |
//! |-------|-------------|
//! | [`ModelCatalog::list`] | All models in the current snapshot |
//! | [`ModelCatalog::get`] | One model by id |
//! | [`ModelCatalog::find_by_capability`] | Models supporting a capability |
//! | [`ModelCatalog::cheapest`] | Lowest unit cost among qualifying models |
//! | [`ModelCatalog::fallback`] | Cheapest qualifying model other than a failed one |

pub(crate) mod wire;

use crate::{Error, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Streaming,
    FunctionCalling,
    Vision,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Streaming => "streaming",
            Capability::FunctionCalling => "function_calling",
            Capability::Vision => "vision",
        })
    }
}

impl std::str::FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streaming" | "stream" => Ok(Capability::Streaming),
            "function_calling" | "tools" => Ok(Capability::FunctionCalling),
            "vision" | "image" => Ok(Capability::Vision),
            other => Err(Error::validation_with_context(
                format!("unknown capability '{}'", other),
                crate::ErrorContext::new().with_source("catalog"),
            )),
        }
    }
}

/// Per-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub prompt: f64,
    pub completion: f64,
}

impl Pricing {
    /// Marker for variable or unreadable pricing.
    pub const UNKNOWN: f64 = -1.0;

    pub fn is_known(&self) -> bool {
        self.prompt >= 0.0 && self.completion >= 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    /// Upstream provider, taken from the id prefix (`openai/...`).
    pub provider: String,
    pub context_length: u32,
    pub pricing: Pricing,
    pub capabilities: BTreeSet<Capability>,
    /// Maximum completion tokens, when the provider reports one.
    pub max_tokens: Option<u32>,
}

impl ModelInfo {
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn supports_all(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.supports(*c))
    }

    /// Prompt plus completion price per token; the ranking key for [`ModelCatalog::cheapest`].
    pub fn unit_cost(&self) -> f64 {
        self.pricing.prompt + self.pricing.completion
    }

    /// Estimated USD cost of one call. `None` when pricing is unknown.
    pub fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> Option<f64> {
        self.pricing.is_known().then(|| {
            self.pricing.prompt * f64::from(prompt_tokens)
                + self.pricing.completion * f64::from(completion_tokens)
        })
    }
}

/// Where model listings come from. Implemented by the HTTP transport.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn fetch_models(&self) -> Result<Vec<ModelInfo>>;
}

#[derive(Debug)]
struct Snapshot {
    models: Vec<ModelInfo>,
    fetched_at: Instant,
}

pub struct ModelCatalog {
    source: Arc<dyn ModelSource>,
    ttl: Duration,
    snapshot: ArcSwapOption<Snapshot>,
    refresh_lock: Mutex<()>,
}

impl fmt::Debug for ModelCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCatalog")
            .field("ttl", &self.ttl)
            .field("cached", &self.snapshot.load_full().map(|s| s.models.len()))
            .finish()
    }
}

impl ModelCatalog {
    pub fn new(source: Arc<dyn ModelSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            snapshot: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Age of the cached snapshot, if any.
    pub fn age(&self) -> Option<Duration> {
        self.snapshot.load_full().map(|s| s.fetched_at.elapsed())
    }

    fn fresh(&self) -> Option<Arc<Snapshot>> {
        self.snapshot
            .load_full()
            .filter(|s| s.fetched_at.elapsed() < self.ttl)
    }

    async fn current(&self, force: bool) -> Result<Arc<Snapshot>> {
        if !force {
            if let Some(s) = self.fresh() {
                return Ok(s);
            }
        }
        let _guard = self.refresh_lock.lock().await;
        if !force {
            // Another caller may have refreshed while we waited for the lock.
            if let Some(s) = self.fresh() {
                return Ok(s);
            }
        }
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<Arc<Snapshot>> {
        let started = Instant::now();
        let mut models = match self.source.fetch_models().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "model catalog refresh failed");
                return Err(e);
            }
        };
        if models.is_empty() {
            warn!("model catalog refresh returned no models");
            return Err(Error::CatalogEmpty);
        }
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models.dedup_by(|a, b| a.id == b.id);

        let snapshot = Arc::new(Snapshot {
            models,
            fetched_at: Instant::now(),
        });
        self.snapshot.store(Some(snapshot.clone()));
        info!(
            count = snapshot.models.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model catalog refreshed"
        );
        Ok(snapshot)
    }

    /// Force a refresh. Returns the number of models now cached.
    pub async fn refresh(&self) -> Result<usize> {
        Ok(self.current(true).await?.models.len())
    }

    pub async fn list(&self, refresh: bool) -> Result<Vec<ModelInfo>> {
        Ok(self.current(refresh).await?.models.clone())
    }

    pub async fn get(&self, id: &str, refresh: bool) -> Result<Option<ModelInfo>> {
        let snap = self.current(refresh).await?;
        Ok(snap
            .models
            .binary_search_by(|m| m.id.as_str().cmp(id))
            .ok()
            .map(|i| snap.models[i].clone()))
    }

    pub async fn find_by_capability(&self, cap: Capability) -> Result<Vec<ModelInfo>> {
        let snap = self.current(false).await?;
        Ok(snap
            .models
            .iter()
            .filter(|m| m.supports(cap))
            .cloned()
            .collect())
    }

    /// Lowest unit cost among models with known pricing that support `required`
    /// and, when given, cost at most `max_cost` per token.
    pub async fn cheapest(
        &self,
        max_cost: Option<f64>,
        required: &[Capability],
    ) -> Result<Option<ModelInfo>> {
        let snap = self.current(false).await?;
        Ok(select_cheapest(&snap.models, max_cost, required, None).cloned())
    }

    /// Cheapest qualifying model other than `preferred`. `None` means no
    /// alternative exists; callers must not fall back further.
    pub async fn fallback(
        &self,
        preferred: &str,
        required: &[Capability],
    ) -> Result<Option<ModelInfo>> {
        let snap = self.current(false).await?;
        Ok(select_cheapest(&snap.models, None, required, Some(preferred)).cloned())
    }
}

/// Ascending unit cost, then larger context window, then lexical id.
fn rank(a: &ModelInfo, b: &ModelInfo) -> Ordering {
    a.unit_cost()
        .total_cmp(&b.unit_cost())
        .then_with(|| b.context_length.cmp(&a.context_length))
        .then_with(|| a.id.cmp(&b.id))
}

fn select_cheapest<'a>(
    models: &'a [ModelInfo],
    max_cost: Option<f64>,
    required: &[Capability],
    exclude: Option<&str>,
) -> Option<&'a ModelInfo> {
    models
        .iter()
        .filter(|m| m.pricing.is_known())
        .filter(|m| exclude != Some(m.id.as_str()))
        .filter(|m| m.supports_all(required))
        .filter(|m| max_cost.map_or(true, |max| m.unit_cost() <= max))
        .min_by(|a, b| rank(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    const TTL: Duration = Duration::from_secs(3600);

    fn model(id: &str, cost: f64, context: u32, caps: &[Capability]) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            name: id.to_string(),
            provider: id.split('/').next().unwrap_or_default().to_string(),
            context_length: context,
            pricing: Pricing {
                prompt: cost / 2.0,
                completion: cost / 2.0,
            },
            capabilities: caps.iter().copied().collect(),
            max_tokens: None,
        }
    }

    /// Replays queued responses; repeats the last one when the queue runs dry.
    struct FakeSource {
        responses: StdMutex<VecDeque<Result<Vec<ModelInfo>>>>,
        last: StdMutex<Vec<ModelInfo>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeSource {
        fn new(models: Vec<ModelInfo>) -> Self {
            Self {
                responses: StdMutex::new(VecDeque::new()),
                last: StdMutex::new(models),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn then(self, next: Result<Vec<ModelInfo>>) -> Self {
            self.responses.lock().unwrap().push_back(next);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelSource for FakeSource {
        async fn fetch_models(&self) -> Result<Vec<ModelInfo>> {
            let n = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n == 0 {
                return Ok(self.last.lock().unwrap().clone());
            }
            match self.responses.lock().unwrap().pop_front() {
                Some(r) => r,
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    fn abc() -> Vec<ModelInfo> {
        vec![
            model("p/a", 2.0, 8_000, &[Capability::Streaming]),
            model("p/b", 1.0, 8_000, &[]),
            model("p/c", 3.0, 8_000, &[Capability::Streaming]),
        ]
    }

    fn catalog(source: Arc<FakeSource>) -> ModelCatalog {
        ModelCatalog::new(source, TTL)
    }

    #[tokio::test]
    async fn cheapest_respects_required_capabilities() {
        let cat = catalog(Arc::new(FakeSource::new(abc())));
        let pick = cat.cheapest(None, &[Capability::Streaming]).await.unwrap();
        assert_eq!(pick.unwrap().id, "p/a");
        let pick = cat.cheapest(None, &[]).await.unwrap();
        assert_eq!(pick.unwrap().id, "p/b");
        assert!(cat.cheapest(None, &[Capability::Vision]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cheapest_honours_cost_ceiling() {
        let cat = catalog(Arc::new(FakeSource::new(abc())));
        assert!(cat.cheapest(Some(0.5), &[]).await.unwrap().is_none());
        let pick = cat.cheapest(Some(2.5), &[Capability::Streaming]).await.unwrap();
        assert_eq!(pick.unwrap().id, "p/a");
    }

    #[tokio::test]
    async fn ties_prefer_larger_context_then_id() {
        let models = vec![
            model("z/small", 1.0, 4_000, &[]),
            model("y/large", 1.0, 32_000, &[]),
            model("x/large", 1.0, 32_000, &[]),
        ];
        let cat = catalog(Arc::new(FakeSource::new(models)));
        assert_eq!(cat.cheapest(None, &[]).await.unwrap().unwrap().id, "x/large");
    }

    #[tokio::test]
    async fn unknown_pricing_never_wins() {
        let mut free = model("r/auto", 0.0, 100_000, &[]);
        free.pricing.prompt = Pricing::UNKNOWN;
        let cat = catalog(Arc::new(FakeSource::new(vec![free, model("p/x", 5.0, 1, &[])])));
        assert_eq!(cat.cheapest(None, &[]).await.unwrap().unwrap().id, "p/x");
    }

    #[tokio::test]
    async fn fallback_excludes_preferred() {
        let cat = catalog(Arc::new(FakeSource::new(abc())));
        let alt = cat.fallback("p/b", &[]).await.unwrap().unwrap();
        assert_eq!(alt.id, "p/a");
        let alt = cat.fallback("p/a", &[Capability::Streaming]).await.unwrap().unwrap();
        assert_eq!(alt.id, "p/c");

        let single = catalog(Arc::new(FakeSource::new(vec![model("only/one", 1.0, 1, &[])])));
        assert!(single.fallback("only/one", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_within_ttl_is_stable_and_cached() {
        let source = Arc::new(FakeSource::new(abc()));
        let cat = catalog(source.clone());
        let first = cat.list(false).await.unwrap();
        let second = cat.list(false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);

        assert_eq!(cat.get("p/c", false).await.unwrap().unwrap().id, "p/c");
        assert!(cat.get("p/missing", false).await.unwrap().is_none());
        assert_eq!(cat.find_by_capability(Capability::Streaming).await.unwrap().len(), 2);
        assert_eq!(source.calls(), 1);

        cat.list(true).await.unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_is_refreshed_before_answering() {
        let source = Arc::new(FakeSource::new(abc()).then(Ok(vec![model("new/one", 1.0, 1, &[])])));
        let cat = catalog(source.clone());
        assert_eq!(cat.list(false).await.unwrap().len(), 3);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let models = cat.list(false).await.unwrap();
        assert_eq!(source.calls(), 2);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "new/one");
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_is_not_masked_by_stale_data() {
        let source = Arc::new(FakeSource::new(abc()).then(Err(Error::cancelled("network down"))));
        let cat = catalog(source);
        cat.list(false).await.unwrap();
        tokio::time::advance(TTL).await;
        assert!(cat.list(false).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_refresh_reports_catalog_empty() {
        let source = Arc::new(FakeSource::new(abc()).then(Ok(vec![])));
        let cat = catalog(source.clone());
        cat.list(false).await.unwrap();
        tokio::time::advance(TTL).await;
        let err = cat.list(false).await.unwrap_err();
        assert!(matches!(err, Error::CatalogEmpty));
        assert!(err.requires_user_action());
        // The old snapshot is retained, yet the next query refreshes instead of serving it.
        assert!(cat.age().is_some());
        assert!(cat.cheapest(None, &[]).await.unwrap().is_some());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cold_reads_share_one_refresh() {
        let mut source = FakeSource::new(abc());
        source.delay = Duration::from_millis(200);
        let source = Arc::new(source);
        let cat = Arc::new(catalog(source.clone()));
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let cat = cat.clone();
            tasks.push(tokio::spawn(async move { cat.list(false).await.map(|m| m.len()) }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap(), 3);
        }
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn estimate_cost_uses_both_prices() {
        let mut m = model("p/x", 0.0, 1, &[]);
        m.pricing = Pricing {
            prompt: 0.000_001,
            completion: 0.000_002,
        };
        let cost = m.estimate_cost(1_000, 500).unwrap();
        assert!((cost - 0.002).abs() < 1e-12);
        m.pricing.completion = Pricing::UNKNOWN;
        assert_eq!(m.estimate_cost(1, 1), None);
    }

    #[test]
    fn capability_parses_from_cli_names() {
        assert_eq!("tools".parse::<Capability>().unwrap(), Capability::FunctionCalling);
        assert_eq!("Vision".parse::<Capability>().unwrap(), Capability::Vision);
        assert!("telepathy".parse::<Capability>().is_err());
    }
}
