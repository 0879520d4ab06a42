use super::bucket::{BucketConfig, TokenBucket};
use crate::types::{CallOptions, Priority};
use crate::{Error, ErrorContext, Result};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_MAX_IN_FLIGHT: usize = 5;

/// Polling step for [`RateLimiter::wait_for_slot`] when the wait is unknown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Shared bucket for models without an override.
    pub default_bucket: BucketConfig,
    /// Per-model overrides, each with its own independent bucket.
    pub per_model: HashMap<String, BucketConfig>,
    /// Global cap on admitted-but-unfinished requests.
    pub max_in_flight: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_bucket: BucketConfig::default(),
            per_model: HashMap::new(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, bucket: BucketConfig) -> Self {
        self.default_bucket = bucket;
        self
    }

    pub fn with_model_bucket(mut self, model: impl Into<String>, bucket: BucketConfig) -> Self {
        self.per_model.insert(model.into(), bucket);
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.default_bucket.validate("rate_limit")?;
        for (model, bucket) in &self.per_model {
            bucket.validate(&format!("rate_limit.per_model.{}", model))?;
        }
        if self.max_in_flight == 0 {
            return Err(Error::configuration_with_context(
                "max_in_flight must be at least 1",
                ErrorContext::new()
                    .with_field_path("max_in_flight")
                    .with_source("rate_limiter"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterSnapshot {
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub tokens: f64,
    /// Waiters queued on this bucket.
    pub queued: usize,
    pub in_flight: usize,
    pub max_in_flight: usize,
    /// True when a new request would be admitted immediately.
    pub ready: bool,
    /// Estimated wait until a token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

/// How a request got through admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Immediate,
    Queued { waited: Duration },
}

/// Held for the duration of an admitted request. Dropping it frees the in-flight slot.
#[derive(Debug)]
pub struct Admission {
    outcome: AdmitOutcome,
    release: Option<mpsc::UnboundedSender<Command>>,
}

impl Admission {
    pub fn outcome(&self) -> AdmitOutcome {
        self.outcome
    }

    pub fn was_queued(&self) -> bool {
        matches!(self.outcome, AdmitOutcome::Queued { .. })
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(Command::Release);
        }
    }
}

#[derive(Debug)]
enum Command {
    Admit {
        model: String,
        priority: Priority,
        reply: oneshot::Sender<Result<Admission>>,
    },
    Release,
    /// Give back the token of a grant nobody claimed.
    Refund {
        model: String,
    },
    Snapshot {
        model: String,
        reply: oneshot::Sender<RateLimiterSnapshot>,
    },
    Budget {
        model: String,
        remaining: Option<u64>,
        reset_after: Option<Duration>,
    },
    ClearQueue {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// `None` is the shared default bucket.
type BucketKey = Option<String>;

struct Waiter {
    priority: Priority,
    seq: u64,
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<Admission>>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // BinaryHeap is a max-heap: the lowest (priority, seq) must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Token-bucket admission control with a priority queue and a global concurrency cap.
///
/// All bucket state lives in a single worker task; this handle only sends it
/// commands, so clones are cheap and every mutation is serialized.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    tx: mpsc::UnboundedSender<Command>,
}

impl RateLimiter {
    /// Spawns the worker on the current Tokio runtime.
    pub fn new(cfg: RateLimiterConfig) -> Result<Self> {
        cfg.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::configuration_with_context(
                "rate limiter requires a running Tokio runtime",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("rate_limiter"),
            )
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(cfg, rx, tx.downgrade());
        runtime.spawn(worker.run());
        Ok(Self { tx })
    }

    /// Wait for admission. Resolves immediately when the bucket has a token,
    /// the queue is empty and an in-flight slot is free.
    pub async fn acquire(&self, model: &str, opts: &CallOptions) -> Result<Admission> {
        opts.check()?;
        let (reply, mut rx) = oneshot::channel();
        self.tx
            .send(Command::Admit {
                model: model.to_string(),
                priority: opts.priority,
                reply,
            })
            .map_err(|_| shut_down())?;

        let interrupted = tokio::select! {
            biased;
            res = &mut rx => return res.unwrap_or_else(|_| Err(shut_down())),
            err = opts.interrupted() => err,
        };
        self.return_unclaimed(model, rx);
        Err(interrupted)
    }

    /// Close the reply channel of an abandoned admit. A waiter still queued is
    /// skipped by the worker; a grant that already landed gets its token back
    /// before its slot is freed.
    fn return_unclaimed(&self, model: &str, mut rx: oneshot::Receiver<Result<Admission>>) {
        rx.close();
        if let Ok(Ok(admission)) = rx.try_recv() {
            debug!(model = %model, "returning admission granted after interruption");
            let _ = self.tx.send(Command::Refund {
                model: model.to_string(),
            });
            drop(admission);
        }
    }

    /// Run `op` under an admission, releasing the slot when it completes.
    pub async fn admit<F, Fut, T>(&self, model: &str, opts: &CallOptions, op: F) -> Result<T>
    where
        F: FnOnce(AdmitOutcome) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.acquire(model, opts).await?;
        let out = op(admission.outcome()).await;
        drop(admission);
        out
    }

    /// Whether a request for `model` could be admitted within `timeout`.
    /// Consumes nothing and enqueues nothing.
    pub async fn wait_for_slot(&self, model: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let snap = match self.snapshot(model).await {
                Ok(s) => s,
                Err(_) => return false,
            };
            if snap.ready {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let step = snap
                .estimated_wait_ms
                .filter(|_| snap.in_flight < snap.max_in_flight)
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(POLL_INTERVAL);
            tokio::time::sleep(step.min(deadline - now)).await;
        }
    }

    pub async fn snapshot(&self, model: &str) -> Result<RateLimiterSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot {
                model: model.to_string(),
                reply,
            })
            .map_err(|_| shut_down())?;
        rx.await.map_err(|_| shut_down())
    }

    /// Feed provider budget headers into the bucket serving `model`.
    pub fn update_budget(&self, model: &str, remaining: Option<u64>, reset_after: Option<Duration>) {
        let _ = self.tx.send(Command::Budget {
            model: model.to_string(),
            remaining,
            reset_after,
        });
    }

    /// Reject every queued waiter with [`Error::Cancelled`]. Returns how many were rejected.
    pub async fn clear_queue(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::ClearQueue { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Cancel all waiters and stop the worker. Later calls fail with [`Error::Cancelled`].
    pub async fn shutdown(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn shut_down() -> Error {
    Error::cancelled("rate limiter is shut down")
}

struct Worker {
    rx: mpsc::UnboundedReceiver<Command>,
    releaser: mpsc::WeakUnboundedSender<Command>,
    buckets: HashMap<BucketKey, TokenBucket>,
    queues: HashMap<BucketKey, BinaryHeap<Waiter>>,
    in_flight: usize,
    max_in_flight: usize,
    seq: u64,
}

impl Worker {
    fn new(
        cfg: RateLimiterConfig,
        rx: mpsc::UnboundedReceiver<Command>,
        releaser: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let now = Instant::now();
        let mut buckets = HashMap::with_capacity(cfg.per_model.len() + 1);
        buckets.insert(None, TokenBucket::new(cfg.default_bucket, now));
        for (model, bucket) in cfg.per_model {
            buckets.insert(Some(model), TokenBucket::new(bucket, now));
        }
        Self {
            rx,
            releaser,
            buckets,
            queues: HashMap::new(),
            in_flight: 0,
            max_in_flight: cfg.max_in_flight,
            seq: 0,
        }
    }

    async fn run(mut self) {
        loop {
            self.drain();
            let received = match self.next_wake() {
                Some(at) => tokio::select! {
                    cmd = self.rx.recv() => Some(cmd),
                    _ = tokio::time::sleep_until(at) => None,
                },
                None => Some(self.rx.recv().await),
            };
            let Some(cmd) = received else {
                continue;
            };
            match cmd {
                Some(Command::Shutdown { reply }) => {
                    let n = self.cancel_all("rate limiter shut down");
                    let _ = reply.send(n);
                    break;
                }
                Some(cmd) => self.handle(cmd),
                None => {
                    self.cancel_all("rate limiter dropped");
                    break;
                }
            }
        }
        debug!(in_flight = self.in_flight, "rate limiter worker stopped");
    }

    fn key_for(&self, model: &str) -> BucketKey {
        let key = Some(model.to_string());
        if self.buckets.contains_key(&key) {
            key
        } else {
            None
        }
    }

    fn handle(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Admit {
                model,
                priority,
                reply,
            } => {
                if reply.is_closed() {
                    return;
                }
                let key = self.key_for(&model);
                let queue_empty = self.queues.get(&key).map_or(true, |q| q.is_empty());
                let slot_free = self.in_flight < self.max_in_flight;
                let took = queue_empty
                    && slot_free
                    && self.buckets.get_mut(&key).is_some_and(|b| b.try_take(now));
                if took {
                    let admission = self.grant(AdmitOutcome::Immediate);
                    if reply.send(Ok(admission)).is_err() {
                        self.refund(&key);
                    }
                    return;
                }
                self.seq += 1;
                let queue = self.queues.entry(key).or_default();
                queue.push(Waiter {
                    priority,
                    seq: self.seq,
                    enqueued_at: now,
                    reply,
                });
                debug!(
                    model = %model,
                    priority,
                    queued = queue.len(),
                    in_flight = self.in_flight,
                    "request queued for admission"
                );
            }
            Command::Release => {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            Command::Refund { model } => {
                let key = self.key_for(&model);
                if let Some(bucket) = self.buckets.get_mut(&key) {
                    bucket.refill(now);
                }
                self.refund(&key);
            }
            Command::Snapshot { model, reply } => {
                let key = self.key_for(&model);
                let queued = self
                    .queues
                    .get(&key)
                    .map_or(0, |q| q.iter().filter(|w| !w.reply.is_closed()).count());
                let (in_flight, max_in_flight) = (self.in_flight, self.max_in_flight);
                if let Some(bucket) = self.buckets.get_mut(&key) {
                    bucket.refill(now);
                    let wait = bucket.wait_time(now);
                    let _ = reply.send(RateLimiterSnapshot {
                        capacity: bucket.capacity(),
                        refill_per_sec: bucket.refill_per_sec(),
                        tokens: bucket.available(),
                        queued,
                        in_flight,
                        max_in_flight,
                        ready: bucket.ready(now) && in_flight < max_in_flight && queued == 0,
                        estimated_wait_ms: (!wait.is_zero()).then(|| wait.as_millis() as u64),
                    });
                }
            }
            Command::Budget {
                model,
                remaining,
                reset_after,
            } => {
                let key = self.key_for(&model);
                if let Some(bucket) = self.buckets.get_mut(&key) {
                    bucket.refill(now);
                    bucket.apply_budget(remaining, reset_after, now);
                }
            }
            Command::ClearQueue { reply } => {
                let n = self.cancel_all("admission queue cleared");
                debug!(cancelled = n, "admission queue cleared");
                let _ = reply.send(n);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.cancel_all("rate limiter shut down"));
            }
        }
    }

    /// Admit queued waiters while slots and tokens allow, best (priority, seq) first.
    fn drain(&mut self) {
        let now = Instant::now();
        while self.in_flight < self.max_in_flight {
            let mut best: Option<(Priority, u64, BucketKey)> = None;
            for (key, queue) in self.queues.iter_mut() {
                while queue.peek().is_some_and(|w| w.reply.is_closed()) {
                    queue.pop();
                }
                let Some(head) = queue.peek() else {
                    continue;
                };
                let Some(bucket) = self.buckets.get_mut(key) else {
                    continue;
                };
                bucket.refill(now);
                if !bucket.ready(now) {
                    continue;
                }
                let better = best
                    .as_ref()
                    .map_or(true, |(p, s, _)| (head.priority, head.seq) < (*p, *s));
                if better {
                    best = Some((head.priority, head.seq, key.clone()));
                }
            }

            let Some((_, _, key)) = best else {
                break;
            };
            let Some(waiter) = self.queues.get_mut(&key).and_then(|q| q.pop()) else {
                break;
            };
            if let Some(bucket) = self.buckets.get_mut(&key) {
                bucket.try_take(now);
            }
            let waited = now.saturating_duration_since(waiter.enqueued_at);
            let admission = self.grant(AdmitOutcome::Queued { waited });
            if waiter.reply.send(Ok(admission)).is_err() {
                self.refund(&key);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        if self.in_flight >= self.max_in_flight {
            return None;
        }
        let now = Instant::now();
        self.queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .filter_map(|(key, _)| self.buckets.get(key))
            .map(|b| now + b.wait_time(now).max(Duration::from_millis(1)))
            .min()
    }

    fn grant(&mut self, outcome: AdmitOutcome) -> Admission {
        self.in_flight += 1;
        Admission {
            outcome,
            release: self.releaser.upgrade(),
        }
    }

    fn refund(&mut self, key: &BucketKey) {
        if let Some(bucket) = self.buckets.get_mut(key) {
            bucket.refund();
        }
    }

    fn cancel_all(&mut self, reason: &str) -> usize {
        let mut n = 0;
        for (_, mut queue) in self.queues.drain() {
            for waiter in queue.drain() {
                if waiter.reply.send(Err(Error::cancelled(reason))).is_ok() {
                    n += 1;
                }
            }
        }
        n
    }
}
