pub mod sampler;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use sampler::{ClientDepth, ClientSample, QueueDepths, Sample, StatsHistory, StatsReport};

#[derive(Debug)]
pub struct RollingCounter {
    buckets: Vec<AtomicU64>,
    last_tick: AtomicU64,
    resolution_secs: u64,
}

impl RollingCounter {
    pub fn new(resolution_secs: u64, bucket_count: usize) -> Self {
        Self {
            buckets: (0..bucket_count.max(1)).map(|_| AtomicU64::new(0)).collect(),
            last_tick: AtomicU64::new(0),
            resolution_secs: resolution_secs.max(1),
        }
    }

    #[inline]
    pub fn incr(&self) {
        self.incr_many(1);
    }

    #[inline]
    pub fn incr_many(&self, many: u64) {
        let now = current_epoch_secs() / self.resolution_secs;
        let idx = (now as usize) % self.buckets.len();

        let last = self.last_tick.swap(now, Ordering::Relaxed);
        if last != now {
            self.buckets[idx].store(0, Ordering::Relaxed);
        }

        self.buckets[idx].fetch_add(many, Ordering::Relaxed);
    }

    pub fn sum_last(&self, seconds: usize) -> u64 {
        let now = current_epoch_secs() / self.resolution_secs;
        let mut sum = 0;

        for i in 0..seconds.min(self.buckets.len()) {
            let idx =
                ((now as isize - i as isize).rem_euclid(self.buckets.len() as isize)) as usize;
            sum += self.buckets[idx].load(Ordering::Relaxed);
        }

        sum
    }

    pub fn rate_per_sec(&self, window_secs: usize) -> f64 {
        self.sum_last(window_secs) as f64 / window_secs.min(self.buckets.len()).max(1) as f64
    }
}

#[inline]
fn current_epoch_secs() -> u64 {
    tarry_util::unix_secs()
}

#[derive(Debug)]
pub struct OpStats {
    pub ops: RollingCounter,
    pub total: AtomicU64,
    pub errors: AtomicU64,
}

impl OpStats {
    pub fn new(bucket_count: usize) -> Self {
        Self {
            ops: RollingCounter::new(1, bucket_count),
            total: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn incr(&self) {
        self.ops.incr();
        self.total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-client counters reset by every sample.
#[derive(Debug, Default)]
pub struct ClientCounters {
    pub pulled: AtomicU64,
    pub acked: AtomicU64,
    pub unreserved: AtomicU64,
    pub dropped: AtomicU64,
}

impl ClientCounters {
    fn take(&self) -> (u64, u64, u64, u64) {
        (
            self.pulled.swap(0, Ordering::Relaxed),
            self.acked.swap(0, Ordering::Relaxed),
            self.unreserved.swap(0, Ordering::Relaxed),
            self.dropped.swap(0, Ordering::Relaxed),
        )
    }
}

/// Event sink for the broker core. Every method is a handful of relaxed
/// atomic increments so callers may invoke them from inside a critical
/// section.
#[derive(Debug)]
pub struct BrokerStats {
    pub published: OpStats,
    pub delivered: OpStats,
    pub acked: OpStats,
    pub redelivered: OpStats,
    pub dropped: OpStats,

    published_since_sample: AtomicU64,
    clients: DashMap<String, Arc<ClientCounters>>,
}

impl BrokerStats {
    pub fn new(buckets: usize) -> Arc<Self> {
        Arc::new(Self {
            published: OpStats::new(buckets),
            delivered: OpStats::new(buckets),
            acked: OpStats::new(buckets),
            redelivered: OpStats::new(buckets),
            dropped: OpStats::new(buckets),
            published_since_sample: AtomicU64::new(0),
            clients: DashMap::new(),
        })
    }

    fn client(&self, client: &str) -> Arc<ClientCounters> {
        if let Some(counters) = self.clients.get(client) {
            return counters.clone();
        }
        self.clients
            .entry(client.to_string())
            .or_insert_with(|| Arc::new(ClientCounters::default()))
            .clone()
    }

    #[inline]
    pub fn published(&self) {
        self.published.incr();
        self.published_since_sample.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn pulled(&self, client: &str) {
        self.delivered.incr();
        self.client(client).pulled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn acked(&self, client: &str) {
        self.acked.incr();
        self.client(client).acked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn ack_rejected(&self) {
        self.acked.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn unreserved(&self, client: &str) {
        self.redelivered.incr();
        self.client(client).unreserved.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dropped(&self, client: &str) {
        self.dropped.incr();
        self.client(client).dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Builds one sample from the given depths and resets the interval
    /// counters it consumed.
    pub fn take_sample(&self, depths: &[ClientDepth]) -> Sample {
        let mut sample = Sample {
            publish_operations_count: self.published_since_sample.swap(0, Ordering::Relaxed),
            clients: Default::default(),
        };

        for depth in depths {
            let (pulled, acked, unreserved, dropped) = self
                .clients
                .get(&depth.client)
                .map(|c| c.take())
                .unwrap_or_default();

            sample.clients.insert(
                depth.client.clone(),
                ClientSample {
                    unacked_message_in_memory_count: depth.unacked as u64,
                    reserved_message_in_memory_count: depth.reserved as u64,
                    pulled_operations_count: pulled,
                    acked_operations_count: acked,
                    unreserved_operations_count: unreserved,
                    dropped_operations_count: dropped,
                },
            );
        }

        sample
    }

    pub fn snapshot(&self) -> BrokerStatsSnapshot {
        let window = 60;

        BrokerStatsSnapshot {
            published_per_sec_1m: self.published.ops.rate_per_sec(window),
            delivered_per_sec_1m: self.delivered.ops.rate_per_sec(window),
            acked_per_sec_1m: self.acked.ops.rate_per_sec(window),
            redelivered_per_sec_1m: self.redelivered.ops.rate_per_sec(window),
            dropped_per_sec_1m: self.dropped.ops.rate_per_sec(window),

            total_published: self.published.total.load(Ordering::Relaxed),
            total_delivered: self.delivered.total.load(Ordering::Relaxed),
            total_acked: self.acked.total.load(Ordering::Relaxed),
            total_redelivered: self.redelivered.total.load(Ordering::Relaxed),
            total_dropped: self.dropped.total.load(Ordering::Relaxed),
            ack_errors: self.acked.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BrokerStatsSnapshot {
    pub published_per_sec_1m: f64,
    pub delivered_per_sec_1m: f64,
    pub acked_per_sec_1m: f64,
    pub redelivered_per_sec_1m: f64,
    pub dropped_per_sec_1m: f64,

    pub total_published: u64,
    pub total_delivered: u64,
    pub total_acked: u64,
    pub total_redelivered: u64,
    pub total_dropped: u64,
    pub ack_errors: u64,
}

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

pub struct MetricsHandle {
    metrics: Metrics,
    runtime: MetricsRuntime,
}

impl MetricsHandle {
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await;
    }
}

struct MetricsInner {
    broker: Arc<BrokerStats>,
    history: Arc<StatsHistory>,
}

impl Metrics {
    pub fn new(buckets: usize, history_len: usize) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                broker: BrokerStats::new(buckets),
                history: Arc::new(StatsHistory::new(history_len)),
            }),
        }
    }

    pub fn start(self, config: MetricsConfig, depths: Arc<dyn QueueDepths>) -> MetricsHandle {
        let runtime = MetricsRuntime::start(self.clone(), config, depths);
        MetricsHandle {
            metrics: self,
            runtime,
        }
    }

    pub fn broker(&self) -> Arc<BrokerStats> {
        self.inner.broker.clone()
    }

    pub fn history(&self) -> Arc<StatsHistory> {
        self.inner.history.clone()
    }

    /// Takes a sample right away, outside the periodic schedule.
    pub fn sample_now(&self, depths: &dyn QueueDepths) {
        let sample = self.inner.broker.take_sample(&depths.queue_depths());
        self.inner.history.push(sample);
    }

    pub fn report(&self) -> StatsReport {
        self.inner.history.report()
    }
}

pub struct MetricsRuntime {
    shutdown: ShutdownSignal,
    handles: Vec<JoinHandle<()>>,
}

impl MetricsRuntime {
    pub fn start(metrics: Metrics, config: MetricsConfig, depths: Arc<dyn QueueDepths>) -> Self {
        let shutdown = ShutdownSignal::new();
        let mut handles = Vec::new();

        handles.push(tokio::spawn(run_sampler(
            metrics.clone(),
            depths,
            config.sample_interval,
            shutdown.subscribe(),
        )));

        if config.log_broker {
            handles.push(tokio::spawn(run_broker_logger(
                metrics.broker(),
                config.log_interval,
                shutdown.subscribe(),
            )));
        }

        Self { shutdown, handles }
    }

    pub async fn shutdown(self) {
        self.shutdown.signal();
        for h in self.handles {
            let _ = h.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub sample_interval: Duration,
    pub log_interval: Duration,
    pub log_broker: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(60),
            log_interval: Duration::from_secs(10),
            log_broker: true,
        }
    }
}

#[inline]
fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

pub async fn run_sampler(
    metrics: Metrics,
    depths: Arc<dyn QueueDepths>,
    interval: Duration,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                metrics.sample_now(depths.as_ref());
                tracing::debug!(samples = metrics.history().sample_count(), "[stats] sampled");
            }
            _ = shutdown.recv() => {
                break;
            }
        }
    }
}

pub async fn run_broker_logger(
    stats: Arc<BrokerStats>,
    interval: Duration,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let snap = stats.snapshot();
                tracing::info!(
                    published_s = round1(snap.published_per_sec_1m),
                    delivered_s = round1(snap.delivered_per_sec_1m),
                    acked_s = round1(snap.acked_per_sec_1m),
                    redelivered_s = round1(snap.redelivered_per_sec_1m),
                    dropped_s = round1(snap.dropped_per_sec_1m),

                    total_published = snap.total_published,
                    total_delivered = snap.total_delivered,
                    total_acked = snap.total_acked,
                    ack_errors = snap.ack_errors,
                    "[broker]"
                );
            }
            _ = shutdown.recv() => {
                break;
            }
        }
    }
}

pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn subscribe(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }

    pub async fn recv(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }
}
