use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use dashmap::DashMap;
use tarry::{Server, ServerConfig};
use tarry_broker::BrokerConfig;
use tarry_client::{Client, Subscriber};
use tarry_metrics::MetricsConfig;
use tarry_util::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "tarry")]
pub enum Command {
    Bench(BenchCmd),
}

#[derive(Parser, Debug)]
pub struct BenchCmd {
    #[command(subcommand)]
    pub mode: BenchMode,
}

#[derive(Parser, Debug)]
pub enum BenchMode {
    E2E(E2EBench),
}

#[derive(Parser, Debug, Clone)]
pub struct E2EBench {
    #[arg(long, default_value = "20000")]
    pub messages: u64,

    #[arg(long, default_value = "4")]
    pub producers: usize,

    /// Distinct subscriber names; every message fans out to each of them
    #[arg(long, default_value = "2")]
    pub clients: usize,

    /// Concurrent long polls per subscriber name
    #[arg(long, default_value = "4")]
    pub pollers: usize,

    #[arg(long, default_value = "32")]
    pub payload_min: usize,

    #[arg(long, default_value = "256")]
    pub payload_max: usize,

    #[arg(long, default_value = "60000")]
    pub reservation_timeout_ms: u64,

    #[arg(long, default_value = "1")]
    pub report_interval_secs: u64,

    #[arg(long, value_enum, default_value = "sync")]
    pub ack_mode: AckMode,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum AckMode {
    Sync,
    None,
}

fn make_payload(msg_id: u64, producer_id: u32, size: usize) -> String {
    let mut buf = format!("{msg_id}:{producer_id}:");
    buf.extend((0..size).map(|_| fastrand::alphanumeric()));
    buf
}

fn decode_payload(payload: &str) -> Option<(u64, u32)> {
    let mut parts = payload.splitn(3, ':');
    let msg_id = parts.next()?.parse().ok()?;
    let producer = parts.next()?.parse().ok()?;
    Some((msg_id, producer))
}

struct BenchMetrics {
    published: AtomicU64,
    consumed: AtomicU64,
    acked: AtomicU64,
    duplicates: AtomicU64,
    errors: AtomicU64,

    start: Instant,

    publish_done_at: AtomicU64, // nanos since start
    consume_done_at: AtomicU64,

    // (client index, msg id) pairs already consumed
    seen: DashMap<(usize, u64), ()>,
}

impl BenchMetrics {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            errors: AtomicU64::new(0),

            start: Instant::now(),
            publish_done_at: AtomicU64::new(0),
            consume_done_at: AtomicU64::new(0),
            seen: DashMap::new(),
        }
    }
}

fn mark_done_once(slot: &AtomicU64, start: Instant) {
    let elapsed = start.elapsed().as_nanos() as u64;
    let _ = slot.compare_exchange(0, elapsed, Ordering::Relaxed, Ordering::Relaxed);
}

async fn producer_task(
    client: Client,
    producer_id: u32,
    start_id: u64,
    count: u64,
    cmd: E2EBench,
    metrics: Arc<BenchMetrics>,
    total: u64,
) {
    for i in 0..count {
        let size = fastrand::usize(cmd.payload_min..=cmd.payload_max);
        let payload = make_payload(start_id + i, producer_id, size);

        match client.publish(payload).await {
            Ok(_) => {
                let n = metrics.published.fetch_add(1, Ordering::Relaxed) + 1;
                if n == total {
                    mark_done_once(&metrics.publish_done_at, metrics.start);
                }
            }
            Err(err) => {
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%err, "publish failed");
            }
        }
    }
}

async fn consumer_task(
    sub: Subscriber,
    client_idx: usize,
    ack_mode: AckMode,
    metrics: Arc<BenchMetrics>,
    total: u64,
) {
    loop {
        let msg = match sub.next().await {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%err, "poll ended");
                return;
            }
        };

        if let Some((msg_id, _producer)) = decode_payload(&msg.payload)
            && metrics.seen.insert((client_idx, msg_id), ()).is_some()
        {
            metrics.duplicates.fetch_add(1, Ordering::Relaxed);
        }

        let c = metrics.consumed.fetch_add(1, Ordering::Relaxed) + 1;
        if c == total {
            mark_done_once(&metrics.consume_done_at, metrics.start);
        }

        match ack_mode {
            AckMode::Sync => match msg.ack().await {
                Ok(()) => {
                    metrics.acked.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%err, "ack failed");
                }
            },
            AckMode::None => {}
        }
    }
}

async fn reporter(metrics: Arc<BenchMetrics>, interval: u64, total: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));

    loop {
        ticker.tick().await;
        let consumed = metrics.consumed.load(Ordering::Relaxed);
        tracing::info!(
            "pub={} cons={} ack={} dup={} err={}",
            metrics.published.load(Ordering::Relaxed),
            consumed,
            metrics.acked.load(Ordering::Relaxed),
            metrics.duplicates.load(Ordering::Relaxed),
            metrics.errors.load(Ordering::Relaxed),
        );

        if consumed >= total {
            break;
        }
    }
}

async fn run_e2e_bench(cmd: E2EBench) -> anyhow::Result<()> {
    anyhow::ensure!(cmd.producers > 0, "producers must be positive");
    anyhow::ensure!(
        cmd.payload_max >= cmd.payload_min,
        "payload_max must not be below payload_min"
    );

    let config = ServerConfig {
        http_bind: "127.0.0.1:0".parse::<SocketAddr>()?,
        broker: BrokerConfig {
            reservation_timeout_ms: cmd.reservation_timeout_ms,
            // the bench must not lose messages to eviction
            max_backlog_per_client: 0,
        },
        stats: MetricsConfig {
            sample_interval: Duration::from_secs(5),
            log_interval: Duration::from_secs(cmd.report_interval_secs.max(1)),
            log_broker: true,
        },
        stats_history: 60,
    };

    let server = Server::bind(config).await?;
    let base_url = format!("http://{}", server.local_addr()?);
    let broker = server.broker();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(server.run(async move {
        let _ = stop_rx.await;
    }));

    let client = Client::new(&base_url)?;
    let metrics = Arc::new(BenchMetrics::new());

    let per_producer = cmd.messages / cmd.producers as u64;
    let published_total = per_producer * cmd.producers as u64;
    let consumed_total = published_total * cmd.clients as u64;

    // Consumers; names are registered up front so no publish is missed
    for c in 0..cmd.clients {
        let name = format!("bench-{c}");
        broker.register_client(&name);
        for _ in 0..cmd.pollers {
            tokio::spawn(consumer_task(
                client.subscriber(name.clone()),
                c,
                cmd.ack_mode.clone(),
                metrics.clone(),
                consumed_total,
            ));
        }
    }

    // Producers
    for p in 0..cmd.producers {
        tokio::spawn(producer_task(
            client.clone(),
            p as u32,
            p as u64 * per_producer,
            per_producer,
            cmd.clone(),
            metrics.clone(),
            published_total,
        ));
    }

    let handle = tokio::spawn(reporter(
        metrics.clone(),
        cmd.report_interval_secs,
        consumed_total,
    ));

    // Wait until done
    handle.await?;

    let pub_ns = metrics.publish_done_at.load(Ordering::Relaxed);
    let con_ns = metrics.consume_done_at.load(Ordering::Relaxed);

    tracing::info!("=== FINAL THROUGHPUT ===");

    if pub_ns > 0 {
        let secs = pub_ns as f64 / 1e9;
        tracing::info!("Published: {:.0} msg/s", published_total as f64 / secs);
    }

    if con_ns > 0 {
        let secs = con_ns as f64 / 1e9;
        tracing::info!("Consumed:  {:.0} msg/s", consumed_total as f64 / secs);
    }

    tracing::info!(
        "duplicates={} errors={}",
        metrics.duplicates.load(Ordering::Relaxed),
        metrics.errors.load(Ordering::Relaxed)
    );

    let _ = stop_tx.send(());
    server_task.await??;

    tracing::info!("Bench complete.");
    Ok(())
}

#[tokio::main(flavor = "multi_thread", worker_threads = 8)]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cmd = Command::parse();

    match cmd {
        Command::Bench(b) => match b.mode {
            BenchMode::E2E(e2e) => {
                tracing::info!("Starting E2E bench: {:#?}", e2e);
                run_e2e_bench(e2e).await
            }
        },
    }
}
