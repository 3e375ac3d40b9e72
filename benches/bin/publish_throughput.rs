use std::sync::Arc;

use clap::Parser;
use tarry_broker::{Broker, BrokerConfig};
use tarry_metrics::Metrics;
use tarry_util::init_tracing;
use tokio::time::Instant;

/// Benchmark in-process publish fan-out.
#[derive(Parser, Debug)]
struct Args {
    /// Number of messages to publish
    #[arg(long, default_value = "1000000")]
    messages: usize,

    /// Parallel publisher tasks
    #[arg(long, default_value = "8")]
    parallelism: usize,

    /// Registered subscriber clients every message fans out to
    #[arg(long, default_value = "4")]
    clients: usize,

    /// Maximum payload size (randomized 32..max)
    #[arg(long, default_value = "256")]
    max_payload: usize,

    /// Per-client backlog limit, 0 for unbounded
    #[arg(long, default_value = "1000")]
    max_backlog: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    anyhow::ensure!(args.parallelism > 0, "parallelism must be positive");
    anyhow::ensure!(args.max_payload >= 32, "max_payload must be at least 32");

    let cfg = BrokerConfig {
        max_backlog_per_client: args.max_backlog,
        ..Default::default()
    };

    let metrics = Metrics::new(60 * 60, 1);
    let broker = Arc::new(Broker::with_observer(cfg, metrics.broker()));
    for i in 0..args.clients {
        broker.register_client(&format!("bench-{i}"));
    }

    tracing::info!("Benchmark: Publishing {} messages...", args.messages);
    tracing::info!(
        "parallel={}, clients={}, max_backlog={}, max_payload={}",
        args.parallelism,
        args.clients,
        args.max_backlog,
        args.max_payload
    );

    let mut tasks = Vec::new();
    let msgs_per_worker = args.messages / args.parallelism;

    let start = Instant::now();

    for _ in 0..args.parallelism {
        let max_payload = args.max_payload;
        let broker = broker.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..msgs_per_worker {
                let size = fastrand::usize(32..=max_payload);
                let mut buf = vec![0u8; size];
                fastrand::fill(&mut buf);
                broker.publish(buf);
            }
        }));
    }

    for t in tasks {
        t.await?;
    }

    let elapsed = start.elapsed().as_secs_f64();
    let published = msgs_per_worker * args.parallelism;
    let rate = published as f64 / elapsed;

    let snap = metrics.broker().snapshot();
    tracing::info!("Total time: {:.2} s", elapsed);
    tracing::info!("Throughput: {:.2} messages/sec", rate);
    tracing::info!(
        "Fan-out: {:.2} copies/sec, dropped {}",
        rate * args.clients as f64,
        snap.total_dropped
    );
    for depth in broker.client_depths() {
        tracing::info!("{}: unacked={}", depth.client, depth.unacked);
    }

    broker.shutdown();
    Ok(())
}
