use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Milliseconds since UNIX epoch
pub type UnixMillis = u64;

const DEFAULT_FILTER: &str = "info";

pub fn unix_millis() -> UnixMillis {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis().min(u64::MAX as u128) as u64,
        Err(_) => 0, // clock went backwards; clamp
    }
}

pub fn unix_secs() -> u64 {
    unix_millis() / 1000
}

/// Installs the process-wide subscriber: `RUST_LOG` if set, `info`
/// otherwise.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_FILTER);
}

pub fn init_tracing_with(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // benches and tests may call this more than once per process
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_millis_is_monotonic_enough() {
        let t1 = unix_millis();
        let t2 = unix_millis();
        assert!(t2 >= t1, "unix_millis went backwards");
    }

    #[test]
    fn unix_secs_agrees_with_millis() {
        let millis = unix_millis();
        let secs = unix_secs();
        assert!(secs >= millis / 1000);
        assert!(secs <= millis / 1000 + 1);
    }

    #[test]
    fn init_tracing_twice_does_not_panic() {
        init_tracing();
        init_tracing_with("debug");
    }
}
