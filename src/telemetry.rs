//! Tracing initialisation.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Install the global subscriber. `GROOM_LOG` takes precedence over the
/// verbosity level. Safe to call more than once (later calls are no-ops),
/// which keeps tests that share a process happy.
pub fn init(verbosity: u8) {
    let filter = match std::env::var("GROOM_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }),
    };

    let _ = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
