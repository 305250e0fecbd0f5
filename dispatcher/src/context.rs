use tracing::{debug, level_filters::LevelFilter, subscriber::DefaultGuard};
use tracing_subscriber::EnvFilter;

/// Owns the log subscriber for the lifetime of one invocation.
/// Dropping or calling `teardown` restores whatever subscriber was active before.
#[must_use = "logging stops once the context is dropped"]
pub struct LoggingContext {
    guard: Option<DefaultGuard>,
}

impl LoggingContext {
    /// `RUST_LOG` takes precedence over `default_level`
    pub fn new(default_level: LevelFilter) -> Self {
        let filter = EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy();

        Self::with_filter(filter)
    }

    pub fn with_filter(filter: EnvFilter) -> Self {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();

        Self {
            guard: Some(tracing::subscriber::set_default(subscriber)),
        }
    }

    pub fn teardown(mut self) {
        debug!("Tearing down logging context");

        self.guard.take();
    }
}
