use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Tracing subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Emit JSON lines instead of the human format.
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global tracing subscriber. Safe to call more than once; only
/// the first call takes effect.
pub fn init_tracing(config: &TracingConfig) {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);

        if config.json {
            builder.json().init();
        } else {
            builder.init();
        }
    });
}
