use std::sync::Once;

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Initializes the global tracing subscriber. Safe to call more than once;
/// only the first call takes effect.
pub fn init(default_level: &str) {
    static START: Once = Once::new();
    let default_level = default_level.to_string();
    START.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set global default tracing subscriber");
    });
}
