use std::sync::atomic::{AtomicBool, Ordering};

use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the global subscriber: env-filtered compact output plus the
/// `log` bridge, so both `log` and `tracing` call sites end up in one place.
/// Safe to call more than once; only the first call takes effect.
pub fn init_logging(default_filter: &str) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();

    let _ = LogTracer::init();
}
