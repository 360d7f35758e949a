use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs the global tracing subscriber. `RUST_LOG` controls filtering,
/// defaulting to `info`. Safe to call more than once (tests).
pub fn setup_logging() {
	INIT.call_once(|| {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
		tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_target(false)
			.init();
	});
}
