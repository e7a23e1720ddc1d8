use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // a subscriber may already be installed (tests, embedding hosts)
    let _ = if json {
        registry.with(fmt::layer().json().with_thread_names(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false).with_thread_names(true)).try_init()
    };
}
