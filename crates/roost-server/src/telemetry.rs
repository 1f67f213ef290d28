//! Tracing setup for the server binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set. Production deployments
/// (`ROOST_ENV=production`) get JSON output for log aggregation; anything
/// else gets human-readable console output.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,roost_mediator=debug,roost_server=debug"));

    let json = std::env::var("ROOST_ENV")
        .map(|v| v == "production")
        .unwrap_or(false);

    if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true);
        tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true);
        tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    }

    tracing::info!(json, "Telemetry initialized");
    Ok(())
}
