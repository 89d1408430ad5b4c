//! Edge runtime binary
//!
//! Loads the TOML configuration (`--config <path>` or `EDGE_RUNTIME_CONFIG`),
//! assembles the runtime and supervises it until Ctrl-C or SIGTERM.

use edge_runtime::sender::sender_fn;
use edge_runtime::{Message, RuntimeConfig, RuntimeContext};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Interval between periodic statistics lines
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RuntimeConfig::load(config_path().as_deref())?;
    init_tracing(&config);

    info!("Edge runtime starting: {}", config.device_id);
    info!("  Queue backend: {}", config.connection.endpoint);
    info!(
        "  Network probe: {}:{}",
        config.network.host, config.network.port
    );

    let shutdown_timeout = config.shutdown_timeout;
    let context = RuntimeContext::build(config).await?;

    // No execution transport is wired in this binary; deliveries are logged
    context
        .service
        .set_dispatcher(sender_fn(|message: Message| async move {
            info!(
                "[SEND] Dispatched {} priority={} trace={}",
                message.id, message.priority, message.trace_id
            );
            true
        }))
        .await;
    context
        .coordinator
        .set_alert_callback(|title, body, _context| warn!("[ALERT] {}: {}", title, body))
        .await;

    if !context.start().await {
        warn!("Some services failed to start; the coordinator will keep supervising");
    }

    let mut stats = tokio::time::interval(STATS_INTERVAL);
    stats.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = stats.tick() => {
                let s = context.service.get_statistics().await;
                info!(
                    "[RUNTIME] submitted={} queued={} buffered={} dispatched={} backend_available={}",
                    s.submitted, s.queued, s.buffered, s.dispatched, s.backend_available
                );
            }
        }
    }

    info!("Shutdown requested");
    if !context.shutdown(shutdown_timeout).await {
        warn!("Shutdown did not complete cleanly within {:?}", shutdown_timeout);
    }
    info!("Edge runtime stopped");
    Ok(())
}

/// `--config <path>` on the command line, else the loader's own lookup
fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

fn init_tracing(config: &RuntimeConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));

    if config.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}
