use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slotwise::clock::{Clock, SystemClock};
use slotwise::config::Config;
use slotwise::engine::Engine;
use slotwise::http::{self, AppState};
use slotwise::quota::QuotaLedger;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is normal outside development.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if let Ok(path) = dotenv {
        info!("loaded {}", path.display());
    }

    let config = Config::from_env()?;
    slotwise::observability::init(config.metrics_port);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = config.desk_registry();
    let calendar = config.calendar_provider(clock.clone())?;
    if calendar.is_none() {
        warn!("no calendar credentials configured, every desk serves fallback slots");
    }
    let live_desks = registry.live_count();
    let engine = Arc::new(Engine::new(registry, calendar, config.engine_settings()));

    let store = config.counter_store()?;
    if !store.is_shared() {
        warn!("quota counters are process-local; each instance enforces its own budget");
    }
    let ledger = Arc::new(QuotaLedger::new(store, clock));

    let state = AppState {
        engine,
        ledger,
        buckets: Arc::new(config.quota_buckets.clone()),
    };

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotwise listening on {addr}");
    info!("  timezone: {}", config.timezone);
    info!("  live desks: {live_desks}");
    info!("  quota buckets: {:?}", config.quota_buckets);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, let in-flight requests finish
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        info!("shutdown signal received, draining requests");
    };

    http::serve(listener, state, shutdown).await?;

    info!("slotwise stopped");
    Ok(())
}
