use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tollgate::audit::TracingAuditSink;
use tollgate::clock::{Clock, SystemClock};
use tollgate::config::{LoggingConfig, StoreKind, Strategy, TollgateConfig};
use tollgate::http::HttpServer;
use tollgate::ratelimit::{
    FixedWindowCounter, IpKeyResolver, LimitPolicyStore, PolicyOverrides, RateLimiter,
    SlidingLogCounter, WindowCounter,
};
use tollgate::store::{CounterStore, MemoryCounterStore, RedisCounterStore};

/// Per-client HTTP admission control.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.http_addr = listen;
    }

    init_tracing(&config.logging);

    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        strategy = ?config.rate_limiting.strategy,
        failure_mode = ?config.rate_limiting.failure_mode,
        "Configuration loaded"
    );

    let rate_limiter = Arc::new(build_rate_limiter(&config).await?);
    info!(strategy = rate_limiter.strategy(), "Rate limiter initialized");

    let sweeper = tokio::spawn(sweep_idle_state(
        Arc::clone(&rate_limiter),
        config.rate_limiting.sweep_interval(),
    ));

    HttpServer::new(config.server.http_addr, rate_limiter)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_rate_limiter(config: &TollgateConfig) -> anyhow::Result<RateLimiter> {
    let settings = &config.rate_limiting;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let counter: Arc<dyn WindowCounter> = match settings.strategy {
        Strategy::Log => Arc::new(SlidingLogCounter::new(clock)),
        Strategy::FixedWindow => {
            let store: Arc<dyn CounterStore> = match config.store.kind {
                StoreKind::Memory => Arc::new(MemoryCounterStore::new(clock)),
                StoreKind::Redis => {
                    let store = RedisCounterStore::connect(&config.store.redis_url).await?;
                    store.ping().await?;
                    Arc::new(store)
                }
            };
            Arc::new(
                FixedWindowCounter::new(store)
                    .with_key_prefix(config.store.key_prefix.clone())
                    .with_backend_timeout(settings.backend_timeout()),
            )
        }
    };

    let default_policy = settings.default_policy()?;
    let overrides = match &settings.overrides_path {
        Some(path) => PolicyOverrides::from_file(path)?.resolve()?,
        None => Vec::new(),
    };
    info!(count = overrides.len(), "Policy overrides loaded");

    let resolver = if config.server.trust_forwarded_for {
        IpKeyResolver::trusting_forwarded_for()
    } else {
        IpKeyResolver::new()
    };

    let mut limiter = RateLimiter::new(counter, default_policy)
        .with_policy_store(LimitPolicyStore::with_overrides(default_policy, overrides))
        .with_resolver(Arc::new(resolver))
        .with_failure_mode(settings.failure_mode);

    if config.audit.enabled {
        limiter = limiter.with_audit_sink(Arc::new(TracingAuditSink));
    }

    Ok(limiter)
}

/// Periodically drop window state for clients that have gone quiet.
async fn sweep_idle_state(rate_limiter: Arc<RateLimiter>, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = rate_limiter.sweep();
        debug!(removed, "Swept idle rate limit state");
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
