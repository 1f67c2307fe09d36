use anyhow::Context;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LimitsConfig, LoggingConfig, RatewardenConfig, StoreBackend, StoreConfig};
use ratewarden::ratelimit::{
    ceil_secs, CounterStore, Decision, ExpirySweeper, Limiter, MemoryCounterStore,
    RedisCounterStore, RequestDescriptor,
};
use ratewarden::reload::ConfigReloader;

/// Fallback sweep interval when no rules are configured.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Request rate limiter.
///
/// Reads one request per line from stdin as `<client> <METHOD> <path>` and
/// writes one JSON decision per line to stdout.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// Service configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Limits file with rules and policies (overrides the configured path)
    #[arg(short, long)]
    limits: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (overrides the configured level)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = RatewardenConfig::load(args.config.as_deref())
        .context("Failed to load service configuration")?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.logging.json |= args.json_logs;

    init_tracing(&config.logging);

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limits_path = args
        .limits
        .or_else(|| config.rate_limiting.limits_path.as_ref().map(PathBuf::from));
    let limits = match &limits_path {
        Some(path) => LimitsConfig::from_file(path)
            .with_context(|| format!("Failed to load limits from {}", path.display()))?,
        None => {
            warn!("No limits file configured, every request is unmatched");
            LimitsConfig::default()
        }
    };

    let store = build_store(&config.store).await?;
    let limiter = Arc::new(
        Limiter::from_config(&limits, store.clone())
            .context("Invalid rate limit configuration")?
            .with_options(config.rate_limiting.limiter_options()),
    );
    info!(options = ?limiter.options(), "Rate limiter initialized");

    let sweep_interval = config
        .rate_limiting
        .sweep_interval_secs
        .map(Duration::from_secs)
        .or_else(|| limiter.rules().shortest_period())
        .unwrap_or(DEFAULT_SWEEP_INTERVAL);
    let mut tasks = vec![ExpirySweeper::new(store, limiter.clock(), sweep_interval).spawn()];

    match &limits_path {
        Some(path) if config.rate_limiting.hot_reload => {
            let reloader = ConfigReloader::new(
                path,
                limiter.clone(),
                Duration::from_millis(config.rate_limiting.reload_debounce_ms),
            );
            tasks.push(reloader.spawn().context("Failed to watch limits file")?);
        }
        _ => info!("Limits hot reload disabled"),
    }

    tokio::select! {
        result = serve_stdin(limiter) => result?,
        _ = shutdown_signal() => {}
    }

    for task in tasks {
        info!(task = task.name(), "Stopping background task");
        task.shutdown().await;
    }

    info!("Ratewarden stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory counter store");
            Ok(Arc::new(MemoryCounterStore::new()))
        }
        StoreBackend::Redis => {
            let store = RedisCounterStore::connect(
                &config.redis_url,
                config.key_prefix.clone(),
                Duration::from_millis(config.timeout_ms),
            )
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
            Ok(Arc::new(store))
        }
    }
}

/// Answer requests read from stdin until EOF.
async fn serve_stdin(limiter: Arc<Limiter>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let output = match parse_request(line) {
            Some(request) => {
                let decision = limiter.check(&request).await;
                render(&request, &decision)
            }
            None => json!({
                "error": "expected '<client> <METHOD> <path>'",
                "input": line,
            }),
        };

        stdout.write_all(output.to_string().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}

fn parse_request(line: &str) -> Option<RequestDescriptor> {
    let mut parts = line.split_whitespace();
    let client = parts.next()?;
    let method = parts.next()?;
    let path = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some(RequestDescriptor::new(client, path, method))
}

fn render(request: &RequestDescriptor, decision: &Decision) -> serde_json::Value {
    let headers: serde_json::Map<String, serde_json::Value> = decision
        .headers()
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.into()))
        .collect();

    json!({
        "client": request.client.as_str(),
        "method": request.method,
        "path": request.path,
        "allowed": decision.allowed,
        "reason": decision.reason,
        "status": if decision.allowed { 200 } else { 429 },
        "retry_after_secs": decision.retry_after.map(ceil_secs),
        "rule": decision.matched_rule.as_ref().map(|rule| rule.id().to_string()),
        "limit": decision.limit,
        "remaining": decision.remaining,
        "message": decision.quota_message(),
        "headers": headers,
    })
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let request = parse_request("10.0.0.1 GET /api/test").unwrap();
        assert_eq!(request.client.as_str(), "10.0.0.1");
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api/test");

        assert!(parse_request("10.0.0.1 GET").is_none());
        assert!(parse_request("10.0.0.1 GET /a extra").is_none());
    }

    #[tokio::test]
    async fn test_render_rejection() {
        let limits = LimitsConfig::from_yaml(
            "rules:\n  - endpoint: \"*\"\n    period: 1m\n    limit: 1\n",
        )
        .unwrap();
        let limiter = Limiter::from_config(&limits, Arc::new(MemoryCounterStore::new())).unwrap();
        let request = RequestDescriptor::new("a", "/", "GET");

        limiter.check(&request).await;
        let decision = limiter.check(&request).await;
        let value = render(&request, &decision);

        assert_eq!(value["allowed"], false);
        assert_eq!(value["status"], 429);
        assert_eq!(value["reason"], "over_limit");
        assert_eq!(value["rule"], "*:*|1m|per_client");
        assert_eq!(value["headers"]["X-Rate-Limit-Remaining"], "0");
    }
}
