//! tiercache daemon
//!
//! Runs the cache system with its background services and serves the ops
//! endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        tiercache                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────────┐ │
//! │  │  Health    │   │  Metrics   │   │     CacheSystem      │ │
//! │  │  server    │──▶│  server    │──▶│ warming, cleanup,    │ │
//! │  │  :8081     │   │  :9090     │   │ invalidation, monitor│ │
//! │  └────────────┘   └────────────┘   └──────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{
    InMemoryRemoteStore, RedisConfig, RedisRemoteStore, RemoteNamespace, RemoteStore,
    RemoteTierConfig, StrategyTable,
};
use tiercache::cleanup::CleanupConfig;
use tiercache::error::{Error, Result};
use tiercache::{CacheSystem, SystemConfig};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - adaptive multi-tier result cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis host
    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    redis_host: String,

    /// Redis port
    #[arg(long, env = "REDIS_PORT", default_value = "6379")]
    redis_port: u16,

    /// Redis password
    #[arg(long, env = "REDIS_PASSWORD")]
    redis_password: Option<String>,

    /// Base Redis database; the cache uses the next one
    #[arg(long, env = "REDIS_DB", default_value = "0")]
    redis_db: i64,

    /// Connect timeout in milliseconds
    #[arg(long, env = "REDIS_CONNECT_TIMEOUT_MS", default_value = "10000")]
    redis_connect_timeout_ms: u64,

    /// Per-command timeout in milliseconds
    #[arg(long, env = "REDIS_COMMAND_TIMEOUT_MS", default_value = "3000")]
    redis_command_timeout_ms: u64,

    /// Use a process-local remote store instead of Redis
    #[arg(long, env = "IN_MEMORY_REMOTE")]
    in_memory_remote: bool,

    /// Enable cache warming
    #[arg(long, env = "ENABLE_WARMING", default_value = "true", action = clap::ArgAction::Set)]
    enable_warming: bool,

    /// Enable monitoring and alerting
    #[arg(long, env = "ENABLE_MONITORING", default_value = "true", action = clap::ArgAction::Set)]
    enable_monitoring: bool,

    /// Enable scheduled invalidation rules
    #[arg(long, env = "ENABLE_INVALIDATION", default_value = "true", action = clap::ArgAction::Set)]
    enable_invalidation: bool,

    /// Enable memory-pressure cleanup
    #[arg(long, env = "ENABLE_CLEANUP", default_value = "true", action = clap::ArgAction::Set)]
    enable_cleanup: bool,

    /// Enable periodic strategy optimization
    #[arg(long, env = "ENABLE_OPTIMIZER")]
    enable_optimizer: bool,

    /// Report cleanup actions without performing them
    #[arg(long, env = "CLEANUP_DRY_RUN")]
    cleanup_dry_run: bool,

    /// YAML file of strategy overrides
    #[arg(long, env = "STRATEGY_FILE")]
    strategy_file: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            host: self.redis_host.clone(),
            port: self.redis_port,
            password: self.redis_password.clone(),
            db: self.redis_db,
            connect_timeout: Duration::from_millis(self.redis_connect_timeout_ms),
            command_timeout: Duration::from_millis(self.redis_command_timeout_ms),
        }
    }

    fn system_config(&self) -> SystemConfig {
        SystemConfig {
            remote: RemoteTierConfig {
                command_timeout: Duration::from_millis(self.redis_command_timeout_ms),
                ..Default::default()
            },
            enable_warming: self.enable_warming,
            enable_monitoring: self.enable_monitoring,
            enable_invalidation: self.enable_invalidation,
            enable_cleanup: self.enable_cleanup,
            enable_optimizer: self.enable_optimizer,
            cleanup: CleanupConfig {
                dry_run: self.cleanup_dry_run,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting tiercache");
    info!("  Warming: {}", args.enable_warming);
    info!("  Monitoring: {}", args.enable_monitoring);
    info!("  Invalidation: {}", args.enable_invalidation);
    info!("  Cleanup: {} (dry run: {})", args.enable_cleanup, args.cleanup_dry_run);
    info!("  Optimizer: {}", args.enable_optimizer);

    let store: Arc<dyn RemoteStore> = if args.in_memory_remote {
        warn!("Using the in-process remote store; nothing is shared between processes");
        Arc::new(InMemoryRemoteStore::new())
    } else {
        let config = args.redis_config();
        let store = RedisRemoteStore::open(config.clone(), RemoteNamespace::Cache)?;
        if let Err(e) = store.ping().await {
            error!("Redis health check failed: {}", e);
            error!("Continuing anyway - serving from memory until Redis is reachable");
        } else {
            info!(
                "Redis connection healthy: {}",
                config.redacted_url(RemoteNamespace::Cache)
            );
        }
        Arc::new(store)
    };

    let system = Arc::new(CacheSystem::new(args.system_config(), store)?);

    if let Some(path) = &args.strategy_file {
        apply_strategy_file(system.registry().strategies(), path).await?;
    }

    system.start();

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_system = Arc::clone(&system);
    let health_server = tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_system).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_system = Arc::clone(&system);
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_system).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    system.stop().await;
    health_server.abort();
    metrics_server.abort();

    info!("tiercache shutdown complete");
    Ok(())
}

async fn apply_strategy_file(strategies: &StrategyTable, path: &str) -> Result<()> {
    let yaml = tokio::fs::read_to_string(path).await?;
    let overrides = StrategyTable::parse_overrides(&yaml)?;
    let applied = strategies.apply_overrides(&overrides)?;
    info!("Loaded {} strategy overrides from {}", applied, path);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Helpers
// =============================================================================

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("encoding failed: {}", e),
        ),
    }
}

async fn bind(addr: &str, name: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address: {}", name, e)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;
    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

// =============================================================================
// Health Server
// =============================================================================

async fn health_handler(
    req: Request<hyper::body::Incoming>,
    system: Arc<CacheSystem>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" | "/livez" => {
            if system.probes().is_live() {
                respond(StatusCode::OK, "text/plain", "ok")
            } else {
                respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "not live")
            }
        }
        "/readyz" => {
            let health = system.health_check().await;
            let status = if system.probes().is_ready() && health.is_serving() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, &health)
        }
        "/status" => {
            let body = serde_json::json!({
                "health": system.health_check().await,
                "system": system.status(),
            });
            json_response(StatusCode::OK, &body)
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

async fn run_health_server(addr: &str, system: Arc<CacheSystem>) -> Result<()> {
    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let system = Arc::clone(&system);

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, Arc::clone(&system)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
    system: Arc<CacheSystem>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let exporter = system.exporter();
            match exporter.encode() {
                Ok(buffer) => respond(StatusCode::OK, &exporter.content_type(), buffer),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

async fn run_metrics_server(addr: &str, system: Arc<CacheSystem>) -> Result<()> {
    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let system = Arc::clone(&system);

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(req, Arc::clone(&system)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
