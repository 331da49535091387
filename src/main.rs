//! Replicated Disk Operator
//!
//! Runs the attachment scheduling and replica management controller, either
//! against a Kubernetes cluster or standalone with an in-memory store.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use replicated_disk_operator::{
    Controller, ControllerConfig, ControllerContext, ControllerMetrics, Error, EventSource, KubeStore,
    MemoryStore, Result, SharedState, SimulatedConfig, SimulatedProvisioner,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Replicated Disk Operator - attachment scheduling and replica management
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Controller configuration file (YAML)
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Reconcile workers (overrides the config file)
    #[arg(long, env = "WORKER_COUNT")]
    workers: Option<usize>,

    /// Attempts before an operation is marked failed (overrides the config file)
    #[arg(long, env = "MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Node label carrying the zone (overrides the config file)
    #[arg(long, env = "TOPOLOGY_KEY")]
    topology_key: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

impl Args {
    fn controller_config(&self) -> Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_yaml_file(path)?,
            None => ControllerConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(key) = &self.topology_key {
            config.topology_key = key.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.controller_config()?;
    info!("Starting Replicated Disk Operator");
    info!("  Version: {}", replicated_disk_operator::VERSION);
    info!("  Workers: {}", config.worker_count);
    info!("  Topology key: {}", config.topology_key);
    info!("  Standalone mode: {}", args.standalone);

    let cancel = CancellationToken::new();
    let provisioner = Arc::new(SimulatedProvisioner::new(SimulatedConfig {
        topology_key: config.topology_key.clone(),
        ..Default::default()
    }));
    let metrics = ControllerMetrics::new()?;

    let (ctx, events, watchers) = if args.standalone {
        let store = Arc::new(MemoryStore::new());
        let events = store.subscribe();
        let ctx = ControllerContext {
            config,
            state: Arc::new(SharedState::new()),
            store: store.clone(),
            cluster: store,
            volume_provisioner: provisioner.clone(),
            attachment_provisioner: provisioner,
            metrics,
        };
        (ctx, events, Vec::new())
    } else {
        let client = kube::Client::try_default().await?;
        let store = Arc::new(KubeStore::new(client));
        let events = store.subscribe();
        let watchers = store.start_watchers(cancel.clone());
        let ctx = ControllerContext {
            config,
            state: Arc::new(SharedState::new()),
            store: store.clone(),
            cluster: store,
            volume_provisioner: provisioner.clone(),
            attachment_provisioner: provisioner,
            metrics,
        };
        (ctx, events, watchers)
    };
    let controller = Controller::new(Arc::new(ctx));
    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_ctx = controller.context().clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_ctx).await {
            error!("Metrics server error: {}", e);
        }
    });

    let report = controller.recover().await?;
    info!(
        volumes = report.volumes,
        attachments = report.attachments,
        requeued = report.requeue.len(),
        "Recovery complete"
    );
    ready.store(true, Ordering::SeqCst);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    controller.run(events, cancel).await?;
    for watcher in watchers {
        let _ = watcher.await;
    }

    info!("Operator shutdown complete");
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
    for directive in ["hyper=warn", "kube=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
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
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "recovering"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, ctx: replicated_disk_operator::controller::ContextRef) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ctx = ctx.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match ctx.metrics.encode() {
                            Ok(buffer) => {
                                let mut response = text_response(StatusCode::OK, buffer);
                                if let Ok(value) = "text/plain; version=0.0.4".parse() {
                                    response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
