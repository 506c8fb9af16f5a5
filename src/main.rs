//! Local Storage Operator
//!
//! One binary, three roles:
//!
//! - `operator`: control-plane reconcilers for a namespace
//! - `diskmaker`: node agent (provisioner, deleter, discovery)
//! - `crdgen`: print the CRD manifests

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use kube::Client;
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_storage_operator::controlplane::manager::{self, OperatorOptions, DEFAULT_DISKMAKER_IMAGE, DEFAULT_RBAC_PROXY_IMAGE};
use local_storage_operator::diskmaker::agent::{
    check_block_listing, run_deleter, run_discovery, run_provisioner, AgentContext, AgentOptions, DiscoveryOptions,
    Flavor,
};
use local_storage_operator::diskmaker::kube_api::load_node_identity;
use local_storage_operator::diskmaker::ProvisionerSettings;
use local_storage_operator::hardware::lock::DEFAULT_LOCK_DIR;
use local_storage_operator::{DiskmakerMetrics, Error, LsblkLister, Result};

/// Timeout applied to every API server call
const API_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local Storage Operator - local persistent volumes from node block devices
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Namespace the operator and its node agents work in
    #[arg(long, env = "WATCH_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081", global = true)]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8383", global = true)]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    /// Root of the per-storage-class symlink directories
    #[arg(long, env = "LOCAL_DISK_LOCATION", default_value = "/mnt/local-storage", global = true)]
    symlink_root: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control-plane reconcilers
    Operator {
        /// Image of the node agents
        #[arg(long, env = "DISKMAKER_IMAGE", default_value = DEFAULT_DISKMAKER_IMAGE)]
        diskmaker_image: String,

        /// Image of the metrics proxy sidecar
        #[arg(long, env = "KUBE_RBAC_PROXY_IMAGE", default_value = DEFAULT_RBAC_PROXY_IMAGE)]
        rbac_proxy_image: String,
    },
    /// Run a node agent
    Diskmaker {
        #[command(subcommand)]
        mode: DiskmakerMode,

        /// Node this agent runs on
        #[arg(long, env = "MY_NODE_NAME")]
        node_name: String,

        /// Directory of the PV-creation lock files
        #[arg(long, env = "LOCK_DIR", default_value = DEFAULT_LOCK_DIR)]
        lock_dir: PathBuf,

        /// Requeue interval of a settled provisioner pass, in seconds
        #[arg(long, default_value = "60")]
        check_duration_secs: u64,

        /// Minimum device age before a LocalVolumeSet uses it, in seconds
        #[arg(long, default_value = "60")]
        device_min_age_secs: u64,

        /// Deleter tick, in seconds
        #[arg(long, default_value = "30")]
        deleter_tick_secs: u64,

        /// Discovery probe interval, in seconds
        #[arg(long, default_value = "300")]
        discovery_interval_secs: u64,

        /// Window that coalesces udev events, in seconds
        #[arg(long, default_value = "5")]
        uevent_window_secs: u64,
    },
    /// Print the CRD manifests as YAML
    Crdgen,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum DiskmakerMode {
    /// Provision LocalVolumes
    Lv,
    /// Provision LocalVolumeSets
    Lvset,
    /// Provision both kinds (the aggregated workload)
    Manager,
    /// Publish the device inventory
    Discover,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if matches!(args.command, Command::Crdgen) {
        print!("{}", local_storage_operator::crd::render_crds()?);
        return Ok(());
    }

    init_logging(&args);
    info!("Starting {} {}", local_storage_operator::NAME, local_storage_operator::VERSION);

    let namespace = args
        .namespace
        .clone()
        .ok_or_else(|| Error::Configuration("WATCH_NAMESPACE is not set".into()))?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        signal_token.cancel();
    });

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    let client = kube_client().await?;

    match args.command {
        Command::Operator {
            diskmaker_image,
            rbac_proxy_image,
        } => {
            spawn_metrics_server(args.metrics_addr.clone(), prometheus::default_registry().clone());
            let options = OperatorOptions {
                diskmaker_image,
                rbac_proxy_image,
                symlink_root: args.symlink_root.clone(),
            };
            manager::run(client, namespace, options, shutdown).await;
        }
        Command::Diskmaker {
            mode,
            node_name,
            lock_dir,
            check_duration_secs,
            device_min_age_secs,
            deleter_tick_secs,
            discovery_interval_secs,
            uevent_window_secs,
        } => {
            let metrics = Arc::new(DiskmakerMetrics::new()?);
            spawn_metrics_server(args.metrics_addr.clone(), metrics.registry().clone());

            if mode == DiskmakerMode::Discover {
                let options = DiscoveryOptions {
                    namespace,
                    node_name,
                    interval: Duration::from_secs(discovery_interval_secs),
                    uevent_window: Duration::from_secs(uevent_window_secs),
                };
                run_discovery(client, options, metrics, shutdown)
                    .await
                    .context("discovery agent failed")?;
                return Ok(());
            }

            check_block_listing(&LsblkLister::default())
                .await
                .context("cannot list block devices")?;
            let node = load_node_identity(client.clone(), &node_name).await?;
            let options = AgentOptions {
                namespace,
                node_name,
                symlink_root: args.symlink_root.clone(),
                lock_dir,
                settings: ProvisionerSettings {
                    check_duration: Duration::from_secs(check_duration_secs),
                    device_min_age: Duration::from_secs(device_min_age_secs),
                },
                deleter_tick: Duration::from_secs(deleter_tick_secs),
            };
            let ctx = Arc::new(AgentContext::new(client, &options, node, metrics));

            let provisioners = {
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                async move {
                    match mode {
                        DiskmakerMode::Lv => run_provisioner(ctx, Flavor::LocalVolume).await,
                        DiskmakerMode::Lvset => run_provisioner(ctx, Flavor::LocalVolumeSet).await,
                        _ => {
                            tokio::join!(
                                run_provisioner(ctx.clone(), Flavor::LocalVolume),
                                run_provisioner(ctx, Flavor::LocalVolumeSet)
                            );
                        }
                    }
                    shutdown.cancel();
                }
            };
            tokio::join!(provisioners, run_deleter(ctx, options.deleter_tick, shutdown));
        }
        Command::Crdgen => {}
    }

    info!("Shutdown complete");
    Ok(())
}

async fn kube_client() -> Result<Client> {
    let mut config = kube::Config::infer()
        .await
        .map_err(|e| Error::Configuration(format!("Cannot load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(API_TIMEOUT);
    config.read_timeout = Some(API_TIMEOUT);
    config.write_timeout = Some(API_TIMEOUT);
    Ok(Client::try_from(config)?)
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
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
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
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
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

fn spawn_metrics_server(addr: String, registry: Registry) {
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&addr, registry).await {
            error!("Metrics server error: {}", e);
        }
    });
}

async fn run_metrics_server(addr: &str, registry: Registry) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&registry.gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = respond(StatusCode::OK, buffer);
                                    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                        response.headers_mut().insert(CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
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
