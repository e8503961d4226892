use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use hsu_service_registry::{
    handler_fn, MeshConfig, RedisStore, ServiceMesh, ServiceRoute, StoreConfig,
};

/// HSU Mesh Node - service discovery and RPC over redis
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Mesh configuration file path (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Redis address (host:port); overrides REDIS_HOST
    #[arg(long)]
    redis_host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register an echo service and serve until interrupted
    Serve {
        /// Service name
        #[arg(short, long, default_value = "echo")]
        name: String,

        /// Advertised port
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Route prefixes to claim
        #[arg(short, long = "route", default_value = "/echo")]
        routes: Vec<String>,

        /// Run duration in seconds (for testing)
        #[arg(long)]
        run_duration: Option<u64>,
    },

    /// Resolve a path to one live service instance
    Resolve {
        path: String,
    },

    /// List every live service instance
    List,

    /// Resolve a path and send it a request
    Call {
        path: String,

        /// JSON payload
        #[arg(default_value = "null")]
        payload: String,

        /// Caller identity put in the `from` field
        #[arg(long, default_value = "hsu-mesh-node")]
        from: String,

        /// Reply timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Delete every key in the store
    Flush,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    initialize_logging(args.debug);

    let config = match &args.config {
        Some(path) => {
            info!("Config file: {}", path);
            MeshConfig::load_from_file(path)?
        }
        None => MeshConfig::default(),
    };

    let store_config = store_config(args.redis_host);
    info!("Connecting to store at {}", store_config.host);

    let store = RedisStore::connect(&store_config)
        .await
        .context("Failed to connect to the store")?;
    let mesh = ServiceMesh::connect(Arc::new(store), config)?;

    match args.command {
        Command::Serve {
            name,
            port,
            routes,
            run_duration,
        } => serve(&mesh, name, port, routes, run_duration).await?,
        Command::Resolve { path } => {
            let service = mesh.resolve_service(&path).await?;
            println!("{}", serde_json::to_string_pretty(&service)?);
        }
        Command::List => {
            let services = mesh.list_services().await;
            if services.is_empty() {
                println!("No live services");
            }
            for service in services {
                println!(
                    "{:<18} {:<20} {}:{} {:?}",
                    service.id.as_str(),
                    service.name.as_str(),
                    service.ip_address,
                    service.port,
                    service.route_prefixes()
                );
            }
        }
        Command::Call {
            path,
            payload,
            from,
            timeout_ms,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload must be valid JSON")?;
            let service = mesh.resolve_service(&path).await?;
            info!("Calling {} ({})", service.key(), service.ip_address);

            let pending = mesh
                .rpc_with_timeout(&from, &service, &path, payload, Duration::from_millis(timeout_ms))
                .await?;
            match pending.recv().await {
                Some(reply) => println!("{}", serde_json::to_string_pretty(&reply.payload)?),
                None => anyhow::bail!("No reply from {} within {}ms", service.key(), timeout_ms),
            }
        }
        Command::Flush => {
            mesh.flush().await?;
            println!("Store flushed");
        }
    }

    Ok(())
}

async fn serve(
    mesh: &ServiceMesh,
    name: String,
    port: u16,
    routes: Vec<String>,
    run_duration: Option<u64>,
) -> Result<()> {
    let echo = handler_fn(|mesh, msg| async move {
        info!(from = %msg.from, route = %msg.route, "Echoing request");
        if !msg.expects_reply() {
            return Ok(());
        }
        let payload = msg.payload.clone();
        mesh.respond(&msg, payload).await
    });

    let routes = routes.into_iter().map(ServiceRoute::new).collect();
    let service = mesh.register_service(name, port, routes, Some(echo)).await?;
    info!("Serving {} on routes {:?}", service.key(), service.route_prefixes());

    // Wait for shutdown signal or run duration
    if let Some(duration) = run_duration {
        info!("Running for {} seconds (test mode)", duration);
        tokio::time::sleep(Duration::from_secs(duration)).await;
    } else if let Err(e) = shutdown_signal().await {
        warn!("Signal handling unavailable, shutting down: {}", e);
    }

    info!("Shutting down...");
    mesh.shutdown().await;
    Ok(())
}

/// Store settings from the environment, with `--redis-host` taking
/// precedence over `REDIS_HOST`.
fn store_config(redis_host: Option<String>) -> StoreConfig {
    let mut config = StoreConfig::from_env();
    if let Some(host) = redis_host {
        config.host = host;
    }
    config
}

fn initialize_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();
}

async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM signal");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT signal");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C signal");
    }

    Ok(())
}
