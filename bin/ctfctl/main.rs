//! ctfctl
//!
//! Operates the challenge instance manager: runs the background sweeper and
//! exposes the controller operations on the command line. Results are
//! printed as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctf_instances::{
    registry, spawn_sweeper, Challenge, DockerSubstrate, InstanceError, LifecycleController,
    ManagerConfig, Registry,
};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ctfctl")]
#[command(about = "CTF challenge instance manager")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CTF_CONFIG")]
    config: Option<PathBuf>,

    /// Registry connection string (postgres:// URL or SQLite path)
    #[arg(long, default_value = "ctf-instances.db", env = "DATABASE_URL")]
    database_url: String,

    /// Namespace instance resources are created in
    #[arg(long, env = "CTF_NAMESPACE")]
    namespace: Option<String>,

    /// Externally reachable host used in access URLs
    #[arg(long, env = "CLUSTER_IP")]
    public_host: Option<String>,

    /// Docker socket path
    #[arg(long, env = "DOCKER_SOCKET")]
    docker_socket: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the reconciliation sweeper until interrupted
    Serve,

    /// Start an instance of a challenge for a user
    Create {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        challenge: i64,
    },

    /// Stop an instance
    Delete {
        id: String,
        #[arg(long)]
        user: i64,
        /// Bypass the ownership check
        #[arg(long)]
        admin: bool,
    },

    /// List a user's instances, newest first
    List {
        #[arg(long)]
        user: i64,
    },

    /// Show one instance
    Get {
        id: String,
        #[arg(long)]
        user: i64,
        #[arg(long)]
        admin: bool,
    },

    /// Run one reconciliation pass
    Sweep,

    /// Register or update a challenge definition
    AddChallenge {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        image: String,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = "0.5")]
        cpu: String,
        #[arg(long, default_value = "512Mi")]
        memory: String,
        /// Instance lifetime in seconds
        #[arg(long)]
        time_limit: Option<u64>,
        #[arg(long)]
        inactive: bool,
    },
}

fn load_config(args: &Args) -> Result<ManagerConfig> {
    let mut config = match &args.config {
        Some(path) => ManagerConfig::from_file(path)?,
        None => ManagerConfig::default(),
    };
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(host) = &args.public_host {
        config.public_host = host.clone();
    }
    if let Some(socket) = &args.docker_socket {
        config.docker.socket_path = Some(socket.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the outcome; controller errors become a JSON error object and a
/// non-zero exit
fn emit<T: Serialize>(result: std::result::Result<T, InstanceError>) -> Result<()> {
    match result {
        Ok(value) => print_json(&value),
        Err(e) => {
            let mut body = json!({
                "error": e.kind().as_str(),
                "message": e.to_string(),
            });
            if let Some(existing) = e.existing_instance() {
                body["existing"] = serde_json::to_value(existing)?;
            }
            print_json(&body)?;
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ctf_instances=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let registry = registry::open(&args.database_url)
        .await
        .with_context(|| format!("Failed to open registry {}", args.database_url))?;

    if let Command::AddChallenge {
        id,
        name,
        image,
        port,
        cpu,
        memory,
        time_limit,
        inactive,
    } = &args.command
    {
        let mut challenge = Challenge::new(*id, name, image, *port).with_limits(cpu, memory);
        if let Some(secs) = time_limit {
            challenge = challenge.with_time_limit(*secs);
        }
        if *inactive {
            challenge = challenge.inactive();
        }
        registry.put_challenge(&challenge).await?;
        return print_json(&challenge);
    }

    let substrate = DockerSubstrate::connect(config.docker.clone())
        .await
        .context("Failed to connect to Docker")?;
    let sweep_interval = config.sweep_interval();
    let controller = LifecycleController::assemble(registry, Arc::new(substrate), config);

    match args.command {
        Command::Serve => {
            info!("Starting instance manager");
            info!("  Namespace: {}", controller.config().namespace);
            info!("  Public host: {}", controller.config().public_host);
            info!(
                "  Ports: {}-{}",
                controller.config().ports.low,
                controller.config().ports.high
            );

            let sweeper = spawn_sweeper(controller.reconciler().clone(), sweep_interval);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
            sweeper.shutdown().await;
            Ok(())
        }
        Command::Create { user, challenge } => {
            emit(controller.create_instance(user, challenge).await)
        }
        Command::Delete { id, user, admin } => {
            emit(controller.delete_instance(&id, user, admin).await)
        }
        Command::List { user } => emit(controller.list_user_instances(user).await),
        Command::Get { id, user, admin } => emit(controller.get_instance(&id, user, admin).await),
        Command::Sweep => {
            let report = controller
                .reconciler()
                .run_once(chrono::Utc::now())
                .await;
            print_json(&report)
        }
        Command::AddChallenge { .. } => Ok(()),
    }
}
