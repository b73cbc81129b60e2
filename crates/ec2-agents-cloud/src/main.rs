//! ec2-agents: provisions EC2 build agents for a CI controller
//!
//! `run` keeps every configured cloud reconciled until interrupted. The other
//! subcommands are one-shot helpers around the same engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ec2_agents_cloud::aws::Ec2Client;
use ec2_agents_cloud::ssh::{KnownHosts, SshLauncher};
use ec2_agents_cloud::{
    Cloud, CloudEnv, CloudSet, DemandLedger, FleetConfig, LoggingController, ec2_step,
};
use ec2_agents_common::PrivateKey;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ec2-agents")]
#[command(about = "EC2 build agent provisioning")]
#[command(version)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile every configured cloud until interrupted
    Run {
        /// Fleet configuration file
        #[arg(long, env = "EC2_AGENTS_CONFIG")]
        config: PathBuf,
    },

    /// Provision one instance from a template and print it once running
    Provision {
        /// Fleet configuration file
        #[arg(long, env = "EC2_AGENTS_CONFIG")]
        config: PathBuf,

        /// Cloud display name
        #[arg(long)]
        cloud: String,

        /// Template id within the cloud
        #[arg(long)]
        template: String,
    },

    /// Print the EC2 fingerprints of a PEM private key
    Fingerprint {
        /// PEM private key file
        #[arg(long)]
        key: PathBuf,
    },

    /// Decrypt Windows password data with a PEM private key
    DecryptPassword {
        /// PEM private key file
        #[arg(long)]
        key: PathBuf,

        /// Base64 password data as returned by GetPasswordData
        #[arg(long)]
        data: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&e);
        std::process::exit(1);
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    match args.command {
        Command::Run { config } => handle_run(&config).await,
        Command::Provision {
            config,
            cloud,
            template,
        } => handle_provision(&config, &cloud, &template).await,
        Command::Fingerprint { key } => {
            let key = read_key(&key)?;
            println!("fingerprint:        {}", key.fingerprint()?);
            println!("public fingerprint: {}", key.public_fingerprint()?);
            Ok(())
        }
        Command::DecryptPassword { key, data } => {
            let key = read_key(&key)?;
            println!("{}", key.decrypt_windows_password(data.trim())?);
            Ok(())
        }
    }
}

fn read_key(path: &Path) -> Result<PrivateKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read private key {}", path.display()))?;
    Ok(PrivateKey::new(pem))
}

/// Load the configuration and connect every cloud it names.
async fn connect_all(path: &Path) -> Result<CloudSet<Ec2Client, SshLauncher>> {
    let fleet = FleetConfig::load(path)
        .with_context(|| format!("failed to load configuration {}", path.display()))?;
    let env = CloudEnv {
        controller_url: fleet.controller_url.clone(),
        timings: Arc::new(fleet.timings.clone()),
        controller: Arc::new(LoggingController::new()),
        demand: DemandLedger::new(),
        known_hosts: KnownHosts::new(),
        agent_payload: fleet.agent_payload.clone(),
    };

    let mut clouds = Vec::with_capacity(fleet.clouds.len());
    for config in fleet.clouds {
        let name = config.name.clone();
        let cloud = Cloud::connect(config, env.clone())
            .await
            .with_context(|| format!("failed to set up cloud '{name}'"))?;
        clouds.push(cloud);
    }
    Ok(CloudSet::new(clouds)?)
}

async fn handle_run(path: &Path) -> Result<()> {
    let clouds = connect_all(path).await?;
    if clouds.is_empty() {
        anyhow::bail!("no clouds configured in {}", path.display());
    }

    info!(clouds = clouds.len(), "Starting reconcilers");
    let handles = clouds.start_all();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    info!("Interrupted, releasing instances");

    clouds.shutdown_all().await;
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// The instance outlives this process; a later `run` adopts it through its
/// ownership tags.
async fn handle_provision(path: &Path, cloud: &str, template: &str) -> Result<()> {
    let clouds = connect_all(path).await?;
    let instance = ec2_step(&clouds, cloud, template).await?;
    println!("{}", serde_json::to_string_pretty(&instance)?);
    Ok(())
}
