//! nodectl: command line for the node control API
//!
//! Usage:
//!   nodectl -n 10.5.0.2 upgrade -i ghcr.io/nodeplane/installer:v1.1.0
//!   nodectl -n 10.5.0.2 upgrade -i ... --wait --timeout 15m
//!   nodectl -n 10.5.0.2 reset --wipe-mode user-disks --user-disks-to-wipe /dev/sdb --reboot
//!   nodectl -n 10.5.0.2 get network HostnameStatus

use anyhow::Context;
use clap::{Parser, Subcommand};
use nodeplane::action::{self, BootIdChanged, Tracker};
use nodeplane::client::NodeClient;
use nodeplane_core::{ActorId, ResetMode, ResetRequest, Resource, ResourceKind, UpgradeRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_INSTALLER_IMAGE: &str = concat!("ghcr.io/nodeplane/installer:v", env!("CARGO_PKG_VERSION"));

#[derive(Parser)]
#[command(name = "nodectl", version, about = "Control a nodeplane node")]
struct Cli {
    /// Node endpoint: host, host:port or ws:// URL
    #[arg(short, long, global = true, default_value = "127.0.0.1:50000")]
    node: String,

    /// Control API token
    #[arg(short, long, global = true, env = "NODEPLANE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upgrade the node to a new installer image
    Upgrade {
        /// Installer image, defaults to the one matching this client
        #[arg(short, long, default_value = DEFAULT_INSTALLER_IMAGE)]
        image: String,
        /// Keep the ephemeral partition
        #[arg(short, long)]
        preserve: bool,
        /// Stage the upgrade and apply it on the next reboot
        #[arg(short, long)]
        stage: bool,
        /// Skip the cluster health check
        #[arg(short, long)]
        force: bool,
        /// Talk to the maintenance service without credentials
        #[arg(long)]
        insecure: bool,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Wipe the node and reboot or power it off
    Reset {
        /// Leave the cluster first
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        graceful: bool,
        /// Reboot afterwards instead of shutting down
        #[arg(long)]
        reboot: bool,
        #[arg(long, value_delimiter = ',')]
        system_labels_to_wipe: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        user_disks_to_wipe: Vec<String>,
        /// all, system-disk or user-disks
        #[arg(long, default_value = "all")]
        wipe_mode: ResetMode,
        #[arg(long)]
        insecure: bool,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Show resources of one kind, or a single one by id
    Get {
        namespace: String,
        #[arg(value_name = "TYPE")]
        resource_type: String,
        id: Option<String>,
        /// Print raw JSON
        #[arg(short, long)]
        json: bool,
    },
    /// Show the node's version and platform mode
    Version,
}

#[derive(clap::Args)]
struct WaitArgs {
    /// Wait for the action to complete
    #[arg(long)]
    wait: bool,
    /// Print every event while waiting (implies --wait)
    #[arg(long)]
    debug: bool,
    /// How long to wait, e.g. 90s, 1m30s, 1h
    #[arg(long, default_value = "30m", value_parser = humantime::parse_duration)]
    timeout: Duration,
}

fn init_tracing(debug: bool) {
    let default = if debug { "nodeplane=debug" } else { "nodeplane=warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_ack(node: &str, ack: &str) {
    let started = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z");
    println!("{:<20} {:<40} {}", "NODE", "ACK", "STARTED");
    println!("{:<20} {:<40} {}", node, ack, started);
}

fn print_resources(resources: &[Resource]) {
    println!("{:<12} {:<24} {:<20} {:<8} {}", "NAMESPACE", "TYPE", "ID", "VERSION", "OWNER");
    for resource in resources {
        let reference = resource.reference();
        println!(
            "{:<12} {:<24} {:<20} {:<8} {}",
            reference.namespace,
            reference.resource_type,
            reference.id,
            resource.version(),
            resource.owner().unwrap_or("")
        );
    }
}

/// Run `start` under a tracker that waits for the node to come back rebooted.
async fn track(
    client: &NodeClient,
    args: &WaitArgs,
    reboots: bool,
    start: impl std::future::Future<Output = nodeplane_core::Result<ActorId>>,
) -> anyhow::Result<()> {
    let node: Arc<dyn action::Node> = Arc::new(client.clone());
    let mut tracker = if reboots {
        Tracker::new(node, action::machine_ready()).with_post_check(BootIdChanged)
    } else {
        Tracker::new(node, action::sequence_completed())
    };
    tracker = tracker.with_timeout(args.timeout).with_debug(args.debug);

    let actor = tracker.run(|| start).await?;
    println!("{}: action {} completed", client.name(), actor);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Upgrade {
            image,
            preserve,
            stage,
            force,
            insecure,
            wait,
        } => {
            let waiting = action::wait_requested(wait.wait, wait.debug, insecure)?;
            init_tracing(wait.debug);
            let token = if insecure { None } else { cli.token };
            let client = NodeClient::new(&cli.node).with_token(token);
            let request = UpgradeRequest {
                image,
                preserve,
                stage,
                force,
            };

            if waiting {
                let start = async { client.upgrade(&request).await.map(|ack| ack.actor_id) };
                track(&client, &wait, true, start).await?;
            } else {
                let ack = client.upgrade(&request).await.context("upgrade failed")?;
                let node = ack.hostname.as_deref().unwrap_or(client.name());
                print_ack(node, &ack.ack);
            }
        }

        Commands::Reset {
            graceful,
            reboot,
            system_labels_to_wipe,
            user_disks_to_wipe,
            wipe_mode,
            insecure,
            wait,
        } => {
            let waiting = action::wait_requested(wait.wait, wait.debug, insecure)?;
            init_tracing(wait.debug);
            let token = if insecure { None } else { cli.token };
            let client = NodeClient::new(&cli.node).with_token(token);
            let request = ResetRequest {
                graceful,
                reboot,
                mode: wipe_mode,
                user_disks_to_wipe,
                system_partitions_to_wipe: system_labels_to_wipe,
            };

            if waiting {
                let start = async { client.reset(&request).await.map(|ack| ack.actor_id) };
                track(&client, &wait, reboot, start).await?;
            } else {
                let ack = client.reset(&request).await.context("reset failed")?;
                print_ack(client.name(), &format!("reset started as {}", ack.actor_id));
            }
        }

        Commands::Get {
            namespace,
            resource_type,
            id,
            json,
        } => {
            init_tracing(false);
            let client = NodeClient::new(&cli.node).with_token(cli.token);
            let kind = ResourceKind::new(namespace, resource_type);
            let resources = client.get(&kind, id.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&resources)?);
            } else {
                print_resources(&resources);
            }
        }

        Commands::Version => {
            init_tracing(false);
            let client = NodeClient::new(&cli.node).with_token(cli.token);
            let version = client.version().await?;
            println!("Client: nodectl v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Node:   v{} ({} mode)",
                version["version"].as_str().unwrap_or("unknown"),
                version["platform"]["mode"].as_str().unwrap_or("unknown")
            );
        }
    }

    Ok(())
}
