//! machined: node daemon serving the control API

use clap::Parser;
use nodeplane_core::{AuthMode, BindMode, Mode};
use nodeplane_gateway::config::{DaemonConfig, LoggingConfig, DEFAULT_CONFIG_PATH};
use nodeplane_gateway::{start_gateway, Node};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "machined", version, about = "Nodeplane node daemon")]
struct Cli {
    /// Daemon config file (TOML)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(short, long)]
    port: Option<u16>,
    /// loopback or lan
    #[arg(short, long)]
    bind: Option<String>,
    #[arg(short, long)]
    token: Option<String>,
    #[arg(long)]
    no_auth: bool,
    /// metal, cloud, container or maintenance
    #[arg(short, long)]
    mode: Option<Mode>,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut DaemonConfig) {
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if let Some(bind) = self.bind {
            config.gateway.bind = match bind.as_str() {
                "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
                _ => BindMode::Lan,
            };
        }
        if let Some(token) = self.token {
            config.gateway.auth.token = Some(token);
        }
        if self.no_auth {
            config.gateway.auth.mode = AuthMode::None;
            config.gateway.auth.token = None;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(path) = self.log_file {
            config.logging.file = Some(path);
        }
    }
}

/// Returns the appender guard; logs to the file stop when it is dropped.
fn init_tracing(logging: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "nodeplane=info,machined=info,tower_http=info".into())
    };
    let stdout = if logging.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let (file_layer, guard) = match logging.file.as_ref().and_then(|p| Some((p.parent()?, p.file_name()?))) {
        Some((dir, name)) => {
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stdout.with_filter(filter()))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = DaemonConfig::load(&cli.config)?;
    cli.apply(&mut config);

    let _log_guard = init_tracing(&config.logging);

    let node = Node::build(&config)?;
    let Node {
        service,
        dispatcher,
        runtime,
        ..
    } = node;
    info!(controllers = ?runtime.controller_names(), "controllers registered");

    let cancel = CancellationToken::new();
    let controllers = tokio::spawn(runtime.run(cancel.clone()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        shutdown.cancel();
    });

    let served = start_gateway(&config.gateway, service, cancel.clone()).await;
    cancel.cancel();

    // accepted sequences run to completion
    dispatcher.wait_idle().await;
    match controllers.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("controller runtime failed: {}", e),
        Err(e) => error!("controller runtime panicked: {}", e),
    }
    served
}
