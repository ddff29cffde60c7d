#![forbid(unsafe_code)]

use clap::Parser;
use rsrv_core::{load_from_path, load_legacy_str, Config};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "rsrv: embedded statistics engine server")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to a legacy line-oriented configuration file
    /// (`key <sep> value`), used when `--config` is absent.
    #[arg(long, value_name = "FILE", conflicts_with = "config")]
    legacy_config: Option<PathBuf>,

    /// TCP port to listen on.
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Accept connections from non-loopback clients.
    #[arg(long)]
    remote: bool,

    /// Listen on a Unix domain socket instead of TCP.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Per-connection scratch directory root; disables the sandbox if unset.
    #[arg(long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Disable authentication even if the config file requests it.
    #[arg(long)]
    no_auth: bool,

    /// Print the resolved configuration and exit without starting the listener.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    apply_overrides(&mut config, &cli);

    if cli.print_config {
        println!("{config:#?}");
        return;
    }

    info!(port = config.port, remote = config.remote, auth = config.auth, "configuration loaded");

    if let Err(err) = rsrv_core::listener::run(config, rsrv_core::engine::ArithEngine::new).await {
        error!(%err, "listener exited with error");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> rsrv_core::Result<Config> {
    if let Some(path) = &cli.config {
        load_from_path(path)
    } else if let Some(path) = &cli.legacy_config {
        let text = std::fs::read_to_string(path).map_err(|e| {
            rsrv_core::RsrvError::Config(format!("failed to read legacy config file: {e}"))
        })?;
        load_legacy_str(&text)
    } else {
        Ok(Config::default())
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.remote {
        config.remote = true;
        config.allow = vec![IpAddr::from([0, 0, 0, 0])];
    }
    if let Some(socket) = &cli.socket {
        config.socket = Some(socket.clone());
    }
    if let Some(workdir) = &cli.workdir {
        config.workdir = Some(workdir.clone());
    }
    if cli.no_auth {
        config.auth = false;
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
