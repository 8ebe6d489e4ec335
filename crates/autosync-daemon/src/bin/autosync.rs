//! Autosync daemon
//!
//! # Usage
//!
//! ```bash
//! # Behind a home router (UPnP)
//! autosync
//!
//! # Behind a reverse proxy terminating TLS on 443
//! autosync --port 8080 --callback-host app.example.com --skip-ip-validation
//!
//! # Print a sample configuration
//! autosync --sample-config > ~/.config/autosync/config.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use autosync_core::config::ConfigOverrides;
use autosync_core::Config;
use autosync_daemon::{
    CallbackRegistrar, CommandCallbacks, CommandSyncFactory, NetworkEnvironmentResolver,
    PortMapper, SmtpAlerter, SyncScheduler, SystemProbe,
};

#[derive(Parser, Debug)]
#[command(name = "autosync")]
#[command(about = "Keep a budget in sync with the bank, on a timer and on bank callbacks")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, env = "AUTOSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// TCP port for the callback listener (random when unset)
    #[arg(long, env = "AUTOSYNC_PORT")]
    port: Option<u16>,

    /// Port to register in the callback URL
    #[arg(long, env = "AUTOSYNC_EXTERNAL_PORT")]
    external_port: Option<u16>,

    /// Minutes between syncs without a callback (default 60)
    #[arg(long)]
    wait: Option<u64>,

    /// Minutes between syncs with a callback (default 240)
    #[arg(long)]
    interval: Option<u64>,

    /// Minutes between callback re-registrations (default 480)
    #[arg(long)]
    refresh: Option<u64>,

    /// Host name for the callback URL; the URL then always uses port 443
    #[arg(long, env = "AUTOSYNC_CALLBACK_HOST")]
    callback_host: Option<String>,

    /// Secret path segment of the callback URL
    #[arg(long)]
    callback_marker: Option<String>,

    /// Accept callbacks from any source (only behind a trusted proxy)
    #[arg(long)]
    skip_ip_validation: bool,

    /// Consecutive failures before an alert mail is sent (default 5)
    #[arg(long)]
    mail_after_errors: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print a sample configuration file and exit
    #[arg(long)]
    sample_config: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            port: self.port,
            external_port: self.external_port,
            wait: self.wait,
            interval: self.interval,
            refresh: self.refresh,
            callback_host: self.callback_host.clone(),
            callback_marker: self.callback_marker.clone(),
            skip_ip_validation: self.skip_ip_validation,
            mail_after_errors: self.mail_after_errors,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.sample_config {
        print!("{}", Config::sample());
        return Ok(());
    }

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply(args.overrides());
    config.validate()?;
    let config = Arc::new(config);

    info!("Starting autosync");
    info!("  Callback marker: {}", config.callback_marker);
    if let Some(host) = &config.callback_host {
        info!("  Callback host: {}", host);
    }

    let registrar = CallbackRegistrar::new(
        Arc::clone(&config),
        NetworkEnvironmentResolver::new(Box::new(SystemProbe::new())),
        PortMapper::igd(),
        Box::new(CommandCallbacks::new(&config.commands)),
    );
    let scheduler = SyncScheduler::new(
        Arc::clone(&config),
        Box::new(CommandSyncFactory::new(config.commands.clone())),
        registrar,
        Box::new(SmtpAlerter::new(config.smtp.clone())),
    )?;

    if let Err(e) = scheduler.run(shutdown_signal()).await {
        error!("Autosync stopped: {}", autosync_daemon::error_chain(&e));
        return Err(e.into());
    }
    info!("Autosync stopped");
    Ok(())
}

/// Completes on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
