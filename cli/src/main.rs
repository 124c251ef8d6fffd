// repcol: report collection server
//
// Serves legacy report clients over TCP and exposes their reports over a
// small REST API.

mod api;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use repcol_core::{
    generate_registration_key, transport, validate_registration_key, LifecycleManager, ServerConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "repcol")]
#[command(about = "RepCol: legacy report collection server", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the TCP and HTTP servers
    Start {
        /// TCP listen address for legacy clients
        #[arg(long)]
        tcp: Option<String>,
        /// HTTP listen address for the REST API
        #[arg(long)]
        http: Option<String>,
    },
    /// Print the registration key for a serial number
    Keygen { serial: String },
    /// Check a registration key against a serial number
    VerifyKey { serial: String, key: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Path,
}

/// Install the global subscriber. Keep the returned guard alive so buffered
/// file output is flushed on exit.
fn init_logging(default_level: &str, log_dir: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "repcol.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { tcp, http } => cmd_start(cli.config, tcp, http).await,
        Commands::Keygen { serial } => cmd_keygen(&serial),
        Commands::VerifyKey { serial, key } => cmd_verify_key(&serial, &key),
        Commands::Config { action } => cmd_config(cli.config, action),
    }
}

fn cmd_keygen(serial: &str) -> Result<()> {
    let key = generate_registration_key(serial).context("Failed to generate registration key")?;
    println!("{}", key);
    Ok(())
}

fn cmd_verify_key(serial: &str, key: &str) -> Result<()> {
    if validate_registration_key(serial, key) {
        println!("{} Registration key is valid for {}", "✓".green(), serial.bright_cyan());
        Ok(())
    } else {
        anyhow::bail!("Registration key is not valid for {}", serial)
    }
}

fn cmd_config(path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load(path.as_deref())?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown or unset config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }

            println!();
            println!("{}", "Key overrides:".bold());
            if config.server.key_overrides.is_empty() {
                println!("  {}", "(none configured)".dimmed());
            } else {
                for o in &config.server.key_overrides {
                    let state = if o.enabled { "enabled".green() } else { "disabled".dimmed() };
                    println!("  class {:<2} len {} {}", o.class_id, o.key_length, state);
                }
            }
        }

        ConfigAction::Path => {
            println!("{}", config.path().display());
        }
    }

    Ok(())
}

/// Warn when the license pair is missing or does not match
fn check_license(config: &ServerConfig) {
    match (&config.serial_number, &config.registration_key) {
        (Some(serial), Some(key)) if validate_registration_key(serial, key) => {
            info!("Registered to serial {}", serial);
        }
        (Some(serial), Some(_)) => {
            warn!("Registration key does not match serial {}; running unregistered", serial);
        }
        _ => warn!("No registration configured; running unregistered"),
    }
}

async fn cmd_start(path: Option<PathBuf>, tcp: Option<String>, http: Option<String>) -> Result<()> {
    let config = config::Config::load(path.as_deref())?;
    let mut server = config.server;
    if let Some(tcp) = tcp {
        server.tcp_listen = tcp;
    }
    if let Some(http) = http {
        server.http_listen = http;
    }

    let _log_guard = init_logging("info", server.log_dir.as_deref());

    println!("{}", "RepCol starting...".bold());
    println!();

    check_license(&server);

    let http_addr: SocketAddr = server
        .http_listen
        .parse()
        .with_context(|| format!("Invalid HTTP listen address {}", server.http_listen))?;

    let manager = Arc::new(LifecycleManager::new(server.manager_config(), server.overrides()));

    let listener = transport::bind(&server.tcp_listen)
        .await
        .context("Cannot start TCP server")?;
    println!("{} Legacy clients: {}", "✓".green(), server.tcp_listen.bright_cyan());

    if !server.key_overrides.is_empty() {
        info!("{} key overrides loaded", server.key_overrides.len());
    }

    tokio::spawn(manager.clone().run_sweeper());
    tokio::spawn(transport::serve(listener, manager.clone()));

    let api_ctx = api::ApiContext::new(manager.clone(), &server);
    let api_task = tokio::spawn(api::start_api_server(http_addr, api_ctx));
    println!("{} REST API:       {}", "✓".green(), http_addr.to_string().bright_cyan());
    println!();
    println!("Press {} to stop", "Ctrl-C".bright_green());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
        }
        result = api_task => {
            result.context("API task panicked")??;
        }
    }

    let mut sessions = manager.registry().active_sessions();
    sessions.extend(manager.registry().pending_sessions());
    for session in &sessions {
        manager.close_session(session).await;
    }
    println!("{} Stopped", "✓".green());

    Ok(())
}
