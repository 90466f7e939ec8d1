//! ELM327 Console - Main Entry Point
//!
//! Sends each line read from stdin to the adapter and prints the reply.

use anyhow::Context;
use clap::Parser;
use elm_session::{SerialPortHost, Session, SessionConfig, SessionError};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial number of the adapter (overrides the configuration)
    #[arg(short, long)]
    serial: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

/// Initialize logging
fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let mut config =
        SessionConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(serial) = args.serial {
        config.target_serial = serial;
    }

    info!("=== ELM327 console v{} ===", env!("CARGO_PKG_VERSION"));
    let target = config.target_serial.clone();
    let mut session = Session::with_config(Arc::new(SerialPortHost::new()), config);
    session.set_permission_listener(|candidate| {
        info!("Permission granted for {}, type :reconnect to retry", candidate);
    });

    match session.connect(&target) {
        Ok(()) => info!("Connected to adapter '{}'", session.target_serial()),
        Err(e) => warn!("{}", e),
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read stdin")?;
        let command = line.trim();
        match command {
            "" => continue,
            ":quit" => break,
            ":reconnect" => {
                match session.reconnect() {
                    Ok(()) => info!("Reconnected to adapter '{}'", session.target_serial()),
                    Err(e) => warn!("{}", e),
                }
                continue;
            }
            ":perm" => {
                if session.has_permission() {
                    info!("Permission granted");
                } else {
                    session.request_permission();
                }
                continue;
            }
            _ => {}
        }

        match session.send_command(command) {
            Ok(reply) => writeln!(stdout, "{}", reply)?,
            Err(SessionError::ConnectionLost { reason, partial }) => {
                if !partial.is_empty() {
                    writeln!(stdout, "{}", partial)?;
                }
                warn!("Connection lost ({}), reconnecting", reason);
                match session.reconnect() {
                    Ok(()) => info!("Reconnected to adapter '{}'", session.target_serial()),
                    Err(e) => warn!("Reconnect failed: {}", e),
                }
            }
            Err(e) => warn!("{}", e),
        }
        stdout.flush()?;
    }

    session.disconnect();
    Ok(())
}
