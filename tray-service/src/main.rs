// SPDX-License-Identifier: GPL-3.0-only

//! rclone tray daemon - supervises rclone mounts and transfers
//!
//! `serve` exposes the manager on the session bus for the tray front end;
//! the other subcommands run a single operation in the foreground.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use zbus::connection::Builder as ConnectionBuilder;

use tray_service::config::LoggingLevel;
use tray_service::dbus::{self, BUS_NAME, OBJECT_PATH, TrayService};
use tray_service::{RcloneManager, TrayConfig, logging};
use tray_types::{TransferInfo, TransferKind};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "rclone-trayd", version)]
#[command(about = "Supervise rclone mounts and transfers")]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/rclone-tray/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the D-Bus service (default)
    Serve,
    /// List configured remotes
    Remotes,
    /// Show active mounts
    Status,
    /// Mount a remote under the mount base directory
    Mount { remote: String },
    /// Unmount a remote
    Unmount { remote: String },
    /// Make dest identical to source
    Sync {
        source: String,
        dest: String,
        /// Extra rclone flags, after `--`
        #[arg(last = true)]
        flags: Vec<String>,
    },
    /// Copy source to dest without deleting anything
    Copy {
        source: String,
        dest: String,
        #[arg(last = true)]
        flags: Vec<String>,
    },
    /// Show space usage of a remote
    Usage { remote: String },
    /// Write the configuration as JSON
    ExportConfig { path: PathBuf },
    /// Replace the configuration with a JSON export
    ImportConfig { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(TrayConfig::default_path);
    let mut config = TrayConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if cli.verbose {
        config.logging.level = LoggingLevel::Debug;
    }
    logging::init(&config.logging);

    match cli.command.unwrap_or(Command::Serve) {
        Command::ExportConfig { path } => {
            config.export_json(&path)?;
            println!("Exported configuration to {}", path.display());
            Ok(())
        }
        Command::ImportConfig { path } => {
            let imported = TrayConfig::import_json(&path)
                .with_context(|| format!("importing {}", path.display()))?;
            imported.save(&config_path)?;
            println!("Imported configuration into {}", config_path.display());
            Ok(())
        }
        command => {
            let manager = Arc::new(RcloneManager::new(config)?);
            run(command, manager).await
        }
    }
}

async fn run(command: Command, manager: Arc<RcloneManager>) -> Result<()> {
    match command {
        Command::Serve => serve(manager).await,
        Command::Remotes => {
            let remotes = blocking(&manager, |m| Ok(m.remote_details())).await?;
            if remotes.is_empty() {
                println!("No remotes configured");
            }
            for remote in remotes {
                println!(
                    "{:<20} {:<12} {}",
                    remote.name,
                    remote.remote_type.as_deref().unwrap_or("-"),
                    if remote.mounted {
                        remote.mount_point.display().to_string()
                    } else {
                        "not mounted".to_string()
                    }
                );
            }
            Ok(())
        }
        Command::Status => {
            let mounts = blocking(&manager, |m| Ok(m.refresh())).await?;
            if mounts.is_empty() {
                println!("No active mounts");
            }
            for mount in mounts {
                let owner = mount
                    .pid
                    .map(|pid| format!("pid {pid}"))
                    .unwrap_or_else(|| "no owner found".to_string());
                println!(
                    "{:<20} {} ({}, {})",
                    mount.remote,
                    mount.mount_point.display(),
                    mount.state,
                    owner
                );
            }
            Ok(())
        }
        Command::Mount { remote } => {
            let mount = blocking(&manager, move |m| Ok(m.mount(&remote)?)).await?;
            println!("{} mounted at {}", mount.remote, mount.mount_point.display());
            Ok(())
        }
        Command::Unmount { remote } => {
            let name = remote.clone();
            let unmounted = blocking(&manager, move |m| {
                // Pick up the owning process of a mount started elsewhere
                m.refresh();
                Ok(m.unmount(&name)?)
            })
            .await?;
            if unmounted {
                println!("{remote} unmounted");
            } else {
                println!("{remote} is not mounted");
            }
            Ok(())
        }
        Command::Sync {
            source,
            dest,
            flags,
        } => transfer(manager, TransferKind::Sync, source, dest, flags).await,
        Command::Copy {
            source,
            dest,
            flags,
        } => transfer(manager, TransferKind::Copy, source, dest, flags).await,
        Command::Usage { remote } => {
            let usage = blocking(&manager, move |m| Ok(m.remote_usage(&remote)?)).await?;
            println!("{}", serde_json::to_string_pretty(&usage)?);
            Ok(())
        }
        Command::ExportConfig { .. } | Command::ImportConfig { .. } => Ok(()),
    }
}

async fn blocking<T, F>(manager: &Arc<RcloneManager>, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&RcloneManager) -> Result<T> + Send + 'static,
{
    let manager = Arc::clone(manager);
    tokio::task::spawn_blocking(move || call(&manager)).await?
}

async fn serve(manager: Arc<RcloneManager>) -> Result<()> {
    info!("Starting rclone tray service v{}", env!("CARGO_PKG_VERSION"));

    let existing = blocking(&manager, |m| Ok(m.refresh())).await?;
    info!("Found {} existing mounts", existing.len());

    let connection = ConnectionBuilder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, TrayService::new(Arc::clone(&manager)))?
        .build()
        .await?;
    info!("Service registered on D-Bus session bus");
    info!("  - {} at {}", BUS_NAME, OBJECT_PATH);

    dbus::watch(connection.clone(), Arc::clone(&manager), POLL_INTERVAL).await?;

    let startup = Arc::clone(&manager);
    let _ = tokio::task::spawn_blocking(move || startup.mount_on_startup());

    info!("Service ready, waiting for requests...");
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    blocking(&manager, |m| {
        m.cleanup();
        Ok(())
    })
    .await?;
    info!("rclone tray service shut down");
    Ok(())
}

/// Run one transfer in the foreground, redrawing its progress line
async fn transfer(
    manager: Arc<RcloneManager>,
    kind: TransferKind,
    source: String,
    dest: String,
    flags: Vec<String>,
) -> Result<()> {
    let job = blocking(&manager, move |m| {
        Ok(m.start_transfer(kind, &source, &dest, &flags)?)
    })
    .await?;
    let id = job.id.clone();
    eprintln!("Started {}", id);

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let finished = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let done = blocking(&manager, |m| Ok(m.poll_transfers())).await?;
                if let Some(job) = done.into_iter().find(|job| job.id == id) {
                    break job;
                }
                if let Some(job) = manager.transfer(&id) {
                    print_progress(&job);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                warn!(job = %id, "Interrupted, cancelling transfer");
                let cancel_id = id.clone();
                blocking(&manager, move |m| Ok(m.cancel_transfer(&cancel_id))).await?;
                match manager.transfer(&id) {
                    Some(job) => break job,
                    None => anyhow::bail!("transfer {id} vanished"),
                }
            }
        }
    };

    eprintln!();
    print_progress(&finished);
    eprintln!();
    if finished.status.is_terminal() && finished.exit_code == Some(0) {
        Ok(())
    } else {
        anyhow::bail!("transfer {} {}", finished.id, finished.status)
    }
}

fn print_progress(job: &TransferInfo) {
    let mut stderr = std::io::stderr();
    let _ = write!(
        stderr,
        "\r{:>3}% {:>12} ETA {:<10} {}",
        job.progress_percent,
        if job.speed.is_empty() { "-" } else { job.speed.as_str() },
        if job.eta.is_empty() { "-" } else { job.eta.as_str() },
        job.status
    );
    let _ = stderr.flush();
}
