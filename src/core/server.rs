/// Control server
///
/// Listens on the loopback control address; each connection carries
/// exactly one newline-terminated command and receives every log
/// record emitted while it runs. A failing command is logged into the
/// session and the connection closed; the server itself never goes
/// down over a bad session.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use crate::core::config::Config;
use crate::core::docker::DockerManager;
use crate::core::error::TaskError;
use crate::core::logging::LogRelay;
use crate::core::metadata::MetadataStore;
use crate::core::scheduler;
use crate::core::tasks::{self, TaskState};
use crate::utils::constants::CONTROL_ADDR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Backup,
    Restore,
    Cancel,
    Healthcheck,
}

fn parse_command(line: &str) -> Option<Command> {
    match line {
        "backup" => Some(Command::Backup),
        "restore" => Some(Command::Restore),
        "cancel" => Some(Command::Cancel),
        "healthcheck" => Some(Command::Healthcheck),
        _ => None,
    }
}

/// Run the control daemon until SIGTERM/ctrl-c.
pub async fn run(config: Config, relay: LogRelay) -> Result<()> {
    let config = Arc::new(config);
    let docker = DockerManager::new()?;
    let store = Arc::new(MetadataStore::from_config(&config).await?);
    let state = Arc::new(TaskState::new());

    if let Some(expression) = &config.backup_cron {
        let _ = scheduler::spawn_backup_schedule(expression)?;
    }

    let listener = TcpListener::bind(CONTROL_ADDR)
        .await
        .with_context(|| format!("failed to bind control address {CONTROL_ADDR}"))?;
    info!(
        "Waiting for commands ({} metadata store)",
        store.backend_name()
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let socket = match accepted {
                    Ok((socket, _)) => socket,
                    Err(err) => {
                        error!("Failed to accept control connection: {err}");
                        continue;
                    }
                };
                let session = Session {
                    config: config.clone(),
                    docker: docker.clone(),
                    store: store.clone(),
                    state: state.clone(),
                    relay: relay.clone(),
                };
                tokio::spawn(session.handle(socket));
            }
            _ = shutdown_signal() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

async fn shutdown_signal() {
    // Docker stops the container with SIGTERM; treat it like ctrl-c so
    // the daemon exits cleanly instead of being killed.
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = sigterm => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

struct Session {
    config: Arc<Config>,
    docker: DockerManager,
    store: Arc<MetadataStore>,
    state: Arc<TaskState>,
    relay: LogRelay,
}

impl Session {
    async fn handle(self, socket: TcpStream) {
        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        match reader.read_line(&mut line).await {
            // Peer disconnected before sending a full line; nothing to
            // answer, nothing to log.
            Ok(0) => return,
            Ok(_) if !line.ends_with('\n') => return,
            Ok(_) => {}
            Err(_) => return,
        }
        let command_line = line.trim_end_matches(['\n', '\r']).to_string();

        // Mirror every record emitted anywhere in the process into this
        // session for as long as the command runs.
        let (sink_id, mut records) = self.relay.register();
        let writer = tokio::spawn(async move {
            while let Some(record_line) = records.recv().await {
                if write_half.write_all(record_line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        self.dispatch(&command_line).await;

        // Dropping the sink ends the writer after it drained what was
        // logged.
        self.relay.unregister(sink_id);
        let _ = writer.await;
    }

    async fn dispatch(&self, command_line: &str) {
        match parse_command(command_line) {
            Some(Command::Backup) => {
                info!("Backup requested");
                match tasks::backup(&self.state, &self.config, &self.store, &self.docker).await {
                    Ok(()) => info!("Backup done"),
                    Err(TaskError::Cancelled) => error!("Backup cancelled"),
                    Err(err) => error!("Backup failed: {err}"),
                }
            }
            Some(Command::Restore) => {
                info!("Restore requested");
                match tasks::restore(&self.state, &self.config, &self.store, &self.docker).await {
                    Ok(()) => info!("Restore done"),
                    Err(TaskError::Cancelled) => error!("Restore cancelled"),
                    Err(err) => error!("Restore failed: {err}"),
                }
            }
            Some(Command::Cancel) => {
                info!("Cancellation of current operation requested");
                match tasks::cancel(&self.state).await {
                    Ok(()) => info!("Successfully cancelled"),
                    Err(err) => error!("Cancellation failed: {err}"),
                }
            }
            Some(Command::Healthcheck) => {
                match tasks::healthcheck(&self.state, &self.docker).await {
                    // The literal marker the healthcheck client scans
                    // for.
                    Ok(()) => info!("Healthcheck passed"),
                    Err(err) => error!("Healthcheck failed: {err}"),
                }
            }
            None => error!("Unknown command {command_line}"),
        }
    }
}
