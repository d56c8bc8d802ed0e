mod cli;
mod core;
mod utils;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Commands};
use crate::core::client;
use crate::core::config::Config;
use crate::core::docker::DockerManager;
use crate::core::job::{BackupJob, RestoreJob};
use crate::core::logging::{self, LogRelay};
use crate::core::{runner, server};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Control => {
            let relay = LogRelay::new();
            logging::init_control(&relay);
            let config = Config::from_env()?;
            server::run(config, relay).await
        }
        Commands::BackupStage2 { job } => {
            logging::init_runner();
            let job: BackupJob =
                serde_json::from_str(&job).context("invalid backup-stage2 payload")?;
            let config = Config::from_env()?;
            let docker = DockerManager::new()?;
            let cancel = shutdown_token();
            runner::backup_stage2(&job, &config, &docker, &cancel).await?;
            Ok(())
        }
        Commands::RestoreStage2 { job } => {
            logging::init_runner();
            let job: RestoreJob =
                serde_json::from_str(&job).context("invalid restore-stage2 payload")?;
            let config = Config::from_env()?;
            let docker = DockerManager::new()?;
            let cancel = shutdown_token();
            runner::restore_stage2(&job, &config, &docker, &cancel).await?;
            Ok(())
        }
        Commands::Backup => {
            logging::init_client();
            client::send_command("backup", Some("cancel"), false).await?;
            Ok(())
        }
        Commands::Restore => {
            logging::init_client();
            client::send_command("restore", Some("cancel"), false).await?;
            Ok(())
        }
        Commands::Cancel => {
            logging::init_client();
            client::send_command("cancel", None, false).await?;
            Ok(())
        }
        Commands::Healthcheck => {
            logging::init_client();
            let output = client::send_command("healthcheck", None, false).await?;
            if !client::contains_pass_marker(&output) {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Token cancelled when the process is asked to stop. The runner gets
/// SIGTERM when the control process stops its container; the work in
/// flight must wind down instead of dying mid-mutation.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
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
        handle.cancel();
    });
    token
}
