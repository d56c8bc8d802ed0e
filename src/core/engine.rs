/// Backup engine (duplicity) subprocess integration
///
/// The engine is an external command-line tool; the four operations we
/// drive are collection-status, backup, remove-old and restore. Only
/// its exit code, output lines and the reported chain end times matter
/// here.

use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::config::Config;
use crate::core::error::TaskError;
use crate::core::job::Retention;

const ENGINE_BIN: &str = "duplicity";

/// Timestamp format of `Chain end time:` lines in collection-status
/// output (there is no machine-readable option for this).
const CHAIN_END_FORMAT: &str = "%a %b %d %H:%M:%S %Y";
const CHAIN_END_PREFIX: &str = "Chain end time: ";

/// Most recent recovery point the engine knows for a volume.
pub async fn last_backup_time(config: &Config, volume: &str) -> Result<NaiveDateTime, TaskError> {
    let output = command(config)
        .arg("collection-status")
        .args(config.engine_flags())
        .arg(config.engine_target(volume))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| TaskError::Engine(format!("failed to run {ENGINE_BIN}: {err}")))?;
    if !output.status.success() {
        return Err(TaskError::Engine(format!(
            "failed to find last backup for {volume}"
        )));
    }
    parse_chain_end_times(&String::from_utf8_lossy(&output.stdout))
        .map_err(|err| TaskError::Engine(format!("{err:#} (volume {volume})")))
}

/// Back up `/source/<volume>` to the configured target.
pub async fn backup(
    config: &Config,
    volume: &str,
    cancel: &CancellationToken,
) -> Result<(), TaskError> {
    let mut cmd = command(config);
    cmd.arg("backup");
    if let Some(age) = &config.full_if_older_than {
        cmd.args(["--full-if-older-than", age]);
    }
    cmd.arg("--allow-source-mismatch")
        .args(config.engine_flags())
        .arg(Config::source_dir(volume))
        .arg(config.engine_target(volume));
    run_streaming(cmd, cancel).await
}

/// Delete old backup history according to the volume's active
/// retention mode.
pub async fn remove_old(
    config: &Config,
    volume: &str,
    retention: &Retention,
    cancel: &CancellationToken,
) -> Result<(), TaskError> {
    let mut cmd = command(config);
    cmd.args(retention.engine_args())
        .arg("--force")
        .args(config.engine_flags())
        .arg(config.engine_target(volume));
    run_streaming(cmd, cancel).await
}

/// Restore a volume's latest recovery point into `/source/<volume>`.
pub async fn restore(
    config: &Config,
    volume: &str,
    cancel: &CancellationToken,
) -> Result<(), TaskError> {
    // The engine never deletes files on restore, so files created after
    // the snapshot would survive. Clear the destination first.
    clear_directory(volume)
        .await
        .map_err(|err| TaskError::Engine(format!("{err:#}")))?;

    let mut cmd = command(config);
    cmd.arg("restore")
        .args(config.engine_flags())
        .arg(config.engine_target(volume))
        .arg(Config::source_dir(volume));
    run_streaming(cmd, cancel).await
}

fn command(config: &Config) -> Command {
    let mut cmd = Command::new(ENGINE_BIN);
    cmd.env_clear().envs(config.engine_env());
    cmd
}

async fn clear_directory(volume: &str) -> Result<()> {
    let dir = Config::source_dir(volume);
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .with_context(|| format!("failed to open {}", dir.display()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to list {}", dir.display()))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        }
        .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Run the engine, forwarding its stdout as info records and stderr as
/// error records. On cancellation the subprocess is killed and reaped
/// before the cancellation is allowed to surface.
async fn run_streaming(mut cmd: Command, cancel: &CancellationToken) -> Result<(), TaskError> {
    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| TaskError::Engine(format!("failed to run {ENGINE_BIN}: {err}")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TaskError::Engine(format!("{ENGINE_BIN} stdout not captured")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| TaskError::Engine(format!("{ENGINE_BIN} stderr not captured")))?;

    let forward = async {
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let out = async {
            while let Ok(Some(line)) = out_lines.next_line().await {
                info!("{line}");
            }
        };
        let err = async {
            while let Ok(Some(line)) = err_lines.next_line().await {
                error!("{line}");
            }
        };
        tokio::join!(out, err);
    };

    tokio::select! {
        _ = forward => {}
        _ = cancel.cancelled() => {
            // The engine must not outlive us; reap it before the
            // cancellation propagates.
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(TaskError::Cancelled);
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|err| TaskError::Engine(format!("failed to wait for {ENGINE_BIN}: {err}")))?;
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(TaskError::Engine(format!(
            "{ENGINE_BIN} failed with code {code}"
        ))),
        None => Err(TaskError::Engine(format!(
            "{ENGINE_BIN} was terminated by a signal"
        ))),
    }
}

/// Max of all `Chain end time:` lines in collection-status output.
fn parse_chain_end_times(stdout: &str) -> Result<NaiveDateTime> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix(CHAIN_END_PREFIX))
        .map(|stamp| {
            NaiveDateTime::parse_from_str(stamp.trim(), CHAIN_END_FORMAT)
                .with_context(|| format!("unparseable chain end time '{stamp}'"))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .max()
        .ok_or_else(|| anyhow!("no chain end time in collection-status output"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_parse_chain_end_times_takes_max() {
        let output = "Last full backup date: Sat Aug 2 10:00:00 2025\n\
                      Chain end time: Sat Aug 2 10:00:00 2025\n\
                      Chain end time: Wed Aug 6 03:15:42 2025\n\
                      No orphaned or incomplete backup sets found.";
        let parsed = parse_chain_end_times(output).unwrap();
        assert_eq!(
            parsed,
            NaiveDate::from_ymd_opt(2025, 8, 6)
                .unwrap()
                .and_hms_opt(3, 15, 42)
                .unwrap()
        );
    }

    #[test]
    fn test_parse_chain_end_times_requires_one() {
        assert!(parse_chain_end_times("nothing relevant here").is_err());
        assert!(parse_chain_end_times("Chain end time: not a date").is_err());
    }
}
