/// Cron-triggered backups
///
/// A thin timer: at every occurrence of the configured cron expression
/// it sends `backup` through the command relay, silently, exactly as
/// an operator would.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::Local;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::core::client;

/// Parse a standard five-field crontab expression (the `cron` crate
/// wants a seconds field in front).
fn parse_expression(expression: &str) -> Result<Schedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized)
        .with_context(|| format!("invalid BACKUP_CRON expression '{expression}'"))
}

pub fn spawn_backup_schedule(expression: &str) -> Result<JoinHandle<()>> {
    let schedule = parse_expression(expression)?;
    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Local).next() else {
                error!("Backup schedule has no further occurrences");
                return;
            };
            info!("Backup will run at {next}");
            let until = next - Local::now();
            if let Ok(wait) = until.to_std() {
                tokio::time::sleep(wait).await;
            }
            info!("Scheduled backup triggered");
            if let Err(err) = client::send_command("backup", None, true).await {
                error!("Scheduled backup failed: {err:#}");
            }
        }
    }))
}
