/// Stage 2: the actual stop/backup/restore/start work
///
/// Runs inside the ephemeral runner container, isolated from the
/// control process. Whatever happens in the volume loop, the final
/// sweep restarts every container still owed a restart before the
/// outcome (including a cancellation) is allowed to surface.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::config::Config;
use crate::core::engine;
use crate::core::error::TaskError;
use crate::core::job::{retention_for, BackupJob, RestoreJob};
use crate::core::lifecycle::{Lifecycle, Runtime};

pub async fn backup_stage2<R: Runtime>(
    job: &BackupJob,
    config: &Config,
    runtime: &R,
    cancel: &CancellationToken,
) -> Result<(), TaskError> {
    info!("Backup stage 2 started");
    let mut lifecycle = Lifecycle::new(runtime);
    let result = backup_volumes(job, config, &mut lifecycle, cancel).await;
    finish(&mut lifecycle, result).await
}

pub async fn restore_stage2<R: Runtime>(
    job: &RestoreJob,
    config: &Config,
    runtime: &R,
    cancel: &CancellationToken,
) -> Result<(), TaskError> {
    info!("Restore stage 2 started");
    let mut lifecycle = Lifecycle::new(runtime);
    let result = restore_volumes(job, config, &mut lifecycle, cancel).await;
    finish(&mut lifecycle, result).await
}

async fn backup_volumes<R: Runtime>(
    job: &BackupJob,
    config: &Config,
    lifecycle: &mut Lifecycle<'_, R>,
    cancel: &CancellationToken,
) -> Result<(), TaskError> {
    for (volume, entry) in job {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        // Containers stopped for a previous volume that this one does
        // not need go back up before this volume's consumers go down.
        lifecycle.start_containers(&entry.containers, cancel).await?;
        lifecycle.stop_containers(&entry.containers, cancel).await?;
        info!("Backing up volume {volume}");
        engine::backup(config, volume, cancel).await?;
        if let Some(retention) = retention_for(entry, config) {
            info!("Removing old backups from volume {volume}");
            engine::remove_old(config, volume, &retention, cancel).await?;
        }
    }
    info!("Backup stage 2 done");
    Ok(())
}

async fn restore_volumes<R: Runtime>(
    job: &RestoreJob,
    config: &Config,
    lifecycle: &mut Lifecycle<'_, R>,
    cancel: &CancellationToken,
) -> Result<(), TaskError> {
    for (volume, consumers) in job {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        lifecycle.start_containers(consumers, cancel).await?;
        lifecycle.stop_containers(consumers, cancel).await?;
        info!("Restoring volume {volume}");
        engine::restore(config, volume, cancel).await?;
    }
    info!("Restore stage 2 done");
    Ok(())
}

/// The guaranteed final step: restart everything still queued, on
/// success, failure and cancellation alike. The loop's outcome takes
/// precedence over a sweep failure, and a cancellation is never masked
/// by one.
async fn finish<R: Runtime>(
    lifecycle: &mut Lifecycle<'_, R>,
    result: Result<(), TaskError>,
) -> Result<(), TaskError> {
    let sweep = lifecycle
        .start_containers(&[], &CancellationToken::new())
        .await;
    match &sweep {
        Ok(()) => info!("All containers are running again"),
        Err(err) => error!(
            "Failed to restart containers ({} still stopped): {err}",
            lifecycle.queued().len()
        ),
    }
    match result {
        Ok(()) => sweep,
        Err(err) => Err(err),
    }
}
