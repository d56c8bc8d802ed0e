/// Task orchestrator: staged backup/restore, cancel and healthcheck
///
/// Stage 1 (discovery, planning, metadata persistence) runs here in the
/// control process; stage 2 runs in the ephemeral runner. One task lock
/// serializes the staged operations and is held across the runner's
/// whole lifetime; the healthcheck only ever reads its state.

use std::collections::BTreeMap;

use anyhow::anyhow;
use bollard::models::{Mount, MountPoint, MountPointTypeEnum};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::config::Config;
use crate::core::docker::{is_not_found, DockerManager};
use crate::core::engine;
use crate::core::error::TaskError;
use crate::core::job::{BackupJob, BackupVolumeJob, RestoreJob, VolumeRecord};
use crate::core::metadata::MetadataStore;
use crate::utils::constants::{
    BACKUP_STAGE2_COMMAND, CONTROL_COMMAND, ENTRYPOINT_SIGNATURE, RESTORE_STAGE2_COMMAND,
    RESTORE_WINDOW_HOURS, RUNNER_STALENESS_HOURS,
};
use crate::utils::helpers::{matches_at_start, my_hostname};

/// Process-wide orchestration state. Owned by the control server and
/// passed by reference; there are no ambient globals.
#[derive(Default)]
pub struct TaskState {
    lock: Mutex<()>,
    active: std::sync::Mutex<Option<CancellationToken>>,
}

impl TaskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a staged operation currently holds the task lock. Never
    /// waits; the healthcheck must stay responsive mid-backup.
    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.active.lock().unwrap() = Some(token.clone());
        token
    }

    fn disarm(&self) {
        *self.active.lock().unwrap() = None;
    }

    fn cancel_active(&self) {
        if let Some(token) = self.active.lock().unwrap().as_ref() {
            token.cancel();
        }
    }
}

/// Backup, stage 1: discover volumes and their consumers, persist the
/// metadata records, then hand off to the runner.
pub async fn backup(
    state: &TaskState,
    config: &Config,
    store: &MetadataStore,
    docker: &DockerManager,
) -> Result<(), TaskError> {
    let _guard = state.lock.lock().await;
    info!("Preparing backup");

    let myself = docker.find_self().await.map_err(TaskError::runtime)?;
    let containers = inspect_other_containers(docker, &myself).await?;
    let consumers = group_backup_consumers(&containers, config.ignore_regex.as_ref());
    if consumers.is_empty() {
        warn!("Nothing found to back up, doing nothing");
        return Ok(());
    }

    let mut job = BackupJob::new();
    let mut mounts = Vec::new();
    let mut records = Vec::new();
    for (volume, consumer_ids) in consumers {
        let record = docker
            .volume_record(&volume)
            .await
            .map_err(TaskError::runtime)?;
        let mut entry =
            BackupVolumeJob::from_labels(&record.labels).map_err(TaskError::runtime)?;
        entry.containers = consumer_ids;
        job.insert(volume.clone(), entry);
        mounts.push(DockerManager::source_mount(&volume, true));
        records.push(record);
    }

    info!("Updating volume metadata");
    for record in &records {
        // Only Name and Labels are stored; the store may skip the write
        // if the value is unchanged.
        let data = serde_json::to_string(record).map_err(TaskError::store)?;
        store
            .write(&record.name, &data)
            .await
            .map_err(TaskError::Store)?;
    }

    info!("Starting backup stage 2");
    let payload = encode_payload(&job)?;
    run_stage2(state, docker, BACKUP_STAGE2_COMMAND, &payload, mounts, &myself).await
}

/// Restore, stage 1: enumerate stored volumes, select the coherent
/// recent set, recreate missing volumes, then hand off to the runner.
pub async fn restore(
    state: &TaskState,
    config: &Config,
    store: &MetadataStore,
    docker: &DockerManager,
) -> Result<(), TaskError> {
    let _guard = state.lock.lock().await;
    info!("Preparing restore");

    let known = store.list().await.map_err(TaskError::Store)?;
    if known.is_empty() {
        warn!("No volumes found in target, doing nothing");
        return Ok(());
    }
    let mut times = Vec::new();
    for volume in &known {
        times.push((volume.clone(), engine::last_backup_time(config, volume).await?));
    }
    let selected = select_restorable(&times);
    info!(
        "Restoring volumes {} ({}/{})",
        selected.join(", "),
        selected.len(),
        times.len()
    );

    let myself = docker.find_self().await.map_err(TaskError::runtime)?;
    let containers = inspect_other_containers(docker, &myself).await?;
    let job = group_restore_consumers(&containers, &selected);
    let mounts: Vec<Mount> = selected
        .iter()
        .map(|volume| DockerManager::source_mount(volume, false))
        .collect();

    info!("Creating volumes with correct metadata if necessary");
    let existing = docker.list_volume_names().await.map_err(TaskError::runtime)?;
    for volume in job.keys() {
        if existing.iter().any(|name| name == volume) {
            continue;
        }
        // Recreating with the stored labels keeps tooling that checks
        // volume labels (compose, most prominently) happy.
        let text = store
            .read(volume)
            .await
            .map_err(TaskError::Store)?
            .ok_or_else(|| {
                TaskError::Store(anyhow!("missing metadata record for volume {volume}"))
            })?;
        let record: VolumeRecord = serde_json::from_str(&text).map_err(TaskError::store)?;
        docker
            .create_volume(&record)
            .await
            .map_err(TaskError::runtime)?;
    }

    info!("Starting restore stage 2");
    let payload = encode_payload(&job)?;
    run_stage2(
        state,
        docker,
        RESTORE_STAGE2_COMMAND,
        &payload,
        mounts,
        &myself,
    )
    .await
}

/// Cancel the in-flight staged operation, if any, and only return once
/// its teardown has finished (the lock becoming free implies the runner
/// has been stopped and awaited).
pub async fn cancel(state: &TaskState) -> Result<(), TaskError> {
    state.cancel_active();
    let _guard = state.lock.lock().await;
    info!("Runner container stopped");
    Ok(())
}

/// Healthcheck: read-only consistency scan over all containers carrying
/// our entrypoint signature. Never takes the task lock.
pub async fn healthcheck(state: &TaskState, docker: &DockerManager) -> Result<(), TaskError> {
    let lock_free = !state.is_locked();
    let own_hostname = my_hostname().map_err(TaskError::runtime)?;
    let now = Utc::now();

    for id in docker
        .list_container_ids()
        .await
        .map_err(TaskError::runtime)?
    {
        let inspect = match docker.inspect(&id).await {
            Ok(inspect) => inspect,
            // Removed since the list call; continue like it was never
            // there.
            Err(err)
                if err
                    .downcast_ref::<bollard::errors::Error>()
                    .is_some_and(is_not_found) =>
            {
                continue
            }
            Err(err) => return Err(TaskError::Runtime(err)),
        };
        let Some(config) = inspect.config else {
            continue;
        };
        let age = inspect
            .created
            .as_deref()
            .and_then(|created| DateTime::parse_from_rfc3339(created).ok())
            .map(|created| now.signed_duration_since(created.with_timezone(&Utc)));
        if let Some(problem) = classify(
            config.entrypoint.as_deref(),
            config.cmd.as_deref(),
            config.hostname.as_deref(),
            age,
            &own_hostname,
            lock_free,
        ) {
            return Err(TaskError::Consistency(problem));
        }
    }
    Ok(())
}

/// Inspect every container except our own.
///
/// Unlike the healthcheck, a container vanishing mid-scan is an error
/// here: backup and restore assume a stable environment.
async fn inspect_other_containers(
    docker: &DockerManager,
    myself: &bollard::models::ContainerInspectResponse,
) -> Result<Vec<(String, Vec<MountPoint>)>, TaskError> {
    let self_id = myself.id.clone().unwrap_or_default();
    let mut containers = Vec::new();
    for id in docker
        .list_container_ids()
        .await
        .map_err(TaskError::runtime)?
    {
        if id == self_id {
            continue;
        }
        // The list endpoint does not return the full config/mounts.
        let inspect = docker.inspect(&id).await.map_err(TaskError::runtime)?;
        containers.push((id, inspect.mounts.unwrap_or_default()));
    }
    Ok(containers)
}

async fn run_stage2(
    state: &TaskState,
    docker: &DockerManager,
    command: &str,
    payload: &str,
    mounts: Vec<Mount>,
    myself: &bollard::models::ContainerInspectResponse,
) -> Result<(), TaskError> {
    let cancel = state.arm();
    let result = docker
        .run_runner(command, payload, mounts, myself, &cancel)
        .await;
    // Cleared even on failure; a stale handle would make a later cancel
    // fire into nothing that exists.
    state.disarm();
    result
}

fn encode_payload<T: serde::Serialize>(job: &T) -> Result<String, TaskError> {
    serde_json::to_string(job)
        .map_err(|err| TaskError::Runner(format!("failed to encode runner job: {err}")))
}

/// Group writable volume mounts by volume name, skipping ignored
/// names. Each volume appears once with the full set of containers
/// mounting it.
fn group_backup_consumers(
    containers: &[(String, Vec<MountPoint>)],
    ignore: Option<&Regex>,
) -> BTreeMap<String, Vec<String>> {
    let mut consumers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (id, mounts) in containers {
        for mount in mounts {
            if mount.rw != Some(true) || mount.typ != Some(MountPointTypeEnum::VOLUME) {
                continue;
            }
            let Some(name) = mount.name.as_deref() else {
                continue;
            };
            if ignore.is_some_and(|pattern| matches_at_start(pattern, name)) {
                continue;
            }
            let entry = consumers.entry(name.to_string()).or_default();
            if !entry.contains(id) {
                entry.push(id.clone());
            }
        }
    }
    consumers
}

/// Build the restore consumer sets: every container mounting one of the
/// selected volumes, by name, regardless of how it mounts it.
fn group_restore_consumers(
    containers: &[(String, Vec<MountPoint>)],
    selected: &[String],
) -> RestoreJob {
    let mut job: RestoreJob = selected
        .iter()
        .map(|volume| (volume.clone(), Vec::new()))
        .collect();
    for (id, mounts) in containers {
        for mount in mounts {
            let Some(name) = mount.name.as_deref() else {
                continue;
            };
            if let Some(entry) = job.get_mut(name) {
                if !entry.contains(id) {
                    entry.push(id.clone());
                }
            }
        }
    }
    job
}

/// Select the volumes whose last backup is recent enough to restore
/// together: within the window of the most recent backup across all
/// volumes. Prevents silently mixing a fresh volume with stale ones
/// into an inconsistent snapshot set.
fn select_restorable(times: &[(String, NaiveDateTime)]) -> Vec<String> {
    let Some(latest) = times.iter().map(|(_, time)| *time).max() else {
        return Vec::new();
    };
    times
        .iter()
        .filter(|(_, time)| latest - *time <= Duration::hours(RESTORE_WINDOW_HOURS))
        .map(|(volume, _)| volume.clone())
        .collect()
}

/// Judge one container for the healthcheck. Returns the failure
/// message, if any.
fn classify(
    entrypoint: Option<&[String]>,
    cmd: Option<&[String]>,
    hostname: Option<&str>,
    age: Option<Duration>,
    own_hostname: &str,
    lock_free: bool,
) -> Option<String> {
    let ours = entrypoint
        .is_some_and(|ep| ep.iter().map(String::as_str).eq(ENTRYPOINT_SIGNATURE));
    if !ours {
        return None;
    }
    let command = cmd.and_then(|cmd| cmd.first()).map(String::as_str)?;
    match command {
        CONTROL_COMMAND if hostname != Some(own_hostname) => Some(
            "It seems like there is another control instance running. Don't do that.".to_string(),
        ),
        BACKUP_STAGE2_COMMAND | RESTORE_STAGE2_COMMAND => {
            if lock_free {
                return Some(
                    "It seems like there is a leftover runner container. I won't delete it."
                        .to_string(),
                );
            }
            let stale = age
                .filter(|age| *age > Duration::hours(RUNNER_STALENESS_HOURS))
                .and_then(|age| age.to_std().ok());
            stale.map(|age| {
                let rounded = std::time::Duration::from_secs(age.as_secs());
                format!(
                    "It seems like the running operation is stuck (runner is {} old).",
                    humantime::format_duration(rounded)
                )
            })
        }
        _ => None,
    }
}
