/// Docker runtime integration and the runner launcher
///
/// Everything that talks to the Docker daemon lives here: container and
/// volume enumeration, self-identification, the lifecycle Runtime
/// implementation, and launching the ephemeral runner container with
/// its log relay.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerCreateConfig, CreateContainerOptions, ListContainersOptions, LogsOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::{
    ContainerInspectResponse, HostConfig, Mount, MountPoint, MountPointTypeEnum, MountTypeEnum,
};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions};
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::error::TaskError;
use crate::core::job::VolumeRecord;
use crate::core::lifecycle::{ContainerBrief, Runtime};
use crate::core::logging;
use crate::utils::constants::SOURCE_MOUNT_PREFIX;
use crate::utils::helpers::my_hostname;

#[derive(Clone)]
pub struct DockerManager {
    docker: Docker,
}

impl DockerManager {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon. Is Docker running?")?;
        Ok(Self { docker })
    }

    /// Ids of all containers, running or not.
    pub async fn list_container_ids(&self) -> Result<Vec<String>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .context("failed to list containers")?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    /// Full inspect; the list endpoint does not return the container
    /// config, so every consumer goes through this.
    pub async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(id, None)
            .await
            .with_context(|| format!("failed to inspect container {id}"))
    }

    /// Find our own container by matching hostnames.
    pub async fn find_self(&self) -> Result<ContainerInspectResponse> {
        let hostname = my_hostname()?;
        for id in self.list_container_ids().await? {
            let inspect = self.inspect(&id).await?;
            let container_hostname = inspect
                .config
                .as_ref()
                .and_then(|config| config.hostname.as_deref());
            if container_hostname == Some(hostname.as_str()) {
                return Ok(inspect);
            }
        }
        bail!("unable to find own container (hostname {hostname}), aborting")
    }

    /// Name and label map of a volume.
    pub async fn volume_record(&self, name: &str) -> Result<VolumeRecord> {
        let volume = self
            .docker
            .inspect_volume(name)
            .await
            .with_context(|| format!("failed to inspect volume {name}"))?;
        Ok(VolumeRecord {
            name: volume.name,
            labels: volume.labels.into_iter().collect(),
        })
    }

    pub async fn list_volume_names(&self) -> Result<Vec<String>> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await
            .context("failed to list volumes")?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| volume.name)
            .collect())
    }

    /// Recreate a volume from its stored record so its labels match
    /// what dependent tooling expects.
    pub async fn create_volume(&self, record: &VolumeRecord) -> Result<()> {
        self.docker
            .create_volume(CreateVolumeOptions::<String> {
                name: record.name.clone(),
                labels: record.labels.clone().into_iter().collect(),
                ..Default::default()
            })
            .await
            .with_context(|| format!("failed to create volume {}", record.name))?;
        Ok(())
    }

    /// The `/source/<volume>` mount handed to the runner.
    pub fn source_mount(volume: &str, read_only: bool) -> Mount {
        Mount {
            target: Some(format!("{SOURCE_MOUNT_PREFIX}/{volume}")),
            source: Some(volume.to_string()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(read_only),
            ..Default::default()
        }
    }

    /// Convert an inspect-time mount point into a create-time mount.
    ///
    /// The create API takes a different shape than inspect returns, so
    /// the runner cannot inherit our mounts verbatim.
    fn convert_mount(mount: &MountPoint) -> Result<Mount> {
        let target = mount.destination.clone();
        let read_only = Some(mount.rw != Some(true));
        match mount.typ {
            Some(MountPointTypeEnum::BIND) => Ok(Mount {
                target,
                source: mount.source.clone(),
                typ: Some(MountTypeEnum::BIND),
                read_only,
                ..Default::default()
            }),
            Some(MountPointTypeEnum::VOLUME) => Ok(Mount {
                target,
                source: mount.name.clone(),
                typ: Some(MountTypeEnum::VOLUME),
                read_only,
                ..Default::default()
            }),
            other => bail!("unsupported mount type {other:?} on own container"),
        }
    }

    /// Launch the runner and relay its log stream until it exits.
    ///
    /// The runner replicates this process's image, mounts and
    /// environment (secrets reach it the same way they reached us),
    /// plus the stage-specific volume mounts. It runs detached with
    /// auto-removal; completion is observed via a wait subscription
    /// opened before the log stream is drained, because once the log
    /// stream ends the container may already be gone.
    pub async fn run_runner(
        &self,
        command: &str,
        payload: &str,
        stage_mounts: Vec<Mount>,
        myself: &ContainerInspectResponse,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let image = myself
            .image
            .clone()
            .ok_or_else(|| TaskError::runtime(anyhow!("own container has no image")))?;
        let mut mounts = myself
            .mounts
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(Self::convert_mount)
            .collect::<Result<Vec<_>>>()
            .map_err(TaskError::runtime)?;
        mounts.extend(stage_mounts);

        let config = ContainerCreateConfig::<String> {
            image: Some(image),
            cmd: Some(vec![command.to_string(), payload.to_string()]),
            env: Some(std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()),
            attach_stdin: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            open_stdin: Some(false),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                mounts: Some(mounts),
                ..Default::default()
            }),
            ..Default::default()
        };

        let id = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|err| TaskError::Runner(format!("failed to create runner: {err}")))?
            .id;
        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| TaskError::Runner(format!("failed to start runner: {err}")))?;

        // Subscribe to the exit before touching the log stream; after
        // the stream closes an auto-removed container may no longer be
        // there to wait on.
        let wait_docker = self.docker.clone();
        let wait_id = id.clone();
        let wait_task = tokio::spawn(async move {
            let mut wait = wait_docker.wait_container(&wait_id, None::<WaitContainerOptions<String>>);
            match wait.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Ok(code)
                }
                Some(Err(err)) => Err(format!("{err}")),
                None => Err("runner wait stream ended without a status".to_string()),
            }
        });

        let mut logs = self.docker.logs(
            &id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let mut pending = String::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // The runner must never be abandoned: stop it, wait
                    // for the exit we subscribed to, then re-raise.
                    if let Err(err) = self.docker.stop_container(&id, None::<StopContainerOptions>).await {
                        if !is_not_found(&err) {
                            warn!("failed to stop runner: {err}");
                        }
                    }
                    let _ = wait_task.await;
                    return Err(TaskError::Cancelled);
                }
                chunk = logs.next() => match chunk {
                    Some(Ok(output)) => {
                        pending.push_str(&String::from_utf8_lossy(&output.into_bytes()));
                        while let Some(newline) = pending.find('\n') {
                            relay_runner_line(pending[..newline].trim_end_matches('\r'));
                            pending.drain(..=newline);
                        }
                    }
                    Some(Err(err)) => {
                        debug!("runner log stream error: {err}");
                        break;
                    }
                    None => break,
                },
            }
        }
        if !pending.is_empty() {
            relay_runner_line(&pending);
        }

        let status = wait_task
            .await
            .map_err(|err| TaskError::Runner(format!("runner wait failed: {err}")))?
            .map_err(|err| TaskError::Runner(format!("runner wait failed: {err}")))?;
        if status != 0 {
            return Err(TaskError::Runner(format!("Runner failed with code {status}")));
        }
        Ok(())
    }
}

/// One line from the runner's output: well-formed records re-enter the
/// logging hierarchy under their embedded source, anything else is
/// relayed verbatim as an error record.
fn relay_runner_line(line: &str) {
    match logging::parse_line(line) {
        Some(record) => logging::reemit(&record),
        None => {
            if !line.is_empty() {
                error!(source = "runner", "{line}");
            }
        }
    }
}

/// The container vanished between listing and inspection; listing and
/// inspection are not atomic with respect to the runtime.
pub fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl Runtime for DockerManager {
    async fn lookup(&self, id: &str) -> Result<ContainerBrief> {
        let inspect = self.inspect(id).await?;
        Ok(ContainerBrief {
            name: inspect
                .name
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.to_string()),
            running: inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false),
        })
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await
            .with_context(|| format!("failed to stop container {id}"))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("failed to start container {id}"))
    }
}
