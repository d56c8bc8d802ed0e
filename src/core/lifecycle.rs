/// Container lifecycle manager
///
/// Owns the restart queue: every container this system stops is owed a
/// restart, and the obligation is recorded as part of the stop attempt
/// itself. Cancellation is only honored between operations, never in a
/// way that loses a stop that already happened or abandons a start
/// that is in flight.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::core::error::TaskError;

/// What the lifecycle manager needs to know about one container.
#[derive(Debug, Clone)]
pub struct ContainerBrief {
    pub name: String,
    pub running: bool,
}

/// The slice of the container runtime the lifecycle manager drives.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Runtime {
    async fn lookup(&self, id: &str) -> Result<ContainerBrief>;
    async fn stop(&self, id: &str) -> Result<()>;
    async fn start(&self, id: &str) -> Result<()>;
}

pub struct Lifecycle<'a, R: Runtime> {
    runtime: &'a R,
    restart_queue: Vec<String>,
}

impl<'a, R: Runtime> Lifecycle<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self {
            runtime,
            restart_queue: Vec::new(),
        }
    }

    /// Ids currently owed a restart.
    pub fn queued(&self) -> &[String] {
        &self.restart_queue
    }

    /// Stop every currently-running container in `ids`.
    ///
    /// The queue entry is pushed as part of the stop attempt: once stop
    /// has been issued the obligation exists, whether or not the call
    /// reported success, and before any cancellation may surface.
    pub async fn stop_containers(
        &mut self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        for id in ids {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let brief = self.runtime.lookup(id).await.map_err(TaskError::runtime)?;
            if !brief.running {
                continue;
            }
            info!("Stopping container {}", brief.name);
            let stopped = self.runtime.stop(id).await;
            if !self.restart_queue.iter().any(|queued| queued == id) {
                self.restart_queue.push(id.clone());
            }
            stopped.map_err(TaskError::runtime)?;
        }
        Ok(())
    }

    /// Start every queued container except the excluded ones, removing
    /// each from the queue only after its start call has completed
    /// successfully. A cancellation is observed only between starts, so
    /// no container is ever left in requested-stop limbo.
    pub async fn start_containers(
        &mut self,
        exclude: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        for id in self.restart_queue.clone() {
            if exclude.contains(&id) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let brief = self.runtime.lookup(&id).await.map_err(TaskError::runtime)?;
            info!("Starting container {}", brief.name);
            self.runtime.start(&id).await.map_err(TaskError::runtime)?;
            self.restart_queue.retain(|queued| queued != &id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use mockall::predicate::eq;

    fn brief(name: &str, running: bool) -> ContainerBrief {
        ContainerBrief {
            name: name.to_string(),
            running,
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_stop_then_start_drains_queue() {
        let mut runtime = MockRuntime::new();
        for id in ["a", "b"] {
            runtime
                .expect_lookup()
                .with(eq(id))
                .times(2)
                .returning(move |_| Ok(brief(id, true)));
            runtime
                .expect_stop()
                .with(eq(id))
                .times(1)
                .returning(|_| Ok(()));
            runtime
                .expect_start()
                .with(eq(id))
                .times(1)
                .returning(|_| Ok(()));
        }

        let cancel = CancellationToken::new();
        let mut lifecycle = Lifecycle::new(&runtime);
        lifecycle
            .stop_containers(&ids(&["a", "b"]), &cancel)
            .await
            .unwrap();
        assert_eq!(lifecycle.queued(), &ids(&["a", "b"]));
        lifecycle.start_containers(&[], &cancel).await.unwrap();
        assert!(lifecycle.queued().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_containers_are_skipped() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_lookup()
            .returning(|_| Ok(brief("sleeper", false)));
        runtime.expect_stop().never();

        let cancel = CancellationToken::new();
        let mut lifecycle = Lifecycle::new(&runtime);
        lifecycle
            .stop_containers(&ids(&["a"]), &cancel)
            .await
            .unwrap();
        assert!(lifecycle.queued().is_empty());
    }

    #[tokio::test]
    async fn test_no_duplicate_queue_entries() {
        let mut runtime = MockRuntime::new();
        runtime.expect_lookup().returning(|_| Ok(brief("a", true)));
        runtime.expect_stop().times(2).returning(|_| Ok(()));

        let cancel = CancellationToken::new();
        let mut lifecycle = Lifecycle::new(&runtime);
        lifecycle
            .stop_containers(&ids(&["a"]), &cancel)
            .await
            .unwrap();
        lifecycle
            .stop_containers(&ids(&["a"]), &cancel)
            .await
            .unwrap();
        assert_eq!(lifecycle.queued(), &ids(&["a"]));
    }

    #[tokio::test]
    async fn test_failed_stop_still_records_obligation() {
        let mut runtime = MockRuntime::new();
        runtime.expect_lookup().returning(|_| Ok(brief("a", true)));
        runtime
            .expect_stop()
            .returning(|_| Err(anyhow!("daemon hiccup")));

        let cancel = CancellationToken::new();
        let mut lifecycle = Lifecycle::new(&runtime);
        let result = lifecycle.stop_containers(&ids(&["a"]), &cancel).await;
        assert!(result.is_err());
        // The container may have stopped anyway; the restart obligation
        // must survive the error.
        assert_eq!(lifecycle.queued(), &ids(&["a"]));
    }

    #[tokio::test]
    async fn test_exclusion_keeps_entry_queued() {
        let mut runtime = MockRuntime::new();
        runtime.expect_lookup().returning(|_| Ok(brief("x", true)));
        runtime.expect_stop().times(2).returning(|_| Ok(()));
        runtime
            .expect_start()
            .with(eq("a"))
            .times(1)
            .returning(|_| Ok(()));

        let cancel = CancellationToken::new();
        let mut lifecycle = Lifecycle::new(&runtime);
        lifecycle
            .stop_containers(&ids(&["a", "b"]), &cancel)
            .await
            .unwrap();
        lifecycle
            .start_containers(&ids(&["b"]), &cancel)
            .await
            .unwrap();
        assert_eq!(lifecycle.queued(), &ids(&["b"]));
    }

    #[tokio::test]
    async fn test_cancellation_observed_between_operations() {
        let mut runtime = MockRuntime::new();
        runtime.expect_lookup().returning(|_| Ok(brief("a", true)));
        // Only the first container gets stopped: the token is honored
        // before the second stop begins.
        runtime
            .expect_stop()
            .with(eq("a"))
            .times(1)
            .returning(|_| Ok(()));

        runtime.expect_start().never();

        let mut lifecycle = Lifecycle::new(&runtime);

        // Cancel before the call: nothing at all must be stopped.
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let result = lifecycle.stop_containers(&ids(&["b"]), &cancelled).await;
        assert!(matches!(result, Err(TaskError::Cancelled)));
        assert!(lifecycle.queued().is_empty());

        // A fresh token lets the stop proceed.
        let fresh = CancellationToken::new();
        lifecycle
            .stop_containers(&ids(&["a"]), &fresh)
            .await
            .unwrap();
        assert_eq!(lifecycle.queued(), &ids(&["a"]));
    }

    #[tokio::test]
    async fn test_failed_start_keeps_remaining_queue() {
        let mut runtime = MockRuntime::new();
        runtime.expect_lookup().returning(|_| Ok(brief("x", true)));
        runtime.expect_stop().times(2).returning(|_| Ok(()));
        runtime
            .expect_start()
            .with(eq("a"))
            .times(1)
            .returning(|_| Err(anyhow!("start failed")));

        let cancel = CancellationToken::new();
        let mut lifecycle = Lifecycle::new(&runtime);
        lifecycle
            .stop_containers(&ids(&["a", "b"]), &cancel)
            .await
            .unwrap();
        let result = lifecycle.start_containers(&[], &cancel).await;
        assert!(result.is_err());
        // Neither the failed container nor the untouched one is dropped
        // from the queue.
        assert_eq!(lifecycle.queued(), &ids(&["a", "b"]));
    }
}
