//! Runs task operations and enforces the cancellation grace period.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::errors::{OperationError, TaskError};
use super::registry::{CancelOutcome, TaskRegistry};
use super::types::{TaskId, TaskProgress, TaskSpec};
use crate::config::TaskSettings;

type Running = Arc<Mutex<HashMap<TaskId, AbortHandle>>>;

/// Handle given to a supervised operation.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    registry: Arc<TaskRegistry>,
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Publish progress. Reports after the task has finished are dropped.
    pub fn report(&self, progress: TaskProgress) {
        if let Err(e) = self.registry.update_progress(&self.id, progress) {
            tracing::debug!(task = %self.id, error = %e, "progress update ignored");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Safe point: fails with `Cancelled` if cancellation was requested, and
    /// waits here while the task is paused.
    pub async fn checkpoint(&self) -> Result<(), OperationError> {
        let mut paused = self.paused.clone();
        loop {
            if self.cancel.is_cancelled() {
                return Err(OperationError::Cancelled);
            }
            if !*paused.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(OperationError::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Spawns operations against registry tasks and commits their outcomes.
pub struct TaskSupervisor {
    registry: Arc<TaskRegistry>,
    grace: Duration,
    running: Running,
}

impl TaskSupervisor {
    pub fn new(registry: Arc<TaskRegistry>, settings: &TaskSettings) -> Self {
        Self {
            registry,
            grace: Duration::from_secs(settings.cancel_grace_secs),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Create a task for `spec`, start it, and drive `operation` on the runtime.
    ///
    /// The operation's return value decides the terminal status. If
    /// cancellation or failure has already been committed, the outcome is
    /// discarded.
    pub fn spawn<F, Fut>(&self, spec: TaskSpec, operation: F) -> Result<TaskId, TaskError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>, OperationError>> + Send + 'static,
    {
        let id = self.registry.create(spec);
        let signals = self.registry.attach(&id)?;
        self.registry.start(&id)?;

        let ctx = TaskContext {
            id: id.clone(),
            registry: Arc::clone(&self.registry),
            cancel: signals.cancel,
            paused: signals.paused,
        };

        let registry = Arc::clone(&self.registry);
        let running = Arc::clone(&self.running);
        let task_id = id.clone();

        // Held across the spawn so the operation cannot deregister first.
        let mut guard = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            let outcome = operation(ctx).await;
            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_id);
            commit(&registry, &task_id, outcome);
        });
        guard.insert(id.clone(), handle.abort_handle());
        drop(guard);

        Ok(id)
    }

    /// Cancel a task. Signalled operations get the grace period to stop on
    /// their own before they are aborted and the task is committed as
    /// `cancelled`.
    pub fn cancel(&self, id: &TaskId) -> Result<(), TaskError> {
        match self.registry.cancel(id)? {
            CancelOutcome::Cancelled => {
                self.abort(id);
                Ok(())
            }
            CancelOutcome::Requested { first: false } => Ok(()),
            CancelOutcome::Requested { first: true } => {
                let registry = Arc::clone(&self.registry);
                let running = Arc::clone(&self.running);
                let grace = self.grace;
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if registry.is_terminal(&id) != Some(false) {
                        return;
                    }
                    tracing::warn!(
                        task = %id,
                        grace_ms = grace.as_millis() as u64,
                        "operation ignored cancellation, forcing termination"
                    );
                    let handle = running
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                    if let Some(handle) = handle {
                        handle.abort();
                    }
                    if let Err(e) = registry.finish_cancelled(&id) {
                        tracing::debug!(task = %id, error = %e, "forced cancel lost the race");
                    }
                });
                Ok(())
            }
        }
    }

    /// Number of operations currently being driven.
    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Abort every running operation and commit them as cancelled.
    pub fn shutdown(&self) {
        let handles: Vec<(TaskId, AbortHandle)> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, handle) in handles {
            handle.abort();
            if let Err(e) = self.registry.finish_cancelled(&id) {
                tracing::debug!(task = %id, error = %e, "task already finished at shutdown");
            }
        }
    }

    fn abort(&self, id: &TaskId) {
        let handle = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

fn commit(registry: &TaskRegistry, id: &TaskId, outcome: Result<Option<Value>, OperationError>) {
    let result = match outcome {
        Ok(value) => registry.complete(id, value),
        Err(OperationError::Cancelled) => registry.finish_cancelled(id),
        Err(OperationError::Failed { message }) => registry.fail(id, message),
    };
    if let Err(e) = result {
        tracing::debug!(task = %id, error = %e, "outcome discarded");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::tasks::{TaskKind, TaskStatus};

    fn supervisor(grace_secs: u64) -> TaskSupervisor {
        let settings = TaskSettings {
            cancel_grace_secs: grace_secs,
            ..TaskSettings::default()
        };
        let registry = Arc::new(TaskRegistry::new(Arc::new(EventBus::new()), &settings));
        TaskSupervisor::new(registry, &settings)
    }

    /// Runs until cancelled, checking in every few milliseconds.
    async fn worker(ctx: TaskContext) -> Result<Option<Value>, OperationError> {
        loop {
            ctx.checkpoint().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_terminal(sup: &TaskSupervisor, id: &TaskId) -> TaskStatus {
        for _ in 0..200 {
            let task = sup.registry().get(id).unwrap();
            if task.status.is_terminal() {
                return task.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never finished");
    }

    #[tokio::test]
    async fn test_operation_result_is_committed() {
        let sup = supervisor(5);
        let id = sup
            .spawn(TaskSpec::new(TaskKind::Async, "ok"), |ctx| async move {
                ctx.report(TaskProgress::with_total(1, 1, "done"));
                Ok::<_, OperationError>(Some(serde_json::json!(7)))
            })
            .unwrap();
        assert_eq!(wait_terminal(&sup, &id).await, TaskStatus::Completed);
        assert_eq!(sup.registry().get(&id).unwrap().result, Some(serde_json::json!(7)));
        assert_eq!(sup.running_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_on_task() {
        let sup = supervisor(5);
        let id = sup
            .spawn(TaskSpec::new(TaskKind::Shell, "bad"), |_| async move {
                Err::<Option<Value>, _>(OperationError::failed("exit status 2"))
            })
            .unwrap();
        assert_eq!(wait_terminal(&sup, &id).await, TaskStatus::Failed);
        assert_eq!(
            sup.registry().get(&id).unwrap().error.as_deref(),
            Some("exit status 2")
        );
    }

    #[tokio::test]
    async fn test_cooperative_cancel() {
        let sup = supervisor(5);
        let id = sup.spawn(TaskSpec::new(TaskKind::Sync, "loop"), worker).unwrap();

        sup.cancel(&id).unwrap();
        assert_eq!(wait_terminal(&sup, &id).await, TaskStatus::Cancelled);
        assert!(matches!(sup.cancel(&id), Err(TaskError::Conflict { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_termination_after_grace() {
        let sup = supervisor(2);
        let id = sup
            .spawn(TaskSpec::new(TaskKind::Async, "stubborn"), |_ctx| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, OperationError>(None)
            })
            .unwrap();

        sup.cancel(&id).unwrap();
        sup.cancel(&id).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sup.registry().get(&id).unwrap().status, TaskStatus::Running);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sup.registry().get(&id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(sup.running_count(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_waits_while_paused() {
        let sup = supervisor(5);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let id = sup
            .spawn(TaskSpec::new(TaskKind::Async, "pausable"), move |ctx| async move {
                for step in 0..3u64 {
                    ctx.checkpoint().await?;
                    let _ = tx.send(step);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Ok::<_, OperationError>(None)
            })
            .unwrap();

        assert_eq!(rx.recv().await, Some(0));
        sup.registry().pause(&id).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(sup.registry().get(&id).unwrap().status, TaskStatus::Paused);

        sup.registry().resume(&id).unwrap();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(wait_terminal(&sup, &id).await, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelling_one_task_leaves_others_running() {
        let sup = supervisor(5);
        let spec = || TaskSpec::new(TaskKind::Async, "worker");
        let a = sup.spawn(spec(), worker).unwrap();
        let b = sup.spawn(spec(), worker).unwrap();

        sup.cancel(&a).unwrap();
        assert_eq!(wait_terminal(&sup, &a).await, TaskStatus::Cancelled);
        assert_eq!(sup.registry().get(&b).unwrap().status, TaskStatus::Running);
        sup.shutdown();
        assert_eq!(sup.registry().get(&b).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_finished_tasks_alone() {
        let sup = supervisor(5);
        let id = sup.spawn(TaskSpec::new(TaskKind::Async, "racing"), worker).unwrap();
        // Committed outside the operation, which is still registered as running.
        sup.registry().complete(&id, None).unwrap();
        assert_eq!(sup.running_count(), 1);

        sup.shutdown();
        assert_eq!(sup.running_count(), 0);
        assert_eq!(sup.registry().get(&id).unwrap().status, TaskStatus::Completed);
    }
}
