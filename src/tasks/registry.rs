//! Task registry: the single owner of task state.
//!
//! Every transition is checked and applied under one short-lived lock, and
//! the resulting snapshot is published on the event bus before the lock is
//! released. Terminal tasks reject all further mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::errors::TaskError;
use super::types::{Task, TaskCounts, TaskFilter, TaskId, TaskProgress, TaskSpec, TaskStatus};
use crate::config::TaskSettings;
use crate::events::{EventBus, HubEvent, Snapshot};
use crate::store::Persistence;

/// What `cancel` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was committed as `cancelled` immediately.
    Cancelled,
    /// The owning operation was signalled. `first` is false when a request
    /// was already outstanding.
    Requested { first: bool },
}

/// Signals handed to the operation that owns a task.
#[derive(Debug, Clone)]
pub struct TaskSignals {
    pub cancel: CancellationToken,
    pub paused: watch::Receiver<bool>,
}

struct Entry {
    task: Task,
    /// An operation is driving this task and will observe cancellation.
    attached: bool,
    cancel_requested: bool,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

impl Entry {
    fn new(task: Task) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            task,
            attached: false,
            cancel_requested: false,
            cancel: CancellationToken::new(),
            pause,
        }
    }
}

/// In-memory task registry.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, Entry>>,
    bus: Arc<EventBus>,
    max_history: usize,
    store: Option<Arc<dyn Persistence>>,
}

impl TaskRegistry {
    pub fn new(bus: Arc<EventBus>, settings: &TaskSettings) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            bus,
            max_history: settings.max_history,
            store: None,
        }
    }

    /// Mirror terminal tasks into `store`.
    pub fn with_store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Entry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Register a new `pending` task.
    pub fn create(&self, spec: TaskSpec) -> TaskId {
        let mut tasks = self.lock();
        let task = Task::new(spec, self.bus.next_revision());
        let id = task.id.clone();
        tracing::debug!(task = %id, kind = ?task.kind, name = %task.name, "task created");
        self.bus.publish(HubEvent::TaskCreated { task: task.clone() });
        tasks.insert(id.clone(), Entry::new(task));
        id
    }

    /// `pending → running`.
    pub fn start(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.transition(id, "start", |entry| {
            expect_status(entry, "start", &[TaskStatus::Pending])?;
            entry.task.status = TaskStatus::Running;
            entry.task.started_at = Some(Utc::now());
            Ok(())
        })
    }

    pub fn update_progress(&self, id: &TaskId, progress: TaskProgress) -> Result<Task, TaskError> {
        self.transition(id, "update", |entry| {
            expect_active(entry, "update")?;
            entry.task.progress = progress.normalized();
            Ok(())
        })
    }

    /// Commit a successful outcome.
    pub fn complete(&self, id: &TaskId, result: Option<Value>) -> Result<Task, TaskError> {
        self.transition(id, "complete", |entry| {
            expect_status(entry, "complete", &[TaskStatus::Running, TaskStatus::Paused])?;
            let progress = &mut entry.task.progress;
            progress.percentage = Some(100.0);
            if let Some(total) = progress.total {
                progress.current = total;
            }
            entry.task.result = result;
            entry.task.finish(TaskStatus::Completed);
            Ok(())
        })
    }

    pub fn fail(&self, id: &TaskId, error: impl Into<String>) -> Result<Task, TaskError> {
        let error = error.into();
        self.transition(id, "fail", |entry| {
            expect_active(entry, "fail")?;
            entry.task.error = Some(error);
            entry.task.finish(TaskStatus::Failed);
            Ok(())
        })
    }

    /// Request cancellation.
    ///
    /// Pending tasks, and running tasks with no attached operation, are
    /// cancelled on the spot. Otherwise the operation is signalled and is
    /// expected to acknowledge through [`finish_cancelled`](Self::finish_cancelled).
    pub fn cancel(&self, id: &TaskId) -> Result<CancelOutcome, TaskError> {
        let mut tasks = self.lock();
        let entry = tasks.get_mut(id).ok_or_else(|| not_found(id))?;
        expect_active(entry, "cancel")?;
        if !entry.task.cancellable {
            return Err(TaskError::NotCancellable { id: id.clone() });
        }

        entry.cancel.cancel();
        let immediate = entry.task.status == TaskStatus::Pending || !entry.attached;
        if !immediate {
            let first = !entry.cancel_requested;
            entry.cancel_requested = true;
            if first {
                tracing::info!(task = %id, "cancellation requested");
            }
            return Ok(CancelOutcome::Requested { first });
        }

        entry.task.finish(TaskStatus::Cancelled);
        let task = self.stamp_and_publish(entry);
        let evicted = self.evict_history(&mut tasks);
        drop(tasks);

        tracing::info!(task = %id, "task cancelled");
        self.persist(&task, evicted);
        Ok(CancelOutcome::Cancelled)
    }

    /// Commit `cancelled` for a task whose operation stopped (or was stopped).
    pub fn finish_cancelled(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.transition(id, "cancel", |entry| {
            expect_active(entry, "cancel")?;
            entry.cancel.cancel();
            entry.task.finish(TaskStatus::Cancelled);
            Ok(())
        })
    }

    /// `running → paused`.
    pub fn pause(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.transition(id, "pause", |entry| {
            expect_status(entry, "pause", &[TaskStatus::Running])?;
            if !entry.task.pausable {
                return Err(TaskError::NotPausable {
                    id: entry.task.id.clone(),
                });
            }
            if entry.cancel_requested {
                return Err(conflict(entry, "pause"));
            }
            entry.task.status = TaskStatus::Paused;
            entry.pause.send_replace(true);
            Ok(())
        })
    }

    /// `paused → running`.
    pub fn resume(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.transition(id, "resume", |entry| {
            expect_status(entry, "resume", &[TaskStatus::Paused])?;
            entry.task.status = TaskStatus::Running;
            entry.pause.send_replace(false);
            Ok(())
        })
    }

    /// Mark `id` as driven by an operation and hand out its signals.
    pub(crate) fn attach(&self, id: &TaskId) -> Result<TaskSignals, TaskError> {
        let mut tasks = self.lock();
        let entry = tasks.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.attached = true;
        Ok(TaskSignals {
            cancel: entry.cancel.clone(),
            paused: entry.pause.subscribe(),
        })
    }

    /// Apply `f` to one task, stamp a new version, publish, and evict old
    /// history. `f` must leave the entry untouched when it returns an error.
    fn transition<F>(&self, id: &TaskId, op: &'static str, f: F) -> Result<Task, TaskError>
    where
        F: FnOnce(&mut Entry) -> Result<(), TaskError>,
    {
        let mut tasks = self.lock();
        let entry = tasks.get_mut(id).ok_or_else(|| not_found(id))?;
        f(entry)?;
        let task = self.stamp_and_publish(entry);
        let evicted = if task.status.is_terminal() {
            self.evict_history(&mut tasks)
        } else {
            Vec::new()
        };
        drop(tasks);

        if task.status.is_terminal() {
            tracing::info!(
                task = %id,
                op,
                status = %task.status,
                duration_ms = task.duration_ms.unwrap_or(0),
                "task finished"
            );
            self.persist(&task, evicted);
        }
        Ok(task)
    }

    fn stamp_and_publish(&self, entry: &mut Entry) -> Task {
        entry.task.version = self.bus.next_revision();
        let task = entry.task.clone();
        self.bus.publish(HubEvent::TaskUpdated { task: task.clone() });
        task
    }

    /// Drop the oldest terminal tasks beyond the history cap.
    fn evict_history(&self, tasks: &mut HashMap<TaskId, Entry>) -> Vec<TaskId> {
        // A terminal task's version is the revision of its final transition.
        let mut terminal: Vec<(u64, TaskId)> = tasks
            .values()
            .filter(|e| e.task.status.is_terminal())
            .map(|e| (e.task.version, e.task.id.clone()))
            .collect();
        if terminal.len() <= self.max_history {
            return Vec::new();
        }
        terminal.sort();
        let excess = terminal.len() - self.max_history;
        let evicted: Vec<TaskId> = terminal.into_iter().take(excess).map(|(_, id)| id).collect();
        for id in &evicted {
            tasks.remove(id);
            self.bus.publish(HubEvent::TaskRemoved {
                task_id: id.clone(),
                revision: self.bus.next_revision(),
            });
        }
        evicted
    }

    fn persist(&self, task: &Task, evicted: Vec<TaskId>) {
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted task history");
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.record_task(task) {
                tracing::warn!(task = %task.id, error = %e, "failed to persist task history");
            }
        }
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub fn get(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.lock()
            .get(id)
            .map(|e| e.task.clone())
            .ok_or_else(|| not_found(id))
    }

    /// Tasks matching `filter`, newest first.
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .lock()
            .values()
            .filter(|e| filter.matches(&e.task))
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for entry in self.lock().values() {
            counts.add(entry.task.status);
        }
        counts
    }

    /// Whether the task has reached a terminal status. `None` if unknown.
    pub fn is_terminal(&self, id: &TaskId) -> Option<bool> {
        self.lock().get(id).map(|e| e.task.status.is_terminal())
    }

    /// All tasks plus the revision they are consistent with.
    pub fn snapshot(&self) -> Snapshot<Task> {
        let tasks = self.lock();
        Snapshot {
            items: tasks.values().map(|e| e.task.clone()).collect(),
            watermark: self.bus.current_revision(),
        }
    }

    /// Remove every terminal task. Returns how many were removed.
    pub fn clear_terminal(&self) -> usize {
        let mut tasks = self.lock();
        let terminal: Vec<TaskId> = tasks
            .values()
            .filter(|e| e.task.status.is_terminal())
            .map(|e| e.task.id.clone())
            .collect();
        for id in &terminal {
            tasks.remove(id);
            self.bus.publish(HubEvent::TaskRemoved {
                task_id: id.clone(),
                revision: self.bus.next_revision(),
            });
        }
        terminal.len()
    }
}

fn not_found(id: &TaskId) -> TaskError {
    TaskError::NotFound { id: id.clone() }
}

fn conflict(entry: &Entry, operation: &'static str) -> TaskError {
    TaskError::Conflict {
        id: entry.task.id.clone(),
        status: entry.task.status,
        operation,
    }
}

fn expect_status(entry: &Entry, op: &'static str, allowed: &[TaskStatus]) -> Result<(), TaskError> {
    if allowed.contains(&entry.task.status) {
        Ok(())
    } else {
        Err(conflict(entry, op))
    }
}

fn expect_active(entry: &Entry, op: &'static str) -> Result<(), TaskError> {
    if entry.task.status.is_terminal() {
        Err(conflict(entry, op))
    } else {
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
