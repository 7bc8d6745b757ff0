//! Task commands and tool calls.
//!
//! Every tool call runs as a `remote-tool-call` task under the supervisor,
//! so it shows up in task listings, reports progress and can be cancelled
//! through `cancel_task` like any other task.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::mcp_client::{
    CallOptions, McpClient, McpError, McpResult, ProgressUpdate, ServerId, ToolCallResult,
};
use crate::store::{CallAuditEntry, CallStatus, Persistence};
use crate::tasks::{
    OperationError, Task, TaskContext, TaskCounts, TaskError, TaskFilter, TaskId, TaskKind,
    TaskProgress, TaskSpec,
};

use super::{Hub, HubError};

/// A tool call that has been started as a task.
pub struct ToolCallHandle {
    task_id: TaskId,
    result: oneshot::Receiver<McpResult<ToolCallResult>>,
}

impl ToolCallHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Wait for the tool result.
    ///
    /// A result with `is_error` set is returned as `Ok`; the task itself is
    /// marked failed.
    pub async fn result(self) -> Result<ToolCallResult, HubError> {
        match self.result.await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => Err(TaskError::Aborted { id: self.task_id }.into()),
        }
    }
}

impl Hub {
    // ─── Tool calls ─────────────────────────────────────────────────────────

    /// Start `tool` on `server_id` as a tracked task and return immediately.
    ///
    /// When `progress` is given, `notifications/progress` frames are relayed
    /// to it in arrival order.
    pub fn start_tool_call(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Option<Value>,
        progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    ) -> Result<ToolCallHandle, HubError> {
        let server = self.servers.get(server_id)?;
        let spec = TaskSpec::new(TaskKind::RemoteToolCall, format!("{}: {tool}", server.name))
            .description(format!("tools/call {tool}"))
            .server(server_id.clone())
            .tag(tool)
            .pausable(false);

        let call = ToolCall {
            client: self.client.clone(),
            store: Arc::clone(&self.store),
            server_id: server_id.clone(),
            tool: tool.to_string(),
            arguments,
            progress,
        };
        let (tx, rx) = oneshot::channel();
        let task_id = self
            .supervisor
            .spawn(spec, move |ctx| async move { call.run(ctx, tx).await })?;

        tracing::debug!(task = %task_id, server = %server_id, tool = %tool, "tool call started");
        Ok(ToolCallHandle {
            task_id,
            result: rx,
        })
    }

    /// Call a tool and wait for its result.
    pub async fn call_tool(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Option<Value>,
    ) -> Result<ToolCallResult, HubError> {
        self.start_tool_call(server_id, tool, arguments, None)?
            .result()
            .await
    }

    /// Call a tool in streaming mode, relaying progress frames to `progress`.
    pub async fn call_tool_streaming(
        &self,
        server_id: &ServerId,
        tool: &str,
        arguments: Option<Value>,
        progress: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Result<ToolCallResult, HubError> {
        self.start_tool_call(server_id, tool, arguments, Some(progress))?
            .result()
            .await
    }

    // ─── Tasks ──────────────────────────────────────────────────────────────

    pub fn list_tasks(&self, filter: Option<TaskFilter>) -> Vec<Task> {
        self.tasks.list(&filter.unwrap_or_default())
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task, HubError> {
        Ok(self.tasks.get(id)?)
    }

    pub fn get_task_count(&self) -> TaskCounts {
        self.tasks.counts()
    }

    /// Request cancellation. Terminal or non-cancellable tasks are a conflict.
    pub fn cancel_task(&self, id: &TaskId) -> Result<(), HubError> {
        self.supervisor.cancel(id)?;
        tracing::info!(task = %id, "task cancellation requested");
        Ok(())
    }

    pub fn pause_task(&self, id: &TaskId) -> Result<Task, HubError> {
        Ok(self.tasks.pause(id)?)
    }

    pub fn resume_task(&self, id: &TaskId) -> Result<Task, HubError> {
        Ok(self.tasks.resume(id)?)
    }

    /// Drop every terminal task from the registry. Returns how many went.
    pub fn clear_completed_tasks(&self) -> usize {
        let removed = self.tasks.clear_terminal();
        tracing::info!(removed, "cleared finished tasks");
        removed
    }

    /// Persisted terminal tasks, newest first.
    pub fn task_history(&self, limit: usize) -> Result<Vec<Task>, HubError> {
        Ok(self.store.task_history(limit)?)
    }
}

// ─── Tool call operation ─────────────────────────────────────────────────────

struct ToolCall {
    client: McpClient,
    store: Arc<dyn Persistence>,
    server_id: ServerId,
    tool: String,
    arguments: Option<Value>,
    progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl ToolCall {
    async fn run(
        self,
        ctx: TaskContext,
        result_tx: oneshot::Sender<McpResult<ToolCallResult>>,
    ) -> Result<Option<Value>, OperationError> {
        let started = Instant::now();
        let cancel = ctx.cancellation_token();

        let outcome = match &self.progress {
            Some(sink) => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let options = CallOptions::streaming(tx).with_cancel(cancel);
                let call = self
                    .client
                    .call_tool(&self.server_id, &self.tool, self.arguments.clone(), options);
                let relay = async {
                    while let Some(update) = rx.recv().await {
                        ctx.report(task_progress(&self.tool, &update));
                        let _ = sink.send(update);
                    }
                };
                let (outcome, ()) = tokio::join!(call, relay);
                outcome
            }
            None => {
                let options = CallOptions::default().with_cancel(cancel);
                self.client
                    .call_tool(&self.server_id, &self.tool, self.arguments.clone(), options)
                    .await
            }
        };

        let status = match &outcome {
            Ok(result) if result.is_error => CallStatus::ToolError,
            Ok(_) => CallStatus::Success,
            Err(McpError::Cancelled { .. }) => CallStatus::Cancelled,
            Err(_) => CallStatus::Failed,
        };
        let entry = CallAuditEntry::new(
            self.server_id.clone(),
            self.tool.as_str(),
            self.arguments.as_ref(),
            status,
            started.elapsed().as_millis() as u64,
        );
        if let Err(e) = self.store.record_call(&entry) {
            tracing::warn!(server = %self.server_id, tool = %self.tool, error = %e, "failed to record call audit");
        }

        let task_outcome = match &outcome {
            Ok(result) if result.is_error => Err(OperationError::failed(result.text())),
            Ok(result) => serde_json::to_value(result)
                .map(Some)
                .map_err(|e| OperationError::failed(format!("unserializable tool result: {e}"))),
            Err(e) => Err(OperationError::from(e.clone())),
        };
        // The caller may have stopped waiting.
        let _ = result_tx.send(outcome);
        task_outcome
    }
}

fn task_progress(tool: &str, update: &ProgressUpdate) -> TaskProgress {
    let message = update
        .message
        .clone()
        .unwrap_or_else(|| format!("{tool} running"));
    let current = update.progress.max(0.0) as u64;
    match update.total {
        Some(total) if total > 0.0 => TaskProgress::with_total(current, total as u64, message),
        _ => TaskProgress {
            current,
            ..TaskProgress::indeterminate(message)
        },
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
