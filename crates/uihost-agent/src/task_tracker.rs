//! Registry of background tasks and their progress.
//!
//! State lives behind a std mutex so progress callbacks running inside output
//! readers can update it synchronously. Notifications are queued while the
//! lock is held and delivered by a single dispatcher task, which keeps the
//! per-task order intact even though delivery itself is asynchronous.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use uihost_types::{Notification, TaskId, TaskState, TaskStatus};

use crate::error::Error;

/// Where task notifications go. Delivery is best effort.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, payload: Notification) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Sink that only writes notifications to the log.
#[derive(Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, payload: Notification) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(&payload)?;
            tracing::debug!(target: "uihost_agent::notify", "{json}");
            Ok(())
        })
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Cancellation control for one unit of work.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancel_tx: Arc<watch::Sender<bool>>,
    requested: Arc<AtomicBool>,
}

/// Worker side of a [`TaskHandle`].
#[derive(Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    requested: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        let requested = Arc::new(AtomicBool::new(false));
        (
            Self {
                cancel_tx: Arc::new(tx),
                requested: requested.clone(),
            },
            CancelSignal { rx, requested },
        )
    }

    /// Marks the task as cancelled without interrupting it; a failure it reports
    /// afterwards is recorded as a cancellation.
    pub fn request_cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Interrupts the unit of work at its next suspension point.
    pub fn cancel(&self) {
        self.request_cancel();
        let _ = self.cancel_tx.send(true);
    }
}

impl TaskHandle {
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl CancelSignal {
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&mut self) {
        // A closed channel means the handle is gone; nobody can cancel anymore.
        if self.rx.wait_for(|v| *v).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub status_text: Option<String>,
    pub status: Option<TaskState>,
    pub processed_units: Option<u64>,
    pub total_units: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The task was live; cancellation was requested and the entry stays until it settles.
    Cancelling,
    Removed,
    NotFound,
}

#[derive(Debug)]
struct TrackedTask {
    status: TaskStatus,
    handle: Option<TaskHandle>,
}

#[derive(Clone)]
pub struct TaskTracker {
    tasks: Arc<Mutex<HashMap<TaskId, TrackedTask>>>,
    notify_tx: mpsc::UnboundedSender<Notification>,
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker").finish_non_exhaustive()
    }
}

impl TaskTracker {
    /// Must be called inside a Tokio runtime: spawns the notification dispatcher.
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Notification>();
        tokio::spawn(async move {
            while let Some(payload) = notify_rx.recv().await {
                let task_id = payload.task_id().clone();
                if let Err(err) = sink.notify(payload).await {
                    tracing::warn!(%task_id, error = %err, "notification delivery failed");
                }
            }
        });

        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            notify_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, TrackedTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, payload: Notification) {
        // Only fails once the dispatcher is gone (runtime shutdown).
        let _ = self.notify_tx.send(payload);
    }

    pub fn start_tracking(
        &self,
        task_id: TaskId,
        label: &str,
        identifier: &str,
        handle: Option<TaskHandle>,
    ) {
        let now = now_unix_ms();
        let status = TaskStatus {
            task_id: task_id.clone(),
            kind: label.to_string(),
            identifier: identifier.to_string(),
            status: TaskState::Pending,
            progress: 0.0,
            status_text: None,
            processed_units: None,
            total_units: None,
            error_message: None,
            result_path: None,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
        };

        let mut tasks = self.lock();
        if let Some(old) = tasks.get(&task_id)
            && !old.status.status.is_terminal()
        {
            tracing::warn!(%task_id, "replacing a live tracked task");
        }
        tasks.insert(
            task_id.clone(),
            TrackedTask {
                status: status.clone(),
                handle,
            },
        );
        self.emit(Notification::Update { data: status });
        tracing::info!(%task_id, kind = label, identifier, "task tracked");
    }

    /// Applies `f` to a live task and notifies. Terminal tasks are left untouched.
    fn mutate(&self, task_id: &TaskId, f: impl FnOnce(&mut TaskStatus)) -> bool {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(task_id) else {
            tracing::debug!(%task_id, "update for unknown task ignored");
            return false;
        };
        if task.status.status.is_terminal() {
            tracing::debug!(
                %task_id,
                status = ?task.status.status,
                "update for terminal task ignored"
            );
            return false;
        }
        f(&mut task.status);
        task.status.updated_at_unix_ms = now_unix_ms();
        if task.status.status.is_terminal() {
            task.handle = None;
        }
        self.emit(Notification::Update {
            data: task.status.clone(),
        });
        true
    }

    pub fn update_progress(
        &self,
        task_id: &TaskId,
        progress: f64,
        status_text: impl Into<String>,
    ) -> bool {
        self.update_task_progress(
            task_id,
            ProgressUpdate {
                progress,
                status_text: Some(status_text.into()),
                ..Default::default()
            },
        )
    }

    pub fn update_task_progress(&self, task_id: &TaskId, update: ProgressUpdate) -> bool {
        self.mutate(task_id, |st| {
            let progress = if update.progress.is_finite() {
                update.progress.clamp(0.0, 100.0)
            } else {
                st.progress
            };
            st.progress = st.progress.max(progress);
            if let Some(text) = update.status_text {
                st.status_text = Some(text);
            }
            // Terminal transitions go through complete/fail.
            if let Some(status) = update.status.filter(|s| !s.is_terminal()) {
                st.status = status;
            }
            if update.processed_units.is_some() {
                st.processed_units = update.processed_units;
            }
            if update.total_units.is_some() {
                st.total_units = update.total_units;
            }
        })
    }

    pub fn complete(&self, task_id: &TaskId, result_path: Option<String>) -> bool {
        let done = self.mutate(task_id, |st| {
            st.status = TaskState::Completed;
            st.progress = 100.0;
            st.result_path = result_path;
        });
        if done {
            tracing::info!(%task_id, "task completed");
        }
        done
    }

    pub fn fail(&self, task_id: &TaskId, message: impl Into<String>, cancelled: bool) -> bool {
        let message = message.into();
        let done = self.mutate(task_id, |st| {
            st.status = if cancelled {
                TaskState::Cancelled
            } else {
                TaskState::Error
            };
            st.error_message = Some(message.clone());
        });
        if done {
            if cancelled {
                tracing::info!(%task_id, "task cancelled");
            } else {
                tracing::warn!(%task_id, error = %message, "task failed");
            }
        }
        done
    }

    /// Cancels a live task, or forgets a settled one.
    pub fn remove(&self, task_id: &TaskId) -> RemoveOutcome {
        let mut tasks = self.lock();
        let Some(task) = tasks.get(task_id) else {
            return RemoveOutcome::NotFound;
        };
        if !task.status.status.is_terminal()
            && let Some(handle) = &task.handle
        {
            handle.cancel();
            tracing::info!(%task_id, "cancellation requested");
            return RemoveOutcome::Cancelling;
        }
        tasks.remove(task_id);
        self.emit(Notification::Remove {
            task_id: task_id.clone(),
        });
        RemoveOutcome::Removed
    }

    /// Marks a live task so its next failure is reported as a cancellation.
    pub fn request_cancel(&self, task_id: &TaskId) -> bool {
        let tasks = self.lock();
        match tasks.get(task_id).and_then(|t| t.handle.as_ref()) {
            Some(handle) => {
                handle.request_cancel();
                true
            }
            None => false,
        }
    }

    /// Whether cancellation was requested for a task that is still live.
    pub fn cancel_requested(&self, task_id: &TaskId) -> bool {
        self.lock()
            .get(task_id)
            .and_then(|t| t.handle.as_ref())
            .is_some_and(TaskHandle::is_requested)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.lock().get(task_id).map(|t| t.status.clone())
    }

    pub fn list_all(&self) -> Vec<TaskStatus> {
        let mut out: Vec<TaskStatus> = self.lock().values().map(|t| t.status.clone()).collect();
        out.sort_by(|a, b| {
            a.created_at_unix_ms
                .cmp(&b.created_at_unix_ms)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        out
    }

    /// Tracks `work` as a cancellable background task and returns immediately.
    ///
    /// `Ok(path)` completes the task with `path` as its result; an error fails it
    /// (or cancels it, when cancellation was requested first).
    pub fn spawn<F>(&self, task_id: TaskId, label: &str, identifier: &str, work: F)
    where
        F: Future<Output = crate::error::Result<Option<String>>> + Send + 'static,
    {
        let (handle, mut signal) = TaskHandle::new();
        self.start_tracking(task_id.clone(), label, identifier, Some(handle));

        let tracker = self.clone();
        tokio::spawn(async move {
            // Let the caller observe the pending task before work starts reporting.
            tokio::task::yield_now().await;

            tokio::select! {
                res = work => match res {
                    Ok(_) if signal.is_requested() => {
                        tracing::info!(%task_id, "work finished after cancel request");
                        tracker.fail(&task_id, "cancelled", true);
                    }
                    Ok(result_path) => {
                        tracker.complete(&task_id, result_path);
                    }
                    Err(err) if signal.is_requested() => {
                        tracing::debug!(%task_id, error = %err, "failure after cancel request");
                        tracker.fail(&task_id, "cancelled", true);
                    }
                    Err(err) => {
                        let message = match &err {
                            Error::Other(_) => {
                                tracing::error!(%task_id, error = ?err, "unexpected task error");
                                format!("operation failed: {}", err.user_message())
                            }
                            _ => err.user_message(),
                        };
                        tracker.fail(&task_id, message, false);
                    }
                },
                _ = signal.cancelled() => {
                    tracker.fail(&task_id, "cancelled", true);
                }
            }
        });
    }
}
