//! Launches and stops managed UI processes and keeps a durable record of which
//! PIDs belong to which task, so supervision survives an agent restart.
//!
//! Lifecycle of one managed process:
//!
//! ```text
//! Starting -> Running -> Terminating -> (stopped | exited)
//! ```
//!
//! The final outcome is reported through the [`TaskTracker`]; the entry itself
//! (and its row in the persisted registry) is dropped once the process is gone.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::watch;
use uihost_types::{InstallationId, TaskId, TaskState};

use crate::{
    catalog::Catalog,
    config::AgentConfig,
    error::{Error, Result},
    instance_registry::{InstanceActivity, InstanceRegistry},
    json_store,
    process::{LineCallback, LogBuffer, ProcessCommand, ProcessHandle, run_process, stream_output},
    setup,
    signals::{self, StopOutcome},
    task_tracker::{CancelSignal, ProgressUpdate, TaskHandle, TaskTracker},
};

/// Task label used for supervised processes.
pub const PROCESS_TASK_KIND: &str = "process";
pub const RECONCILED_STATUS_TEXT: &str = "running (reconciled)";

/// How often a reconciled (foreign) PID is re-checked.
const FOREIGN_POLL_INTERVAL: Duration = Duration::from_millis(1000);
/// Output lines folded into the error message of a crashed process.
const CRASH_TAIL_LINES: usize = 40;

pub type LivenessCheck = Arc<dyn Fn(u32) -> bool + Send + Sync>;

/// On-disk shape: `{"<task_id>": ["<installation_id>", <pid>]}`.
type RegistryFile = BTreeMap<TaskId, (InstallationId, u32)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Running,
    Terminating,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ManagedProcess {
    pub task_id: TaskId,
    pub installation_id: InstallationId,
    pub pid: Option<u32>,
    pub state: ProcessState,
    /// Adopted from the persisted registry rather than spawned by this agent.
    pub reconciled: bool,
}

#[derive(Debug)]
struct ProcessEntry {
    installation_id: InstallationId,
    pid: Option<u32>,
    state: ProcessState,
    /// Flips to `true` once a locally spawned child has exited. `None` for foreign PIDs.
    exited: Option<watch::Receiver<bool>>,
    stop_requested: bool,
    cancelled: bool,
}

type SharedLog = Arc<Mutex<LogBuffer>>;

struct Inner {
    registry_path: PathBuf,
    stop_grace: Duration,
    log_max_lines: usize,
    tracker: TaskTracker,
    instances: Arc<InstanceRegistry>,
    catalog: Arc<Catalog>,
    is_alive: LivenessCheck,
    entries: Mutex<HashMap<TaskId, ProcessEntry>>,
    /// Output tails, kept after exit until the installation is started again.
    logs: Mutex<HashMap<TaskId, (InstallationId, SharedLog)>>,
    write_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("registry_path", &self.inner.registry_path)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Opens the supervisor and reconciles the persisted registry against live PIDs.
    pub async fn open(
        config: &AgentConfig,
        tracker: TaskTracker,
        instances: Arc<InstanceRegistry>,
        catalog: Arc<Catalog>,
    ) -> Result<Self> {
        let is_alive: LivenessCheck = Arc::new(signals::is_process_alive);
        Self::open_with_liveness(config, tracker, instances, catalog, is_alive).await
    }

    pub async fn open_with_liveness(
        config: &AgentConfig,
        tracker: TaskTracker,
        instances: Arc<InstanceRegistry>,
        catalog: Arc<Catalog>,
        is_alive: LivenessCheck,
    ) -> Result<Self> {
        let sup = Self {
            inner: Arc::new(Inner {
                registry_path: config.process_registry_path(),
                stop_grace: config.stop_grace,
                log_max_lines: config.log_max_lines,
                tracker,
                instances,
                catalog,
                is_alive,
                entries: Mutex::new(HashMap::new()),
                logs: Mutex::new(HashMap::new()),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        };
        sup.reconcile().await?;
        Ok(sup)
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, ProcessEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn logs(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, (InstallationId, SharedLog)>> {
        self.inner.logs.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn reconcile(&self) -> Result<()> {
        let persisted: RegistryFile =
            json_store::load_or_default(&self.inner.registry_path, "process registry").await;
        let total = persisted.len();

        let mut live = Vec::new();
        for (task_id, (installation_id, pid)) in persisted {
            if (self.inner.is_alive)(pid) {
                live.push((task_id, installation_id, pid));
            } else {
                tracing::info!(%task_id, %installation_id, pid, "dropping dead process from registry");
            }
        }

        {
            let mut entries = self.entries();
            for (task_id, installation_id, pid) in &live {
                entries.insert(
                    task_id.clone(),
                    ProcessEntry {
                        installation_id: installation_id.clone(),
                        pid: Some(*pid),
                        state: ProcessState::Running,
                        exited: None,
                        stop_requested: false,
                        cancelled: false,
                    },
                );
            }
        }

        for (task_id, installation_id, pid) in live.iter().cloned() {
            let (handle, signal) = TaskHandle::new();
            self.inner.tracker.start_tracking(
                task_id.clone(),
                PROCESS_TASK_KIND,
                installation_id.as_str(),
                Some(handle),
            );
            self.inner.tracker.update_task_progress(
                &task_id,
                ProgressUpdate {
                    status: Some(TaskState::Running),
                    status_text: Some(RECONCILED_STATUS_TEXT.to_string()),
                    ..Default::default()
                },
            );
            tracing::info!(%task_id, %installation_id, pid, "reattached to running process");
            self.spawn_foreign_watch(task_id, pid, signal);
        }

        tracing::info!(
            path = %self.inner.registry_path.display(),
            persisted = total,
            live = live.len(),
            "process registry reconciled"
        );
        self.persist().await
    }

    fn snapshot(&self) -> RegistryFile {
        self.entries()
            .iter()
            .filter_map(|(task_id, e)| {
                e.pid
                    .map(|pid| (task_id.clone(), (e.installation_id.clone(), pid)))
            })
            .collect()
    }

    async fn persist(&self) -> Result<()> {
        let _writer = self.inner.write_lock.lock().await;
        let snapshot = self.snapshot();
        json_store::write_atomic(&self.inner.registry_path, &snapshot).await?;
        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(err) = self.persist().await {
            tracing::warn!(
                path = %self.inner.registry_path.display(),
                error = %err.user_message(),
                "failed to persist process registry"
            );
        }
    }

    /// Removes the entry for `task_id` (when it still refers to `pid`) and persists.
    async fn prune(&self, task_id: &TaskId, pid: Option<u32>) -> Option<ProcessEntry> {
        let removed = {
            let mut entries = self.entries();
            match entries.get(task_id) {
                Some(e) if pid.is_none() || e.pid == pid => entries.remove(task_id),
                _ => None,
            }
        };
        if removed.is_some() {
            self.persist_logged().await;
        }
        removed
    }

    pub fn is_running(&self, installation_id: &InstallationId) -> bool {
        self.entries()
            .values()
            .any(|e| e.installation_id == *installation_id)
    }

    pub fn list(&self) -> Vec<ManagedProcess> {
        let mut out: Vec<ManagedProcess> = self
            .entries()
            .iter()
            .map(|(task_id, e)| ManagedProcess {
                task_id: task_id.clone(),
                installation_id: e.installation_id.clone(),
                pid: e.pid,
                state: e.state,
                reconciled: e.exited.is_none() && e.state != ProcessState::Starting,
            })
            .collect();
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        out
    }

    /// Launches the installation's start command and tracks it under `task_id`.
    pub async fn start_process(&self, installation_id: &InstallationId, task_id: &TaskId) -> Result<()> {
        let record = self
            .inner
            .instances
            .get(installation_id)
            .ok_or_else(|| Error::not_found(format!("installation {installation_id}")))?;
        let install_dir = PathBuf::from(&record.path);
        if !install_dir.is_dir() {
            return Err(Error::bad_request(format!(
                "install path {} does not exist",
                install_dir.display()
            )));
        }
        let spec = self
            .inner
            .catalog
            .find(record.ui_kind.as_str())
            .ok_or_else(|| Error::bad_request(format!("unknown ui kind {}", record.ui_kind)))?;
        let (program, args) = spec
            .resolve_start_command(&setup::env_interpreter(&install_dir))
            .map_err(|e| Error::bad_request(e.to_string()))?;

        {
            let mut entries = self.entries();
            if entries.values().any(|e| e.installation_id == *installation_id) {
                return Err(Error::bad_request(format!(
                    "installation {installation_id} is already running"
                )));
            }
            if entries.contains_key(task_id) {
                return Err(Error::bad_request(format!("task {task_id} is already in use")));
            }
            entries.insert(
                task_id.clone(),
                ProcessEntry {
                    installation_id: installation_id.clone(),
                    pid: None,
                    state: ProcessState::Starting,
                    exited: None,
                    stop_requested: false,
                    cancelled: false,
                },
            );
        }

        let (handle, signal) = TaskHandle::new();
        self.inner.tracker.start_tracking(
            task_id.clone(),
            PROCESS_TASK_KIND,
            installation_id.as_str(),
            Some(handle),
        );

        match self
            .launch(installation_id, task_id, &install_dir, program, args, signal)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                self.entries().remove(task_id);
                self.inner.tracker.fail(task_id, err.user_message(), false);
                Err(err)
            }
        }
    }

    async fn launch(
        &self,
        installation_id: &InstallationId,
        task_id: &TaskId,
        install_dir: &Path,
        program: PathBuf,
        args: Vec<String>,
        signal: CancelSignal,
    ) -> Result<()> {
        // Detached: the process must outlive an agent restart to be reconciled later.
        let cmd = ProcessCommand::new(program)
            .args(args)
            .env("PYTHONUNBUFFERED", "1")
            .detached();
        tracing::info!(%task_id, %installation_id, command = %cmd.display(), "starting process");

        let handle = run_process(&cmd, install_dir)?;
        let pid = handle
            .pid
            .ok_or_else(|| Error::failed(format!("{} exited before reporting a pid", handle.program)))?;

        let log: SharedLog = Arc::new(Mutex::new(LogBuffer::new(self.inner.log_max_lines)));
        {
            let mut logs = self.logs();
            // One retained tail per installation.
            logs.retain(|_, (owner, _)| *owner != *installation_id);
            logs.insert(task_id.clone(), (installation_id.clone(), log.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        {
            let mut entries = self.entries();
            if let Some(e) = entries.get_mut(task_id) {
                e.pid = Some(pid);
                e.state = ProcessState::Running;
                e.exited = Some(exit_rx.clone());
            }
        }
        self.persist_logged().await;

        self.inner.tracker.update_task_progress(
            task_id,
            ProgressUpdate {
                status: Some(TaskState::Running),
                status_text: Some(format!("running (pid {pid})")),
                ..Default::default()
            },
        );
        tracing::info!(%task_id, %installation_id, pid, "process running");

        self.spawn_exit_watch(task_id.clone(), pid, handle, log, exit_tx);
        self.spawn_cancel_watch(task_id.clone(), signal, exit_rx);
        Ok(())
    }

    fn spawn_exit_watch(
        &self,
        task_id: TaskId,
        pid: u32,
        handle: ProcessHandle,
        log: SharedLog,
        exit_tx: watch::Sender<bool>,
    ) {
        let sup = self.clone();
        tokio::spawn(async move {
            let on_line: LineCallback = {
                let log = log.clone();
                Arc::new(move |line: &str| {
                    log.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_line(line.to_string());
                })
            };
            let res = stream_output(handle, Some(on_line)).await;
            let entry = sup.prune(&task_id, Some(pid)).await;
            let (stop_requested, cancelled) = entry
                .map(|e| (e.stop_requested, e.cancelled))
                .unwrap_or((false, false));
            let tracker = &sup.inner.tracker;

            match res {
                _ if cancelled => {
                    tracker.fail(&task_id, "cancelled", true);
                }
                Ok(_) if stop_requested => {
                    tracker.update_progress(&task_id, 0.0, "stopped");
                    tracker.complete(&task_id, None);
                }
                Ok(out) if out.success => {
                    tracing::info!(%task_id, pid, "process exited cleanly");
                    tracker.update_progress(&task_id, 0.0, "exited");
                    tracker.complete(&task_id, None);
                }
                Ok(out) => {
                    let tail = {
                        let log = log.lock().unwrap_or_else(|e| e.into_inner());
                        log.tail_after(0, CRASH_TAIL_LINES).0.join("\n")
                    };
                    let err = Error::failed_with_output(
                        format!("process exited with {}", out.exit_label()),
                        &tail,
                    );
                    tracker.fail(&task_id, err.user_message(), false);
                }
                Err(err) => {
                    tracker.fail(&task_id, err.user_message(), false);
                }
            }
            let _ = exit_tx.send(true);
        });
    }

    /// Routes a tracker-side cancellation (`TaskTracker::remove`) into a stop.
    fn spawn_cancel_watch(
        &self,
        task_id: TaskId,
        mut signal: CancelSignal,
        mut exit_rx: watch::Receiver<bool>,
    ) {
        let sup = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.cancelled() => {
                    if let Some(e) = sup.entries().get_mut(&task_id) {
                        e.cancelled = true;
                    }
                    if let Err(err) = sup.stop_process(&task_id).await {
                        tracing::warn!(%task_id, error = %err.user_message(), "stop after cancel failed");
                    }
                }
                _ = async { let _ = exit_rx.wait_for(|v| *v).await; } => {}
            }
        });
    }

    /// Watches a reconciled PID we cannot `wait` on.
    fn spawn_foreign_watch(
        &self,
        task_id: TaskId,
        pid: u32,
        mut signal: CancelSignal,
    ) {
        let sup = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = signal.cancelled() => {
                        if let Some(e) = sup.entries().get_mut(&task_id) {
                            e.cancelled = true;
                        }
                        if let Err(err) = sup.stop_process(&task_id).await {
                            tracing::warn!(%task_id, error = %err.user_message(), "stop after cancel failed");
                        }
                        return;
                    }
                    _ = tokio::time::sleep(FOREIGN_POLL_INTERVAL) => {}
                }

                let still_ours = sup
                    .entries()
                    .get(&task_id)
                    .is_some_and(|e| e.pid == Some(pid));
                if !still_ours {
                    return;
                }
                if !(sup.inner.is_alive)(pid) {
                    tracing::info!(%task_id, pid, "reconciled process is gone");
                    if sup.prune(&task_id, Some(pid)).await.is_some() {
                        sup.inner.tracker.update_progress(&task_id, 0.0, "exited");
                        sup.inner.tracker.complete(&task_id, None);
                    }
                    return;
                }
            }
        });
    }

    /// Stops the process behind `task_id`.
    ///
    /// A locally spawned child gets terminate, then kill after the configured
    /// grace. A reconciled PID only gets terminate; its task is completed
    /// without waiting for the exit.
    pub async fn stop_process(&self, task_id: &TaskId) -> Result<StopOutcome> {
        let (pid, exited, cancelled) = {
            let mut entries = self.entries();
            let entry = entries
                .get_mut(task_id)
                .ok_or_else(|| Error::not_found(format!("process task {task_id}")))?;
            let Some(pid) = entry.pid else {
                return Err(Error::bad_request(format!("process task {task_id} is still starting")));
            };
            entry.state = ProcessState::Terminating;
            entry.stop_requested = true;
            (pid, entry.exited.clone(), entry.cancelled)
        };
        self.inner.tracker.update_progress(task_id, 0.0, "stopping");
        tracing::info!(%task_id, pid, "stopping process");

        match exited {
            Some(mut rx) => {
                let outcome = signals::terminate_with_escalation(pid, self.inner.stop_grace, async move {
                    let _ = rx.wait_for(|v| *v).await;
                })
                .await;
                tracing::info!(%task_id, pid, ?outcome, "process stopped");
                Ok(outcome)
            }
            None => {
                if let Err(err) = signals::signal_terminate(pid) {
                    tracing::warn!(%task_id, pid, error = %err, "terminate signal failed");
                }
                self.prune(task_id, Some(pid)).await;
                if cancelled {
                    self.inner.tracker.fail(task_id, "cancelled", true);
                } else {
                    self.inner.tracker.update_progress(task_id, 0.0, "stopped");
                    self.inner.tracker.complete(task_id, None);
                }
                Ok(StopOutcome::Terminated)
            }
        }
    }

    /// Output lines after `cursor`; see [`LogBuffer::tail_after`].
    pub fn tail_logs(&self, task_id: &TaskId, cursor: u64, limit: usize) -> Result<(Vec<String>, u64)> {
        let log = self
            .logs()
            .get(task_id)
            .map(|(_, log)| log.clone())
            .ok_or_else(|| Error::not_found(format!("logs for task {task_id}")))?;
        let guard = log.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.tail_after(cursor, limit.max(1)))
    }
}

impl InstanceActivity for ProcessSupervisor {
    fn is_running(&self, installation_id: &InstallationId) -> bool {
        ProcessSupervisor::is_running(self, installation_id)
    }
}
