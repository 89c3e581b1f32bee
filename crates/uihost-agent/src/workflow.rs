//! Install and repair/adopt workflows built from the setup primitives.
//!
//! Each workflow runs as one tracked task. Step output is mapped onto a single
//! 0..100 scale:
//!
//! | phase        | band   |
//! |--------------|--------|
//! | clone        | 0-15   |
//! | environment  | 15-25  |
//! | resolve      | 25-40  |
//! | collect      | 40-75  |
//! | install      | 75-90  |
//! | finalize     | 90-100 |

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use uihost_types::{InstallationId, InstallationRecord, TaskId, TaskState, UiKind};

use crate::{
    catalog::{Catalog, UiKindSpec},
    config::AgentConfig,
    error::{Error, Result},
    fs_walk,
    instance_registry::{InstanceRegistry, resolve_path_async},
    process::{ChildSlot, OutputHooks},
    setup::{self, InstallProgress, ProgressCallback},
    signals,
    supervisor::ProcessSupervisor,
    task_tracker::{ProgressUpdate, RemoveOutcome, TaskTracker},
};

pub const INSTALL_TASK_KIND: &str = "install";
pub const REPAIR_TASK_KIND: &str = "repair";

type Band = (f64, f64);

const CLONE_BAND: Band = (0.0, 15.0);
const ENVIRONMENT_BAND: Band = (15.0, 25.0);
const RESOLVE_BAND: Band = (25.0, 40.0);
const COLLECT_BAND: Band = (40.0, 75.0);
const INSTALL_BAND: Band = (75.0, 90.0);
const FINALIZE_BAND: Band = (90.0, 100.0);

fn in_band((lo, hi): Band, fraction: f64) -> f64 {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    lo + (hi - lo) * fraction
}

/// Percentage from git's `Receiving objects:  42% (42/100)` progress lines.
pub fn parse_clone_percent(line: &str) -> Option<u8> {
    let rest = line.split("Receiving objects:").nth(1)?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let pct: u8 = digits.parse().ok()?;
    rest.trim_start()[digits.len()..]
        .starts_with('%')
        .then_some(pct.min(100))
}

/// Problems `diagnose` can find in an existing installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IssueCode {
    /// The source tree (or its manifest) is gone; only a reinstall helps.
    SourceMissing,
    EnvironmentMissing,
    DependenciesIncomplete,
    Unknown(String),
}

impl IssueCode {
    pub fn as_str(&self) -> &str {
        match self {
            IssueCode::SourceMissing => "source_missing",
            IssueCode::EnvironmentMissing => "environment_missing",
            IssueCode::DependenciesIncomplete => "dependencies_incomplete",
            IssueCode::Unknown(raw) => raw,
        }
    }
}

impl From<&str> for IssueCode {
    fn from(value: &str) -> Self {
        match value.trim() {
            "source_missing" => IssueCode::SourceMissing,
            "environment_missing" => IssueCode::EnvironmentMissing,
            "dependencies_incomplete" => IssueCode::DependenciesIncomplete,
            other => IssueCode::Unknown(other.to_string()),
        }
    }
}

impl From<String> for IssueCode {
    fn from(value: String) -> Self {
        IssueCode::from(value.as_str())
    }
}

impl From<IssueCode> for String {
    fn from(value: IssueCode) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inspects an install directory for problems a repair can (or cannot) fix.
pub async fn diagnose(install_dir: &Path, spec: &UiKindSpec) -> Result<Vec<IssueCode>> {
    let manifest = install_dir.join(&spec.manifest_file);
    if !manifest.is_file() {
        return Ok(vec![IssueCode::SourceMissing]);
    }
    let interpreter = setup::env_interpreter(install_dir);
    if !interpreter.exists() {
        return Ok(vec![
            IssueCode::EnvironmentMissing,
            IssueCode::DependenciesIncomplete,
        ]);
    }

    let report = setup::compute_dependency_report(
        &interpreter,
        &manifest,
        &spec.extra_packages,
        None,
        &OutputHooks::default(),
    )
    .await?;
    if report.is_empty() {
        Ok(Vec::new())
    } else {
        tracing::info!(
            dir = %install_dir.display(),
            missing = report.packages.len(),
            "installation has missing dependencies"
        );
        Ok(vec![IssueCode::DependenciesIncomplete])
    }
}

#[derive(Debug, Clone)]
pub enum RepairTarget {
    Existing(InstallationId),
    /// Registers a directory that was installed outside this agent.
    Adopt {
        path: PathBuf,
        kind: UiKind,
        display_name: String,
    },
}

/// Maps step-level output onto the task's overall progress.
#[derive(Clone)]
struct PhaseReporter {
    tracker: TaskTracker,
    task_id: TaskId,
}

impl PhaseReporter {
    /// Step boundary: stops the workflow once cancellation was requested.
    fn checkpoint(&self) -> Result<()> {
        if self.tracker.cancel_requested(&self.task_id) {
            tracing::info!(task_id = %self.task_id, "workflow stopping at step boundary");
            return Err(Error::failed("cancelled"));
        }
        Ok(())
    }

    fn enter(&self, band: Band, text: impl Into<String>) {
        self.tracker.update_task_progress(
            &self.task_id,
            ProgressUpdate {
                progress: band.0,
                status_text: Some(text.into()),
                status: Some(TaskState::Running),
                ..Default::default()
            },
        );
    }

    fn clone_line(&self, line: &str) {
        if let Some(pct) = parse_clone_percent(line) {
            self.tracker.update_task_progress(
                &self.task_id,
                ProgressUpdate {
                    progress: in_band(CLONE_BAND, f64::from(pct) / 100.0),
                    status_text: Some(format!("cloning ({pct}%)")),
                    ..Default::default()
                },
            );
        }
    }

    fn install_event(&self, event: InstallProgress) {
        let update = match event {
            InstallProgress::Collecting {
                processed,
                total: None,
                label,
                ..
            } => ProgressUpdate {
                // Total unknown while resolving: approach the band end asymptotically.
                progress: in_band(RESOLVE_BAND, 1.0 - 1.0 / (processed as f64 + 1.0)),
                status_text: Some(format!("resolving {label}")),
                processed_units: Some(processed),
                ..Default::default()
            },
            InstallProgress::Collecting {
                processed,
                total: Some(total),
                label,
                ..
            } => ProgressUpdate {
                progress: in_band(COLLECT_BAND, processed as f64 / total.max(1) as f64),
                status_text: Some(format!("collecting {label}")),
                processed_units: Some(processed),
                total_units: Some(total),
                ..Default::default()
            },
            InstallProgress::Installing {
                processed,
                total,
                label,
            } => ProgressUpdate {
                progress: in_band(INSTALL_BAND, processed as f64 / total.max(1) as f64),
                status_text: Some(label),
                processed_units: Some(processed),
                total_units: Some(total),
                ..Default::default()
            },
        };
        self.tracker.update_task_progress(&self.task_id, update);
    }

    fn hooks(&self, slot: &ChildSlot) -> OutputHooks {
        OutputHooks {
            on_line: None,
            child_slot: Some(slot.clone()),
        }
    }

    fn progress_callback(&self) -> ProgressCallback {
        let reporter = self.clone();
        Arc::new(move |event| reporter.install_event(event))
    }
}

/// Deletes a partially created install directory unless disarmed.
struct PartialInstallGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for PartialInstallGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = self.path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    tracing::info!(path = %path.display(), "removing partial install");
                    if let Err(err) = fs_walk::remove_tree(&path).await {
                        tracing::warn!(path = %path.display(), error = %err, "failed to remove partial install");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(path = %path.display(), "no runtime; partial install left in place");
            }
        }
    }
}

type SlotMap = Arc<Mutex<HashMap<TaskId, ChildSlot>>>;

/// Keeps a task's child slot visible to `cancel` for as long as its work runs.
struct SlotRegistration {
    slots: SlotMap,
    task_id: TaskId,
}

impl Drop for SlotRegistration {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

#[derive(Clone)]
pub struct InstallationManager {
    config: AgentConfig,
    tracker: TaskTracker,
    instances: Arc<InstanceRegistry>,
    supervisor: ProcessSupervisor,
    catalog: Arc<Catalog>,
    slots: SlotMap,
}

impl fmt::Debug for InstallationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationManager")
            .field("data_root", &self.config.data_root)
            .finish_non_exhaustive()
    }
}

impl InstallationManager {
    pub fn new(
        config: AgentConfig,
        tracker: TaskTracker,
        instances: Arc<InstanceRegistry>,
        supervisor: ProcessSupervisor,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            config,
            tracker,
            instances,
            supervisor,
            catalog,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn find_spec(&self, kind: &str) -> Result<UiKindSpec> {
        self.catalog
            .find(kind)
            .cloned()
            .ok_or_else(|| Error::bad_request(format!("unknown ui kind {kind}")))
    }

    fn register_slot(&self, task_id: &TaskId) -> (ChildSlot, SlotRegistration) {
        let slot = ChildSlot::default();
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.clone(), slot.clone());
        (
            slot,
            SlotRegistration {
                slots: self.slots.clone(),
                task_id: task_id.clone(),
            },
        )
    }

    /// PID of the subprocess a workflow task is currently waiting on.
    pub fn active_subprocess(&self, task_id: &TaskId) -> Option<u32> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .and_then(ChildSlot::get)
    }

    /// Starts a fresh install of `kind` and returns the tracking task id.
    ///
    /// `target` defaults to `<data_root>/instances/<installation_id>`.
    pub async fn install(
        &self,
        kind: &str,
        display_name: &str,
        target: Option<PathBuf>,
    ) -> Result<TaskId> {
        let spec = self.find_spec(kind)?;
        let display_name = match display_name.trim() {
            "" => spec.display_name.clone(),
            name => name.to_string(),
        };
        let installation_id = InstallationId::new();
        let target =
            resolve_path_async(&target.unwrap_or_else(|| self.config.instance_dir(&installation_id)))
                .await;
        if let Some(owner) = self.instances.find_by_path(&target).await {
            return Err(Error::bad_request(format!(
                "{} already belongs to installation {}",
                target.display(),
                owner.installation_id
            )));
        }

        let task_id = TaskId::new();
        let (slot, registration) = self.register_slot(&task_id);
        let reporter = PhaseReporter {
            tracker: self.tracker.clone(),
            task_id: task_id.clone(),
        };
        let manager = self.clone();
        let label = display_name.clone();
        tracing::info!(%task_id, %installation_id, kind, target = %target.display(), "install requested");

        self.tracker
            .spawn(task_id.clone(), INSTALL_TASK_KIND, &label, async move {
                let _registration = registration;
                let record = InstallationRecord {
                    installation_id,
                    ui_kind: spec.ui_kind(),
                    display_name,
                    path: target.display().to_string(),
                };
                manager
                    .run_install(&spec, record, &target, &reporter, &slot)
                    .await
                    .map(Some)
            });
        Ok(task_id)
    }

    async fn run_install(
        &self,
        spec: &UiKindSpec,
        record: InstallationRecord,
        target: &Path,
        reporter: &PhaseReporter,
        slot: &ChildSlot,
    ) -> Result<String> {
        let mut guard = PartialInstallGuard {
            path: target.to_path_buf(),
            armed: true,
        };
        let toolchain = &self.config.toolchain;

        reporter.enter(CLONE_BAND, format!("cloning {}", spec.source_url));
        let clone_hooks = {
            let reporter = reporter.clone();
            reporter.hooks(slot).with_line(move |line| reporter.clone_line(line))
        };
        setup::clone_repository(&toolchain.git, &spec.source_url, target, &clone_hooks).await?;
        reporter.checkpoint()?;

        reporter.enter(ENVIRONMENT_BAND, "creating environment");
        setup::create_isolated_environment(&toolchain.python, target, &reporter.hooks(slot)).await?;
        reporter.checkpoint()?;

        reporter.enter(RESOLVE_BAND, "resolving dependencies");
        setup::install_dependencies(
            target,
            &spec.manifest_file,
            &reporter.hooks(slot),
            Some(reporter.progress_callback()),
            &spec.extra_packages,
        )
        .await?;
        reporter.checkpoint()?;

        reporter.enter(FINALIZE_BAND, "registering installation");
        self.instances.add(record).await?;
        guard.armed = false;
        Ok(target.display().to_string())
    }

    /// Runs `diagnose` for a registered installation.
    pub async fn diagnose_installation(&self, installation_id: &InstallationId) -> Result<Vec<IssueCode>> {
        let record = self
            .instances
            .get(installation_id)
            .ok_or_else(|| Error::not_found(format!("installation {installation_id}")))?;
        let spec = self.find_spec(record.ui_kind.as_str())?;
        diagnose(Path::new(&record.path), &spec).await
    }

    /// Runs `diagnose` for an unregistered directory, e.g. before adopting it.
    pub async fn diagnose_path(&self, path: &Path, kind: &UiKind) -> Result<Vec<IssueCode>> {
        let spec = self.find_spec(kind.as_str())?;
        if !path.is_dir() {
            return Err(Error::bad_request(format!("{} is not a directory", path.display())));
        }
        diagnose(path, &spec).await
    }

    /// Fixes the given issues in the background, then registers the installation.
    pub async fn repair(&self, target: RepairTarget, issues: &[IssueCode]) -> Result<TaskId> {
        let (record, spec) = match target {
            RepairTarget::Existing(installation_id) => {
                let record = self
                    .instances
                    .get(&installation_id)
                    .ok_or_else(|| Error::not_found(format!("installation {installation_id}")))?;
                let spec = self.find_spec(record.ui_kind.as_str())?;
                (record, spec)
            }
            RepairTarget::Adopt {
                path,
                kind,
                display_name,
            } => {
                let spec = self.find_spec(kind.as_str())?;
                if !path.is_dir() {
                    return Err(Error::bad_request(format!("{} is not a directory", path.display())));
                }
                let path = resolve_path_async(&path).await;
                if let Some(owner) = self.instances.find_by_path(&path).await {
                    return Err(Error::bad_request(format!(
                        "{} already belongs to installation {}",
                        path.display(),
                        owner.installation_id
                    )));
                }
                let display_name = match display_name.trim() {
                    "" => spec.display_name.clone(),
                    name => name.to_string(),
                };
                let record = InstallationRecord {
                    installation_id: InstallationId::new(),
                    ui_kind: kind,
                    display_name,
                    path: path.display().to_string(),
                };
                (record, spec)
            }
        };
        if self.supervisor.is_running(&record.installation_id) {
            return Err(Error::bad_request(format!(
                "installation {} is running; stop it first",
                record.installation_id
            )));
        }

        let task_id = TaskId::new();
        let (slot, registration) = self.register_slot(&task_id);
        let reporter = PhaseReporter {
            tracker: self.tracker.clone(),
            task_id: task_id.clone(),
        };
        let manager = self.clone();
        let issues = issues.to_vec();
        let label = record.display_name.clone();
        tracing::info!(
            %task_id,
            installation_id = %record.installation_id,
            issues = ?issues.iter().map(IssueCode::as_str).collect::<Vec<_>>(),
            "repair requested"
        );

        self.tracker
            .spawn(task_id.clone(), REPAIR_TASK_KIND, &label, async move {
                let _registration = registration;
                manager
                    .run_repair(&spec, record, &issues, &reporter, &slot)
                    .await
                    .map(Some)
            });
        Ok(task_id)
    }

    async fn run_repair(
        &self,
        spec: &UiKindSpec,
        record: InstallationRecord,
        issues: &[IssueCode],
        reporter: &PhaseReporter,
        slot: &ChildSlot,
    ) -> Result<String> {
        let dir = PathBuf::from(&record.path);
        let manifest_present = dir.join(&spec.manifest_file).is_file();

        let mut create_env = false;
        let mut install_deps = false;
        for issue in issues {
            match issue {
                IssueCode::SourceMissing if manifest_present => {
                    tracing::info!(task_id = %reporter.task_id, "source present again; skipping");
                }
                IssueCode::SourceMissing => {
                    return Err(Error::failed(format!(
                        "{} is missing {}; reinstall instead of repairing",
                        dir.display(),
                        spec.manifest_file
                    )));
                }
                IssueCode::EnvironmentMissing => {
                    if setup::env_interpreter(&dir).exists() {
                        tracing::info!(task_id = %reporter.task_id, "environment already present; skipping");
                    } else {
                        create_env = true;
                    }
                    // A fresh environment has nothing installed.
                    install_deps = true;
                }
                IssueCode::DependenciesIncomplete => install_deps = true,
                IssueCode::Unknown(raw) => {
                    tracing::warn!(task_id = %reporter.task_id, issue = %raw, "unknown issue code skipped");
                }
            }
        }

        if create_env {
            reporter.enter(ENVIRONMENT_BAND, "creating environment");
            setup::create_isolated_environment(&self.config.toolchain.python, &dir, &reporter.hooks(slot))
                .await?;
            reporter.checkpoint()?;
        }
        if install_deps {
            reporter.enter(RESOLVE_BAND, "resolving dependencies");
            setup::install_dependencies(
                &dir,
                &spec.manifest_file,
                &reporter.hooks(slot),
                Some(reporter.progress_callback()),
                &spec.extra_packages,
            )
            .await?;
            reporter.checkpoint()?;
        }

        reporter.enter(FINALIZE_BAND, "registering installation");
        self.instances.add(record).await?;
        Ok(dir.display().to_string())
    }

    /// Cancels a workflow task.
    ///
    /// When the task is waiting on a subprocess, that process group is
    /// terminated (then killed after the stop grace) and the step's failure is
    /// reported as a cancellation. Otherwise the task is cancelled through the
    /// tracker, which drops the work at its next suspension point.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<()> {
        if let Some(pid) = self.active_subprocess(task_id) {
            self.tracker.request_cancel(task_id);
            tracing::info!(%task_id, pid, "cancelling workflow subprocess");
            let outcome =
                signals::terminate_with_escalation(pid, self.config.stop_grace, signals::wait_until_dead(pid))
                    .await;
            tracing::info!(%task_id, pid, ?outcome, "workflow subprocess stopped");
            return Ok(());
        }

        match self.tracker.remove(task_id) {
            RemoveOutcome::NotFound => Err(Error::not_found(format!("task {task_id}"))),
            RemoveOutcome::Cancelling | RemoveOutcome::Removed => Ok(()),
        }
    }

    /// Renames and/or moves an installation; refused while it is running.
    pub async fn update(
        &self,
        installation_id: &InstallationId,
        new_display_name: Option<String>,
        new_path: Option<PathBuf>,
    ) -> Result<InstallationRecord> {
        self.instances
            .update(installation_id, new_display_name, new_path, &self.supervisor)
            .await
    }

    /// Removes an installation's directory and its record.
    pub async fn delete(&self, installation_id: &InstallationId) -> Result<()> {
        let record = self
            .instances
            .get(installation_id)
            .ok_or_else(|| Error::not_found(format!("installation {installation_id}")))?;
        if self.supervisor.is_running(installation_id) {
            return Err(Error::bad_request(format!(
                "installation {installation_id} is running; stop it first"
            )));
        }

        fs_walk::remove_tree(Path::new(&record.path))
            .await
            .map_err(|e| Error::failed(format!("failed to delete {}: {e}", record.path)))?;
        self.instances.remove(installation_id).await?;
        tracing::info!(%installation_id, path = %record.path, "installation deleted");
        Ok(())
    }

    /// Bytes used by an installation's directory.
    pub async fn disk_usage(&self, installation_id: &InstallationId) -> Result<u64> {
        let record = self
            .instances
            .get(installation_id)
            .ok_or_else(|| Error::not_found(format!("installation {installation_id}")))?;
        let path = PathBuf::from(&record.path);
        if !path.exists() {
            return Err(Error::not_found(format!("install directory {}", path.display())));
        }
        Ok(fs_walk::disk_usage(&path).await?)
    }
}
