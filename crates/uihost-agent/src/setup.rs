//! Environment setup primitives: clone, isolated environment, dependency install.
//!
//! Every step follows a fresh-install policy: existing targets are removed
//! before they are recreated. Steps report raw output through [`OutputHooks`]
//! and phase progress through [`InstallProgress`]; mapping onto a 0..100 scale
//! is left to the caller.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{
    error::{Error, Result},
    fs_walk,
    process::{OutputHooks, ProcessCommand, run_to_completion},
};

/// Name of the isolated environment directory inside an installation.
pub const ENV_DIR_NAME: &str = "venv";

/// Weight used for packages whose size the report does not declare.
const UNKNOWN_PACKAGE_WEIGHT: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum InstallProgress {
    /// Packages discovered/downloaded. `total` is unknown during resolution.
    Collecting {
        processed: u64,
        total: Option<u64>,
        label: String,
        item_size: Option<u64>,
    },
    Installing {
        processed: u64,
        total: u64,
        label: String,
    },
}

pub type ProgressCallback = Arc<dyn Fn(InstallProgress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequirement {
    pub name: String,
    pub version: String,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    pub packages: Vec<PackageRequirement>,
}

impl DependencyReport {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    fn weight_of(&self, normalized: &str) -> Option<u64> {
        self.packages
            .iter()
            .find(|p| normalize_package_name(&p.name) == normalized)
            .map(|p| p.size_bytes.unwrap_or(UNKNOWN_PACKAGE_WEIGHT))
    }

    pub fn total_weight(&self) -> u64 {
        self.packages
            .iter()
            .map(|p| p.size_bytes.unwrap_or(UNKNOWN_PACKAGE_WEIGHT))
            .fold(0u64, u64::saturating_add)
    }

    /// Parses a resolver JSON report (`{"install": [{"metadata": {...}}]}`).
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        #[derive(serde::Deserialize)]
        struct Raw {
            #[serde(default)]
            install: Vec<RawItem>,
        }
        #[derive(serde::Deserialize)]
        struct RawItem {
            metadata: RawMetadata,
            #[serde(default)]
            size: Option<u64>,
            #[serde(default)]
            download_info: Option<RawDownloadInfo>,
        }
        #[derive(serde::Deserialize)]
        struct RawMetadata {
            name: String,
            #[serde(default)]
            version: String,
        }
        #[derive(serde::Deserialize)]
        struct RawDownloadInfo {
            #[serde(default)]
            size: Option<u64>,
        }

        let raw: Raw = serde_json::from_str(raw)?;
        let packages = raw
            .install
            .into_iter()
            .map(|item| PackageRequirement {
                name: item.metadata.name,
                version: item.metadata.version,
                size_bytes: item.size.or(item.download_info.and_then(|d| d.size)),
            })
            .collect();
        Ok(Self { packages })
    }
}

/// PEP 503 style normalization so report names and log names compare equal.
pub fn normalize_package_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_dash {
                out.push('-');
            }
            last_dash = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        }
    }
    out
}

/// Extracts the package name from a resolver line such as
/// `Collecting torch==2.1.0 (from -r requirements.txt (line 3))`.
pub fn parse_collecting_line(line: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix("Collecting ")?;
    let end = rest
        .find(|c: char| c.is_whitespace() || "<>=!~;[(@,".contains(c))
        .unwrap_or(rest.len());
    let name = &rest[..end];
    if name.is_empty() {
        return None;
    }
    Some(normalize_package_name(name))
}

/// Interpreter inside an installation's isolated environment.
pub fn env_interpreter(install_dir: &Path) -> PathBuf {
    let env = install_dir.join(ENV_DIR_NAME);
    if cfg!(windows) {
        env.join("Scripts").join("python.exe")
    } else {
        env.join("bin").join("python")
    }
}

async fn remove_existing(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    tracing::info!(path = %path.display(), "removing existing {what}");
    fs_walk::remove_tree(path).await.map_err(|e| {
        Error::failed(format!(
            "failed to remove existing {what} at {}: {e}",
            path.display()
        ))
    })
}

pub async fn clone_repository(
    git: &Path,
    url: &str,
    target_dir: &Path,
    hooks: &OutputHooks,
) -> Result<()> {
    remove_existing(target_dir, "directory").await?;

    let parent = match target_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&parent).await.map_err(|e| {
        Error::failed(format!("failed to create {}: {e}", parent.display()))
    })?;

    let cmd = ProcessCommand::new(git)
        .args(["clone", "--progress", url])
        .arg(target_dir.display().to_string())
        .env("GIT_TERMINAL_PROMPT", "0");
    tracing::info!(url, target = %target_dir.display(), "cloning repository");

    let out = run_to_completion(&cmd, &parent, hooks).await?;
    if !out.success {
        return Err(Error::failed_with_output(
            format!("git clone of {url} failed ({})", out.exit_label()),
            &out.log,
        ));
    }
    Ok(())
}

pub async fn create_isolated_environment(
    python: &Path,
    install_dir: &Path,
    hooks: &OutputHooks,
) -> Result<()> {
    let env_dir = install_dir.join(ENV_DIR_NAME);
    remove_existing(&env_dir, "environment").await?;

    let cmd = ProcessCommand::new(python).args(["-m", "venv", ENV_DIR_NAME]);
    tracing::info!(dir = %install_dir.display(), "creating isolated environment");

    let out = run_to_completion(&cmd, install_dir, hooks).await?;
    if !out.success {
        return Err(Error::failed_with_output(
            format!("environment creation failed ({})", out.exit_label()),
            &out.log,
        ));
    }
    if !env_interpreter(install_dir).exists() {
        return Err(Error::failed_with_output(
            "environment creation produced no interpreter",
            &out.log,
        ));
    }
    Ok(())
}

/// Removes the report file on every exit path, cancellation included.
struct TempFileGuard(PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.0.display(), error = %err, "failed to remove temp file");
            }
        }
    }
}

fn temp_report_path(dir: &Path) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.join(format!(".uihost-dry-run-{}-{nanos}.json", std::process::id()))
}

fn pip_command(interpreter: &Path) -> ProcessCommand {
    ProcessCommand::new(interpreter)
        .args(["-m", "pip", "install"])
        .env("PYTHONUNBUFFERED", "1")
        .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
}

pub async fn compute_dependency_report(
    interpreter: &Path,
    manifest: &Path,
    extra_packages: &[String],
    on_progress: Option<ProgressCallback>,
    hooks: &OutputHooks,
) -> Result<DependencyReport> {
    let cwd = manifest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let report_path = temp_report_path(&cwd);
    let _cleanup = TempFileGuard(report_path.clone());

    let cmd = pip_command(interpreter)
        .args(["--dry-run", "--report"])
        .arg(report_path.display().to_string())
        .arg("-r")
        .arg(manifest.display().to_string())
        .args(extra_packages.iter().cloned());

    let discovered = Arc::new(Mutex::new(0u64));
    let hooks = hooks.clone().with_line(move |line| {
        let Some(name) = parse_collecting_line(line) else {
            return;
        };
        let n = {
            let mut count = discovered.lock().unwrap_or_else(|e| e.into_inner());
            *count += 1;
            *count
        };
        if let Some(cb) = &on_progress {
            cb(InstallProgress::Collecting {
                processed: n,
                total: None,
                label: name,
                item_size: None,
            });
        }
    });

    tracing::info!(manifest = %manifest.display(), "resolving dependencies (dry run)");
    let out = run_to_completion(&cmd, &cwd, &hooks).await?;
    if !out.success {
        return Err(Error::failed_with_output(
            format!("dependency resolution failed ({})", out.exit_label()),
            &out.log,
        ));
    }

    let raw = match tokio::fs::read_to_string(&report_path).await {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(path = %report_path.display(), error = %err, "dry-run report missing; assuming nothing to install");
            return Ok(DependencyReport::default());
        }
    };
    if raw.trim().is_empty() {
        tracing::warn!(path = %report_path.display(), "dry-run report empty; assuming nothing to install");
        return Ok(DependencyReport::default());
    }

    let report = DependencyReport::from_json(&raw).map_err(|e| {
        Error::failed(format!("failed to parse dependency report: {e}"))
    })?;
    tracing::info!(packages = report.packages.len(), "dependency report ready");
    Ok(report)
}

/// Byte-weighted progress over the packages a report says are missing.
struct CollectTracker {
    report: DependencyReport,
    total: u64,
    processed: u64,
    seen: HashSet<String>,
}

impl CollectTracker {
    fn new(report: DependencyReport) -> Self {
        let total = report.total_weight();
        Self {
            report,
            total,
            processed: 0,
            seen: HashSet::new(),
        }
    }

    fn observe(&mut self, line: &str) -> Option<InstallProgress> {
        let name = parse_collecting_line(line)?;
        let weight = self.report.weight_of(&name)?;
        if !self.seen.insert(name.clone()) {
            return None;
        }
        self.processed = self.processed.saturating_add(weight).min(self.total);
        Some(InstallProgress::Collecting {
            processed: self.processed,
            total: Some(self.total),
            label: name,
            item_size: Some(weight),
        })
    }
}

pub async fn install_dependencies(
    install_dir: &Path,
    manifest_file: &str,
    hooks: &OutputHooks,
    on_progress: Option<ProgressCallback>,
    extra_packages: &[String],
) -> Result<()> {
    let interpreter = env_interpreter(install_dir);
    if !interpreter.exists() {
        return Err(Error::not_found(format!(
            "environment interpreter {}",
            interpreter.display()
        )));
    }
    let manifest = install_dir.join(manifest_file);
    if !manifest.exists() {
        return Err(Error::not_found(format!("manifest {}", manifest.display())));
    }

    let report = compute_dependency_report(
        &interpreter,
        &manifest,
        extra_packages,
        on_progress.clone(),
        hooks,
    )
    .await?;

    if report.is_empty() {
        tracing::info!(dir = %install_dir.display(), "dependencies already satisfied");
        if let Some(cb) = &on_progress {
            cb(InstallProgress::Installing {
                processed: 1,
                total: 1,
                label: "dependencies already satisfied".to_string(),
            });
        }
        return Ok(());
    }

    let package_count = report.packages.len();
    let tracker = Mutex::new(CollectTracker::new(report));
    let line_progress = on_progress.clone();
    let hooks = hooks.clone().with_line(move |line| {
        let event = tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe(line);
        if let (Some(event), Some(cb)) = (event, &line_progress) {
            cb(event);
        }
    });

    let cmd = pip_command(&interpreter)
        .arg("-r")
        .arg(manifest.display().to_string())
        .args(extra_packages.iter().cloned());
    tracing::info!(packages = package_count, "installing dependencies");

    let out = run_to_completion(&cmd, install_dir, &hooks).await?;
    if !out.success {
        return Err(Error::failed_with_output(
            format!("dependency installation failed ({})", out.exit_label()),
            &out.log,
        ));
    }

    if let Some(cb) = &on_progress {
        cb(InstallProgress::Installing {
            processed: 1,
            total: 1,
            label: format!("installed {package_count} packages"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakePackage, fake_env_interpreter, fake_git, fake_python};

    fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<InstallProgress>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let cb = {
            let events = events.clone();
            Arc::new(move |e: InstallProgress| events.lock().unwrap().push(e)) as ProgressCallback
        };
        (cb, events)
    }

    #[test]
    fn collecting_lines_yield_normalized_names() {
        assert_eq!(
            parse_collecting_line("Collecting Torch_Vision==0.16.0 (from -r requirements.txt (line 2))"),
            Some("torch-vision".to_string())
        );
        assert_eq!(
            parse_collecting_line("  Collecting numpy>=1.25"),
            Some("numpy".to_string())
        );
        assert_eq!(
            parse_collecting_line("Collecting uvicorn[standard]"),
            Some("uvicorn".to_string())
        );
        assert_eq!(parse_collecting_line("  Downloading numpy-1.26.whl"), None);
        assert_eq!(parse_collecting_line("Collecting "), None);
    }

    #[test]
    fn report_parses_names_versions_and_sizes() {
        let raw = r#"{"version":"1","install":[
            {"metadata":{"name":"numpy","version":"1.26.4"},"download_info":{"url":"x","size":2048}},
            {"metadata":{"name":"tqdm","version":"4.66.1"}}
        ]}"#;
        let report = DependencyReport::from_json(raw).unwrap();
        assert_eq!(report.packages.len(), 2);
        assert_eq!(report.packages[0].size_bytes, Some(2048));
        assert_eq!(report.packages[1].version, "4.66.1");
        assert_eq!(report.total_weight(), 2048 + UNKNOWN_PACKAGE_WEIGHT);
    }

    #[test]
    fn collect_tracker_weights_by_size_and_ignores_repeats() {
        let report = DependencyReport {
            packages: vec![
                PackageRequirement {
                    name: "numpy".to_string(),
                    version: "1".to_string(),
                    size_bytes: Some(300),
                },
                PackageRequirement {
                    name: "Pillow".to_string(),
                    version: "1".to_string(),
                    size_bytes: Some(100),
                },
            ],
        };
        let mut t = CollectTracker::new(report);
        assert_eq!(
            t.observe("Collecting pillow"),
            Some(InstallProgress::Collecting {
                processed: 100,
                total: Some(400),
                label: "pillow".to_string(),
                item_size: Some(100),
            })
        );
        assert_eq!(t.observe("Collecting pillow"), None);
        assert_eq!(t.observe("Collecting already-satisfied-dep"), None);
        match t.observe("Collecting numpy==1.0").unwrap() {
            InstallProgress::Collecting { processed, .. } => assert_eq!(processed, 400),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn satisfied_manifest_skips_real_install() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "numpy\n").unwrap();
        fake_env_interpreter(dir.path(), &[]);
        let (cb, events) = recorder();

        install_dependencies(dir.path(), "requirements.txt", &OutputHooks::default(), Some(cb), &[])
            .await
            .unwrap();

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![InstallProgress::Installing {
                processed: 1,
                total: 1,
                label: "dependencies already satisfied".to_string(),
            }]
        );
        let calls = std::fs::read_to_string(dir.path().join("pip-calls.log")).unwrap();
        assert_eq!(calls.lines().count(), 1);
        assert!(calls.contains("--dry-run"));
        // The temp report never outlives the call.
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".uihost-dry-run-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_reports_collecting_then_installing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "numpy\ntqdm\n").unwrap();
        fake_env_interpreter(
            dir.path(),
            &[
                FakePackage::new("numpy", "1.26.4", Some(3000)),
                FakePackage::new("tqdm", "4.66.1", Some(1000)),
            ],
        );
        let (cb, events) = recorder();

        install_dependencies(dir.path(), "requirements.txt", &OutputHooks::default(), Some(cb), &[])
            .await
            .unwrap();

        let events = events.lock().unwrap().clone();
        // Dry run: unknown totals, counting up.
        assert!(matches!(
            &events[0],
            InstallProgress::Collecting { processed: 1, total: None, .. }
        ));
        let weighted: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                InstallProgress::Collecting {
                    processed,
                    total: Some(4000),
                    ..
                } => Some(*processed),
                _ => None,
            })
            .collect();
        assert_eq!(weighted, vec![3000, 4000]);
        assert!(matches!(
            events.last().unwrap(),
            InstallProgress::Installing { processed: 1, total: 1, .. }
        ));

        let calls = std::fs::read_to_string(dir.path().join("pip-calls.log")).unwrap();
        assert_eq!(calls.lines().count(), 2);
    }

    #[tokio::test]
    async fn install_requires_environment_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = install_dependencies(dir.path(), "requirements.txt", &OutputHooks::default(), None, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound(_)), "{err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_clone_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let git = fake_git(dir.path(), false);
        let target = dir.path().join("install");

        let err = clone_repository(&git, "https://example.invalid/repo.git", &target, &OutputHooks::default())
            .await
            .unwrap_err();
        let msg = err.user_message();
        assert!(msg.contains("exit code 128"), "{msg}");
        assert!(msg.contains("fatal: repository not found"), "{msg}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clone_replaces_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let git = fake_git(dir.path(), true);
        let target = dir.path().join("install");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.txt"), "old").unwrap();

        clone_repository(&git, "https://example.invalid/repo.git", &target, &OutputHooks::default())
            .await
            .unwrap();
        assert!(!target.join("stale.txt").exists());
        assert!(target.join("requirements.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn environment_is_recreated_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let python = fake_python(dir.path(), &[]);
        let install = dir.path().join("install");
        std::fs::create_dir_all(install.join(ENV_DIR_NAME)).unwrap();
        std::fs::write(install.join(ENV_DIR_NAME).join("marker"), "old").unwrap();

        create_isolated_environment(&python, &install, &OutputHooks::default())
            .await
            .unwrap();
        assert!(!install.join(ENV_DIR_NAME).join("marker").exists());
        assert!(env_interpreter(&install).exists());
    }
}
