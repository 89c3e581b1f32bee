use std::{path::PathBuf, time::Duration};

use uihost_types::InstallationId;

const DEFAULT_DATA_ROOT: &str = "./data";
const DEFAULT_STOP_GRACE_MS: u64 = 10_000;
const DEFAULT_LOG_MAX_LINES: usize = 1000;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// External executables the setup primitives drive.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub git: PathBuf,
    /// Base interpreter used to create isolated environments.
    pub python: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            git: PathBuf::from("git"),
            python: PathBuf::from("python3"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub stop_grace: Duration,
    pub log_max_lines: usize,
    pub toolchain: Toolchain,
    pub catalog_path: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let data_root =
            env_path("UIHOST_DATA_ROOT").unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
        let stop_grace = Duration::from_millis(
            env_u64("UIHOST_STOP_GRACE_MS")
                .map(|v| v.clamp(100, 120_000))
                .unwrap_or(DEFAULT_STOP_GRACE_MS),
        );
        let log_max_lines = env_usize("UIHOST_LOG_MAX_LINES")
            .map(|v| v.clamp(100, 50_000))
            .unwrap_or(DEFAULT_LOG_MAX_LINES);

        let defaults = Toolchain::default();
        let toolchain = Toolchain {
            git: env_path("UIHOST_GIT").unwrap_or(defaults.git),
            python: env_path("UIHOST_PYTHON").unwrap_or(defaults.python),
        };

        Self {
            data_root,
            stop_grace,
            log_max_lines,
            toolchain,
            catalog_path: env_path("UIHOST_CATALOG"),
        }
    }

    /// Config rooted at `data_root` with defaults for everything else.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            toolchain: Toolchain::default(),
            catalog_path: None,
        }
    }

    pub fn process_registry_path(&self) -> PathBuf {
        self.data_root.join("process_registry.json")
    }

    pub fn instance_registry_path(&self) -> PathBuf {
        self.data_root.join("installations.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }

    /// Default location for a fresh install.
    pub fn instance_dir(&self, id: &InstallationId) -> PathBuf {
        self.data_root.join("instances").join(id.as_str())
    }
}
