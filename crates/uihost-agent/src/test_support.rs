//! Fixtures shared by unit tests: recording sinks and shell scripts that stand
//! in for git and the Python toolchain.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::BoxFuture;
use uihost_types::{Notification, TaskId, TaskState, TaskStatus};

use crate::task_tracker::{NotificationSink, TaskTracker};

const WAIT_LIMIT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    pub async fn wait_for_count(&self, n: usize) -> Vec<Notification> {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let events = self.events();
            if events.len() >= n {
                return events;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("expected {n} notifications, got {}: {events:?}", events.len());
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Waits until some delivered notification satisfies `pred`; returns everything so far.
    pub async fn wait_for(&self, pred: impl Fn(&Notification) -> bool) -> Vec<Notification> {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let events = self.events();
            if events.iter().any(&pred) {
                return events;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("no matching notification among {events:?}");
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, payload: Notification) -> BoxFuture<'_, anyhow::Result<()>> {
        self.events.lock().unwrap().push(payload);
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Default)]
pub struct FailingSink;

impl NotificationSink for FailingSink {
    fn notify(&self, _payload: Notification) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { anyhow::bail!("listener unavailable") })
    }
}

pub async fn wait_for_state(tracker: &TaskTracker, task_id: &TaskId, state: TaskState) -> TaskStatus {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let current = tracker.get(task_id);
        if let Some(st) = &current
            && st.status == state
        {
            return st.clone();
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("task {task_id} never reached {state:?}; last seen {current:?}");
        }
        tokio::time::sleep(POLL).await;
    }
}

pub fn write_script(path: &Path, body: &str) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    // Write under a temp name and rename so no writable fd to the final path exists.
    let tmp = path.with_extension("tmp-script");
    std::fs::write(&tmp, format!("#!/bin/sh\n{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    std::fs::rename(&tmp, path).unwrap();
    path.to_path_buf()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeGit {
    /// Creates the target with a one-line `requirements.txt`.
    Clones,
    /// Prints a fatal error and exits 128.
    Fails,
    /// Never finishes on its own.
    Hangs,
    /// Waits until terminated, then writes the clone and exits 0.
    FinishesOnTerminate,
}

pub fn fake_git(dir: &Path, succeed: bool) -> PathBuf {
    fake_git_with(dir, if succeed { FakeGit::Clones } else { FakeGit::Fails })
}

pub fn fake_git_with(dir: &Path, mode: FakeGit) -> PathBuf {
    let body = match mode {
        FakeGit::Clones => {
            r#"for last; do :; done
mkdir -p "$last"
echo "Cloning into '$last'..." >&2
echo "Receiving objects:  50% (1/2)" >&2
echo "Receiving objects: 100% (2/2), done." >&2
printf 'numpy\n' > "$last/requirements.txt"
exit 0
"#
        }
        FakeGit::Fails => {
            r#"echo "Cloning into 'x'..." >&2
echo "fatal: repository not found" >&2
exit 128
"#
        }
        FakeGit::Hangs => {
            r#"echo "Cloning into 'x'..." >&2
sleep 30
exit 0
"#
        }
        FakeGit::FinishesOnTerminate => {
            r#"for last; do :; done
trap 'mkdir -p "$last"; printf "numpy\n" > "$last/requirements.txt"; exit 0' TERM
echo "Cloning into '$last'..." >&2
while true; do sleep 1; done
"#
        }
    };
    write_script(&dir.join("tools").join("git"), body)
}

/// One package the fake resolver reports as missing.
#[derive(Debug, Clone)]
pub struct FakePackage {
    pub name: String,
    pub version: String,
    pub size: Option<u64>,
}

impl FakePackage {
    pub fn new(name: &str, version: &str, size: Option<u64>) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            size,
        }
    }
}

/// Shell body of an environment interpreter.
///
/// `-m pip install` appends its args to `$PWD/pip-calls.log`, prints a
/// `Collecting` line per package and, on `--dry-run`, writes the JSON report.
/// Anything else is handed to `sh`, so a start command of `{python} run.sh` works.
fn env_interpreter_body(packages: &[FakePackage]) -> String {
    let collecting: String = packages
        .iter()
        .map(|p| format!("  echo \"Collecting {}=={}\"\n", p.name, p.version))
        .collect();
    let items: Vec<String> = packages
        .iter()
        .map(|p| {
            let size = p
                .size
                .map(|s| format!(",\"download_info\":{{\"size\":{s}}}"))
                .unwrap_or_default();
            format!(
                "{{\"metadata\":{{\"name\":\"{}\",\"version\":\"{}\"}}{size}}}",
                p.name, p.version
            )
        })
        .collect();
    let report = format!("{{\"install\":[{}]}}", items.join(","));

    format!(
        r#"if [ "$1" = "-m" ] && [ "$2" = "pip" ]; then
  echo "$*" >> "$PWD/pip-calls.log"
  dry=0
  report=""
  while [ $# -gt 0 ]; do
    case "$1" in
      --dry-run) dry=1 ;;
      --report) shift; report="$1" ;;
    esac
    shift
  done
{collecting}  if [ "$dry" = 1 ]; then
    printf '%s' '{report}' > "$report"
  fi
  exit 0
fi
exec /bin/sh "$@"
"#
    )
}

/// Installs a fake interpreter at `<install_dir>/venv/bin/python`.
pub fn fake_env_interpreter(install_dir: &Path, packages: &[FakePackage]) -> PathBuf {
    write_script(
        &crate::setup::env_interpreter(install_dir),
        &env_interpreter_body(packages),
    )
}

/// Base interpreter whose `-m venv <name>` creates a fake environment in `$PWD/<name>`.
pub fn fake_python(dir: &Path, packages: &[FakePackage]) -> PathBuf {
    // Stored next to the base interpreter and copied into each new environment.
    let template = write_script(
        &dir.join("tools").join("env-python"),
        &env_interpreter_body(packages),
    );
    let body = format!(
        r#"if [ "$1" = "-m" ] && [ "$2" = "venv" ]; then
  mkdir -p "$3/bin"
  cp "{template}" "$3/bin/python.tmp"
  chmod 755 "$3/bin/python.tmp"
  mv "$3/bin/python.tmp" "$3/bin/python"
  echo "created environment $3"
  exit 0
fi
echo "unsupported: $*" >&2
exit 2
"#,
        template = template.display()
    );
    write_script(&dir.join("tools").join("python3"), &body)
}
