//! OS process control: liveness probing and terminate/kill delivery.
//!
//! Managed processes are spawned as process-group leaders, so signals go to
//! the whole group (`-pid`) and reach grandchildren as well.

use std::{future::Future, time::Duration};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period after terminate.
    Terminated,
    /// Still alive at the end of the grace period and was killed.
    Killed,
}

/// Non-destructive liveness check.
#[cfg(target_os = "linux")]
pub fn is_process_alive(pid: u32) -> bool {
    if !unix_signal_zero(pid) {
        return false;
    }
    // An unreaped zombie still answers signal 0.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !proc_stat_is_zombie(&stat),
        Err(_) => true,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn is_process_alive(pid: u32) -> bool {
    unix_signal_zero(pid)
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    let out = match std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .output()
    {
        Ok(v) => v,
        Err(_) => return false,
    };
    String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\""))
}

#[cfg(not(any(unix, windows)))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn unix_signal_zero(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().kind() == std::io::ErrorKind::PermissionDenied
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn proc_stat_is_zombie(stat: &str) -> bool {
    // Format: `pid (comm) state ...`; comm may itself contain ')'.
    let Some(end) = stat.rfind(')') else {
        return false;
    };
    matches!(stat[end + 1..].split_whitespace().next(), Some("Z") | Some("X"))
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    let pid = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid pid"))?;
    // Prefer the group; fall back to the single pid for processes we did not spawn as leaders.
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc == 0 {
        return Ok(());
    }
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
pub fn signal_terminate(pid: u32) -> std::io::Result<()> {
    signal_group(pid, libc::SIGTERM)
}

#[cfg(unix)]
pub fn signal_kill(pid: u32) -> std::io::Result<()> {
    signal_group(pid, libc::SIGKILL)
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> std::io::Result<()> {
    let pid = pid.to_string();
    let mut args = vec!["/PID", pid.as_str(), "/T"];
    if force {
        args.push("/F");
    }
    let status = std::process::Command::new("taskkill").args(&args).status()?;
    if !status.success() {
        return Err(std::io::Error::other(format!("taskkill exited with {status}")));
    }
    Ok(())
}

#[cfg(windows)]
pub fn signal_terminate(pid: u32) -> std::io::Result<()> {
    taskkill(pid, false)
}

#[cfg(windows)]
pub fn signal_kill(pid: u32) -> std::io::Result<()> {
    taskkill(pid, true)
}

#[cfg(not(any(unix, windows)))]
pub fn signal_terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "terminate not supported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
pub fn signal_kill(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "kill not supported on this platform",
    ))
}

/// Resolves once `pid` no longer passes the liveness check.
pub async fn wait_until_dead(pid: u32) {
    while is_process_alive(pid) {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// terminate -> wait up to `grace` for `exited` -> kill.
///
/// `exited` should resolve when the caller observes the process gone (a wait
/// on a local child, or [`wait_until_dead`] for a foreign pid).
pub async fn terminate_with_escalation<F>(pid: u32, grace: Duration, exited: F) -> StopOutcome
where
    F: Future<Output = ()>,
{
    if let Err(err) = signal_terminate(pid) {
        tracing::warn!(pid, error = %err, "terminate signal failed");
    } else {
        tracing::info!(pid, grace_ms = grace.as_millis() as u64, "sent terminate");
    }

    tokio::pin!(exited);
    if tokio::time::timeout(grace, &mut exited).await.is_ok() {
        return StopOutcome::Terminated;
    }

    tracing::warn!(pid, "process did not exit within grace period; killing");
    if let Err(err) = signal_kill(pid) {
        tracing::warn!(pid, error = %err, "kill signal failed");
    }
    // Bounded: a killed process that still lingers is reported as killed anyway.
    let _ = tokio::time::timeout(grace, exited).await;
    StopOutcome::Killed
}
