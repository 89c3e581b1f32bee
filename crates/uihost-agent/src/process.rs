use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
};

use crate::{
    error::{Error, Result},
    signals,
};

/// Lines kept for the combined output log returned by [`stream_output`].
const CAPTURE_MAX_LINES: usize = 2000;

pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // cursor 0 means "most recent lines".
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }

    pub fn joined(&self) -> String {
        let mut out = String::new();
        for (_, line) in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Shared cell holding the pid of the subprocess a task is currently running.
#[derive(Debug, Clone, Default)]
pub struct ChildSlot(Arc<Mutex<Option<u32>>>);

impl ChildSlot {
    pub fn get(&self) -> Option<u32> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, pid: Option<u32>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }
}

/// Clears the slot when the subprocess is done with.
///
/// Dropped while still armed (the owning future was abandoned mid-step), it
/// kills the whole process group: `kill_on_drop` alone only reaches the leader.
struct SlotGuard<'a> {
    slot: Option<&'a ChildSlot>,
    pid: Option<u32>,
    armed: bool,
}

impl SlotGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            slot.set(None);
        }
        if self.armed
            && let Some(pid) = self.pid
        {
            tracing::info!(pid, "step abandoned; killing its process group");
            if let Err(err) = signals::signal_kill(pid) {
                tracing::debug!(pid, error = %err, "group kill after abandon failed");
            }
        }
    }
}

/// Where subprocess output and pids are reported while a step runs.
#[derive(Clone, Default)]
pub struct OutputHooks {
    pub on_line: Option<LineCallback>,
    pub child_slot: Option<ChildSlot>,
}

impl OutputHooks {
    pub fn with_line(mut self, on_line: impl Fn(&str) + Send + Sync + 'static) -> Self {
        let previous = self.on_line.take();
        self.on_line = Some(Arc::new(move |line: &str| {
            if let Some(prev) = &previous {
                prev(line);
            }
            on_line(line);
        }));
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Kill the child if the owning future is dropped.
    pub kill_on_drop: bool,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            kill_on_drop: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn detached(mut self) -> Self {
        self.kill_on_drop = false;
        self
    }

    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    pub child: Child,
    pub pid: Option<u32>,
    pub program: String,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Interleaved stdout/stderr, bounded to the most recent lines.
    pub log: String,
}

impl ProcessOutput {
    pub fn exit_label(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// A program given as a path (rather than a bare name looked up on PATH).
fn is_path_like(program: &Path) -> bool {
    program.is_absolute() || program.components().count() > 1
}

pub fn run_process(command: &ProcessCommand, cwd: &Path) -> Result<ProcessHandle> {
    let program_label = command.program.display().to_string();
    let program = if is_path_like(&command.program) && command.program.is_relative() {
        cwd.join(&command.program)
    } else {
        command.program.clone()
    };

    if is_path_like(&program) && !program.exists() {
        return Err(Error::StartFailed {
            program: program_label,
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("executable not found at {}", program.display()),
            ),
        });
    }

    let mut cmd = Command::new(&program);
    cmd.current_dir(cwd)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(command.kill_on_drop);
    for (k, v) in &command.env {
        cmd.env(k, v);
    }

    #[cfg(unix)]
    {
        // Own process group: signals reach the whole tree, and a Ctrl-C aimed at the
        // agent's terminal does not take managed processes down with it.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = cmd.spawn().map_err(|source| Error::StartFailed {
        program: program_label.clone(),
        source,
    })?;
    let pid = child.id();
    tracing::debug!(program = %program_label, ?pid, cwd = %cwd.display(), "process started");

    Ok(ProcessHandle {
        child,
        pid,
        program: program_label,
    })
}

/// Splits a byte stream into lines on `\n` or `\r`.
///
/// Progress bars redraw with a bare `\r`, so each redraw surfaces as its own
/// line; the `\n` of a `\r\n` pair does not produce an extra empty line.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    fn feed(&mut self, chunk: &[u8], mut emit: impl FnMut(&[u8])) {
        for &b in chunk {
            match b {
                b'\n' if self.after_cr && self.pending.is_empty() => {}
                b'\n' | b'\r' => {
                    emit(&self.pending);
                    self.pending.clear();
                }
                other => self.pending.push(other),
            }
            self.after_cr = b == b'\r';
        }
    }

    /// Flushes a trailing chunk that never got a terminator.
    fn finish(&mut self, mut emit: impl FnMut(&[u8])) {
        if !self.pending.is_empty() {
            emit(&self.pending);
            self.pending.clear();
        }
    }
}

async fn drain_lines<R>(
    reader: R,
    stream: &'static str,
    pid: Option<u32>,
    on_line: Option<&LineCallback>,
    capture: &Mutex<LogBuffer>,
) where
    R: AsyncRead + Unpin,
{
    let mut emit = |raw: &[u8]| {
        let line = String::from_utf8_lossy(raw);
        tracing::debug!(target: "uihost_agent::process", ?pid, stream, "{line}");
        if let Some(cb) = on_line {
            cb(&line);
        }
        capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_line(line.into_owned());
    };

    let mut reader = BufReader::new(reader);
    let mut splitter = LineSplitter::default();
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(?pid, stream, error = %err, "output reader stopped");
                break;
            }
        };
        if chunk.is_empty() {
            break;
        }
        let n = chunk.len();
        splitter.feed(chunk, &mut emit);
        reader.consume(n);
    }
    splitter.finish(&mut emit);
}

/// Drains stdout and stderr concurrently, then waits for exit.
pub async fn stream_output(
    mut handle: ProcessHandle,
    on_line: Option<LineCallback>,
) -> Result<ProcessOutput> {
    let capture = Mutex::new(LogBuffer::new(CAPTURE_MAX_LINES));
    let stdout = handle.child.stdout.take();
    let stderr = handle.child.stderr.take();
    let pid = handle.pid;

    let out_task = async {
        if let Some(out) = stdout {
            drain_lines(out, "stdout", pid, on_line.as_ref(), &capture).await;
        }
    };
    let err_task = async {
        if let Some(err) = stderr {
            drain_lines(err, "stderr", pid, on_line.as_ref(), &capture).await;
        }
    };
    tokio::join!(out_task, err_task);

    let status = handle.child.wait().await.map_err(|e| {
        Error::Other(anyhow::Error::new(e).context(format!("wait for {}", handle.program)))
    })?;
    let log = capture.into_inner().unwrap_or_else(|e| e.into_inner()).joined();
    tracing::debug!(program = %handle.program, ?pid, code = ?status.code(), "process exited");

    Ok(ProcessOutput {
        exit_code: status.code(),
        success: status.success(),
        log,
    })
}

/// `run_process` + `stream_output`, publishing the pid into the hooks' slot meanwhile.
pub async fn run_to_completion(
    command: &ProcessCommand,
    cwd: &Path,
    hooks: &OutputHooks,
) -> Result<ProcessOutput> {
    let handle = run_process(command, cwd)?;
    if let Some(slot) = &hooks.child_slot {
        slot.set(handle.pid);
    }
    let guard = SlotGuard {
        slot: hooks.child_slot.as_ref(),
        pid: handle.pid,
        armed: command.kill_on_drop,
    };
    let out = stream_output(handle, hooks.on_line.clone()).await;
    guard.disarm();
    out
}
