//! Shell command execution with a watchdog timeout.
//!
//! Every command runs as `sh -c <command>` in its own process group with
//! piped stdin/stdout/stderr. A watchdog thread sends SIGTERM to the group
//! when the timeout elapses; the partial output read so far is returned.
//! Non-zero exit codes are data, not errors. Only a failure to spawn the
//! shell is reported as an `Error`.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::shell;

/// Captured output of a finished (or killed) command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, or the negated signal number if a signal ended it.
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// Children are spawned as group leaders, so the group id equals the pid.
pub(crate) fn signal_group(pid: i32, signal: Signal) -> bool {
    if pid <= 0 {
        return false;
    }
    killpg(Pid::from_raw(pid), signal).is_ok()
}

pub(crate) fn terminate_group(pid: i32) -> bool {
    signal_group(pid, Signal::SIGTERM)
}

/// Tracks the child processes spawned on behalf of one batch worker so the
/// orchestrator can terminate them.
#[derive(Debug, Default)]
pub struct ChildTracker {
    terminated: AtomicBool,
    pids: Mutex<HashSet<i32>>,
}

impl ChildTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request termination: flags the tracker and signals every live child.
    ///
    /// Advisory only. A child that is about to exit may finish first.
    pub fn terminate(&self) -> usize {
        self.terminated.store(true, Ordering::SeqCst);
        let pids = self.pids.lock();
        pids.iter().filter(|pid| terminate_group(**pid)).count()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn register(&self, pid: i32) {
        self.pids.lock().insert(pid);
        // A child spawned after termination was requested is stopped right away.
        if self.is_terminated() {
            terminate_group(pid);
        }
    }

    fn unregister(&self, pid: i32) {
        self.pids.lock().remove(&pid);
    }
}

struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<bool>>,
}

impl Watchdog {
    fn arm(pid: i32, timeout: Duration) -> Self {
        let (cancel, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || match rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                if terminate_group(pid) {
                    tracing::error!(pid, "launch_cmd: pid {} killed by timeout", pid);
                }
                true
            }
            _ => false,
        });

        Self {
            cancel: Some(cancel),
            handle: Some(handle),
        }
    }

    /// Cancel the timer. Returns true when it had already fired.
    fn disarm(&mut self) -> bool {
        drop(self.cancel.take());
        self.handle
            .take()
            .map(|handle| handle.join().unwrap_or(false))
            .unwrap_or(false)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Run `command` through `sh -c` with a hard timeout.
pub fn launch_cmd(command: &str, timeout: Duration, input: Option<&[u8]>) -> Result<CommandResult> {
    launch_cmd_tracked(command, timeout, input, None)
}

/// Like [`launch_cmd`], registering the child with `tracker` while it runs.
pub fn launch_cmd_tracked(
    command: &str,
    timeout: Duration,
    input: Option<&[u8]>,
    tracker: Option<&ChildTracker>,
) -> Result<CommandResult> {
    launch_cmd_redacted(command, &shell::redact_secrets(command), timeout, input, tracker)
}

/// Like [`launch_cmd_tracked`]; `display` stands in for `command` in logs
/// and errors.
pub fn launch_cmd_redacted(
    command: &str,
    display: &str,
    timeout: Duration,
    input: Option<&[u8]>,
    tracker: Option<&ChildTracker>,
) -> Result<CommandResult> {
    // `display` would resolve to `tracing::field::display` inside the macros.
    let shown = display;
    tracing::info!(command = shown, "launching cmd");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| Error::command_spawn_failed(display, e.to_string()))?;

    let pid = child.id() as i32;
    if let Some(tracker) = tracker {
        tracker.register(pid);
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let mut watchdog = Watchdog::arm(pid, timeout);
    if let Err(err) = communicate(&mut child, input, &mut stdout, &mut stderr) {
        tracing::warn!(pid, error = %err, "communication with child failed, killing its group");
        signal_group(pid, Signal::SIGKILL);
        drop(child.stdin.take());
        drain(&mut child, &mut stdout, &mut stderr);
    }

    // The exited child stays a zombie until reaped, so its pid and group id
    // cannot be reused while the watchdog or tracker may still signal them.
    if let Err(err) = wait_exited(pid) {
        tracing::warn!(pid, error = %err, "failed to wait for child");
    }
    let timed_out = watchdog.disarm();
    if let Some(tracker) = tracker {
        tracker.unregister(pid);
    }

    let exit_code = match child.wait() {
        Ok(status) => exit_code(status),
        Err(err) => {
            tracing::warn!(pid, error = %err, "failed to reap child");
            -1
        }
    };

    let result = CommandResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: strip_one_newline(String::from_utf8_lossy(&stderr).into_owned()),
        exit_code,
    };

    tracing::debug!(
        command = shown,
        exit_code = result.exit_code,
        timed_out,
        stdin = ?input.map(String::from_utf8_lossy),
        stdout = %result.stdout,
        stderr = %result.stderr,
        "command finished"
    );

    Ok(result)
}

/// Block until `pid` has exited without reaping it.
fn wait_exited(pid: i32) -> nix::Result<()> {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT;
    loop {
        match waitid(Id::Pid(Pid::from_raw(pid)), flags) {
            Err(Errno::EINTR) => continue,
            other => return other.map(|_| ()),
        }
    }
}

/// Feed stdin and read stdout/stderr to EOF without deadlocking on full pipes.
///
/// Output read before a failure stays in the buffers.
fn communicate(
    child: &mut Child,
    input: Option<&[u8]>,
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
) -> io::Result<()> {
    let stdin = child.stdin.take();
    let input = input.map(<[u8]>::to_vec);
    let writer = thread::spawn(move || -> io::Result<()> {
        if let (Some(mut stdin), Some(input)) = (stdin, input) {
            match stdin.write_all(&input) {
                Err(err) if err.kind() != io::ErrorKind::BrokenPipe => return Err(err),
                _ => {}
            }
        }
        Ok(())
    });

    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let res = pipe.read_to_end(&mut buf);
            (buf, res)
        })
    });

    let stdout_res = match child.stdout.take() {
        Some(mut pipe) => pipe.read_to_end(stdout).map(|_| ()),
        None => Ok(()),
    };

    if let Some(reader) = stderr_reader {
        match reader.join() {
            Ok((buf, res)) => {
                stderr.extend_from_slice(&buf);
                res?;
            }
            Err(_) => return Err(io::Error::other("stderr reader panicked")),
        }
    }

    writer
        .join()
        .map_err(|_| io::Error::other("stdin writer panicked"))??;

    stdout_res
}

/// Best-effort drain after a failed exchange: whatever pipes are still
/// attached are read to EOF.
fn drain(child: &mut Child, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) {
    if let Some(mut pipe) = child.stdout.take() {
        let _ = pipe.read_to_end(stdout);
    }
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_end(stderr);
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

fn strip_one_newline(mut text: String) -> String {
    if text.ends_with('\n') {
        text.pop();
    }
    text
}

/// Run `f` with a DEBUG subscriber on this thread and return what it logged.
#[cfg(test)]
pub(crate) fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let buffer = Buffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    let value = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock()).into_owned();
    (value, logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::time::Instant;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn captures_stdout_and_exit_code() {
        let result = launch_cmd("echo hello", 5 * SECOND, None).unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, 0);
        assert!(result.success());
    }

    #[test]
    fn strips_exactly_one_trailing_newline_from_stderr() {
        let result = launch_cmd("printf 'oops\\n\\n' >&2", 5 * SECOND, None).unwrap();
        assert_eq!(result.stderr, "oops\n");
    }

    #[test]
    fn nonzero_exit_is_returned_not_raised() {
        let result = launch_cmd("echo bad >&2; exit 3", 5 * SECOND, None).unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr, "bad");
        assert!(!result.success());
    }

    #[test]
    fn feeds_input_to_stdin() {
        let result = launch_cmd("cat", 5 * SECOND, Some(b"line one\nline two")).unwrap();
        assert_eq!(result.stdout, "line one\nline two");
    }

    #[test]
    fn closes_stdin_when_no_input_given() {
        let result = launch_cmd("cat; echo done", 5 * SECOND, None).unwrap();
        assert_eq!(result.stdout, "done\n");
    }

    #[test]
    fn timeout_kills_the_child_and_returns_promptly() {
        let started = Instant::now();
        let result = launch_cmd("sleep 5", SECOND, None).unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(result.exit_code, -(Signal::SIGTERM as i32));
    }

    #[test]
    fn timeout_keeps_partial_output() {
        let result = launch_cmd("echo partial; sleep 5", SECOND, None).unwrap();
        assert_eq!(result.stdout, "partial\n");
        assert_eq!(result.exit_code, -(Signal::SIGTERM as i32));
    }

    #[test]
    fn fast_command_is_not_signalled() {
        let result = launch_cmd("sleep 0.1; exit 0", 5 * SECOND, None).unwrap();
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn tracker_terminates_registered_child() {
        let tracker = ChildTracker::new();
        let worker_tracker = Arc::clone(&tracker);
        let started = Instant::now();

        let handle = thread::spawn(move || {
            launch_cmd_tracked("sleep 5", 30 * SECOND, None, Some(&worker_tracker)).unwrap()
        });

        // Wait until the child is registered.
        while tracker.pids.lock().is_empty() {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(tracker.terminate(), 1);

        let result = handle.join().unwrap();
        assert_eq!(result.exit_code, -(Signal::SIGTERM as i32));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(tracker.pids.lock().is_empty());
    }

    #[test]
    fn tracker_stops_children_spawned_after_termination() {
        let tracker = ChildTracker::new();
        tracker.terminate();

        let result = launch_cmd_tracked("sleep 5", 30 * SECOND, None, Some(&tracker)).unwrap();
        assert_eq!(result.exit_code, -(Signal::SIGTERM as i32));
    }

    #[test]
    fn strip_one_newline_only_removes_one() {
        assert_eq!(strip_one_newline("a\n\n".to_string()), "a\n");
        assert_eq!(strip_one_newline("a".to_string()), "a");
        assert_eq!(strip_one_newline(String::new()), "");
    }

    #[test]
    fn credentials_are_masked_in_logs() {
        let (result, logs) = capture_logs(|| {
            launch_cmd("OS_PASSWORD=hunter2 sh -c 'test -n \"$OS_PASSWORD\"'", 5 * SECOND, None)
        });

        assert_eq!(result.unwrap().exit_code, 0);
        assert!(logs.contains("launching cmd"), "{}", logs);
        assert!(logs.contains("command finished"), "{}", logs);
        assert!(logs.contains("OS_PASSWORD=******"), "{}", logs);
        assert!(!logs.contains("hunter2"), "{}", logs);
    }

    #[test]
    fn explicit_display_replaces_command_in_logs() {
        let (result, logs) = capture_logs(|| {
            launch_cmd_redacted("echo hidden-value", "echo <masked>", 5 * SECOND, None, None)
        });

        assert_eq!(result.unwrap().stdout, "hidden-value\n");
        assert!(logs.contains("echo <masked>"), "{}", logs);
        assert!(!logs.contains("echo hidden-value"), "{}", logs);
    }

    #[test]
    fn timeout_applies_after_child_closes_its_pipes() {
        let started = Instant::now();
        let result = launch_cmd("exec >/dev/null 2>&1; sleep 5", SECOND, None).unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(result.exit_code, -(Signal::SIGTERM as i32));
    }

    #[test]
    fn tracked_child_stays_registered_until_it_exits() {
        let tracker = ChildTracker::new();
        let worker_tracker = Arc::clone(&tracker);

        let handle = thread::spawn(move || {
            launch_cmd_tracked("exec >/dev/null 2>&1; sleep 5", 30 * SECOND, None, Some(&worker_tracker))
                .unwrap()
        });

        while tracker.pids.lock().is_empty() {
            thread::sleep(Duration::from_millis(10));
        }
        // Output pipes are already closed; the child is still reachable.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(tracker.terminate(), 1);

        let result = handle.join().unwrap();
        assert_eq!(result.exit_code, -(Signal::SIGTERM as i32));
        assert!(tracker.pids.lock().is_empty());
    }

    #[test]
    fn killing_the_group_reaches_grandchildren() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & echo started; wait")
            .stdout(Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        let mut stdout = io::BufReader::new(child.stdout.take().unwrap());
        let mut line = String::new();
        stdout.read_line(&mut line).unwrap();
        assert_eq!(line, "started\n");

        let started = Instant::now();
        assert!(signal_group(pid, Signal::SIGKILL));

        // EOF only arrives once the backgrounded sleep holding the pipe is gone.
        let mut rest = String::new();
        stdout.read_to_string(&mut rest).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(child.wait().unwrap().signal(), Some(Signal::SIGKILL as i32));
    }

    #[test]
    fn signalling_invalid_group_fails() {
        assert!(!signal_group(0, Signal::SIGTERM));
        assert!(!terminate_group(-1));
    }
}
