//! Subprocess lifecycle: spawn into a fresh process group, capture output,
//! wait with timeout and cancellation, kill the whole group.

use crate::cancel::CancelToken;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// How often a waiting slot checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for a killed group to be reaped or for pipes to drain
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Termination status of the direct child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

/// Resource usage of the child and its reaped descendants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub user_time: Duration,
    pub sys_time: Duration,
    pub max_rss_kib: u64,
}

/// Reaped child
#[derive(Debug, Clone, Copy)]
pub struct Exit {
    pub status: ExitStatus,
    pub usage: ResourceUsage,
    /// When `wait4` returned
    pub finished: Instant,
}

#[derive(Debug)]
pub enum WaitError {
    TimedOut,
    Cancelled,
    Io(io::Error),
}

/// A running child leading its own process group
///
/// Dropping an unfinished group kills every process in it.
pub struct ProcessGroup {
    pid: u32,
    finished: bool,
    waiter: Receiver<io::Result<Exit>>,
    stdout: Option<Receiver<String>>,
    stderr: Option<Receiver<String>>,
}

impl ProcessGroup {
    /// Spawn `command` as the leader of a new process group
    ///
    /// stdin is closed; stdout and stderr are captured keeping the last
    /// `capture_limit` bytes of each.
    pub fn spawn(command: &mut Command, capture_limit: usize) -> io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take().and_then(|s| capture(s, capture_limit));
        let stderr = child.stderr.take().and_then(|s| capture(s, capture_limit));

        let (tx, waiter) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("isobench-wait-{pid}"))
            .spawn(move || {
                let _ = tx.send(wait_for(pid));
            });

        if let Err(e) = spawned {
            kill_group(pid);
            let _ = wait_for(pid);
            return Err(e);
        }

        Ok(Self {
            pid,
            finished: false,
            waiter,
            stdout,
            stderr,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the child to exit
    ///
    /// `timeout` counts from `started`. On timeout or cancellation the whole
    /// group is killed with SIGKILL and reaped before returning.
    pub fn wait(
        &mut self,
        started: Instant,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Exit, WaitError> {
        loop {
            if cancel.is_cancelled() {
                self.terminate();
                return Err(WaitError::Cancelled);
            }

            let mut slice = POLL_INTERVAL;
            if let Some(limit) = timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    self.terminate();
                    return Err(WaitError::TimedOut);
                }
                slice = slice.min(limit - elapsed);
            }

            match self.waiter.recv_timeout(slice) {
                Ok(result) => {
                    self.finished = true;
                    return result.map_err(WaitError::Io);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    return Err(WaitError::Io(io::Error::other("waiter thread exited")));
                }
            }
        }
    }

    /// Captured stdout and stderr tails
    ///
    /// A stream still held open by an escaped descendant yields an empty
    /// string after a grace period.
    pub fn take_output(&mut self) -> (String, String) {
        let collect = |rx: Option<Receiver<String>>| {
            rx.and_then(|rx| rx.recv_timeout(DRAIN_GRACE).ok())
                .unwrap_or_default()
        };
        (collect(self.stdout.take()), collect(self.stderr.take()))
    }

    fn terminate(&mut self) {
        if self.finished {
            return;
        }
        kill_group(self.pid);
        if self.waiter.recv_timeout(DRAIN_GRACE).is_err() {
            tracing::warn!(pid = self.pid, "Killed process group was not reaped in time");
        }
        self.finished = true;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn kill_group(pid: u32) {
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Blocking `wait4` on `pid`, retried on EINTR
fn wait_for(pid: u32) -> io::Result<Exit> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        let rc = unsafe { libc::wait4(pid as libc::pid_t, &mut status, 0, &mut usage) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    let finished = Instant::now();

    let status = if libc::WIFSIGNALED(status) {
        ExitStatus::Signaled(libc::WTERMSIG(status))
    } else {
        ExitStatus::Exited(libc::WEXITSTATUS(status))
    };

    #[cfg(target_os = "macos")]
    let max_rss_kib = usage.ru_maxrss.max(0) as u64 / 1024;
    #[cfg(not(target_os = "macos"))]
    let max_rss_kib = usage.ru_maxrss.max(0) as u64;

    Ok(Exit {
        status,
        usage: ResourceUsage {
            user_time: timeval_to_duration(usage.ru_utime),
            sys_time: timeval_to_duration(usage.ru_stime),
            max_rss_kib,
        },
        finished,
    })
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
}

/// Drain a pipe on its own thread, keeping the last `limit` bytes
fn capture<R: Read + Send + 'static>(mut source: R, limit: usize) -> Option<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("isobench-capture".to_string())
        .spawn(move || {
            let mut kept = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        kept.extend_from_slice(&buf[..n]);
                        if kept.len() > limit.saturating_mul(2).max(buf.len()) {
                            let cut = kept.len() - limit;
                            kept.drain(..cut);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            if kept.len() > limit {
                let cut = kept.len() - limit;
                kept.drain(..cut);
            }
            let _ = tx.send(String::from_utf8_lossy(&kept).into_owned());
        })
        .ok()?;
    Some(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn test_exit_status_and_output() {
        let mut group =
            ProcessGroup::spawn(&mut sh("echo out; echo err >&2; exit 3"), 1024).unwrap();
        let exit = group
            .wait(Instant::now(), None, &CancelToken::new())
            .unwrap();
        assert_eq!(exit.status, ExitStatus::Exited(3));

        let (stdout, stderr) = group.take_output();
        assert_eq!(stdout, "out\n");
        assert_eq!(stderr, "err\n");
    }

    #[test]
    fn test_capture_keeps_tail() {
        let mut group = ProcessGroup::spawn(&mut sh("printf 'abcdefghij'"), 4).unwrap();
        group.wait(Instant::now(), None, &CancelToken::new()).unwrap();
        let (stdout, _) = group.take_output();
        assert_eq!(stdout, "ghij");
    }

    #[test]
    fn test_signaled() {
        let mut group = ProcessGroup::spawn(&mut sh("kill -9 $$"), 64).unwrap();
        let exit = group.wait(Instant::now(), None, &CancelToken::new()).unwrap();
        assert_eq!(exit.status, ExitStatus::Signaled(libc::SIGKILL));
    }

    #[test]
    fn test_timeout_kills_group() {
        let start = Instant::now();
        // the background sleep keeps the pipe open unless the group dies
        let mut group = ProcessGroup::spawn(&mut sh("sleep 5 & sleep 5"), 64).unwrap();
        let result = group.wait(start, Some(Duration::from_millis(20)), &CancelToken::new());
        assert!(matches!(result, Err(WaitError::TimedOut)));

        let _ = group.take_output();
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let cancel = CancelToken::new();
        let mut group = ProcessGroup::spawn(&mut sh("sleep 5"), 64).unwrap();

        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            trigger.cancel();
        });

        let start = Instant::now();
        let result = group.wait(start, None, &cancel);
        canceller.join().unwrap();
        assert!(matches!(result, Err(WaitError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_spawn_failure() {
        let result = ProcessGroup::spawn(&mut Command::new("/nonexistent/isobench-binary"), 64);
        assert!(result.is_err());
    }

    #[test]
    fn test_rusage_collected() {
        let script = "i=0; while [ $i -lt 20000 ]; do i=$((i+1)); done";
        let mut group = ProcessGroup::spawn(&mut sh(script), 64).unwrap();
        let exit = group.wait(Instant::now(), None, &CancelToken::new()).unwrap();
        assert_eq!(exit.status, ExitStatus::Exited(0));
        assert!(exit.usage.max_rss_kib > 0);
    }
}
