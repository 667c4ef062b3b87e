//! Process utilities for child process management.

use std::collections::VecDeque;
use tokio::process::Child;

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

fn exit_status_code_parts(code: Option<i32>, _signal: Option<i32>) -> Option<i32> {
    if let Some(code) = code {
        return Some(code);
    }
    #[cfg(unix)]
    {
        if let Some(signal) = _signal {
            return Some(128 + signal);
        }
    }
    None
}

/// Extract exit code from ExitStatus, using 128+signal for signal-terminated processes on Unix.
pub(crate) fn exit_status_code(status: &std::process::ExitStatus) -> Option<i32> {
    let code = status.code();
    #[cfg(unix)]
    let signal = status.signal();
    #[cfg(not(unix))]
    let signal = None;
    exit_status_code_parts(code, signal)
}

/// Signal that terminated the process, if any.
pub(crate) fn terminating_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

/// Attempt to capture the exit code from a child process.
/// Tries non-blocking first, falls back to blocking wait if process hasn't exited.
pub(crate) async fn capture_exit_code(child: &mut Child) -> Option<i32> {
    match child.try_wait() {
        Ok(Some(status)) => exit_status_code(&status),
        Ok(None) => child
            .wait()
            .await
            .ok()
            .and_then(|status| exit_status_code(&status)),
        Err(_) => None,
    }
}

/// Kill the child and reap it so no zombie is left behind.
pub(crate) async fn kill_and_reap(child: &mut Child) -> Option<i32> {
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "kill failed, child likely already exited");
    }
    capture_exit_code(child).await
}

/// Line buffer that keeps only the most recent output within a byte cap.
#[derive(Debug)]
pub(crate) struct TailBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    cap: usize,
    dropped: usize,
}

impl TailBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            cap: cap.max(1),
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.cap && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len() + 1;
                self.dropped += 1;
            }
        }
    }

    /// Number of lines discarded to stay within the cap
    pub(crate) fn dropped(&self) -> usize {
        self.dropped
    }

    pub(crate) fn lines(&self) -> impl DoubleEndedIterator<Item = &String> {
        self.lines.iter()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub(crate) fn text(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_passthrough() {
        assert_eq!(exit_status_code_parts(Some(0), None), Some(0));
        assert_eq!(exit_status_code_parts(Some(1), None), Some(1));
        assert_eq!(exit_status_code_parts(Some(255), None), Some(255));
    }

    #[cfg(unix)]
    #[test]
    fn signal_exit_code() {
        // SIGKILL (9) -> 137
        assert_eq!(exit_status_code_parts(None, Some(9)), Some(137));
        assert_eq!(exit_status_code_parts(None, Some(15)), Some(143));
    }

    #[test]
    fn tail_buffer_keeps_latest() {
        let mut buf = TailBuffer::new(12);
        buf.push("aaaa".into());
        buf.push("bbbb".into());
        buf.push("cccc".into());
        assert_eq!(buf.text(), "bbbb\ncccc");
        assert_eq!(buf.dropped(), 1);
    }

    #[test]
    fn tail_buffer_keeps_oversized_single_line() {
        let mut buf = TailBuffer::new(2);
        buf.push("a very long line".into());
        assert_eq!(buf.text(), "a very long line");
        assert!(!buf.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_exit_code() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("exit 42")
            .spawn()
            .expect("failed to spawn");

        let code = capture_exit_code(&mut child).await;
        assert_eq!(code, Some(42));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_and_reap_reports_signal() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("10")
            .spawn()
            .expect("failed to spawn");

        let code = kill_and_reap(&mut child).await;
        assert_eq!(code, Some(137));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminating_signal() {
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("kill -9 $$")
            .status()
            .await
            .expect("failed to run");
        assert_eq!(terminating_signal(&status), Some(9));

        let status = tokio::process::Command::new("true")
            .status()
            .await
            .expect("failed to run");
        assert_eq!(terminating_signal(&status), None);
    }
}
