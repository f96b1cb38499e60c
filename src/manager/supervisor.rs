//! Per-process supervision task.
//!
//! The supervisor owns the OS child handle for its whole life. It relays
//! signals requested by the manager, forwards stdout/stderr into the log,
//! watches for the readiness line, and reports the exit exactly once.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::store::{AppId, BackendState};

/// Exit code a runtime reports after a SIGTERM it handled itself.
const SIGTERM_EXIT_CODE: i32 = 143;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Polite stop (SIGTERM)
    Terminate,
    /// Forced stop (SIGKILL)
    Kill,
}

/// How a backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Exit that could not be observed (wait failed)
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Whether the exit counts as a normal stop rather than a failure.
    pub fn is_clean(self, stop_requested: bool) -> bool {
        if stop_requested {
            return true;
        }
        matches!(self.code, Some(0 | SIGTERM_EXIT_CODE))
            || self.signal == Some(Signal::SIGTERM as i32)
    }

    /// Durable state that follows this exit.
    pub fn final_state(self, stop_requested: bool) -> BackendState {
        if self.is_clean(stop_requested) {
            BackendState::Stopped
        } else {
            BackendState::FailedToStart
        }
    }

    pub fn describe(self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(sig)) => match Signal::try_from(sig) {
                Ok(signal) => format!("killed by {} (signal {sig})", signal.as_str()),
                Err(_) => format!("killed by signal {sig}"),
            },
            (None, None) => "exited (unknown status)".to_string(),
        }
    }
}

/// Handles returned to the manager for a supervised process.
#[derive(Debug)]
pub struct Supervision {
    pub control: mpsc::UnboundedSender<ControlSignal>,
    pub exited: watch::Receiver<Option<ExitReport>>,
    /// Fires when a stdout line mentions the port. Never fires when readiness
    /// detection is off.
    pub ready: oneshot::Receiver<()>,
}

/// Take ownership of `child` and supervise it until exit.
///
/// `on_exit` runs before the exit is published on `exited`, so anyone waiting
/// on the watch sees the bookkeeping already done.
pub fn supervise<F, Fut>(
    app_id: AppId,
    mut child: Child,
    port: u16,
    detect_ready: bool,
    on_exit: F,
) -> Supervision
where
    F: FnOnce(ExitReport) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let pid = child.id();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    let (ready_tx, ready_rx) = oneshot::channel();
    let ready_tx = detect_ready.then_some(ready_tx);

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pipe_output(app_id.clone(), "stdout", stdout, port, ready_tx));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pipe_output(app_id.clone(), "stderr", stderr, port, None));
    }

    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = control_rx.recv() => deliver(&app_id, &mut child, pid, signal),
            }
        };

        let report = match status {
            Ok(status) => ExitReport::from_status(status),
            Err(e) => {
                error!(app_id = %app_id, error = %e, "Failed to wait for backend process");
                ExitReport::unknown()
            }
        };
        debug!(app_id = %app_id, pid, exit = %report.describe(), "Backend process exited");

        on_exit(report).await;
        exit_tx.send_replace(Some(report));
    });

    Supervision {
        control: control_tx,
        exited: exit_rx,
        ready: ready_rx,
    }
}

fn deliver(app_id: &AppId, child: &mut Child, pid: Option<u32>, signal: ControlSignal) {
    match signal {
        ControlSignal::Terminate => {
            let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
                warn!(app_id = %app_id, "No pid to send SIGTERM to");
                return;
            };
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(app_id = %app_id, pid, error = %e, "Failed to send SIGTERM");
            }
        }
        ControlSignal::Kill => {
            if let Err(e) = child.start_kill() {
                warn!(app_id = %app_id, error = %e, "Failed to send SIGKILL");
            }
        }
    }
}

async fn pipe_output<R>(
    app_id: AppId,
    stream: &'static str,
    reader: R,
    port: u16,
    mut ready: Option<oneshot::Sender<()>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(app_id = %app_id, stream, "{line}");
                if ready.is_some() && mentions_port(&line, port) {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(app_id = %app_id, stream, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

/// True if the line contains the port as a standalone number.
pub fn mentions_port(line: &str, port: u16) -> bool {
    let port = port.to_string();
    line.split(|c: char| !c.is_ascii_digit())
        .any(|token| token == port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::app_id;
    use std::process::Stdio;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::process::Command;

    fn shell(script: &str) -> Child {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    async fn wait_exit(exited: &mut watch::Receiver<Option<ExitReport>>) -> ExitReport {
        let report = tokio::time::timeout(Duration::from_secs(5), exited.wait_for(Option::is_some))
            .await
            .expect("process did not exit in time")
            .unwrap();
        report.expect("exit published")
    }

    #[test]
    fn test_mentions_port() {
        assert!(mentions_port("Deno server running on port 9000", 9000));
        assert!(mentions_port("Listening on http://0.0.0.0:9000/", 9000));
        assert!(!mentions_port("Listening on port 90001", 9000));
        assert!(!mentions_port("booting", 9000));
    }

    #[test]
    fn test_exit_classification() {
        let code = |c| ExitReport {
            code: Some(c),
            signal: None,
        };
        let signal = |s| ExitReport {
            code: None,
            signal: Some(s),
        };

        assert_eq!(code(0).final_state(false), BackendState::Stopped);
        assert_eq!(code(143).final_state(false), BackendState::Stopped);
        assert_eq!(signal(15).final_state(false), BackendState::Stopped);
        assert_eq!(code(1).final_state(false), BackendState::FailedToStart);
        assert_eq!(signal(9).final_state(false), BackendState::FailedToStart);
        assert_eq!(signal(9).final_state(true), BackendState::Stopped);
        assert_eq!(code(3).final_state(true), BackendState::Stopped);
        assert_eq!(
            ExitReport::unknown().final_state(false),
            BackendState::FailedToStart
        );
    }

    #[test]
    fn test_describe() {
        let report = ExitReport {
            code: None,
            signal: Some(9),
        };
        assert_eq!(report.describe(), "killed by SIGKILL (signal 9)");
        let report = ExitReport {
            code: Some(2),
            signal: None,
        };
        assert_eq!(report.describe(), "exited with code 2");
        assert_eq!(ExitReport::unknown().describe(), "exited (unknown status)");
    }

    #[tokio::test]
    async fn test_exit_is_reported_after_callback() {
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();
        let mut supervision = supervise(app_id("sup-exit"), shell("exit 4"), 9000, false, move |r| {
            let seen = seen_cb.clone();
            async move {
                *seen.lock().unwrap() = Some(r);
            }
        });

        let report = wait_exit(&mut supervision.exited).await;
        assert_eq!(report.code, Some(4));
        assert_eq!(*seen.lock().unwrap(), Some(report));
    }

    #[tokio::test]
    async fn test_terminate_then_kill() {
        let mut supervision = supervise(
            app_id("sup-term"),
            shell("exec sleep 30"),
            9000,
            false,
            |_| async {},
        );
        supervision.control.send(ControlSignal::Terminate).unwrap();
        let report = wait_exit(&mut supervision.exited).await;
        assert_eq!(report.signal, Some(Signal::SIGTERM as i32));

        let mut supervision = supervise(
            app_id("sup-kill"),
            shell("exec sleep 30"),
            9000,
            false,
            |_| async {},
        );
        supervision.control.send(ControlSignal::Kill).unwrap();
        let report = wait_exit(&mut supervision.exited).await;
        assert_eq!(report.signal, Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_ready_fires_on_port_line() {
        let supervision = supervise(
            app_id("sup-ready"),
            shell("echo 'Deno server running on port 9123'; exec sleep 30"),
            9123,
            true,
            |_| async {},
        );
        tokio::time::timeout(Duration::from_secs(5), supervision.ready)
            .await
            .expect("readiness not detected")
            .unwrap();
        supervision.control.send(ControlSignal::Kill).unwrap();
    }

    #[tokio::test]
    async fn test_ready_never_fires_when_disabled() {
        let supervision = supervise(
            app_id("sup-noready"),
            shell("echo 'port 9124'; exec sleep 30"),
            9124,
            false,
            |_| async {},
        );
        // Sender is dropped up front, so the receiver errors instead of firing
        assert!(supervision.ready.await.is_err());
        supervision.control.send(ControlSignal::Kill).unwrap();
    }
}
