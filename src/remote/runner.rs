//! Runs the command on one opened session.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::error::HostError;
use super::session::{ExecChannel, RemoteSession};
use super::types::{ChannelEvent, PtyConfig, RunResult};

/// Run `command` on `session` and forward its output bytes to `bytes`.
///
/// Requests a pty first when `pty` is set. Stdout and stderr go to the same
/// stream. The session is closed and `bytes` dropped before returning, so
/// the host's drain task sees the end of its stream.
///
/// A zero exit status is a success. A non-zero or missing one, or a kill
/// signal, is a [`HostError::CommandExecution`].
pub async fn run(
    session: Arc<RemoteSession>,
    mut channel: Box<dyn ExecChannel>,
    command: &str,
    pty: Option<&PtyConfig>,
    bytes: mpsc::Sender<Vec<u8>>,
) -> RunResult {
    let result = run_command(&session, channel.as_mut(), command, pty, &bytes).await;
    drop(bytes);
    session.close().await;

    if let RunResult::Failed(err) = &result {
        error!(host = %err.host(), kind = err.kind(), "{}", err);
    }
    result
}

async fn run_command(
    session: &RemoteSession,
    channel: &mut dyn ExecChannel,
    command: &str,
    pty: Option<&PtyConfig>,
    bytes: &mpsc::Sender<Vec<u8>>,
) -> RunResult {
    let host = session.host().name.clone();

    if let Some(pty) = pty {
        if let Err(message) = channel.request_pty(pty).await {
            return RunResult::Failed(HostError::SessionStart { host, message });
        }
    }

    if let Err(message) = channel.exec(command).await {
        return RunResult::Failed(HostError::CommandExecution { host, message });
    }
    debug!(host = %host, "Started: {}", command);

    let mut exit_status = None;
    let mut exit_signal = None;
    let mut forwarding = true;
    while let Some(event) = channel.next_event().await {
        match event {
            ChannelEvent::Data(data) | ChannelEvent::ExtendedData(data) => {
                // Keep reading after the drain went away so the exit status
                // still arrives.
                if forwarding && bytes.send(data).await.is_err() {
                    forwarding = false;
                }
            }
            ChannelEvent::ExitStatus(status) => exit_status = Some(status),
            ChannelEvent::ExitSignal(signal) => exit_signal = Some(signal),
            ChannelEvent::Eof => {
                if exit_status.is_some() || exit_signal.is_some() {
                    break;
                }
            }
        }
    }

    match (exit_status, exit_signal) {
        (Some(0), _) => RunResult::Success { host },
        (Some(status), _) => RunResult::Failed(HostError::CommandExecution {
            host,
            message: format!("exited with status {}", status),
        }),
        (None, Some(signal)) => RunResult::Failed(HostError::CommandExecution {
            host,
            message: format!("killed by signal {}", signal),
        }),
        (None, None) => RunResult::Failed(HostError::CommandExecution {
            host,
            message: "channel closed without an exit status".to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::remote::session::Connection;
    use crate::remote::types::HostSpec;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct CountingConnection(pub(crate) Arc<AtomicUsize>);

    #[async_trait]
    impl Connection for CountingConnection {
        async fn disconnect(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Channel that replays a fixed script of events.
    #[derive(Default)]
    pub(crate) struct ScriptedChannel {
        pub(crate) pty_error: Option<String>,
        pub(crate) exec_error: Option<String>,
        pub(crate) events: VecDeque<ChannelEvent>,
        pub(crate) exec_calls: Arc<AtomicUsize>,
    }

    impl ScriptedChannel {
        pub(crate) fn with_output(lines: &[&str], status: u32) -> Self {
            let mut events: VecDeque<_> = lines
                .iter()
                .map(|l| ChannelEvent::Data(format!("{l}\n").into_bytes()))
                .collect();
            events.push_back(ChannelEvent::ExitStatus(status));
            events.push_back(ChannelEvent::Eof);
            Self {
                events,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ExecChannel for ScriptedChannel {
        async fn request_pty(&mut self, _pty: &PtyConfig) -> Result<(), String> {
            match self.pty_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn exec(&mut self, _command: &str) -> Result<(), String> {
            self.exec_calls.fetch_add(1, Ordering::SeqCst);
            match self.exec_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn next_event(&mut self) -> Option<ChannelEvent> {
            self.events.pop_front()
        }
    }

    fn session(counter: &Arc<AtomicUsize>) -> Arc<RemoteSession> {
        Arc::new(RemoteSession::new(
            HostSpec::parse("web1").unwrap(),
            Box::new(CountingConnection(counter.clone())),
        ))
    }

    async fn collect(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend(chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_success_forwards_output_and_closes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(16);
        let mut channel = ScriptedChannel::with_output(&["up 3 days"], 0);
        channel
            .events
            .push_front(ChannelEvent::ExtendedData(b"warn\n".to_vec()));

        let result = run(
            session(&counter),
            Box::new(channel),
            "uptime",
            Some(&PtyConfig::default()),
            tx,
        )
        .await;

        assert!(result.is_success());
        assert_eq!(result.host(), "web1");
        assert_eq!(collect(rx).await, b"warn\nup 3 days\n".to_vec());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_command_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, _rx) = mpsc::channel(16);
        let result = run(
            session(&counter),
            Box::new(ScriptedChannel::with_output(&[], 2)),
            "false",
            None,
            tx,
        )
        .await;

        match result {
            RunResult::Failed(HostError::CommandExecution { message, .. }) => {
                assert!(message.contains("status 2"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pty_failure_is_session_start_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(16);
        let channel = ScriptedChannel {
            pty_error: Some("pty request refused by server".to_string()),
            ..ScriptedChannel::default()
        };
        let calls = channel.exec_calls.clone();

        let result = run(
            session(&counter),
            Box::new(channel),
            "uptime",
            Some(&PtyConfig::default()),
            tx,
        )
        .await;

        assert!(matches!(
            result,
            RunResult::Failed(HostError::SessionStart { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(collect(rx).await.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exec_failure_is_command_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, _rx) = mpsc::channel(16);
        let channel = ScriptedChannel {
            exec_error: Some("exec request refused by server".to_string()),
            ..ScriptedChannel::default()
        };

        let result = run(session(&counter), Box::new(channel), "uptime", None, tx).await;

        assert!(matches!(
            result,
            RunResult::Failed(HostError::CommandExecution { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_exit_status_is_command_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, _rx) = mpsc::channel(16);
        let channel = ScriptedChannel {
            events: VecDeque::from(vec![ChannelEvent::Data(b"partial".to_vec())]),
            ..ScriptedChannel::default()
        };

        let result = run(session(&counter), Box::new(channel), "cat", None, tx).await;

        assert!(!result.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kill_signal_is_command_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(16);
        let channel = ScriptedChannel {
            events: VecDeque::from(vec![
                ChannelEvent::Data(b"working\n".to_vec()),
                ChannelEvent::ExitSignal("KILL".to_string()),
                ChannelEvent::Eof,
            ]),
            ..ScriptedChannel::default()
        };

        let result = run(session(&counter), Box::new(channel), "sleep 60", None, tx).await;

        match result {
            RunResult::Failed(HostError::CommandExecution { message, .. }) => {
                assert_eq!(message, "killed by signal KILL");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(collect(rx).await, b"working\n".to_vec());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_still_reports_exit() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = run(
            session(&counter),
            Box::new(ScriptedChannel::with_output(&["a", "b", "c"], 0)),
            "ls",
            None,
            tx,
        )
        .await;

        assert!(result.is_success());
    }
}
