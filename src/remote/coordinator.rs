//! Drives one run across every host.
//!
//! # State machine
//!
//! ```text
//! Idle -> Connecting -> Running -> Draining -> Terminated
//!              \____________\__________\________^   (interrupt)
//! ```
//!
//! - `Connecting`: one open task per host is in flight.
//! - `Running`: at least one session opened. Each opened session gets its
//!   runner and drain task straight away, other hosts may still be
//!   connecting.
//! - `Draining`: every host has opened or failed, runners are finishing.
//! - `Terminated`: entered once, either after the last runner completed or
//!   as soon as the interrupt fires.
//!
//! # Session cleanup
//!
//! Every opened session is closed exactly once through
//! [`RemoteSession::close`]. Runners close their own session, the
//! coordinator sweeps all of them on the way out, and an open that finishes
//! after the run ended closes its session itself.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::error::HostError;
use super::output::{self, BYTES_CHANNEL_CAPACITY, OutputLine};
use super::runner;
use super::session::{Connector, OpenedSession, RemoteSession};
use super::types::{HostSpec, PtyConfig, RunReport, RunResult};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Connecting,
    Running,
    Draining,
    Terminated,
}

impl RunState {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Running)
                | (Connecting, Draining)
                | (Connecting, Terminated)
                | (Running, Draining)
                | (Running, Terminated)
                | (Draining, Terminated)
        )
    }
}

/// Result of one open task.
enum OpenEvent {
    Opened(OpenedSession),
    Failed(HostError),
}

/// Runs one command on a set of hosts.
pub struct Coordinator {
    connector: Arc<dyn Connector>,
    hosts: Vec<HostSpec>,
    command: String,
    pty: Option<PtyConfig>,
    state: RunState,
}

impl Coordinator {
    pub fn new(
        connector: Arc<dyn Connector>,
        hosts: Vec<HostSpec>,
        command: impl Into<String>,
        pty: Option<PtyConfig>,
    ) -> Self {
        Self {
            connector,
            hosts,
            command: command.into(),
            pty,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn advance(&mut self, next: RunState) -> bool {
        if !self.state.can_advance_to(next) {
            warn!("Rejected run state transition {:?} -> {:?}", self.state, next);
            return false;
        }
        debug!("Run state {:?} -> {:?}", self.state, next);
        self.state = next;
        true
    }

    /// Run the command on every host until all runners finish or
    /// `interrupt` completes.
    ///
    /// Output lines go to `lines`. Every clone of it is gone by the time
    /// this returns, so its receiver sees the end of the stream once the
    /// buffered lines are read.
    ///
    /// A coordinator runs once. Calling this again logs a warning and
    /// returns an empty report.
    pub async fn run<F>(&mut self, lines: mpsc::Sender<OutputLine>, interrupt: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        if !self.advance(RunState::Connecting) {
            return RunReport::default();
        }
        info!("Running {:?} on {} host(s)", self.command, self.hosts.len());

        let mut open_rx = self.spawn_opens();
        let mut runners: JoinSet<RunResult> = JoinSet::new();
        let mut drains: JoinSet<usize> = JoinSet::new();
        let mut sessions: Vec<Arc<RemoteSession>> = Vec::new();
        let mut results = Vec::with_capacity(self.hosts.len());
        let mut connecting = true;
        let mut interrupted = false;

        tokio::pin!(interrupt);

        while connecting || !runners.is_empty() {
            tokio::select! {
                biased;

                _ = &mut interrupt => {
                    interrupted = true;
                    break;
                }

                event = open_rx.recv(), if connecting => match event {
                    Some(OpenEvent::Opened(opened)) => {
                        if self.state == RunState::Connecting {
                            self.advance(RunState::Running);
                        }
                        sessions.push(opened.session.clone());
                        self.start_host(opened, &lines, &mut runners, &mut drains);
                    }
                    Some(OpenEvent::Failed(err)) => {
                        error!(host = %err.host(), kind = err.kind(), "{}", err);
                        results.push(RunResult::Failed(err));
                    }
                    None => {
                        connecting = false;
                        self.advance(RunState::Draining);
                    }
                },

                Some(joined) = runners.join_next(), if !runners.is_empty() => match joined {
                    Ok(result) => results.push(result),
                    Err(e) => error!("Runner task failed: {}", e),
                },
            }
        }

        // Drains can stall on a printer that stopped reading, so the
        // interrupt still applies here.
        while !interrupted {
            tokio::select! {
                biased;

                _ = &mut interrupt => interrupted = true,

                joined = drains.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }

        if interrupted {
            info!("Interrupted, closing {} session(s)", sessions.len());
            open_rx.close();
            while let Ok(event) = open_rx.try_recv() {
                if let OpenEvent::Opened(opened) = event {
                    sessions.push(opened.session);
                }
            }
            join_all(sessions.iter().map(|s| s.close())).await;
            runners.shutdown().await;
            drains.shutdown().await;
        } else {
            join_all(sessions.iter().map(|s| s.close())).await;
        }

        self.advance(RunState::Terminated);
        let report = RunReport {
            results,
            opened: sessions.len(),
            interrupted,
        };
        info!(
            "Run finished: {} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        );
        report
    }

    /// Spawn one open task per host.
    ///
    /// The tasks are detached: an interrupt does not cancel a connect in
    /// flight. If the run is over when a task finishes, it closes its own
    /// session.
    fn spawn_opens(&self) -> mpsc::Receiver<OpenEvent> {
        let (open_tx, open_rx) = mpsc::channel(self.hosts.len().max(1));

        for host in &self.hosts {
            let connector = Arc::clone(&self.connector);
            let open_tx = open_tx.clone();
            let host = host.clone();

            tokio::spawn(async move {
                let event = match connector.open(&host).await {
                    Ok(opened) => OpenEvent::Opened(opened),
                    Err(err) => OpenEvent::Failed(err),
                };
                if let Err(mpsc::error::SendError(OpenEvent::Opened(opened))) =
                    open_tx.send(event).await
                {
                    debug!(host = %host, "Opened after the run ended, closing");
                    opened.session.close().await;
                }
            });
        }

        open_rx
    }

    /// Start the runner and drain task of an opened session.
    fn start_host(
        &self,
        opened: OpenedSession,
        lines: &mpsc::Sender<OutputLine>,
        runners: &mut JoinSet<RunResult>,
        drains: &mut JoinSet<usize>,
    ) {
        let OpenedSession { session, channel } = opened;
        let host: Arc<str> = Arc::from(session.host().name.as_str());
        let (bytes_tx, bytes_rx) = mpsc::channel(BYTES_CHANNEL_CAPACITY);

        drains.spawn(output::drain(host, bytes_rx, lines.clone()));

        let command = self.command.clone();
        let pty = self.pty.clone();
        runners.spawn(async move {
            runner::run(session, channel, &command, pty.as_ref(), bytes_tx).await
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::runner::tests::{CountingConnection, ScriptedChannel};
    use crate::remote::session::ExecChannel;
    use crate::remote::types::ChannelEvent;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Channel whose command prints forever.
    struct EndlessChannel;

    #[async_trait]
    impl ExecChannel for EndlessChannel {
        async fn request_pty(&mut self, _pty: &PtyConfig) -> Result<(), String> {
            Ok(())
        }

        async fn exec(&mut self, _command: &str) -> Result<(), String> {
            Ok(())
        }

        async fn next_event(&mut self) -> Option<ChannelEvent> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Some(ChannelEvent::Data(b"tick\n".to_vec()))
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        unreachable: HashSet<String>,
        pty_refused: HashSet<String>,
        endless: bool,
        lines_per_host: Option<usize>,
        open_delay: Option<Duration>,
        disconnects: Arc<AtomicUsize>,
        execs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn open(&self, host: &HostSpec) -> Result<OpenedSession, HostError> {
            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
            }
            if self.unreachable.contains(&host.name) {
                return Err(HostError::Connect {
                    host: host.name.clone(),
                    message: "Connection refused".to_string(),
                });
            }

            let session = Arc::new(RemoteSession::new(
                host.clone(),
                Box::new(CountingConnection(self.disconnects.clone())),
            ));
            let channel: Box<dyn ExecChannel> = if self.endless {
                Box::new(EndlessChannel)
            } else {
                let texts: Vec<String> = (1..=self.lines_per_host.unwrap_or(2))
                    .map(|n| format!("{} line {}", host.name, n))
                    .collect();
                let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
                let mut channel = ScriptedChannel::with_output(&texts, 0);
                channel.exec_calls = self.execs.clone();
                if self.pty_refused.contains(&host.name) {
                    channel.pty_error = Some("pty request refused by server".to_string());
                }
                Box::new(channel)
            };
            Ok(OpenedSession { session, channel })
        }
    }

    fn hosts(names: &[&str]) -> Vec<HostSpec> {
        names.iter().map(|n| HostSpec::parse(n).unwrap()).collect()
    }

    fn never() -> impl Future<Output = ()> {
        std::future::pending()
    }

    async fn collect(mut rx: mpsc::Receiver<OutputLine>) -> Vec<OutputLine> {
        let mut out = Vec::new();
        while let Some(line) = rx.recv().await {
            out.push(line);
        }
        out
    }

    mod state_machine {
        use super::*;
        use RunState::*;

        #[test]
        fn test_forward_path_is_legal() {
            assert!(Idle.can_advance_to(Connecting));
            assert!(Connecting.can_advance_to(Running));
            assert!(Running.can_advance_to(Draining));
            assert!(Draining.can_advance_to(Terminated));
        }

        #[test]
        fn test_interrupt_from_any_active_state() {
            for state in [Connecting, Running, Draining] {
                assert!(state.can_advance_to(Terminated));
            }
        }

        #[test]
        fn test_illegal_transitions_rejected() {
            assert!(!Idle.can_advance_to(Running));
            assert!(!Idle.can_advance_to(Terminated));
            assert!(!Running.can_advance_to(Connecting));
            assert!(!Draining.can_advance_to(Running));
            for state in [Idle, Connecting, Running, Draining, Terminated] {
                assert!(!Terminated.can_advance_to(state));
            }
        }
    }

    mod normal_path {
        use super::*;

        #[tokio::test]
        async fn test_every_host_runs_once() {
            let connector = Arc::new(FakeConnector::default());
            let mut coordinator = Coordinator::new(
                connector.clone(),
                hosts(&["a", "b", "c"]),
                "uptime",
                Some(PtyConfig::default()),
            );
            let (tx, rx) = mpsc::channel(64);
            let printer = tokio::spawn(collect(rx));

            let report = coordinator.run(tx, never()).await;

            assert_eq!(coordinator.state(), RunState::Terminated);
            assert_eq!(report.results.len(), 3);
            assert_eq!(report.succeeded(), 3);
            assert_eq!(report.opened, 3);
            assert!(!report.interrupted);
            assert_eq!(connector.execs.load(Ordering::SeqCst), 3);
            assert_eq!(connector.disconnects.load(Ordering::SeqCst), 3);

            let lines = printer.await.unwrap();
            assert_eq!(lines.len(), 6);
            for host in ["a", "b", "c"] {
                let texts: Vec<_> = lines
                    .iter()
                    .filter(|l| &*l.host == host)
                    .map(|l| l.text.clone())
                    .collect();
                assert_eq!(
                    texts,
                    vec![format!("{host} line 1"), format!("{host} line 2")]
                );
            }
        }

        #[tokio::test]
        async fn test_failed_host_produces_no_output() {
            let connector = Arc::new(FakeConnector {
                unreachable: HashSet::from(["c".to_string()]),
                ..FakeConnector::default()
            });
            let mut coordinator =
                Coordinator::new(connector.clone(), hosts(&["a", "c"]), "uptime", None);
            let (tx, rx) = mpsc::channel(64);
            let printer = tokio::spawn(collect(rx));

            let report = coordinator.run(tx, never()).await;

            assert_eq!(report.succeeded(), 1);
            assert_eq!(report.failed(), 1);
            assert_eq!(report.opened, 1);
            let failed: Vec<_> = report.results.iter().filter(|r| !r.is_success()).collect();
            assert_eq!(failed[0].host(), "c");
            assert_eq!(connector.execs.load(Ordering::SeqCst), 1);

            let lines = printer.await.unwrap();
            assert_eq!(lines.len(), 2);
            assert!(lines.iter().all(|l| &*l.host == "a"));
        }

        #[tokio::test]
        async fn test_pty_failure_is_host_scoped() {
            let connector = Arc::new(FakeConnector {
                pty_refused: HashSet::from(["b".to_string()]),
                ..FakeConnector::default()
            });
            let mut coordinator = Coordinator::new(
                connector.clone(),
                hosts(&["a", "b"]),
                "uptime",
                Some(PtyConfig::default()),
            );
            let (tx, rx) = mpsc::channel(64);
            let printer = tokio::spawn(collect(rx));

            let report = coordinator.run(tx, never()).await;

            assert_eq!(report.succeeded(), 1);
            let failed = report
                .results
                .iter()
                .find(|r| !r.is_success())
                .unwrap();
            assert!(matches!(
                failed,
                RunResult::Failed(HostError::SessionStart { host, .. }) if host == "b"
            ));
            assert_eq!(connector.disconnects.load(Ordering::SeqCst), 2);
            assert!(printer.await.unwrap().iter().all(|l| &*l.host == "a"));
        }

        #[tokio::test]
        async fn test_all_hosts_failing_still_terminates() {
            let connector = Arc::new(FakeConnector {
                unreachable: HashSet::from(["a".to_string(), "b".to_string()]),
                ..FakeConnector::default()
            });
            let mut coordinator = Coordinator::new(connector, hosts(&["a", "b"]), "uptime", None);
            let (tx, _rx) = mpsc::channel(8);

            let report = coordinator.run(tx, never()).await;

            assert_eq!(coordinator.state(), RunState::Terminated);
            assert_eq!(report.failed(), 2);
            assert_eq!(report.opened, 0);
        }

        #[tokio::test]
        async fn test_second_run_is_rejected() {
            let connector = Arc::new(FakeConnector::default());
            let mut coordinator =
                Coordinator::new(connector.clone(), hosts(&["a"]), "uptime", None);
            let (tx, _rx) = mpsc::channel(8);
            coordinator.run(tx.clone(), never()).await;

            let report = coordinator.run(tx, never()).await;

            assert!(report.results.is_empty());
            assert_eq!(connector.execs.load(Ordering::SeqCst), 1);
        }
    }

    mod interrupt_path {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_interrupt_closes_every_session_once() {
            let connector = Arc::new(FakeConnector {
                endless: true,
                ..FakeConnector::default()
            });
            let mut coordinator =
                Coordinator::new(connector.clone(), hosts(&["a", "b"]), "yes", None);
            let (tx, rx) = mpsc::channel(64);
            let printer = tokio::spawn(collect(rx));

            let report = coordinator
                .run(tx, tokio::time::sleep(Duration::from_millis(50)))
                .await;

            assert!(report.interrupted);
            assert_eq!(report.opened, 2);
            assert_eq!(coordinator.state(), RunState::Terminated);
            assert_eq!(connector.disconnects.load(Ordering::SeqCst), 2);

            // Every sender is gone, so the printer sees the end of the stream.
            let lines = tokio::time::timeout(Duration::from_secs(5), printer)
                .await
                .expect("output stream did not end")
                .unwrap();
            assert!(!lines.is_empty());
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_interrupt_while_output_is_backed_up() {
            let connector = Arc::new(FakeConnector {
                lines_per_host: Some(50),
                ..FakeConnector::default()
            });
            let mut coordinator =
                Coordinator::new(connector.clone(), hosts(&["a"]), "seq 50", None);
            // Nobody reads the output, so the drain blocks on its second line.
            let (tx, _rx) = mpsc::channel(1);

            let report = tokio::time::timeout(
                Duration::from_secs(2),
                coordinator.run(tx, tokio::time::sleep(Duration::from_millis(100))),
            )
            .await
            .expect("run ignored the interrupt while draining");

            assert!(report.interrupted);
            assert_eq!(report.opened, 1);
            assert_eq!(report.succeeded(), 1);
            assert_eq!(coordinator.state(), RunState::Terminated);
            assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_late_open_closes_itself() {
            let connector = Arc::new(FakeConnector {
                open_delay: Some(Duration::from_millis(100)),
                ..FakeConnector::default()
            });
            let mut coordinator =
                Coordinator::new(connector.clone(), hosts(&["slow"]), "uptime", None);
            let (tx, _rx) = mpsc::channel(8);

            let report = coordinator
                .run(tx, tokio::time::sleep(Duration::from_millis(10)))
                .await;

            assert!(report.interrupted);
            assert_eq!(report.opened, 0);
            assert_eq!(connector.execs.load(Ordering::SeqCst), 0);

            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
        }
    }
}
