//! Data model shared by the run stages.

use std::fmt;
use std::path::PathBuf;

use super::client::parse_address;
use super::error::HostError;

/// One target host.
///
/// `name` is the entry exactly as written in the host file and is what
/// output lines are tagged with. `host`/`port` are what we dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl HostSpec {
    /// Parse a host file entry (`host`, `host:port`, `[v6]:port`).
    pub fn parse(entry: &str) -> Result<Self, String> {
        let entry = entry.trim();
        let (host, port) = parse_address(entry)?;
        if host.is_empty() {
            return Err(format!("empty host name in entry {:?}", entry));
        }
        Ok(Self {
            name: entry.to_string(),
            host,
            port,
        })
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Authentication options for the run. One username for every host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub use_agent: bool,
    /// Already expanded (`$VAR`, `${VAR}`, `~/`).
    pub private_key: Option<PathBuf>,
    pub use_password: bool,
}

/// Pseudo-terminal requested before the command starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyConfig {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 40,
        }
    }
}

/// What an execution channel yields while a command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes on stdout.
    Data(Vec<u8>),
    /// Bytes on stderr.
    ExtendedData(Vec<u8>),
    ExitStatus(u32),
    /// The command was killed by the named signal.
    ExitSignal(String),
    Eof,
}

/// Terminal status of one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// The command ran and exited with status 0.
    Success { host: String },
    Failed(HostError),
}

impl RunResult {
    pub fn host(&self) -> &str {
        match self {
            RunResult::Success { host, .. } => host,
            RunResult::Failed(err) => err.host(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success { .. })
    }
}

/// Everything the coordinator knows once it has terminated.
#[derive(Debug, Default)]
pub struct RunReport {
    /// One entry per host that reached a terminal status, in arrival order.
    /// Hosts still running when an interrupt arrived have no entry.
    pub results: Vec<RunResult>,
    /// Number of sessions that were opened.
    pub opened: usize,
    pub interrupted: bool,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Final line printed after a normal completion.
    pub fn summary_line(&self) -> String {
        format!("done: {} succeeded, {} failed", self.succeeded(), self.failed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod host_spec {
        use super::*;

        #[test]
        fn test_bare_host_gets_default_port() {
            let spec = HostSpec::parse("web1").unwrap();
            assert_eq!(spec.name, "web1");
            assert_eq!(spec.host, "web1");
            assert_eq!(spec.port, 22);
        }

        #[test]
        fn test_name_keeps_port() {
            let spec = HostSpec::parse("10.0.0.5:2222").unwrap();
            assert_eq!(spec.name, "10.0.0.5:2222");
            assert_eq!(spec.host, "10.0.0.5");
            assert_eq!(spec.port, 2222);
            assert_eq!(spec.to_string(), "10.0.0.5:2222");
        }

        #[test]
        fn test_surrounding_whitespace_trimmed() {
            let spec = HostSpec::parse("  db  ").unwrap();
            assert_eq!(spec.name, "db");
        }

        #[test]
        fn test_empty_host_rejected() {
            assert!(HostSpec::parse(":22").is_err());
            assert!(HostSpec::parse("").is_err());
        }

        #[test]
        fn test_bad_port_rejected() {
            assert!(HostSpec::parse("web1:ssh").is_err());
        }
    }

    mod report {
        use super::*;

        #[test]
        fn test_summary_counts() {
            let report = RunReport {
                results: vec![
                    RunResult::Success {
                        host: "a".to_string(),
                    },
                    RunResult::Success {
                        host: "b".to_string(),
                    },
                    RunResult::Failed(HostError::Connect {
                        host: "c".to_string(),
                        message: "Connection refused".to_string(),
                    }),
                ],
                opened: 2,
                interrupted: false,
            };
            assert_eq!(report.succeeded(), 2);
            assert_eq!(report.failed(), 1);
            assert_eq!(report.summary_line(), "done: 2 succeeded, 1 failed");
        }

        #[test]
        fn test_result_host() {
            let ok = RunResult::Success {
                host: "a".to_string(),
            };
            assert_eq!(ok.host(), "a");
            assert!(ok.is_success());
        }
    }

    #[test]
    fn test_default_pty() {
        let pty = PtyConfig::default();
        assert_eq!(pty.term, "xterm");
        assert_eq!((pty.cols, pty.rows), (80, 40));
    }
}
