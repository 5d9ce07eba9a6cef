//! Error types and classification for a multi-host run.
//!
//! Errors come in two scopes:
//!
//! - [`FatalError`]: problems with the local setup (host file, trust store).
//!   These abort the process before any connection is attempted.
//! - [`HostError`]: problems reaching or using one host. These are logged,
//!   and the host drops out of the run. Sibling hosts are never affected.
//!
//! Connection attempts are retried only for transient failures. The string
//! classifier [`is_retryable_error`] makes that decision, and
//! [`HostError::from_connect_message`] uses the same patterns to tell an
//! authentication failure apart from a transport failure.
//!
//! # Priority
//!
//! Authentication errors take precedence over connection errors. If an error message
//! contains both authentication and connection keywords, it is classified as
//! non-retryable to avoid repeatedly failing with bad credentials.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop the whole run before any host is contacted.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("hostfile {0} not found")]
    ConfigNotFound(String),

    #[error("failed to read hostfile {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing hostfile {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("hostfile {0:?} lists no hosts")]
    NoHosts(PathBuf),

    #[error("hostfile {path:?} has an invalid host entry: {reason}")]
    BadHost { path: PathBuf, reason: String },

    #[error("known hosts file {path:?} is not usable: {reason}")]
    TrustStore { path: PathBuf, reason: String },
}

/// A failure confined to a single host.
///
/// Each variant carries the host's display name and a description. The
/// variant records the stage at which the host dropped out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("[{host}] connection failed: {message}")]
    Connect { host: String, message: String },

    #[error("[{host}] authentication failed: {message}")]
    Auth { host: String, message: String },

    #[error("[{host}] session start failed: {message}")]
    SessionStart { host: String, message: String },

    #[error("[{host}] remote command failed: {message}")]
    CommandExecution { host: String, message: String },
}

impl HostError {
    /// Name of the host this error belongs to.
    pub fn host(&self) -> &str {
        match self {
            HostError::Connect { host, .. }
            | HostError::Auth { host, .. }
            | HostError::SessionStart { host, .. }
            | HostError::CommandExecution { host, .. } => host,
        }
    }

    /// Short label for the failed stage, used in summaries and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            HostError::Connect { .. } => "connect",
            HostError::Auth { .. } => "auth",
            HostError::SessionStart { .. } => "session",
            HostError::CommandExecution { .. } => "command",
        }
    }

    /// Build the right variant for a failure raised while connecting.
    ///
    /// Connect and authenticate share one retry loop, so both surface as a
    /// message. Messages matching an authentication pattern become
    /// [`HostError::Auth`], everything else [`HostError::Connect`].
    pub fn from_connect_message(host: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if is_auth_error(&message) {
            HostError::Auth {
                host: host.to_string(),
                message,
            }
        } else {
            HostError::Connect {
                host: host.to_string(),
                message,
            }
        }
    }
}

/// Authentication error patterns that indicate permanent failures.
///
/// These errors will never succeed by retrying and should fail immediately
/// to avoid wasting time and potentially locking out accounts.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "agent authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "rejected",
    "password prompt",
];

/// Non-authentication failures that retrying cannot fix.
const PERMANENT_ERRORS: &[&str] = &["host key", "invalid port"];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "timed out",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

fn is_auth_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    AUTH_ERRORS.iter().any(|p| error_lower.contains(p))
}

/// Determines if an error is retryable (transient) or permanent.
///
/// 1. Authentication failures, host key mismatches and malformed addresses
///    are never retryable.
/// 2. Known transient connection errors are retryable.
/// 3. Anything else is retried unless it looks like an SSH protocol error
///    (contains "ssh") without a timeout/connect keyword.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if is_auth_error(&error_lower) || PERMANENT_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return true;
    }

    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}
