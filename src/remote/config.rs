//! Runtime tunables.
//!
//! Values come from the environment (a `.env` file is loaded at startup) and
//! fall back to built-in defaults. Unparseable values are ignored.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MCMD_CONNECT_TIMEOUT` | 10s | Connection timeout in seconds |
//! | `MCMD_MAX_RETRIES` | 2 | Retry attempts for transient connect failures |
//! | `MCMD_RETRY_DELAY_MS` | 500ms | Initial retry delay in milliseconds |
//! | `MCMD_COMPRESSION` | true | Enable zlib compression |
//! | `MCMD_PTY` | true | Request a pseudo-terminal before running the command |
//! | `MCMD_KNOWN_HOSTS` | `~/.ssh/known_hosts` | Trust store used for host key checks |
//! | `MCMD_STRICT_HOST_KEY` | true | Verify host keys against the trust store |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::types::PtyConfig;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default retry attempts for transient connection failures
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "MCMD_CONNECT_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "MCMD_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "MCMD_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "MCMD_COMPRESSION";
pub(crate) const PTY_ENV_VAR: &str = "MCMD_PTY";
pub(crate) const KNOWN_HOSTS_ENV_VAR: &str = "MCMD_KNOWN_HOSTS";
pub(crate) const STRICT_HOST_KEY_ENV_VAR: &str = "MCMD_STRICT_HOST_KEY";

/// Connection and execution settings for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compress: bool,
    /// `None` runs the command without a pseudo-terminal.
    pub pty: Option<PtyConfig>,
    /// Verify host keys against `known_hosts`.
    pub strict_host_key: bool,
    /// `None` when no home directory is known and no override is set.
    pub known_hosts: Option<PathBuf>,
}

impl RunSettings {
    /// Resolve every setting from the environment.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: Duration::from_secs(resolve_number(
                CONNECT_TIMEOUT_ENV_VAR,
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            max_retries: resolve_number(MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES),
            retry_delay: Duration::from_millis(resolve_number(
                RETRY_DELAY_MS_ENV_VAR,
                DEFAULT_RETRY_DELAY_MS,
            )),
            compress: resolve_flag(COMPRESSION_ENV_VAR, true),
            pty: resolve_flag(PTY_ENV_VAR, true).then(PtyConfig::default),
            strict_host_key: resolve_flag(STRICT_HOST_KEY_ENV_VAR, true),
            known_hosts: resolve_known_hosts_path(),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compress: true,
            pty: Some(PtyConfig::default()),
            strict_host_key: true,
            known_hosts: default_known_hosts_path(),
        }
    }
}

/// Resolve a numeric value with priority: env var -> default
pub(crate) fn resolve_number<T: FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Resolve a boolean flag with priority: env var -> default.
///
/// `true`/`1`/`yes` (any case) enable, anything else set disables.
pub(crate) fn resolve_flag(var: &str, default: bool) -> bool {
    match env::var(var) {
        Ok(value) => {
            let value = value.trim();
            value.eq_ignore_ascii_case("true") || value == "1" || value.eq_ignore_ascii_case("yes")
        }
        Err(_) => default,
    }
}

fn resolve_known_hosts_path() -> Option<PathBuf> {
    match env::var(KNOWN_HOSTS_ENV_VAR) {
        Ok(path) if !path.trim().is_empty() => {
            Some(super::hostfile::expand_path(path.trim()))
        }
        _ => default_known_hosts_path(),
    }
}

/// `~/.ssh/known_hosts`, if a home directory can be determined.
pub(crate) fn default_known_hosts_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}
