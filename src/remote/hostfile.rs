//! Host file loading.
//!
//! A host file is a small YAML document naming the user, the hosts and the
//! authentication sources for a run:
//!
//! ```yaml
//! user: ops
//! hosts:
//!   - web1
//!   - web2:2222
//! auth:
//!   agent: true
//!   privatekey: $HOME/.ssh/id_ed25519
//!   password: false
//! ```
//!
//! The first CLI argument is either a path to such a file or a bare name that
//! is looked up as `<name>.yml` / `<name>.yaml` in the `mcmd` config directory.

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::error::FatalError;
use super::types::{Credentials, HostSpec};

/// Subdirectory of the user config directory holding host files.
pub(crate) const CONFIG_SUBDIR: &str = "mcmd";

pub(crate) const XDG_CONFIG_HOME_ENV_VAR: &str = "XDG_CONFIG_HOME";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HostConfig {
    pub user: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthConfig {
    #[serde(default, alias = "usePasswordPrompt")]
    pub password: bool,
    #[serde(default, alias = "privateKeyPath")]
    pub privatekey: Option<String>,
    #[serde(default, alias = "useAgent")]
    pub agent: bool,
}

impl HostConfig {
    /// Parse a YAML host file body.
    pub fn from_yaml(path: &Path, content: &str) -> Result<Self, FatalError> {
        let config: HostConfig =
            serde_yaml::from_str(content).map_err(|source| FatalError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        if config.hosts.is_empty() {
            return Err(FatalError::NoHosts(path.to_path_buf()));
        }
        Ok(config)
    }

    /// Every configured host, in file order.
    pub fn host_specs(&self, path: &Path) -> Result<Vec<HostSpec>, FatalError> {
        self.hosts
            .iter()
            .map(|entry| {
                HostSpec::parse(entry).map_err(|reason| FatalError::BadHost {
                    path: path.to_path_buf(),
                    reason,
                })
            })
            .collect()
    }

    /// Credentials for the run, with the key path expanded.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            use_agent: self.auth.agent,
            private_key: self
                .auth
                .privatekey
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(expand_path),
            use_password: self.auth.password,
        }
    }
}

/// A host file after it has been found and parsed.
#[derive(Debug, Clone)]
pub struct LoadedHostFile {
    pub path: PathBuf,
    pub config: HostConfig,
    pub hosts: Vec<HostSpec>,
}

/// Find, read and parse the host file named by `param`.
pub fn load(param: &str) -> Result<LoadedHostFile, FatalError> {
    let path = locate(param)?;
    debug!("Using hostfile {:?}", path);

    let content = std::fs::read_to_string(&path).map_err(|source| FatalError::ConfigRead {
        path: path.clone(),
        source,
    })?;
    let config = HostConfig::from_yaml(&path, &content)?;
    let hosts = config.host_specs(&path)?;

    Ok(LoadedHostFile {
        path,
        config,
        hosts,
    })
}

/// First existing candidate for `param`.
pub fn locate(param: &str) -> Result<PathBuf, FatalError> {
    location_candidates(param)
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| FatalError::ConfigNotFound(param.to_string()))
}

/// Candidate paths, in lookup order:
///
/// 1. `param` itself
/// 2. `<config root>/mcmd/<param>.yml` and `.yaml`, where the config root is
///    `$XDG_CONFIG_HOME` or the platform config directory
/// 3. `~/.config/mcmd/<param>.yml` and `.yaml` when that differs from 2
pub fn location_candidates(param: &str) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(param)];

    let mut roots = Vec::new();
    match env::var(XDG_CONFIG_HOME_ENV_VAR) {
        Ok(xdg) if !xdg.is_empty() => roots.push(PathBuf::from(xdg)),
        _ => roots.extend(dirs::config_dir()),
    }
    if let Some(home) = dirs::home_dir() {
        let fallback = home.join(".config");
        if !roots.contains(&fallback) {
            roots.push(fallback);
        }
    }

    for root in roots {
        let dir = root.join(CONFIG_SUBDIR);
        candidates.push(dir.join(format!("{param}.yml")));
        candidates.push(dir.join(format!("{param}.yaml")));
    }
    candidates
}

/// Expand `~/`, `$VAR` and `${VAR}` in a path. Unset variables expand to
/// nothing.
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = expand_env_vars(path);
    if let Some(rest) = expanded.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(expanded)
}

/// Replace `$VAR` and `${VAR}` with their environment values.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let name: String = if chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            if !closed {
                // unterminated, keep it literal
                out.push_str("${");
                out.push_str(&name);
                continue;
            }
            name
        } else {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                let valid = if name.is_empty() {
                    c.is_ascii_alphabetic() || c == '_'
                } else {
                    c.is_ascii_alphanumeric() || c == '_'
                };
                if valid {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push('$');
                continue;
            }
            name
        };

        out.push_str(&env::var(&name).unwrap_or_default());
    }
    out
}
