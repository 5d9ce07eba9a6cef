//! Turn the host file's auth options into an ordered [`AuthChain`].
//!
//! The order is fixed: agent, key file, password. The password comes last
//! because it blocks on a terminal prompt.

use std::env;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::remote::types::Credentials;

use super::agent::AGENT_SOCK_ENV_VAR;
use super::cache::SharedCredentialCache;
use super::chain::AuthChain;

/// Resolve the run's authentication chain from `credentials`.
///
/// The agent is only included when `SSH_AUTH_SOCK` is set. An empty chain is
/// returned as-is; connecting with it fails fast with an authentication
/// error.
pub fn resolve(credentials: &Credentials, cache: &Arc<SharedCredentialCache>) -> AuthChain {
    let agent_available = env::var_os(AGENT_SOCK_ENV_VAR).is_some_and(|v| !v.is_empty());
    resolve_with_agent(credentials, cache, agent_available)
}

pub(crate) fn resolve_with_agent(
    credentials: &Credentials,
    cache: &Arc<SharedCredentialCache>,
    agent_available: bool,
) -> AuthChain {
    let mut chain = AuthChain::new();

    if credentials.use_agent {
        if agent_available {
            chain = chain.with_agent();
        } else {
            warn!("SSH agent requested but {} is not set", AGENT_SOCK_ENV_VAR);
        }
    }

    if let Some(key_path) = &credentials.private_key {
        chain = chain.with_key(key_path.clone());
    }

    if credentials.use_password {
        chain = chain.with_password(Arc::clone(cache));
    }

    debug!("Resolved authentication methods: {:?}", chain.names());
    chain
}
