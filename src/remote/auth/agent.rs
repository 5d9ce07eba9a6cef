//! SSH agent authentication.

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::remote::session::SshClientHandler;

use super::traits::AuthStrategy;

/// Environment variable naming the agent socket.
pub const AGENT_SOCK_ENV_VAR: &str = "SSH_AUTH_SOCK";

/// SSH agent authentication strategy.
///
/// Connects to the SSH agent (via `SSH_AUTH_SOCK`) and tries each available
/// identity until one succeeds.
#[derive(Debug, Default)]
pub struct AgentAuth;

impl AgentAuth {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| format!("agent authentication failed: cannot reach SSH agent: {}", e))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| format!("agent authentication failed: cannot list identities: {}", e))?;

        if identities.is_empty() {
            return Err("agent authentication failed: no identities in SSH agent".to_string());
        }

        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        for identity in identities {
            debug!("Trying SSH agent identity: {:?}", identity.comment());

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    debug!("Authenticated with SSH agent");
                    return Ok(true);
                }
                Ok(_) => {
                    debug!("Agent identity not accepted, trying next...");
                }
                Err(e) => {
                    debug!("Agent authentication error: {}, trying next...", e);
                }
            }
        }

        Err("Agent authentication failed: no identities accepted".to_string())
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}
