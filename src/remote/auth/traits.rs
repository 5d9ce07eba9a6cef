//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::remote::session::SshClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be `Send + Sync`: one resolved chain is shared by
/// every host task in a run.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - Authentication failed (credentials rejected)
    /// * `Err(message)` - Error during authentication attempt
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    /// Name of this strategy, for logs.
    fn name(&self) -> &'static str;
}
