//! Password-based SSH authentication.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;

use crate::remote::session::SshClientHandler;

use super::cache::SharedCredentialCache;
use super::traits::AuthStrategy;

/// Password authentication strategy.
///
/// The password is fetched from the run's [`SharedCredentialCache`] the
/// first time any host reaches this strategy, so the user is prompted at most
/// once and only when earlier strategies did not succeed.
pub struct PasswordAuth {
    cache: Arc<SharedCredentialCache>,
}

impl PasswordAuth {
    pub fn new(cache: Arc<SharedCredentialCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let password = self.cache.password().await?;

        let result = handle
            .authenticate_password(username, password.as_str())
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
