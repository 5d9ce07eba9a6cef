//! Remote sessions and the seams between the coordinator and the transport.
//!
//! # Architecture
//!
//! - [`SshClientHandler`]: the russh client handler. It checks server keys
//!   against the run's [`HostKeyPolicy`].
//! - [`RemoteSession`]: one authenticated connection bound to one host. It
//!   owns the close-at-most-once guard, so the runner, the interrupt path and
//!   the exit sweep can all call [`RemoteSession::close`] safely.
//! - [`Connector`], [`Connection`], [`ExecChannel`]: the traits the run
//!   stages are written against. `client.rs` implements them over russh.
//!
//! # Thread Safety
//!
//! A `RemoteSession` is shared through `Arc` between its runner task and the
//! coordinator. Closing only needs `&self`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use russh::{client, keys};
use tracing::{debug, error};

use super::error::HostError;
use super::known_hosts::HostKeyPolicy;
use super::types::{ChannelEvent, HostSpec, PtyConfig};

/// Client handler for russh that verifies host keys.
pub struct SshClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl SshClientHandler {
    pub fn new(host: impl Into<String>, port: u16, policy: HostKeyPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            policy,
        }
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.policy.verify(&self.host, self.port, server_public_key) {
            Ok(()) => Ok(true),
            Err(reason) => {
                // Rejecting makes russh fail the handshake with UnknownKey.
                error!(host = %self.host, "{}", reason);
                Ok(false)
            }
        }
    }
}

/// The transport half of an open session.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Tear the connection down. Errors are logged, never returned.
    async fn disconnect(&self);
}

/// The execution channel opened on a session.
#[async_trait]
pub trait ExecChannel: Send {
    /// Request a pseudo-terminal. Must be called before [`exec`](Self::exec).
    async fn request_pty(&mut self, pty: &PtyConfig) -> Result<(), String>;

    /// Start `command`.
    async fn exec(&mut self, command: &str) -> Result<(), String>;

    /// Next event from the running command, `None` once the channel closed.
    async fn next_event(&mut self) -> Option<ChannelEvent>;
}

/// One authenticated connection bound to one host.
pub struct RemoteSession {
    host: HostSpec,
    connection: Box<dyn Connection>,
    closed: AtomicBool,
}

impl RemoteSession {
    pub fn new(host: HostSpec, connection: Box<dyn Connection>) -> Self {
        Self {
            host,
            connection,
            closed: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session.
    ///
    /// Only the first call disconnects. Returns `true` for that call and
    /// `false` for every later one.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!(host = %self.host, "Closing session");
        self.connection.disconnect().await;
        true
    }
}

/// A session that is ready to run a command.
pub struct OpenedSession {
    pub session: Arc<RemoteSession>,
    pub channel: Box<dyn ExecChannel>,
}

/// Opens authenticated sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, verify, authenticate and open one execution channel.
    async fn open(&self, host: &HostSpec) -> Result<OpenedSession, HostError>;
}
