//! SSH transport: connecting, authenticating and the execution channel.
//!
//! ## Connection Lifecycle
//!
//! 1. **Address Parsing**: host file entries are split into host and port
//!    (`host`, `host:port`, `[v6]:port`, bare IPv6). Port 22 by default.
//!
//! 2. **Client Configuration**: keepalive and compression settings. There is
//!    no inactivity timeout, a command may stay silent for as long as it
//!    likes.
//!
//! 3. **Connection Establishment**: TCP and SSH handshake under the connect
//!    timeout. The server key is checked by [`SshClientHandler`].
//!
//! 4. **Authentication**: the run's [`AuthChain`], first success wins.
//!
//! 5. **Channel**: one session channel, wrapped as an [`ExecChannel`].
//!
//! ## Retry Strategy
//!
//! Connect and authenticate are retried together with exponential backoff
//! and jitter via the `backon` crate:
//!
//! - **Initial delay**: `MCMD_RETRY_DELAY_MS` (default: 500ms)
//! - **Maximum delay**: capped at [`MAX_RETRY_DELAY`] (10 seconds)
//! - **Maximum attempts**: `MCMD_MAX_RETRIES` retries after the first try
//!
//! Authentication failures and host key mismatches are never retried.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::{ChannelMsg, Sig, client};
use tracing::{debug, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::config::{MAX_RETRY_DELAY, RunSettings};
use super::error::{HostError, is_retryable_error};
use super::known_hosts::HostKeyPolicy;
use super::session::{
    Connection, Connector, ExecChannel, OpenedSession, RemoteSession, SshClientHandler,
};
use super::types::{ChannelEvent, HostSpec, PtyConfig};

/// Build russh client configuration.
///
/// - No inactivity timeout
/// - Keepalive interval of 30 seconds with max 3 keepalives
/// - Compression preference based on `compress` (ZLIB if enabled, NONE if disabled)
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Parse an address into host and port components.
///
/// Supports the following formats:
/// - `host:port` and `host`
/// - `[v6]:port` and `[v6]` (brackets are removed from the host)
/// - bare IPv6 such as `fe80::1`, which always uses port 22
///
/// # Examples
///
/// ```ignore
/// let (host, port) = parse_address("example.com:2222")?;
/// assert_eq!(host, "example.com");
/// assert_eq!(port, 2222);
///
/// let (host, port) = parse_address("[::1]:2200")?;
/// assert_eq!(host, "::1");
/// ```
pub(crate) fn parse_address(address: &str) -> Result<(String, u16), String> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("Invalid address {:?}: missing ']'", address))?;
        return match tail {
            "" => Ok((host.to_string(), 22)),
            _ => match tail.strip_prefix(':') {
                Some(port_str) => Ok((host.to_string(), parse_port(port_str)?)),
                None => Err(format!("Invalid port number in {:?}", address)),
            },
        };
    }

    match address.rsplit_once(':') {
        // More than one colon without brackets: a bare IPv6 address.
        Some((host, _)) if host.contains(':') => Ok((address.to_string(), 22)),
        Some((host, port_str)) => Ok((host.to_string(), parse_port(port_str)?)),
        None => Ok((address.to_string(), 22)),
    }
}

fn parse_port(port_str: &str) -> Result<u16, String> {
    port_str
        .parse::<u16>()
        .map_err(|e| format!("Invalid port number: {}", e))
}

/// Connect to `host` and authenticate, retrying transient failures.
///
/// # Returns
///
/// * `Ok((handle, retry_count))` - Authenticated handle and number of retries needed
/// * `Err(message)` - Error message describing the last failure
pub(crate) async fn connect_with_retry(
    host: &HostSpec,
    username: &str,
    auth: &AuthChain,
    policy: &HostKeyPolicy,
    settings: &RunSettings,
) -> Result<(client::Handle<SshClientHandler>, u32), String> {
    let attempt_counter = AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(settings.retry_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(settings.max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);

        if current_attempt > 0 {
            warn!(
                host = %host,
                "SSH connection retry attempt {} as {}", current_attempt, username
            );
        }

        connect(host, username, auth, policy, settings).await
    })
    .retry(backoff)
    .when(|e| {
        let retryable = is_retryable_error(e);
        if !retryable {
            debug!(host = %host, "Non-retryable connection error: {}", e);
        }
        retryable
    })
    .notify(|err, dur| {
        warn!(host = %host, "SSH connection failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    let retry_count = total_attempts.saturating_sub(1);

    match result {
        Ok(handle) => {
            if retry_count > 0 {
                info!(
                    host = %host,
                    "SSH connection succeeded after {} retry attempt(s)", retry_count
                );
            }
            Ok((handle, retry_count))
        }
        Err(e) if total_attempts > 1 => Err(format!(
            "{} (after {} attempts)",
            e, total_attempts
        )),
        Err(e) => Err(e),
    }
}

/// Establish one SSH connection and authenticate.
async fn connect(
    host: &HostSpec,
    username: &str,
    auth: &AuthChain,
    policy: &HostKeyPolicy,
    settings: &RunSettings,
) -> Result<client::Handle<SshClientHandler>, String> {
    let config = build_client_config(settings.compress);
    let handler = SshClientHandler::new(host.host.clone(), host.port, policy.clone());

    let connect_future = client::connect(config, (host.host.as_str(), host.port), handler);

    let mut handle = tokio::time::timeout(settings.connect_timeout, connect_future)
        .await
        .map_err(|_| format!("Connection timed out after {:?}", settings.connect_timeout))?
        .map_err(|e| match e {
            russh::Error::UnknownKey => format!(
                "host key verification failed for {}:{}",
                host.host, host.port
            ),
            e => format!("Failed to connect: {}", e),
        })?;

    let success = auth.authenticate(&mut handle, username).await?;

    if !success {
        return Err("Authentication failed: no authentication methods succeeded".to_string());
    }

    Ok(handle)
}

/// [`Connector`] over russh.
///
/// One connector serves every host of a run. The auth chain is resolved
/// once, before the connector is built.
pub struct SshConnector {
    username: String,
    auth: Arc<AuthChain>,
    policy: HostKeyPolicy,
    settings: RunSettings,
}

impl SshConnector {
    pub fn new(
        username: impl Into<String>,
        auth: AuthChain,
        policy: HostKeyPolicy,
        settings: RunSettings,
    ) -> Self {
        Self {
            username: username.into(),
            auth: Arc::new(auth),
            policy,
            settings,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, host: &HostSpec) -> Result<OpenedSession, HostError> {
        if self.auth.is_empty() {
            return Err(HostError::Auth {
                host: host.name.clone(),
                message: "No authentication methods configured".to_string(),
            });
        }

        debug!(host = %host, "Connecting to {}:{}", host.host, host.port);
        let (handle, _) = connect_with_retry(
            host,
            &self.username,
            &self.auth,
            &self.policy,
            &self.settings,
        )
        .await
        .map_err(|e| HostError::from_connect_message(&host.name, e))?;

        let channel = match handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                disconnect_handle(&handle, host).await;
                return Err(HostError::SessionStart {
                    host: host.name.clone(),
                    message: format!("Failed to open channel: {}", e),
                });
            }
        };

        info!(host = %host, "Session opened");
        let session = RemoteSession::new(host.clone(), Box::new(SshConnection { handle }));
        Ok(OpenedSession {
            session: Arc::new(session),
            channel: Box::new(SshExecChannel::new(channel)),
        })
    }
}

async fn disconnect_handle(handle: &client::Handle<SshClientHandler>, host: &HostSpec) {
    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "", "English")
        .await
    {
        debug!(host = %host, "Disconnect failed: {}", e);
    }
}

/// The transport of an open session.
struct SshConnection {
    handle: client::Handle<SshClientHandler>,
}

#[async_trait]
impl Connection for SshConnection {
    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Disconnect failed: {}", e);
        }
    }
}

/// Execution channel over a russh session channel.
///
/// Requests are sent with `want_reply` and the reply is awaited. Output that
/// arrives while waiting is kept in `pending` and handed out first.
struct SshExecChannel {
    channel: russh::Channel<client::Msg>,
    pending: VecDeque<ChannelEvent>,
}

impl SshExecChannel {
    fn new(channel: russh::Channel<client::Msg>) -> Self {
        Self {
            channel,
            pending: VecDeque::new(),
        }
    }

    /// Wait for the server's answer to the last request.
    async fn wait_reply(&mut self, request: &str) -> Result<(), String> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(format!("{} request refused by server", request));
                }
                Some(ChannelMsg::Close) | None => {
                    return Err(format!("channel closed before {} reply", request));
                }
                Some(msg) => {
                    if let Some(event) = to_event(msg) {
                        self.pending.push_back(event);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ExecChannel for SshExecChannel {
    async fn request_pty(&mut self, pty: &PtyConfig) -> Result<(), String> {
        self.channel
            .request_pty(true, &pty.term, pty.cols, pty.rows, 0, 0, &[])
            .await
            .map_err(|e| format!("Failed to request pty: {}", e))?;
        self.wait_reply("pty").await
    }

    async fn exec(&mut self, command: &str) -> Result<(), String> {
        self.channel
            .exec(true, command)
            .await
            .map_err(|e| format!("Failed to execute command: {}", e))?;
        self.wait_reply("exec").await
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Close) | None => return None,
                Some(msg) => {
                    if let Some(event) = to_event(msg) {
                        return Some(event);
                    }
                }
            }
        }
    }
}

/// Map a channel message to an event. Messages the runner does not care
/// about yield `None`.
fn to_event(msg: ChannelMsg) -> Option<ChannelEvent> {
    match msg {
        ChannelMsg::Data { data } => Some(ChannelEvent::Data(data.to_vec())),
        // ext == 1 is stderr in SSH protocol
        ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
            Some(ChannelEvent::ExtendedData(data.to_vec()))
        }
        ChannelMsg::ExitStatus { exit_status } => Some(ChannelEvent::ExitStatus(exit_status)),
        ChannelMsg::Eof => Some(ChannelEvent::Eof),
        ChannelMsg::ExitSignal { signal_name, .. } => {
            Some(ChannelEvent::ExitSignal(signal_label(signal_name)))
        }
        _ => None,
    }
}

fn signal_label(sig: Sig) -> String {
    match sig {
        Sig::Custom(name) => name,
        other => format!("{:?}", other),
    }
}
