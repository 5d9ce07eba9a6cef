//! Run-wide password cache.
//!
//! Every host that falls through to password authentication asks this cache.
//! The first caller runs the terminal prompt; everyone else, concurrently or
//! later, gets the same outcome. A failed or cancelled prompt is cached too,
//! so a broken terminal does not trigger one prompt per host.
//!
//! While the prompt is up the terminal has echo off. [`restore_terminal`]
//! puts the terminal back for a process that has to exit mid-prompt.
//!
//! [`restore_terminal`]: SharedCredentialCache::restore_terminal

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::OnceCell;
use tracing::debug;
use zeroize::Zeroizing;

use super::terminal::TerminalMode;

/// The cached secret. Shared by reference, wiped when the last host drops it.
pub type SharedPassword = Arc<Zeroizing<String>>;

type Prompter = dyn Fn() -> io::Result<String> + Send + Sync;

/// Text shown by the interactive prompt.
pub const PASSWORD_PROMPT: &str = "Password: ";

pub struct SharedCredentialCache {
    password: OnceCell<Result<SharedPassword, String>>,
    prompter: Arc<Prompter>,
    prompting: AtomicBool,
    terminal: TerminalMode,
}

impl SharedCredentialCache {
    /// Cache backed by a no-echo terminal prompt.
    pub fn new() -> Self {
        Self::with_prompter(|| rpassword::prompt_password(PASSWORD_PROMPT))
    }

    /// Cache backed by an arbitrary blocking password source.
    pub fn with_prompter(prompter: impl Fn() -> io::Result<String> + Send + Sync + 'static) -> Self {
        Self {
            password: OnceCell::new(),
            prompter: Arc::new(prompter),
            prompting: AtomicBool::new(false),
            terminal: TerminalMode::default(),
        }
    }

    /// The run's password, prompting on first use.
    ///
    /// The prompt blocks on the terminal, so it runs on the blocking pool and
    /// other hosts keep making progress meanwhile.
    pub async fn password(&self) -> Result<SharedPassword, String> {
        self.password
            .get_or_init(|| async {
                debug!("Prompting for password");
                self.terminal.save();
                self.prompting.store(true, Ordering::SeqCst);
                let prompter = Arc::clone(&self.prompter);
                let outcome = tokio::task::spawn_blocking(move || prompter()).await;
                self.prompting.store(false, Ordering::SeqCst);
                match outcome {
                    Ok(Ok(password)) => Ok(Arc::new(Zeroizing::new(password))),
                    Ok(Err(e)) => Err(format!("password prompt failed: {}", e)),
                    Err(e) => Err(format!("password prompt failed: {}", e)),
                }
            })
            .await
            .clone()
    }

    /// Whether the prompt has already run.
    pub fn is_resolved(&self) -> bool {
        self.password.initialized()
    }

    /// Whether the prompt is waiting for input right now.
    pub fn is_prompting(&self) -> bool {
        self.prompting.load(Ordering::SeqCst)
    }

    /// Undo the prompt's terminal changes if it is still waiting.
    ///
    /// Returns whether a prompt was interrupted. Call this before exiting
    /// the process.
    pub fn restore_terminal(&self) -> bool {
        if !self.is_prompting() {
            return false;
        }
        if !self.terminal.restore() {
            debug!("No terminal mode to restore");
        }
        true
    }
}

impl Default for SharedCredentialCache {
    fn default() -> Self {
        Self::new()
    }
}
