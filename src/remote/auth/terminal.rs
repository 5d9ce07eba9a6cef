//! Terminal mode saved around the password prompt.
//!
//! The prompt turns echo off on the controlling terminal and only turns it
//! back on when it returns. A process that exits mid-prompt restores the
//! saved mode itself.

#[cfg(unix)]
use std::sync::Mutex;

#[cfg(unix)]
use nix::sys::termios::{self, SetArg, Termios};
#[cfg(unix)]
use tracing::debug;

#[cfg(unix)]
const TTY_PATH: &str = "/dev/tty";

#[derive(Default)]
pub(crate) struct TerminalMode {
    #[cfg(unix)]
    saved: Mutex<Option<Termios>>,
}

#[cfg(unix)]
impl TerminalMode {
    /// Remember the controlling terminal's current mode.
    ///
    /// Returns false when there is no terminal to save.
    pub(crate) fn save(&self) -> bool {
        let mode = std::fs::File::open(TTY_PATH)
            .map_err(|e| e.to_string())
            .and_then(|tty| termios::tcgetattr(&tty).map_err(|e| e.to_string()));
        match (mode, self.saved.lock()) {
            (Ok(mode), Ok(mut saved)) => {
                *saved = Some(mode);
                true
            }
            (Err(e), _) => {
                debug!("Cannot read terminal mode: {}", e);
                false
            }
            (_, Err(_)) => false,
        }
    }

    /// Put the saved mode back. Returns whether a mode was restored.
    pub(crate) fn restore(&self) -> bool {
        let Some(mode) = self.saved.lock().ok().and_then(|mut saved| saved.take()) else {
            return false;
        };
        let restored = std::fs::File::open(TTY_PATH)
            .map_err(|e| e.to_string())
            .and_then(|tty| {
                termios::tcsetattr(&tty, SetArg::TCSANOW, &mode).map_err(|e| e.to_string())
            });
        match restored {
            Ok(()) => true,
            Err(e) => {
                debug!("Cannot restore terminal mode: {}", e);
                false
            }
        }
    }
}

#[cfg(not(unix))]
impl TerminalMode {
    pub(crate) fn save(&self) -> bool {
        false
    }

    pub(crate) fn restore(&self) -> bool {
        false
    }
}
