//! Runs one shell command on many SSH hosts at once.
//!
//! This module is organized into the following submodules:
//!
//! - `hostfile`: Host file lookup and parsing
//! - `config`: Runtime tunables from the environment
//! - `error`: Fatal and per-host errors, retry classification
//! - `auth`: Credential resolution and the shared password cache
//! - `known_hosts`: Host key verification
//! - `session`: Remote sessions and the transport traits
//! - `client`: russh implementation of the transport traits
//! - `runner`: Runs the command on one session
//! - `output`: Line decoding and the printer
//! - `coordinator`: The run state machine

pub mod auth;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hostfile;
pub mod known_hosts;
pub mod output;
pub mod runner;
pub mod session;
pub mod types;

pub use coordinator::{Coordinator, RunState};
pub use error::{FatalError, HostError};
