//! Authentication strategies for SSH connections.
//!
//! Each strategy is one way of proving identity to a server. The
//! [`resolve`] function builds the run's [`AuthChain`] from the host file,
//! and the chain is shared by every host task.
//!
//! # Available Strategies
//!
//! - [`AgentAuth`]: SSH agent authentication
//! - [`KeyAuth`]: Private key file authentication
//! - [`PasswordAuth`]: Password authentication through the
//!   [`SharedCredentialCache`]

mod agent;
mod cache;
mod chain;
mod key;
mod password;
mod resolver;
mod terminal;
mod traits;

pub use agent::{AGENT_SOCK_ENV_VAR, AgentAuth};
pub use cache::{PASSWORD_PROMPT, SharedCredentialCache, SharedPassword};
pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use resolver::resolve;
pub use traits::AuthStrategy;
