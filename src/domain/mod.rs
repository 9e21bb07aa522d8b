//! Domain layer - Core types and rules of the user agent
//!
//! This layer contains:
//! - Accounts: SIP identities and their registration state
//! - Calls: the per-call state machine as the upper layer sees it
//! - Shared kernel: identifiers, URIs, errors and events

pub mod account;
pub mod call;
pub mod shared;

// Re-export commonly used types
pub use shared::{DomainError, Result};
