//! Application layer
//!
//! The link facade the upper layer drives, the signals it gets back, and
//! the errors both surface.

pub mod error;
pub mod link;
pub mod notifier;

pub use error::{LinkError, LinkResult};
pub use link::SipVoipLink;
pub use notifier::{Notifier, Signal};
