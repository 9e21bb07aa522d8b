/// STUN binding discovery (RFC 5389)
pub mod client;
pub mod message;

pub use client::{StunClient, StunResolver};
pub use message::{is_stun_packet, BindingRequest, StunError};
