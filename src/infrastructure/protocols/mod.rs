//! Wire protocols spoken by the link

pub mod sdp;
pub mod sip;
pub mod stun;
