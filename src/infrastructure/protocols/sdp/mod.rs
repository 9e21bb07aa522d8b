//! SDP model, offer/answer and per-call negotiation

pub mod negotiator;
pub mod offer_answer;
pub mod session;

pub use negotiator::{NegotiationState, SdpNegotiator, DEFAULT_TELEPHONE_EVENT_PAYLOAD};
pub use offer_answer::{apply_answer, create_answer};
pub use session::{
    Attribute, Connection, Direction, MediaDescription, MediaKind, Origin, RtpMap, SdpError,
    SessionDescription,
};
