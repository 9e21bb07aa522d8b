//! Call bounded context - the lifecycle of a single call

pub mod aggregate;
pub mod event;
pub mod value_object;

pub use aggregate::Call;
pub use event::{CallEvent, CallStatusChanged};
pub use value_object::{CallDirection, CallState, CallStatus, ConnectionState, EndReason};
