//! Shared kernel - types used by the call, account and signalling layers

pub mod error;
pub mod events;
pub mod result;
pub mod value_objects;

pub use error::DomainError;
pub use result::Result;
pub use value_objects::*;
