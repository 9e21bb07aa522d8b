//! SIP user agent
//!
//! Layers, bottom up:
//! ```text
//! ┌─────────────────────────┐
//! │   Engine                │
//! │  (calls, registrations) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Call / Session        │
//! │  (dialogs, SDP, DTMF)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (Client/Server TXN)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │  (UDP, TLS)             │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call;
pub mod call_table;
pub mod dialog;
pub mod engine;
pub mod message;
pub mod registration;
pub mod session;
pub mod transaction;
pub mod transport;

pub use call::{CallError, CallSetup, DialogAction, SipCall};
pub use call_table::{CallHandle, CallRoute, CallTable};
pub use engine::{EngineSettings, SipEngine};
pub use message::{HeaderAccess, ReplacesValue, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use registration::{Registration, RegistrationResult, RegistrationStep};
pub use session::{LocalContact, Outgoing, ProtocolSession, SipSession};
pub use transaction::{SipTimers, TransactionLayer, TransactionOwner, TransactionState};
pub use transport::{InboundMessage, SipTransport, TransportManager, TransportProtocol, UdpTransport};
