//! Account bounded context - SIP identities and their registration state

pub mod entity;
pub mod repository;
pub mod value_object;

pub use entity::{Account, Credentials, DEFAULT_REGISTRATION_TIME, MIN_REGISTRATION_TIME};
pub use repository::AccountTable;
pub use value_object::{
    DtmfMode, KeyExchange, RegistrationError, RegistrationState, SrtpPolicy, TransportKind,
    VideoCodecSetting, ZrtpPolicy,
};
