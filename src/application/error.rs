//! Errors surfaced by the link facade

use crate::config::ConfigError;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{AccountId, CallId};
use crate::infrastructure::media::MediaError;
use crate::infrastructure::protocols::sip::call::CallError;
use crate::infrastructure::protocols::sip::message::SipError;
use crate::infrastructure::tls::TlsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Could not create call: {0}")]
    CouldNotCreateCall(String),

    #[error("Call {0} not found")]
    CallNotFound(CallId),

    #[error("Account {0} not found")]
    AccountNotFound(AccountId),

    #[error("Link is not running")]
    NotRunning,

    #[error("Link is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Sip(#[from] SipError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type LinkResult<T> = std::result::Result<T, LinkError>;
