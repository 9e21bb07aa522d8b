//! Errors raised by the account and call models

use super::value_objects::AccountId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Account {0} not found")]
    AccountNotFound(AccountId),

    #[error("Account {0} already exists")]
    AccountExists(AccountId),

    #[error("'{0}' is not a DTMF digit")]
    InvalidDtmf(char),
}
