//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallDirection {
    Incoming,
    Outgoing,
    /// Incoming call that ended without being answered
    Missed,
}

/// Signalling progress of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Trying,
    Progressing,
    Ringing,
    Connected,
}

impl ConnectionState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            // From Disconnected
            (Disconnected, Trying) => true,
            (Disconnected, Progressing) => true,

            // From Trying
            (Trying, Progressing) => true,
            (Trying, Ringing) => true,
            (Trying, Connected) => true,
            (Trying, Disconnected) => true,

            // From Progressing
            (Progressing, Ringing) => true,
            (Progressing, Connected) => true,
            (Progressing, Disconnected) => true,

            // From Ringing
            (Ringing, Connected) => true,
            (Ringing, Disconnected) => true,

            // From Connected
            (Connected, Disconnected) => true,

            _ => false,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Media/session state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Inactive,
    Active,
    Hold,
    Busy,
    Conferencing,
    Refused,
    Error,
}

impl CallState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, next: &CallState) -> bool {
        use CallState::*;

        match (self, next) {
            // From Inactive
            (Inactive, Active) => true,
            (Inactive, Busy) => true,
            (Inactive, Refused) => true,
            (Inactive, Error) => true,

            // From Active
            (Active, Hold) => true,
            (Active, Conferencing) => true,
            (Active, Busy) => true,
            (Active, Refused) => true,
            (Active, Error) => true,

            // From Hold
            (Hold, Active) => true,
            (Hold, Error) => true,

            // From Conferencing
            (Conferencing, Active) => true,
            (Conferencing, Hold) => true,
            (Conferencing, Error) => true,

            // Busy, Refused and Error are terminal
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Busy | CallState::Refused | CallState::Error)
    }
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Peer sent BYE or the INVITE was terminated after our CANCEL
    PeerHangup,
    /// Peer cancelled before answer
    Cancelled,
    /// Local user refused an incoming call
    Refused,
    /// Peer is busy (486/600)
    Busy,
    /// Call replaced by a transfer
    Transferred,
    /// Signalling or negotiation failure, with SIP status
    Failure(u16),
}

/// Call status label as seen by the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Incoming,
    Ringing,
    Current,
    Hold,
    Unhold,
    Busy,
    Failure,
    Hungup,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Incoming => "INCOMING",
            CallStatus::Ringing => "RINGING",
            CallStatus::Current => "CURRENT",
            CallStatus::Hold => "HOLD",
            CallStatus::Unhold => "UNHOLD",
            CallStatus::Busy => "BUSY",
            CallStatus::Failure => "FAILURE",
            CallStatus::Hungup => "HUNGUP",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
