//! Call domain events

use crate::domain::call::value_object::{CallDirection, CallStatus, EndReason};
use crate::domain::shared::events::{DomainEvent, EventMetadata};
use crate::domain::shared::value_objects::{AccountId, CallId};
use serde::{Deserialize, Serialize};

/// Base struct for all call events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEventBase {
    pub metadata: EventMetadata,
    pub call_id: CallId,
}

impl CallEventBase {
    pub fn new(event_type: &str, call_id: CallId) -> Self {
        Self {
            metadata: EventMetadata::new(event_type),
            call_id,
        }
    }
}

/// Call created, either dialled or received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallCreated {
    pub base: CallEventBase,
    pub account_id: AccountId,
    pub peer: String,
    pub direction: CallDirection,
}

impl DomainEvent for CallCreated {
    fn metadata(&self) -> &EventMetadata {
        &self.base.metadata
    }
}

/// Upper-layer status changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStatusChanged {
    pub base: CallEventBase,
    pub status: CallStatus,
    /// Last SIP status code and reason seen for the call
    pub sip_status: Option<(u16, String)>,
}

impl DomainEvent for CallStatusChanged {
    fn metadata(&self) -> &EventMetadata {
        &self.base.metadata
    }
}

/// Call ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnded {
    pub base: CallEventBase,
    pub reason: EndReason,
    pub duration_seconds: Option<i64>,
}

impl DomainEvent for CallEnded {
    fn metadata(&self) -> &EventMetadata {
        &self.base.metadata
    }
}

/// Enum wrapping all call events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    Created(CallCreated),
    StatusChanged(CallStatusChanged),
    Ended(CallEnded),
}

impl CallEvent {
    fn base(&self) -> &CallEventBase {
        match self {
            CallEvent::Created(e) => &e.base,
            CallEvent::StatusChanged(e) => &e.base,
            CallEvent::Ended(e) => &e.base,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.base().call_id
    }
}

impl DomainEvent for CallEvent {
    fn metadata(&self) -> &EventMetadata {
        &self.base().metadata
    }
}
