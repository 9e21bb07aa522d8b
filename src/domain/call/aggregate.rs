//! Call aggregate root

use crate::domain::call::event::{
    CallCreated, CallEnded, CallEvent, CallEventBase, CallStatusChanged,
};
use crate::domain::call::value_object::{
    CallDirection, CallState, CallStatus, ConnectionState, EndReason,
};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::{AccountId, CallId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Call aggregate root
///
/// Tracks the two independent state machines of a call (signalling progress
/// and media state) and the media addresses both ends use. All mutation goes
/// through transition methods that validate against the transition tables
/// and record the events the upper layer is notified with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    id: CallId,
    account_id: AccountId,
    direction: CallDirection,
    connection_state: ConnectionState,
    state: CallState,
    /// Peer URI or dial string
    peer: String,
    display_name: Option<String>,
    ip_to_ip: bool,
    local_ip: Option<String>,
    local_audio_port: u16,
    local_video_port: u16,
    remote_ip: Option<String>,
    remote_audio_port: u16,
    remote_video_port: u16,
    sip_status: Option<(u16, String)>,
    started_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    events: Vec<CallEvent>,
}

impl Call {
    fn new(id: CallId, account_id: AccountId, peer: String, direction: CallDirection) -> Self {
        let mut call = Self {
            id,
            account_id: account_id.clone(),
            direction,
            connection_state: ConnectionState::Disconnected,
            state: CallState::Inactive,
            ip_to_ip: account_id.is_ip2ip(),
            peer: peer.clone(),
            display_name: None,
            local_ip: None,
            local_audio_port: 0,
            local_video_port: 0,
            remote_ip: None,
            remote_audio_port: 0,
            remote_video_port: 0,
            sip_status: None,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            events: Vec::new(),
        };

        call.record_event(CallEvent::Created(CallCreated {
            base: CallEventBase::new("call.created", id),
            account_id,
            peer,
            direction,
        }));

        call
    }

    /// Create a call dialled by the local user
    pub fn outgoing(id: CallId, account_id: AccountId, peer: impl Into<String>) -> Self {
        Self::new(id, account_id, peer.into(), CallDirection::Outgoing)
    }

    /// Create a call for a received INVITE
    pub fn incoming(id: CallId, account_id: AccountId, peer: impl Into<String>) -> Self {
        Self::new(id, account_id, peer.into(), CallDirection::Incoming)
    }

    /// INVITE sent or received, waiting for the far end
    pub fn progress(&mut self) -> Result<()> {
        self.set_connection_state(ConnectionState::Progressing)
    }

    /// Outgoing calls own media from the moment the INVITE leaves
    pub fn activate(&mut self) -> Result<()> {
        self.transition_to(CallState::Active)
    }

    /// Alerting: remote ringing for outgoing calls, local ringing for incoming
    pub fn ring(&mut self) -> Result<()> {
        if self.connection_state == ConnectionState::Ringing {
            return Ok(());
        }
        self.set_connection_state(ConnectionState::Ringing)?;
        let status = match self.direction {
            CallDirection::Incoming => CallStatus::Incoming,
            _ => CallStatus::Ringing,
        };
        self.record_status(status);
        Ok(())
    }

    /// Session established
    pub fn connect(&mut self) -> Result<()> {
        if self.connection_state == ConnectionState::Connected {
            return Ok(());
        }
        self.set_connection_state(ConnectionState::Connected)?;
        if self.state != CallState::Active {
            self.transition_to(CallState::Active)?;
        }
        self.answered_at = Some(Utc::now());
        self.record_status(CallStatus::Current);
        Ok(())
    }

    /// Put the call on hold
    pub fn hold(&mut self) -> Result<()> {
        self.require_connected("hold")?;
        self.transition_to(CallState::Hold)?;
        self.record_status(CallStatus::Hold);
        Ok(())
    }

    /// Resume the call from hold
    pub fn resume(&mut self) -> Result<()> {
        if self.state != CallState::Hold {
            return Err(DomainError::InvalidStateTransition(
                "Can only resume from Hold state".to_string(),
            ));
        }
        self.transition_to(CallState::Active)?;
        self.record_status(CallStatus::Unhold);
        Ok(())
    }

    /// End the call
    pub fn end(&mut self, reason: EndReason) -> Result<()> {
        if self.ended_at.is_some() {
            return Err(DomainError::InvalidStateTransition(format!(
                "Call {} already ended",
                self.id
            )));
        }

        let target = match reason {
            EndReason::Busy => Some(CallState::Busy),
            EndReason::Refused => Some(CallState::Refused),
            EndReason::Failure(_) => Some(CallState::Error),
            _ => None,
        };
        if let Some(target) = target {
            if self.state.can_transition_to(&target) {
                self.state = target;
            }
        }

        self.connection_state = ConnectionState::Disconnected;
        if self.direction == CallDirection::Incoming && self.answered_at.is_none() {
            self.direction = CallDirection::Missed;
        }

        let ended_at = Utc::now();
        self.ended_at = Some(ended_at);

        // A refusal is a failure for the side that was refused
        let status = match reason {
            EndReason::Busy => CallStatus::Busy,
            EndReason::Failure(_) => CallStatus::Failure,
            EndReason::Refused if self.direction == CallDirection::Outgoing => CallStatus::Failure,
            _ => CallStatus::Hungup,
        };
        self.record_status(status);

        let duration_seconds = self
            .answered_at
            .map(|answered| (ended_at - answered).num_seconds());
        self.record_event(CallEvent::Ended(CallEnded {
            base: CallEventBase::new("call.ended", self.id),
            reason,
            duration_seconds,
        }));

        Ok(())
    }

    pub fn set_connection_state(&mut self, next: ConnectionState) -> Result<()> {
        if !self.connection_state.can_transition_to(&next) {
            return Err(DomainError::InvalidStateTransition(format!(
                "Cannot transition from {:?} to {:?}",
                self.connection_state, next
            )));
        }
        self.connection_state = next;
        Ok(())
    }

    /// Transition to a new state
    fn transition_to(&mut self, next: CallState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(DomainError::InvalidStateTransition(format!(
                "Cannot transition from {:?} to {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn require_connected(&self, operation: &str) -> Result<()> {
        if !self.connection_state.is_established() {
            return Err(DomainError::InvalidOperation(format!(
                "Cannot {} call {} in connection state {:?}",
                operation, self.id, self.connection_state
            )));
        }
        Ok(())
    }

    fn record_status(&mut self, status: CallStatus) {
        self.record_event(CallEvent::StatusChanged(CallStatusChanged {
            base: CallEventBase::new("call.status_changed", self.id),
            status,
            sip_status: self.sip_status.clone(),
        }));
    }

    /// Record a domain event
    fn record_event(&mut self, event: CallEvent) {
        self.events.push(event);
    }

    /// Take all pending events
    pub fn take_events(&mut self) -> Vec<CallEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn set_sip_status(&mut self, code: u16, reason: impl Into<String>) {
        self.sip_status = Some((code, reason.into()));
    }

    pub fn set_display_name(&mut self, name: Option<String>) {
        self.display_name = name;
    }

    pub fn set_local_media(&mut self, ip: String, audio_port: u16, video_port: u16) {
        self.local_ip = Some(ip);
        self.local_audio_port = audio_port;
        self.local_video_port = video_port;
    }

    pub fn set_remote_media(&mut self, ip: Option<String>, audio_port: u16, video_port: u16) {
        if ip.is_some() {
            self.remote_ip = ip;
        }
        self.remote_audio_port = audio_port;
        self.remote_video_port = video_port;
    }

    // Getters
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn is_ip_to_ip(&self) -> bool {
        self.ip_to_ip
    }

    pub fn local_ip(&self) -> Option<&str> {
        self.local_ip.as_deref()
    }

    pub fn local_audio_port(&self) -> u16 {
        self.local_audio_port
    }

    pub fn local_video_port(&self) -> u16 {
        self.local_video_port
    }

    pub fn remote_ip(&self) -> Option<&str> {
        self.remote_ip.as_deref()
    }

    pub fn remote_audio_port(&self) -> u16 {
        self.remote_audio_port
    }

    pub fn remote_video_port(&self) -> u16 {
        self.remote_video_port
    }

    pub fn sip_status(&self) -> Option<&(u16, String)> {
        self.sip_status.as_ref()
    }

    pub fn started_at(&self) -> &DateTime<Utc> {
        &self.started_at
    }

    pub fn answered_at(&self) -> Option<&DateTime<Utc>> {
        self.answered_at.as_ref()
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_call() -> Call {
        Call::outgoing(CallId::new(), AccountId::new("a1"), "sip:bob@example.com")
    }

    fn statuses(call: &mut Call) -> Vec<CallStatus> {
        call.take_events()
            .into_iter()
            .filter_map(|e| match e {
                CallEvent::StatusChanged(s) => Some(s.status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_outgoing_call_lifecycle() {
        let mut call = create_test_call();
        assert_eq!(call.connection_state(), ConnectionState::Disconnected);
        assert_eq!(call.state(), CallState::Inactive);

        call.progress().unwrap();
        call.activate().unwrap();
        call.ring().unwrap();
        call.connect().unwrap();
        assert_eq!(call.connection_state(), ConnectionState::Connected);
        assert_eq!(call.state(), CallState::Active);

        call.hold().unwrap();
        assert_eq!(call.state(), CallState::Hold);
        call.resume().unwrap();
        assert_eq!(call.state(), CallState::Active);

        call.end(EndReason::LocalHangup).unwrap();
        assert!(call.is_ended());
        assert_eq!(call.connection_state(), ConnectionState::Disconnected);

        assert_eq!(
            statuses(&mut call),
            vec![
                CallStatus::Ringing,
                CallStatus::Current,
                CallStatus::Hold,
                CallStatus::Unhold,
                CallStatus::Hungup
            ]
        );
    }

    #[test]
    fn test_incoming_unanswered_becomes_missed() {
        let mut call = Call::incoming(CallId::new(), AccountId::ip2ip(), "sip:10.0.0.2");
        assert!(call.is_ip_to_ip());
        call.progress().unwrap();
        call.ring().unwrap();
        call.end(EndReason::Cancelled).unwrap();
        assert_eq!(call.direction(), CallDirection::Missed);
        assert_eq!(statuses(&mut call), vec![CallStatus::Incoming, CallStatus::Hungup]);
    }

    #[test]
    fn test_busy_sets_terminal_state() {
        let mut call = create_test_call();
        call.progress().unwrap();
        call.activate().unwrap();
        call.set_sip_status(486, "Busy Here");
        call.end(EndReason::Busy).unwrap();
        assert_eq!(call.state(), CallState::Busy);

        let events = call.take_events();
        let last_status = events.iter().rev().find_map(|e| match e {
            CallEvent::StatusChanged(s) => Some(s.clone()),
            _ => None,
        });
        let last_status = last_status.unwrap();
        assert_eq!(last_status.status, CallStatus::Busy);
        assert_eq!(last_status.sip_status, Some((486, "Busy Here".to_string())));
    }

    #[test]
    fn test_hold_requires_connection() {
        let mut call = create_test_call();
        call.progress().unwrap();
        call.activate().unwrap();
        assert!(call.hold().is_err());
    }

    #[test]
    fn test_resume_requires_hold() {
        let mut call = create_test_call();
        call.progress().unwrap();
        call.connect().unwrap();
        assert!(call.resume().is_err());
    }

    #[test]
    fn test_cannot_end_twice() {
        let mut call = create_test_call();
        call.end(EndReason::LocalHangup).unwrap();
        assert!(call.end(EndReason::PeerHangup).is_err());
    }
}
