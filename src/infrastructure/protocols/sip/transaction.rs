//! SIP Transaction Layer
//!
//! Client and server transactions as per RFC 3261 Section 17. Transactions
//! are keyed by the topmost Via branch plus the method, so a CANCEL never
//! collides with the INVITE it cancels. Every transaction remembers who
//! owns it; responses and timeouts are handed back tagged with that owner.
//!
//! ## Transaction Types
//! - INVITE Client Transaction (ICT) - Section 17.1.1
//! - INVITE Server Transaction (IST) - Section 17.2.1
//! - Non-INVITE Client Transaction (NICT) - Section 17.1.2
//! - Non-INVITE Server Transaction (NIST) - Section 17.2.2

use super::message::{header_value, HeaderAccess, SipError, SipMethod, SipRequest, SipResponse};
use super::transport::SipTransport;
use crate::domain::shared::value_objects::{AccountId, CallId};
use rsip::{Header, Headers, Request, Version};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fresh RFC 3261 branch
pub fn generate_branch() -> String {
    format!("z9hG4bK{:x}", rand::random::<u64>())
}

/// Transaction key: Via branch plus method
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionKey {
    pub branch: String,
    pub method: SipMethod,
}

impl TransactionKey {
    pub fn new(branch: &str, method: SipMethod) -> Self {
        Self {
            branch: branch.to_string(),
            method,
        }
    }

    pub fn for_request(request: &SipRequest) -> Result<Self, SipError> {
        let branch = request
            .via_branch()
            .ok_or_else(|| SipError::InvalidMessage("No branch parameter in Via header".to_string()))?;
        let method = request
            .method()
            .ok_or_else(|| SipError::InvalidMessage(format!("Unsupported method {}", request.method_name())))?;
        Ok(Self::new(&branch, method))
    }

    /// Responses match on branch and the CSeq method
    pub fn for_response(response: &SipResponse) -> Result<Self, SipError> {
        let branch = response
            .via_branch()
            .ok_or_else(|| SipError::InvalidMessage("No branch parameter in Via header".to_string()))?;
        let method = response
            .cseq()
            .and_then(|cseq| SipMethod::parse(&cseq.method))
            .ok_or_else(|| SipError::InvalidMessage("Missing or invalid CSeq".to_string()))?;
        Ok(Self::new(&branch, method))
    }
}

/// Who gets the responses and timeouts of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOwner {
    Call(CallId),
    Registration(AccountId),
    /// Answered without any call or registration behind it
    Stateless,
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer types for SIP transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    /// INVITE request retransmit
    TimerA,
    /// INVITE transaction timeout
    TimerB,
    /// Wait for response retransmits after a non-2xx final
    TimerD,
    /// Non-INVITE request retransmit
    TimerE,
    /// Non-INVITE transaction timeout
    TimerF,
    /// INVITE response retransmit
    TimerG,
    /// Wait for ACK receipt
    TimerH,
    /// Wait for ACK retransmits
    TimerI,
    /// Wait for request retransmits, non-INVITE server
    TimerJ,
    /// Wait for response retransmits, non-INVITE client
    TimerK,
}

impl TimerType {
    /// Initial duration of this timer. Reliable transports skip the
    /// absorb-retransmission waits.
    pub fn initial_duration(&self, timers: &SipTimers, is_reliable: bool) -> Duration {
        let unreliable_only = |d: Duration| if is_reliable { Duration::ZERO } else { d };
        match self {
            TimerType::TimerA | TimerType::TimerE | TimerType::TimerG => timers.t1,
            TimerType::TimerB | TimerType::TimerF | TimerType::TimerH => timers.t1 * 64,
            TimerType::TimerD => unreliable_only(Duration::from_secs(32)),
            TimerType::TimerI | TimerType::TimerK => unreliable_only(timers.t4),
            TimerType::TimerJ => unreliable_only(timers.t1 * 64),
        }
    }
}

/// INVITE Client Transaction States (RFC 3261 Section 17.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteClientState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// INVITE Server Transaction States (RFC 3261 Section 17.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteServerState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Non-INVITE Client Transaction States (RFC 3261 Section 17.1.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteClientState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Non-INVITE Server Transaction States (RFC 3261 Section 17.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonInviteServerState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Transaction type and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    InviteClient(InviteClientState),
    InviteServer(InviteServerState),
    NonInviteClient(NonInviteClientState),
    NonInviteServer(NonInviteServerState),
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(InviteClientState::Terminated)
                | TransactionState::InviteServer(InviteServerState::Terminated)
                | TransactionState::NonInviteClient(NonInviteClientState::Terminated)
                | TransactionState::NonInviteServer(NonInviteServerState::Terminated)
        )
    }

    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionState::InviteClient(_) | TransactionState::NonInviteClient(_)
        )
    }

    /// State name for logs
    pub fn name(&self) -> &'static str {
        use TransactionState::*;
        match self {
            InviteClient(InviteClientState::Calling) => "ICT-Calling",
            InviteClient(InviteClientState::Proceeding) => "ICT-Proceeding",
            InviteClient(InviteClientState::Completed) => "ICT-Completed",
            InviteClient(InviteClientState::Terminated) => "ICT-Terminated",
            InviteServer(InviteServerState::Proceeding) => "IST-Proceeding",
            InviteServer(InviteServerState::Completed) => "IST-Completed",
            InviteServer(InviteServerState::Confirmed) => "IST-Confirmed",
            InviteServer(InviteServerState::Terminated) => "IST-Terminated",
            NonInviteClient(NonInviteClientState::Trying) => "NICT-Trying",
            NonInviteClient(NonInviteClientState::Proceeding) => "NICT-Proceeding",
            NonInviteClient(NonInviteClientState::Completed) => "NICT-Completed",
            NonInviteClient(NonInviteClientState::Terminated) => "NICT-Terminated",
            NonInviteServer(NonInviteServerState::Trying) => "NIST-Trying",
            NonInviteServer(NonInviteServerState::Proceeding) => "NIST-Proceeding",
            NonInviteServer(NonInviteServerState::Completed) => "NIST-Completed",
            NonInviteServer(NonInviteServerState::Terminated) => "NIST-Terminated",
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveTimer {
    timer_type: TimerType,
    expires_at: Instant,
    interval: Duration,
}

/// What a fired timer asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionTimerAction {
    None,
    RetransmitRequest,
    RetransmitResponse,
    Timeout,
    Terminate,
}

/// One SIP transaction
pub struct Transaction {
    pub key: TransactionKey,
    pub state: TransactionState,
    pub request: SipRequest,
    /// Peer address: request destination for clients, source for servers
    pub peer: SocketAddr,
    pub transport: Arc<dyn SipTransport>,
    pub owner: TransactionOwner,
    pub last_response: Option<SipResponse>,
    /// ACK sent for a non-2xx final, resent on response retransmissions
    ack: Option<SipRequest>,
    timers: Vec<ActiveTimer>,
    sip_timers: SipTimers,
    is_reliable: bool,
}

impl Transaction {
    fn new(
        key: TransactionKey,
        state: TransactionState,
        request: SipRequest,
        peer: SocketAddr,
        transport: Arc<dyn SipTransport>,
        owner: TransactionOwner,
        sip_timers: SipTimers,
    ) -> Self {
        let is_reliable = transport.protocol().is_reliable();
        Self {
            key,
            state,
            request,
            peer,
            transport,
            owner,
            last_response: None,
            ack: None,
            timers: Vec::new(),
            sip_timers,
            is_reliable,
        }
    }

    /// Client transaction; retransmission and timeout timers start now
    pub fn client(
        key: TransactionKey,
        request: SipRequest,
        peer: SocketAddr,
        transport: Arc<dyn SipTransport>,
        owner: TransactionOwner,
        sip_timers: SipTimers,
    ) -> Self {
        let invite = key.method == SipMethod::Invite;
        let state = if invite {
            TransactionState::InviteClient(InviteClientState::Calling)
        } else {
            TransactionState::NonInviteClient(NonInviteClientState::Trying)
        };
        let mut transaction = Self::new(key, state, request, peer, transport, owner, sip_timers);
        let (retransmit, timeout) = if invite {
            (TimerType::TimerA, TimerType::TimerB)
        } else {
            (TimerType::TimerE, TimerType::TimerF)
        };
        if !transaction.is_reliable {
            transaction.start_timer(retransmit);
        }
        transaction.start_timer(timeout);
        transaction
    }

    pub fn server(
        key: TransactionKey,
        request: SipRequest,
        peer: SocketAddr,
        transport: Arc<dyn SipTransport>,
        sip_timers: SipTimers,
    ) -> Self {
        let state = if key.method == SipMethod::Invite {
            TransactionState::InviteServer(InviteServerState::Proceeding)
        } else {
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
        };
        Self::new(
            key,
            state,
            request,
            peer,
            transport,
            TransactionOwner::Stateless,
            sip_timers,
        )
    }

    fn start_timer(&mut self, timer_type: TimerType) {
        let duration = timer_type.initial_duration(&self.sip_timers, self.is_reliable);
        if duration.is_zero() {
            return;
        }
        self.timers.push(ActiveTimer {
            timer_type,
            expires_at: Instant::now() + duration,
            interval: duration,
        });
        debug!(
            "Started {:?} for transaction {} (expires in {:?})",
            timer_type, self.key.branch, duration
        );
    }

    fn stop_timer(&mut self, timer_type: TimerType) {
        self.timers.retain(|t| t.timer_type != timer_type);
    }

    fn terminate(&mut self) {
        self.timers.clear();
        self.state = match self.state {
            TransactionState::InviteClient(_) => {
                TransactionState::InviteClient(InviteClientState::Terminated)
            }
            TransactionState::InviteServer(_) => {
                TransactionState::InviteServer(InviteServerState::Terminated)
            }
            TransactionState::NonInviteClient(_) => {
                TransactionState::NonInviteClient(NonInviteClientState::Terminated)
            }
            TransactionState::NonInviteServer(_) => {
                TransactionState::NonInviteServer(NonInviteServerState::Terminated)
            }
        };
    }

    /// Feed a received response to a client transaction
    pub fn process_response(&mut self, response: &SipResponse) -> Result<(), SipError> {
        let status = response.status_code();

        match self.state {
            TransactionState::InviteClient(InviteClientState::Calling)
            | TransactionState::InviteClient(InviteClientState::Proceeding) => {
                if status < 200 {
                    self.state = TransactionState::InviteClient(InviteClientState::Proceeding);
                    self.stop_timer(TimerType::TimerA);
                } else if status < 300 {
                    // 2xx goes to the dialog; ACK is its business
                    self.terminate();
                } else {
                    self.state = TransactionState::InviteClient(InviteClientState::Completed);
                    self.stop_timer(TimerType::TimerA);
                    self.stop_timer(TimerType::TimerB);
                    self.start_timer(TimerType::TimerD);
                    if self.timers.is_empty() {
                        self.terminate();
                    }
                }
                Ok(())
            }
            TransactionState::NonInviteClient(NonInviteClientState::Trying)
            | TransactionState::NonInviteClient(NonInviteClientState::Proceeding) => {
                if status < 200 {
                    self.state = TransactionState::NonInviteClient(NonInviteClientState::Proceeding);
                } else {
                    self.state = TransactionState::NonInviteClient(NonInviteClientState::Completed);
                    self.stop_timer(TimerType::TimerE);
                    self.stop_timer(TimerType::TimerF);
                    self.start_timer(TimerType::TimerK);
                    if self.timers.is_empty() {
                        self.terminate();
                    }
                }
                Ok(())
            }
            // Absorb retransmitted responses
            TransactionState::InviteClient(InviteClientState::Completed)
            | TransactionState::NonInviteClient(NonInviteClientState::Completed) => Ok(()),
            state => Err(SipError::TransactionError(format!(
                "Cannot process response in state {}",
                state.name()
            ))),
        }
    }

    /// ACK for a non-2xx final on an INVITE server transaction
    pub fn process_ack(&mut self) -> Result<(), SipError> {
        match self.state {
            TransactionState::InviteServer(InviteServerState::Completed) => {
                self.state = TransactionState::InviteServer(InviteServerState::Confirmed);
                self.stop_timer(TimerType::TimerG);
                self.stop_timer(TimerType::TimerH);
                self.start_timer(TimerType::TimerI);
                if self.timers.is_empty() {
                    self.terminate();
                }
                Ok(())
            }
            TransactionState::InviteServer(InviteServerState::Confirmed) => Ok(()),
            state => Err(SipError::TransactionError(format!(
                "Invalid state {} for ACK processing",
                state.name()
            ))),
        }
    }

    /// Record a response sent by a server transaction
    pub fn send_response(&mut self, response: SipResponse) -> Result<(), SipError> {
        let status = response.status_code();

        match self.state {
            TransactionState::InviteServer(InviteServerState::Proceeding) => {
                if (200..300).contains(&status) {
                    self.terminate();
                } else if status >= 300 {
                    self.state = TransactionState::InviteServer(InviteServerState::Completed);
                    if !self.is_reliable {
                        self.start_timer(TimerType::TimerG);
                    }
                    self.start_timer(TimerType::TimerH);
                }
            }
            TransactionState::NonInviteServer(NonInviteServerState::Trying)
            | TransactionState::NonInviteServer(NonInviteServerState::Proceeding) => {
                if status < 200 {
                    self.state = TransactionState::NonInviteServer(NonInviteServerState::Proceeding);
                } else {
                    self.state = TransactionState::NonInviteServer(NonInviteServerState::Completed);
                    self.start_timer(TimerType::TimerJ);
                    if self.timers.is_empty() {
                        self.terminate();
                    }
                }
            }
            state => {
                return Err(SipError::TransactionError(format!(
                    "Invalid state {} for sending response",
                    state.name()
                )))
            }
        }
        self.last_response = Some(response);
        Ok(())
    }

    fn backoff(&mut self, timer_type: TimerType) {
        let t2 = self.sip_timers.t2;
        if let Some(timer) = self.timers.iter_mut().find(|t| t.timer_type == timer_type) {
            timer.interval = std::cmp::min(timer.interval * 2, t2);
            timer.expires_at = Instant::now() + timer.interval;
        }
    }

    /// Handle timer expiration
    pub fn handle_timer_fired(&mut self, timer_type: TimerType) -> TransactionTimerAction {
        debug!(
            "Timer {:?} fired for transaction {} in state {}",
            timer_type,
            self.key.branch,
            self.state.name()
        );

        match timer_type {
            TimerType::TimerA
                if self.state == TransactionState::InviteClient(InviteClientState::Calling) =>
            {
                self.backoff(timer_type);
                TransactionTimerAction::RetransmitRequest
            }
            TimerType::TimerE
                if matches!(self.state, TransactionState::NonInviteClient(NonInviteClientState::Trying) | TransactionState::NonInviteClient(NonInviteClientState::Proceeding)) =>
            {
                self.backoff(timer_type);
                TransactionTimerAction::RetransmitRequest
            }
            TimerType::TimerG
                if self.state == TransactionState::InviteServer(InviteServerState::Completed) =>
            {
                self.backoff(timer_type);
                TransactionTimerAction::RetransmitResponse
            }
            TimerType::TimerA | TimerType::TimerE | TimerType::TimerG => {
                self.stop_timer(timer_type);
                TransactionTimerAction::None
            }
            TimerType::TimerB | TimerType::TimerF | TimerType::TimerH => {
                self.terminate();
                TransactionTimerAction::Timeout
            }
            TimerType::TimerD | TimerType::TimerI | TimerType::TimerJ | TimerType::TimerK => {
                self.terminate();
                TransactionTimerAction::Terminate
            }
        }
    }

    /// Fire every expired timer
    pub fn check_timers(&mut self) -> Vec<(TimerType, TransactionTimerAction)> {
        let now = Instant::now();
        let expired: Vec<TimerType> = self
            .timers
            .iter()
            .filter(|t| t.expires_at <= now)
            .map(|t| t.timer_type)
            .collect();

        let mut actions = Vec::new();
        for timer_type in expired {
            if self.state.is_terminated() {
                break;
            }
            let action = self.handle_timer_fired(timer_type);
            if action != TransactionTimerAction::None {
                actions.push((timer_type, action));
            }
        }
        actions
    }
}

/// ACK for a non-2xx final response (RFC 3261 Section 17.1.1.3): same
/// Request-URI, top Via, From, Call-ID and CSeq number as the INVITE,
/// To from the response.
pub fn build_non2xx_ack(invite: &SipRequest, response: &SipResponse) -> Result<SipRequest, SipError> {
    let mut headers = Vec::new();
    let mut via_copied = false;
    for header in invite.headers().iter() {
        match header {
            Header::Via(_) if !via_copied => {
                headers.push(header.clone());
                via_copied = true;
            }
            Header::MaxForwards(_) | Header::Route(_) | Header::From(_) | Header::CallId(_) => {
                headers.push(header.clone());
            }
            _ => {}
        }
    }

    let to = header_value(response.headers(), "To")
        .ok_or_else(|| SipError::InvalidMessage("Response without To".to_string()))?;
    headers.push(Header::To(to.into()));

    let seq = invite
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("INVITE without CSeq".to_string()))?
        .seq;
    headers.push(Header::CSeq(format!("{} ACK", seq).into()));
    headers.push(Header::ContentLength("0".to_string().into()));

    Ok(SipRequest::new(Request {
        method: rsip::Method::Ack,
        uri: invite.inner.uri.clone(),
        version: Version::V2,
        headers: Headers::from(headers),
        body: Vec::new(),
    }))
}

/// What happened to a received response
#[derive(Debug)]
pub enum ResponseDisposition {
    /// New information for the owner
    Deliver {
        owner: TransactionOwner,
        request: SipRequest,
        response: SipResponse,
    },
    /// Retransmission, already handled
    Absorbed,
    /// No transaction; 2xx retransmissions for INVITE land here
    Stray(SipResponse),
}

/// What happened to a received request
#[derive(Debug)]
pub enum RequestDisposition {
    /// New server transaction created
    New(TransactionKey),
    /// Retransmission answered from the transaction
    Absorbed,
    /// ACK for a 2xx; belongs to the dialog
    DialogAck,
}

/// A transaction gave up waiting
#[derive(Debug, Clone)]
pub struct TransactionTimeout {
    pub owner: TransactionOwner,
    pub request: SipRequest,
    /// Server side timeouts mean the ACK never came
    pub server: bool,
}

/// All live transactions, driven by the dispatch loop
pub struct TransactionLayer {
    transactions: Mutex<HashMap<TransactionKey, Transaction>>,
    sip_timers: SipTimers,
}

impl TransactionLayer {
    pub fn new(sip_timers: SipTimers) -> Self {
        Self {
            transactions: Mutex::new(HashMap::new()),
            sip_timers,
        }
    }

    pub fn timers(&self) -> SipTimers {
        self.sip_timers
    }

    /// Send a request inside a new client transaction. The transport send
    /// happens after the table lock is released.
    pub async fn send_request(
        &self,
        request: SipRequest,
        destination: SocketAddr,
        transport: Arc<dyn SipTransport>,
        owner: TransactionOwner,
    ) -> Result<TransactionKey, SipError> {
        let key = TransactionKey::for_request(&request)?;
        if key.method == SipMethod::Ack {
            return Err(SipError::TransactionError(
                "ACK is sent outside transactions".to_string(),
            ));
        }

        let bytes = request.to_bytes();
        {
            let mut transactions = self.transactions.lock().await;
            info!(
                "Created client transaction {} for {} to {}",
                key.branch, key.method, destination
            );
            transactions.insert(
                key.clone(),
                Transaction::client(
                    key.clone(),
                    request,
                    destination,
                    transport.clone(),
                    owner,
                    self.sip_timers,
                ),
            );
        }

        if let Err(e) = transport.send(&bytes, destination).await {
            self.transactions.lock().await.remove(&key);
            return Err(e);
        }
        Ok(key)
    }

    /// Match a response to its client transaction
    pub async fn on_response(&self, response: SipResponse) -> Result<ResponseDisposition, SipError> {
        let key = TransactionKey::for_response(&response)?;

        let mut resend_ack = None;
        let disposition = {
            let mut transactions = self.transactions.lock().await;
            let Some(transaction) = transactions.get_mut(&key) else {
                debug!("No transaction found for response: {}", key.branch);
                return Ok(ResponseDisposition::Stray(response));
            };

            let old_state = transaction.state;
            transaction.process_response(&response)?;
            let new_state = transaction.state;
            debug!(
                "Transaction {} processed response {}: {} -> {}",
                key.branch,
                response.status_code(),
                old_state.name(),
                new_state.name()
            );

            // Non-2xx final to an INVITE is acknowledged here
            if key.method == SipMethod::Invite && response.status_code() >= 300 {
                if transaction.ack.is_none() {
                    transaction.ack = Some(build_non2xx_ack(&transaction.request, &response)?);
                }
                resend_ack = transaction
                    .ack
                    .as_ref()
                    .map(|ack| (transaction.transport.clone(), ack.to_bytes(), transaction.peer));
            }

            let changed = old_state != new_state
                || (response.is_provisional() && response.status_code() > 100);
            if changed {
                ResponseDisposition::Deliver {
                    owner: transaction.owner.clone(),
                    request: transaction.request.clone(),
                    response,
                }
            } else {
                ResponseDisposition::Absorbed
            }
        };

        if let Some((transport, bytes, peer)) = resend_ack {
            transport.send(&bytes, peer).await?;
        }
        Ok(disposition)
    }

    /// Match a request to a server transaction, creating one if new
    pub async fn on_request(
        &self,
        request: &SipRequest,
        source: SocketAddr,
        transport: Arc<dyn SipTransport>,
    ) -> Result<RequestDisposition, SipError> {
        let key = TransactionKey::for_request(request)?;

        if key.method == SipMethod::Ack {
            let invite_key = TransactionKey::new(&key.branch, SipMethod::Invite);
            let mut transactions = self.transactions.lock().await;
            return match transactions.get_mut(&invite_key) {
                Some(transaction)
                    if !transaction.state.is_client() && !transaction.state.is_terminated() =>
                {
                    transaction.process_ack()?;
                    Ok(RequestDisposition::Absorbed)
                }
                _ => Ok(RequestDisposition::DialogAck),
            };
        }

        let retransmit = {
            let mut transactions = self.transactions.lock().await;
            match transactions.get(&key) {
                Some(existing) => existing
                    .last_response
                    .as_ref()
                    .map(|r| (existing.transport.clone(), r.to_bytes(), existing.peer)),
                None => {
                    info!(
                        "Created server transaction {} for {} from {}",
                        key.branch, key.method, source
                    );
                    transactions.insert(
                        key.clone(),
                        Transaction::server(
                            key.clone(),
                            request.clone(),
                            source,
                            transport,
                            self.sip_timers,
                        ),
                    );
                    return Ok(RequestDisposition::New(key));
                }
            }
        };

        debug!("Request retransmission for transaction {}", key.branch);
        if let Some((transport, bytes, peer)) = retransmit {
            transport.send(&bytes, peer).await?;
        }
        Ok(RequestDisposition::Absorbed)
    }

    /// Attach an owner to a server transaction
    pub async fn set_owner(&self, key: &TransactionKey, owner: TransactionOwner) {
        if let Some(transaction) = self.transactions.lock().await.get_mut(key) {
            transaction.owner = owner;
        }
    }

    /// Send a response through the server transaction of `request`
    pub async fn respond(&self, request: &SipRequest, response: SipResponse) -> Result<(), SipError> {
        let key = TransactionKey::for_request(request)?;
        let (transport, peer) = {
            let mut transactions = self.transactions.lock().await;
            let transaction = transactions.get_mut(&key).ok_or_else(|| {
                SipError::TransactionError(format!("Transaction not found: {}", key.branch))
            })?;
            let old_state = transaction.state;
            transaction.send_response(response.clone())?;
            debug!(
                "Transaction {} sent response {}: {} -> {}",
                key.branch,
                response.status_code(),
                old_state.name(),
                transaction.state.name()
            );
            (transaction.transport.clone(), transaction.peer)
        };
        transport.send(&response.to_bytes(), peer).await
    }

    /// Whether the INVITE server transaction of `request` still awaits a final response
    pub async fn is_pending(&self, request: &SipRequest) -> bool {
        let Ok(key) = TransactionKey::for_request(request) else {
            return false;
        };
        matches!(
            self.transactions.lock().await.get(&key).map(|t| t.state),
            Some(TransactionState::InviteServer(InviteServerState::Proceeding))
                | Some(TransactionState::NonInviteServer(NonInviteServerState::Trying))
                | Some(TransactionState::NonInviteServer(NonInviteServerState::Proceeding))
        )
    }

    /// Drive timers: retransmit what needs it, drop terminated
    /// transactions and report timeouts to their owners.
    pub async fn poll_timers(&self) -> Vec<TransactionTimeout> {
        let mut sends = Vec::new();
        let mut timeouts = Vec::new();

        {
            let mut transactions = self.transactions.lock().await;
            for (key, transaction) in transactions.iter_mut() {
                for (timer_type, action) in transaction.check_timers() {
                    match action {
                        TransactionTimerAction::RetransmitRequest => {
                            debug!("Transaction {} {:?}: retransmit request", key.branch, timer_type);
                            sends.push((
                                transaction.transport.clone(),
                                transaction.request.to_bytes(),
                                transaction.peer,
                            ));
                        }
                        TransactionTimerAction::RetransmitResponse => {
                            if let Some(response) = &transaction.last_response {
                                sends.push((
                                    transaction.transport.clone(),
                                    response.to_bytes(),
                                    transaction.peer,
                                ));
                            }
                        }
                        TransactionTimerAction::Timeout => {
                            warn!("Transaction {} {:?}: timeout", key.branch, timer_type);
                            timeouts.push(TransactionTimeout {
                                owner: transaction.owner.clone(),
                                request: transaction.request.clone(),
                                server: !transaction.state.is_client(),
                            });
                        }
                        TransactionTimerAction::Terminate | TransactionTimerAction::None => {}
                    }
                }
            }
            transactions.retain(|key, transaction| {
                let keep = !transaction.state.is_terminated();
                if !keep {
                    debug!("Removing terminated transaction {}", key.branch);
                }
                keep
            });
        }

        for (transport, bytes, peer) in sends {
            if let Err(e) = transport.send(&bytes, peer).await {
                warn!("Retransmission to {} failed: {}", peer, e);
            }
        }
        timeouts
    }

    pub async fn transaction_count(&self) -> usize {
        self.transactions.lock().await.len()
    }

    pub async fn state_of(&self, key: &TransactionKey) -> Option<TransactionState> {
        self.transactions.lock().await.get(key).map(|t| t.state)
    }

    /// Drop everything, used once the grace period is over
    pub async fn clear(&self) -> usize {
        let mut transactions = self.transactions.lock().await;
        let count = transactions.len();
        transactions.clear();
        count
    }
}
