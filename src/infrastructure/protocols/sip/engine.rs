//! SIP engine: routes transport events to calls and registrations
//!
//! Inbound messages, transaction timers and registration refreshes are all
//! handled on the dispatch task, one at a time. Application operations run
//! on the caller's task. Both lock a call only for the transition itself;
//! queued messages are put on the wire and signals published after the lock
//! is released.

use super::builder::{generate_call_id, generate_tag, ResponseBuilder};
use super::call::{CallSetup, DialogAction, SipCall};
use super::call_table::{CallHandle, CallRoute, CallTable};
use super::message::{
    name_addr_uri, HeaderAccess, ReplacesValue, SipError, SipMessage, SipMethod, SipRequest,
    SipResponse,
};
use super::registration::{via_received, Registration, RegistrationResult, RegistrationStep};
use super::session::{LocalContact, Outgoing, SipSession, ALLOWED_METHODS, SDP_CONTENT_TYPE};
use super::transaction::{
    RequestDisposition, ResponseDisposition, SipTimers, TransactionKey, TransactionLayer,
    TransactionOwner,
};
use super::transport::{resolve_target, InboundMessage, SipTransport, TransportManager};
use crate::application::error::{LinkError, LinkResult};
use crate::application::notifier::{Notifier, Signal};
use crate::domain::account::{
    Account, AccountTable, RegistrationError, RegistrationState, TransportKind,
};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{direct_ip_target, AccountId, CallId, SipUri};
use crate::infrastructure::media::{CodecRegistry, MediaFactory, MediaPortAllocator, ZrtpEvent};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Engine-wide behavior taken from configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub dtmf_duration_ms: u32,
    /// Status sent when the user refuses a call
    pub rejection_code: u16,
    pub timers: SipTimers,
    pub ports: MediaPortAllocator,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dtmf_duration_ms: 100,
            rejection_code: 603,
            timers: SipTimers::default(),
            ports: MediaPortAllocator::default(),
        }
    }
}

struct RegistrationSlot {
    registration: Registration,
    route: CallRoute,
    refresh_at: Option<Instant>,
}

pub struct SipEngine {
    settings: EngineSettings,
    accounts: Arc<AccountTable>,
    calls: CallTable,
    transactions: TransactionLayer,
    transports: TransportManager,
    notifier: Notifier,
    media: Arc<dyn MediaFactory>,
    registry: CodecRegistry,
    registrations: Mutex<HashMap<AccountId, RegistrationSlot>>,
    /// Ended calls kept until late responses for them have drained
    lingering: Mutex<HashMap<CallId, Instant>>,
}

impl SipEngine {
    pub fn new(
        settings: EngineSettings,
        accounts: Arc<AccountTable>,
        transports: TransportManager,
        notifier: Notifier,
        media: Arc<dyn MediaFactory>,
    ) -> Self {
        Self {
            transactions: TransactionLayer::new(settings.timers),
            settings,
            accounts,
            calls: CallTable::new(),
            transports,
            notifier,
            media,
            registry: CodecRegistry::new(),
            registrations: Mutex::new(HashMap::new()),
            lingering: Mutex::new(HashMap::new()),
        }
    }

    pub fn accounts(&self) -> &Arc<AccountTable> {
        &self.accounts
    }

    pub fn calls(&self) -> &CallTable {
        &self.calls
    }

    pub fn transports(&self) -> &TransportManager {
        &self.transports
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Signalling transport an account sends through
    pub async fn account_transport(&self, account: &Account) -> Result<Arc<dyn SipTransport>, SipError> {
        match account.transport {
            TransportKind::Udp => {
                self.transports
                    .udp_transport(
                        &account.local_interface,
                        account.local_port,
                        account.stun_server.as_deref(),
                    )
                    .await
            }
            TransportKind::Tls => {
                let server = resolve_target(&account.hostname, TransportKind::Tls.default_port()).await?;
                self.transports
                    .tls_transport(&account.local_interface, &account.hostname, server)
                    .await
            }
        }
    }

    fn local_contact(account: &Account, transport: &dyn SipTransport) -> LocalContact {
        let public = transport.public_addr();
        let (host, port) = account.contact_address(&public.ip().to_string(), public.port());
        LocalContact {
            transport: transport.protocol(),
            contact: account.contact(&host, port),
            host,
            port,
            user_agent: account.user_agent.clone(),
        }
    }

    fn call_setup(&self, id: CallId, account: Account, local_ip: &str) -> CallSetup {
        CallSetup {
            id,
            account,
            registry: self.registry.clone(),
            local_ip: local_ip.to_string(),
            ports: self.settings.ports.allocate_pair(),
            audio: self.media.audio_session(id),
            video: self.media.video_session(id),
            dtmf_duration_ms: self.settings.dtmf_duration_ms,
        }
    }

    // ---- outgoing calls

    /// Call `target`. Direct IP targets always go through the IP2IP account.
    pub async fn place_call(&self, account_id: &AccountId, target: &str) -> LinkResult<CallId> {
        self.start_outgoing(account_id, target, None, None).await
    }

    async fn start_outgoing(
        &self,
        account_id: &AccountId,
        target: &str,
        replaces: Option<ReplacesValue>,
        referred_by: Option<CallId>,
    ) -> LinkResult<CallId> {
        let account_id = if direct_ip_target(target).is_some() {
            debug!(%target, "Direct IP call");
            AccountId::ip2ip()
        } else {
            account_id.clone()
        };
        let account = self
            .accounts
            .get(&account_id)
            .await
            .ok_or_else(|| LinkError::AccountNotFound(account_id.clone()))?;

        let to = account.to_uri(target);
        let destination = if account.is_ip2ip() {
            let uri = SipUri::parse(&to).map_err(LinkError::CouldNotCreateCall)?;
            resolve_target(&uri.host_port(), account.transport.default_port()).await
        } else {
            resolve_target(&account.hostname, account.transport.default_port()).await
        }
        .map_err(|e| LinkError::CouldNotCreateCall(e.to_string()))?;
        let transport = self
            .account_transport(&account)
            .await
            .map_err(|e| LinkError::CouldNotCreateCall(e.to_string()))?;

        let local = Self::local_contact(&account, transport.as_ref());
        let from = account.from_uri(&local.host);
        let sip_call_id = generate_call_id(&local.host);
        let mut session = SipSession::outgoing(
            local.clone(),
            &sip_call_id,
            &from,
            &to,
            account.credentials.clone(),
        );
        if let Some(replaces) = replaces {
            session = session.replacing(replaces);
        }

        let id = CallId::new();
        let setup = self.call_setup(id, account, &local.host);
        let mut call = SipCall::outgoing(setup, Box::new(session), &name_addr_uri(&to))
            .map_err(|e| LinkError::CouldNotCreateCall(e.to_string()))?;
        if let Some(referrer) = referred_by {
            call.set_referred_by(referrer);
        }
        call.dial()
            .map_err(|e| LinkError::CouldNotCreateCall(e.to_string()))?;

        info!(call_id = %id, %to, %destination, "Placing call");
        self.calls
            .insert(id, &sip_call_id, call, CallRoute { transport, peer: destination })
            .await;
        self.flush(id).await;
        Ok(id)
    }

    // ---- application operations on calls

    async fn with_call<T>(
        &self,
        id: &CallId,
        op: impl FnOnce(&mut SipCall) -> Result<T, super::call::CallError>,
    ) -> LinkResult<T> {
        let handle = self.calls.get(id).await.ok_or(LinkError::CallNotFound(*id))?;
        let result = {
            let mut call = handle.lock().await;
            op(&mut call)
        };
        self.flush(*id).await;
        Ok(result?)
    }

    pub async fn answer(&self, id: &CallId) -> LinkResult<()> {
        self.hold_other_calls(id).await;
        self.with_call(id, SipCall::answer).await
    }

    pub async fn refuse(&self, id: &CallId) -> LinkResult<()> {
        let code = self.settings.rejection_code;
        self.with_call(id, |call| call.refuse(code)).await
    }

    pub async fn hangup(&self, id: &CallId) -> LinkResult<()> {
        self.with_call(id, SipCall::hangup).await
    }

    pub async fn hold(&self, id: &CallId) -> LinkResult<()> {
        self.with_call(id, SipCall::hold).await
    }

    pub async fn resume(&self, id: &CallId) -> LinkResult<()> {
        self.hold_other_calls(id).await;
        self.with_call(id, SipCall::resume).await
    }

    pub async fn transfer(&self, id: &CallId, target: &str) -> LinkResult<()> {
        self.with_call(id, |call| call.transfer(target)).await
    }

    /// Hand the peer of `id` over to the peer of `target_call`
    pub async fn attended_transfer(&self, id: &CallId, target_call: &CallId) -> LinkResult<()> {
        let (peer, replaces) = self
            .with_call(target_call, |call| {
                call.replaces_target().ok_or_else(|| {
                    DomainError::InvalidOperation(format!(
                        "call {} has no established dialog",
                        call.id()
                    ))
                    .into()
                })
            })
            .await?;
        self.with_call(id, |call| call.attended_transfer(&peer, &replaces))
            .await
    }

    pub async fn send_dtmf(&self, id: &CallId, digit: char) -> LinkResult<()> {
        self.with_call(id, |call| call.send_dtmf(digit)).await
    }

    pub async fn send_text_message(&self, id: &CallId, text: &str) -> LinkResult<()> {
        self.with_call(id, |call| call.send_text_message(text)).await
    }

    pub async fn request_keyframe(&self, id: &CallId) -> LinkResult<()> {
        self.with_call(id, SipCall::request_keyframe).await
    }

    pub async fn on_zrtp_event(&self, id: &CallId, event: ZrtpEvent) -> LinkResult<()> {
        self.with_call(id, |call| {
            call.on_zrtp_event(event);
            Ok(())
        })
        .await
    }

    /// Only one call owns the audio device: put any other current call on hold
    async fn hold_other_calls(&self, except: &CallId) {
        for (id, handle) in self.calls.handles().await {
            if id == *except {
                continue;
            }
            let held = {
                let mut call = handle.lock().await;
                call.is_current().then(|| call.hold())
            };
            if let Some(result) = held {
                if let Err(e) = result {
                    warn!(call_id = %id, "Cannot hold call: {}", e);
                }
                self.flush(id).await;
            }
        }
    }

    /// Hang up every live call
    pub async fn hangup_all(&self) {
        for id in self.calls.ids().await {
            if let Err(e) = self.hangup(&id).await {
                warn!(call_id = %id, "Hangup during shutdown failed: {}", e);
            }
        }
    }

    // ---- flushing call output

    /// Put a call's queued messages on the wire and publish its signals,
    /// then follow up on referrals and ended calls.
    async fn flush(&self, id: CallId) {
        let mut pending = VecDeque::from([id]);
        while let Some(id) = pending.pop_front() {
            let Some(handle) = self.calls.get(&id).await else {
                continue;
            };
            self.drain(id, &handle).await;

            let (ended, referral, status) = {
                let mut call = handle.lock().await;
                let status = call.call().sip_status().map(|(code, _)| *code);
                (call.is_ended(), call.take_referral(), status)
            };
            if let Some((referrer, progressed)) = referral {
                let code = match status {
                    _ if progressed => 200,
                    Some(code) if code >= 300 => code,
                    _ => 503,
                };
                self.report_referral(referrer, code).await;
                pending.push_back(referrer);
            }
            if ended {
                self.retire(id).await;
            }
        }
    }

    async fn drain(&self, id: CallId, handle: &CallHandle) {
        let Some(route) = self.calls.route(&id).await else {
            return;
        };
        loop {
            let (outbox, signals) = {
                let mut call = handle.lock().await;
                (call.take_outbox(), call.take_signals())
            };
            if outbox.is_empty() && signals.is_empty() {
                break;
            }
            self.notifier.publish_all(signals);

            let mut invite_sent = false;
            let mut failed = Vec::new();
            for outgoing in outbox {
                match outgoing {
                    Outgoing::Request(request) => {
                        let is_invite = request.method() == Some(SipMethod::Invite);
                        match self
                            .transactions
                            .send_request(
                                request.clone(),
                                route.peer,
                                route.transport.clone(),
                                TransactionOwner::Call(id),
                            )
                            .await
                        {
                            Ok(_) => invite_sent |= is_invite,
                            Err(e) => {
                                warn!(call_id = %id, "Cannot send {}: {}", request.method_name(), e);
                                failed.push(request);
                            }
                        }
                    }
                    Outgoing::Ack(ack) => {
                        if let Err(e) = route.transport.send(&ack.to_bytes(), route.peer).await {
                            warn!(call_id = %id, "Cannot send ACK: {}", e);
                        }
                    }
                    Outgoing::Response { request, response } => {
                        if let Err(e) = self.transactions.respond(&request, response).await {
                            warn!(call_id = %id, "Cannot send response: {}", e);
                        }
                    }
                }
            }

            if invite_sent || !failed.is_empty() {
                let mut call = handle.lock().await;
                if invite_sent {
                    if let Err(e) = call.invite_sent() {
                        warn!(call_id = %id, "{}", e);
                    }
                }
                for request in &failed {
                    if let Err(e) = call.on_send_failure(request) {
                        warn!(call_id = %id, "{}", e);
                    }
                }
            }
        }
    }

    /// Tell the referrer how the call it asked for went; drop it on success
    async fn report_referral(&self, referrer: CallId, code: u16) {
        let Some(handle) = self.calls.get(&referrer).await else {
            return;
        };
        let mut call = handle.lock().await;
        if call.is_ended() {
            return;
        }
        if let Err(e) = call.notify_transfer(code) {
            warn!(call_id = %referrer, "Cannot notify transfer progress: {}", e);
        }
        if code < 300 {
            info!(call_id = %referrer, "Transfer target reached, dropping referring call");
            if let Err(e) = call.hangup() {
                warn!(call_id = %referrer, "{}", e);
            }
        }
    }

    /// Keep an ended call around for the late responses of its dialog
    async fn retire(&self, id: CallId) {
        let linger = self.settings.timers.t1 * 64;
        self.lingering
            .lock()
            .await
            .entry(id)
            .or_insert_with(|| Instant::now() + linger);
    }

    async fn sweep_lingering(&self) {
        let now = Instant::now();
        let expired: Vec<CallId> = {
            let mut lingering = self.lingering.lock().await;
            let expired = lingering
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            for id in &expired {
                lingering.remove(id);
            }
            expired
        };
        for id in expired {
            self.calls.remove(&id).await;
        }
    }

    /// Drop ended calls at once; used on shutdown
    pub async fn purge_ended(&self) {
        let ids: Vec<CallId> = self.lingering.lock().await.drain().map(|(id, _)| id).collect();
        for id in ids {
            self.calls.remove(&id).await;
        }
    }

    // ---- dispatch

    /// Route one message received on any transport
    pub async fn handle_inbound(&self, inbound: InboundMessage) {
        let InboundMessage {
            message,
            source,
            transport,
        } = inbound;
        match message {
            SipMessage::Request(request) => self.on_request(request, source, transport).await,
            SipMessage::Response(response) => self.on_response(response).await,
        }
    }

    async fn on_response(&self, response: SipResponse) {
        let disposition = match self.transactions.on_response(response).await {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!("Dropping response: {}", e);
                return;
            }
        };
        match disposition {
            ResponseDisposition::Deliver {
                owner,
                request,
                response,
            } => match owner {
                TransactionOwner::Call(id) => {
                    let Some(handle) = self.calls.get(&id).await else {
                        debug!(call_id = %id, "Response for a call that is gone");
                        return;
                    };
                    let result = handle.lock().await.on_response(&request, &response);
                    if let Err(e) = result {
                        warn!(call_id = %id, "Response handling failed: {}", e);
                    }
                    self.flush(id).await;
                }
                TransactionOwner::Registration(account_id) => {
                    self.on_registration_response(&account_id, &response).await
                }
                TransactionOwner::Stateless => {}
            },
            ResponseDisposition::Absorbed => {}
            ResponseDisposition::Stray(response) => {
                let is_invite_2xx = response.is_success()
                    && response
                        .cseq()
                        .map_or(false, |c| c.method == SipMethod::Invite.as_str());
                if !is_invite_2xx {
                    debug!(code = response.status_code(), "Stray response dropped");
                    return;
                }
                // 2xx retransmission: our ACK got lost
                let Some(call_id) = response.call_id() else {
                    return;
                };
                if let Some((id, handle)) = self.calls.find_by_sip_call_id(&call_id).await {
                    handle.lock().await.resend_ack();
                    self.flush(id).await;
                }
            }
        }
    }

    async fn on_request(&self, request: SipRequest, source: SocketAddr, transport: Arc<dyn SipTransport>) {
        let key = match self.transactions.on_request(&request, source, transport.clone()).await {
            Ok(RequestDisposition::New(key)) => Some(key),
            Ok(RequestDisposition::DialogAck) => None,
            Ok(RequestDisposition::Absorbed) => return,
            Err(e) => {
                warn!(%source, "Dropping request: {}", e);
                return;
            }
        };

        let Some(method) = request.method() else {
            self.respond_stateless(&request, 501, &[]).await;
            return;
        };
        let existing = match request.call_id() {
            Some(call_id) => self.calls.find_by_sip_call_id(&call_id).await,
            None => None,
        };

        match (existing, key) {
            // ACK for a 2xx belongs to the dialog
            (Some((id, handle)), None) => {
                let result = handle.lock().await.on_request(&request);
                if let Err(e) = result {
                    warn!(call_id = %id, "ACK handling failed: {}", e);
                }
                self.flush(id).await;
            }
            (None, None) => debug!("ACK outside any dialog dropped"),
            (Some((id, handle)), Some(key)) if method != SipMethod::Invite || request.to_tag().is_some() => {
                self.transactions.set_owner(&key, TransactionOwner::Call(id)).await;
                let action = handle.lock().await.on_request(&request);
                self.flush(id).await;
                match action {
                    Ok(DialogAction::Refer { target, replaces }) => {
                        self.accept_referral(id, &target, replaces).await
                    }
                    Ok(DialogAction::None) => {}
                    Err(e) => warn!(call_id = %id, "{} handling failed: {}", method, e),
                }
            }
            (Some(_), Some(_)) => {
                // Same Call-ID, no tag: a merged or looped request
                self.respond_stateless(&request, 482, &[]).await;
            }
            (None, Some(key)) => self.on_out_of_dialog(request, method, key, source, transport).await,
        }
    }

    async fn on_out_of_dialog(
        &self,
        request: SipRequest,
        method: SipMethod,
        key: TransactionKey,
        source: SocketAddr,
        transport: Arc<dyn SipTransport>,
    ) {
        let standalone = matches!(
            method,
            SipMethod::Options | SipMethod::Notify | SipMethod::Message
        );
        if request.to_tag().is_some() && !standalone {
            // Dialog we do not know (any more)
            self.respond_stateless(&request, 481, &[]).await;
            return;
        }
        match method {
            SipMethod::Invite => self.on_incoming_invite(request, key, source, transport).await,
            SipMethod::Options => {
                self.respond_stateless(
                    &request,
                    200,
                    &[("Allow", ALLOWED_METHODS), ("Accept", SDP_CONTENT_TYPE)],
                )
                .await
            }
            SipMethod::Notify => {
                self.respond_stateless(&request, 200, &[]).await;
                self.on_voicemail_notify(&request).await;
            }
            SipMethod::Message => self.respond_stateless(&request, 200, &[]).await,
            SipMethod::Bye | SipMethod::Cancel => self.respond_stateless(&request, 481, &[]).await,
            _ => {
                self.respond_stateless(&request, 405, &[("Allow", ALLOWED_METHODS)])
                    .await
            }
        }
    }

    async fn respond_stateless(&self, request: &SipRequest, code: u16, headers: &[(&str, &str)]) {
        let builder = headers
            .iter()
            .fold(ResponseBuilder::new(code).to_tag(&generate_tag()), |b, (name, value)| {
                b.other(name, value)
            });
        let result = match builder.build_for_request(request) {
            Ok(response) => self.transactions.respond(request, response).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(method = %request.method_name(), code, "Answered outside any call"),
            Err(e) => warn!("Cannot answer {}: {}", request.method_name(), e),
        }
    }

    /// Message-waiting NOTIFY: `Voice-Message: new/old`
    async fn on_voicemail_notify(&self, request: &SipRequest) {
        let Some(count) = request.body_str().and_then(voicemail_count) else {
            return;
        };
        let (user, host) = request_parties(request);
        let account_id = self.accounts.find_for_incoming(&user, &host).await;
        info!(account = %account_id, count, "Voicemail notification");
        self.notifier
            .publish(Signal::VoicemailNotification { account_id, count });
    }

    async fn on_incoming_invite(
        &self,
        request: SipRequest,
        key: TransactionKey,
        source: SocketAddr,
        transport: Arc<dyn SipTransport>,
    ) {
        let replaced = match request.header("Replaces").map(|v| ReplacesValue::parse(&v)) {
            None => None,
            Some(Some(replaces)) => match self.find_replaced(&replaces).await {
                Some(id) => Some(id),
                None => {
                    warn!(call_id = %replaces.call_id, "INVITE replaces an unknown dialog");
                    self.respond_stateless(&request, 481, &[]).await;
                    return;
                }
            },
            Some(None) => {
                self.respond_stateless(&request, 400, &[]).await;
                return;
            }
        };

        let (user, host) = request_parties(&request);
        let account_id = self.accounts.find_for_incoming(&user, &host).await;
        let Some(account) = self.accounts.get(&account_id).await else {
            self.respond_stateless(&request, 500, &[]).await;
            return;
        };
        let Some(sip_call_id) = request.call_id() else {
            self.respond_stateless(&request, 400, &[]).await;
            return;
        };

        let local = Self::local_contact(&account, transport.as_ref());
        let session = match SipSession::incoming(local.clone(), &request, account.credentials.clone()) {
            Ok(session) => session,
            Err(e) => {
                warn!(%source, "Malformed INVITE: {}", e);
                self.respond_stateless(&request, 400, &[]).await;
                return;
            }
        };

        let id = CallId::new();
        info!(call_id = %id, account = %account_id, %source, "Incoming call");
        let setup = self.call_setup(id, account, &local.host);
        let call = match SipCall::incoming(setup, Box::new(session), &request) {
            Ok(call) => call,
            Err(e) => {
                warn!(call_id = %id, "Cannot create incoming call: {}", e);
                self.respond_stateless(&request, 500, &[]).await;
                return;
            }
        };

        self.transactions.set_owner(&key, TransactionOwner::Call(id)).await;
        self.calls
            .insert(id, &sip_call_id, call, CallRoute { transport, peer: source })
            .await;
        self.flush(id).await;

        if let Some(old) = replaced {
            info!(call_id = %id, replaced = %old, "Call replaces an existing one");
            if let Err(e) = self.hangup(&old).await {
                warn!(call_id = %old, "Cannot end replaced call: {}", e);
            }
            if let Err(e) = self.answer(&id).await {
                warn!(call_id = %id, "Cannot answer replacing call: {}", e);
            }
        }
    }

    async fn find_replaced(&self, replaces: &ReplacesValue) -> Option<CallId> {
        let (id, handle) = self.calls.find_by_sip_call_id(&replaces.call_id).await?;
        let call = handle.lock().await;
        let dialog = call.dialog_id();
        let matches = !call.is_ended()
            && dialog.local_tag == replaces.to_tag
            && dialog.remote_tag.as_deref() == Some(replaces.from_tag.as_str());
        matches.then_some(id)
    }

    /// The peer of `referrer` asked us to call `target`
    async fn accept_referral(&self, referrer: CallId, target: &str, replaces: Option<ReplacesValue>) {
        let account_id = match self.calls.get(&referrer).await {
            Some(handle) => handle.lock().await.account_id().clone(),
            None => return,
        };
        match self
            .start_outgoing(&account_id, target, replaces, Some(referrer))
            .await
        {
            Ok(id) => info!(call_id = %id, referrer = %referrer, %target, "Calling transfer target"),
            Err(e) => {
                warn!(referrer = %referrer, %target, "Transfer target unreachable: {}", e);
                self.report_referral(referrer, 503).await;
                self.flush(referrer).await;
            }
        }
    }

    // ---- timers

    /// One tick of the dispatch loop: transaction timers, registration
    /// refreshes and the removal of ended calls
    pub async fn poll(&self) {
        for timeout in self.transactions.poll_timers().await {
            match timeout.owner {
                TransactionOwner::Call(id) if !timeout.server => {
                    let Some(handle) = self.calls.get(&id).await else {
                        continue;
                    };
                    let result = handle.lock().await.on_transaction_timeout(&timeout.request);
                    if let Err(e) = result {
                        warn!(call_id = %id, "{}", e);
                    }
                    self.flush(id).await;
                }
                TransactionOwner::Call(id) => {
                    debug!(call_id = %id, "No ACK for final response");
                }
                TransactionOwner::Registration(account_id) => {
                    let result = {
                        let mut registrations = self.registrations.lock().await;
                        match registrations.get_mut(&account_id) {
                            Some(slot) => slot.registration.on_timeout(),
                            None => continue,
                        }
                    };
                    self.finish_registration(&account_id, result).await;
                }
                TransactionOwner::Stateless => {}
            }
        }
        self.refresh_registrations().await;
        self.sweep_lingering().await;
    }

    // ---- registration

    /// Send a REGISTER for `account_id`; the outcome arrives as a signal
    pub async fn register(&self, account_id: &AccountId) -> LinkResult<()> {
        self.send_register(account_id, false).await
    }

    /// REGISTER with Expires 0
    pub async fn unregister(&self, account_id: &AccountId) -> LinkResult<()> {
        self.send_register(account_id, true).await
    }

    async fn send_register(&self, account_id: &AccountId, unregister: bool) -> LinkResult<()> {
        let account = self
            .accounts
            .get(account_id)
            .await
            .ok_or_else(|| LinkError::AccountNotFound(account_id.clone()))?;
        if account.is_ip2ip() {
            return Ok(());
        }

        let route = match self.registrar_route(&account).await {
            Ok(route) => route,
            Err(e) => {
                warn!(account = %account_id, "No route to registrar: {}", e);
                self.finish_registration(
                    account_id,
                    RegistrationResult {
                        state: RegistrationState::Error(RegistrationError::Network),
                        status: None,
                        refresh_in: None,
                    },
                )
                .await;
                return Err(e.into());
            }
        };
        if let Some(e) = route.transport.stun_failure() {
            warn!(account = %account_id, "STUN failed: {}", e);
            self.finish_registration(
                account_id,
                RegistrationResult {
                    state: RegistrationState::Error(RegistrationError::ExistStun),
                    status: None,
                    refresh_in: None,
                },
            )
            .await;
            return Ok(());
        }

        let request = {
            let mut registrations = self.registrations.lock().await;
            let public = route.transport.public_addr();
            let slot = registrations
                .entry(account_id.clone())
                .or_insert_with(|| RegistrationSlot {
                    registration: Registration::new(
                        &account,
                        route.transport.protocol(),
                        &public.ip().to_string(),
                        public.port(),
                    ),
                    route: route.clone(),
                    refresh_at: None,
                });
            slot.route = route;
            slot.refresh_at = None;
            if unregister {
                slot.registration.unregister(&account)?
            } else {
                slot.registration.register(&account)?
            }
        };

        self.set_registration_state(account_id, RegistrationState::Trying, None)
            .await;
        self.send_registration_request(account_id, request).await;
        Ok(())
    }

    async fn registrar_route(&self, account: &Account) -> Result<CallRoute, SipError> {
        let peer = resolve_target(&account.hostname, account.transport.default_port()).await?;
        let transport = self.account_transport(account).await?;
        Ok(CallRoute { transport, peer })
    }

    async fn send_registration_request(&self, account_id: &AccountId, request: SipRequest) {
        let route = match self.registrations.lock().await.get(account_id) {
            Some(slot) => slot.route.clone(),
            None => return,
        };
        let sent = self
            .transactions
            .send_request(
                request,
                route.peer,
                route.transport,
                TransactionOwner::Registration(account_id.clone()),
            )
            .await;
        if let Err(e) = sent {
            warn!(account = %account_id, "Cannot send REGISTER: {}", e);
            let result = match self.registrations.lock().await.get(account_id) {
                Some(slot) => slot.registration.on_transport_failure(),
                None => return,
            };
            self.finish_registration(account_id, result).await;
        }
    }

    async fn on_registration_response(&self, account_id: &AccountId, response: &SipResponse) {
        if let Some((received, rport)) = via_received(response) {
            let learned = self
                .accounts
                .update(account_id, |account| account.set_received(Some(received), rport))
                .await;
            if let Err(e) = learned {
                debug!(account = %account_id, "{}", e);
            }
        }
        let Some(account) = self.accounts.get(account_id).await else {
            return;
        };

        let step = {
            let mut registrations = self.registrations.lock().await;
            let Some(slot) = registrations.get_mut(account_id) else {
                return;
            };
            slot.registration.on_response(&account, response)
        };
        match step {
            Ok(RegistrationStep::Pending) => {}
            Ok(RegistrationStep::Retry(request)) => {
                self.send_registration_request(account_id, request).await
            }
            Ok(RegistrationStep::Finished(result)) => {
                self.finish_registration(account_id, result).await
            }
            Err(e) => {
                warn!(account = %account_id, "Unusable registrar response: {}", e);
                self.finish_registration(
                    account_id,
                    RegistrationResult {
                        state: RegistrationState::Error(RegistrationError::Generic),
                        status: Some((response.status_code(), response.reason())),
                        refresh_in: None,
                    },
                )
                .await;
            }
        }
    }

    async fn finish_registration(&self, account_id: &AccountId, result: RegistrationResult) {
        let keep_alive = self
            .accounts
            .get(account_id)
            .await
            .map_or(false, |a| a.needs_keep_alive());
        if let Some(slot) = self.registrations.lock().await.get_mut(account_id) {
            slot.refresh_at = match result.refresh_in {
                Some(after) if keep_alive => Some(Instant::now() + after),
                _ => None,
            };
        }
        self.set_registration_state(account_id, result.state, result.status)
            .await;
    }

    async fn set_registration_state(
        &self,
        account_id: &AccountId,
        state: RegistrationState,
        status: Option<(u16, String)>,
    ) {
        let code = status.as_ref().map(|(code, _)| *code);
        let updated = self
            .accounts
            .update(account_id, |account| account.set_registration_state(state, status))
            .await;
        if updated.is_err() {
            return;
        }
        info!(account = %account_id, %state, "Registration state changed");
        self.notifier.publish(Signal::RegistrationStateChanged {
            account_id: account_id.clone(),
            state,
            code,
        });
    }

    /// Re-register every account whose binding is about to expire
    async fn refresh_registrations(&self) {
        let now = Instant::now();
        let due: Vec<AccountId> = {
            let mut registrations = self.registrations.lock().await;
            registrations
                .iter_mut()
                .filter(|(_, slot)| slot.refresh_at.map_or(false, |at| at <= now))
                .map(|(id, slot)| {
                    slot.refresh_at = None;
                    id.clone()
                })
                .collect()
        };
        for account_id in due {
            let Some(account) = self.accounts.get(&account_id).await else {
                continue;
            };
            let request = {
                let mut registrations = self.registrations.lock().await;
                match registrations.get_mut(&account_id) {
                    Some(slot) => slot.registration.refresh(&account),
                    None => continue,
                }
            };
            match request {
                Ok(request) => {
                    debug!(account = %account_id, "Refreshing registration");
                    self.send_registration_request(&account_id, request).await
                }
                Err(e) => warn!(account = %account_id, "Cannot refresh registration: {}", e),
            }
        }
    }

    /// Accounts that currently hold a registration slot
    pub async fn registered_accounts(&self) -> Vec<AccountId> {
        self.registrations.lock().await.keys().cloned().collect()
    }

    /// Transactions still running; shutdown waits for this to reach zero
    pub async fn pending_transactions(&self) -> usize {
        self.transactions.transaction_count().await
    }

    pub async fn clear_transactions(&self) -> usize {
        self.transactions.clear().await
    }
}

/// User of the Request-URI (or To) and host of the From header
fn request_parties(request: &SipRequest) -> (String, String) {
    let to_user = SipUri::parse(&request.uri().to_string())
        .ok()
        .and_then(|uri| uri.user().map(str::to_string))
        .or_else(|| {
            request
                .to_header()
                .and_then(|to| SipUri::parse(&to).ok())
                .and_then(|uri| uri.user().map(str::to_string))
        })
        .unwrap_or_default();
    let from_host = request
        .from_header()
        .and_then(|from| SipUri::parse(&from).ok())
        .map(|uri| uri.host().to_string())
        .unwrap_or_default();
    (to_user, from_host)
}

/// New-message count of a message-summary body
fn voicemail_count(body: &str) -> Option<u32> {
    body.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("Voice-Message") {
            return None;
        }
        value.trim().split('/').next()?.trim().parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::RecordingMediaFactory;
    use crate::infrastructure::protocols::sip::transport::TransportProtocol;
    use crate::infrastructure::protocols::stun::client::MockStunResolver;
    use crate::infrastructure::tls::TlsConfig;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{broadcast, mpsc};

    #[derive(Default)]
    struct CapturingTransport {
        sent: StdMutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl CapturingTransport {
        fn responses(&self) -> Vec<SipResponse> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(bytes, _)| SipResponse::parse(bytes).ok())
                .collect()
        }
    }

    #[async_trait]
    impl SipTransport for CapturingTransport {
        async fn send(&self, data: &[u8], destination: SocketAddr) -> Result<(), SipError> {
            self.sent.lock().unwrap().push((data.to_vec(), destination));
            Ok(())
        }

        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:5060".parse().unwrap()
        }

        fn public_addr(&self) -> SocketAddr {
            self.local_addr()
        }

        fn protocol(&self) -> TransportProtocol {
            TransportProtocol::Udp
        }
    }

    fn engine() -> (SipEngine, broadcast::Receiver<Signal>) {
        let (tx, _rx) = mpsc::channel(16);
        let transports = TransportManager::new(tx, Arc::new(MockStunResolver::new()), TlsConfig::default());
        let notifier = Notifier::new();
        let signals = notifier.subscribe();
        let engine = SipEngine::new(
            EngineSettings::default(),
            Arc::new(AccountTable::new(5060)),
            transports,
            notifier,
            Arc::new(RecordingMediaFactory::new()),
        );
        (engine, signals)
    }

    fn request(method: &str, extra: &str, body: &str) -> SipRequest {
        let text = format!(
            "{method} sip:bob@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5070;branch=z9hG4bK{branch:x}\r\n\
From: <sip:alice@127.0.0.1:5070>;tag=atag\r\n\
To: <sip:bob@127.0.0.1>\r\n\
Call-ID: engine-{branch:x}\r\n\
CSeq: 1 {method}\r\n\
Contact: <sip:alice@127.0.0.1:5070>\r\n\
{extra}Content-Length: {len}\r\n\r\n{body}",
            method = method,
            branch = rand::random::<u32>(),
            extra = extra,
            len = body.len(),
            body = body,
        );
        SipRequest::parse(text.as_bytes()).unwrap()
    }

    async fn deliver(engine: &SipEngine, transport: &Arc<CapturingTransport>, request: SipRequest) {
        engine
            .handle_inbound(InboundMessage {
                message: SipMessage::Request(request),
                source: "127.0.0.1:5070".parse().unwrap(),
                transport: transport.clone(),
            })
            .await;
    }

    fn codes(transport: &CapturingTransport) -> Vec<u16> {
        transport.responses().iter().map(|r| r.status_code()).collect()
    }

    #[tokio::test]
    async fn test_options_answered_with_capabilities() {
        let (engine, _) = engine();
        let transport = Arc::new(CapturingTransport::default());
        deliver(&engine, &transport, request("OPTIONS", "", "")).await;

        let responses = transport.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status_code(), 200);
        assert!(responses[0].header("Allow").unwrap().contains("INVITE"));
        assert_eq!(responses[0].header("Accept").as_deref(), Some(SDP_CONTENT_TYPE));
        assert!(engine.calls().is_empty().await);
    }

    #[tokio::test]
    async fn test_requests_without_dialog() {
        let (engine, _) = engine();
        let transport = Arc::new(CapturingTransport::default());
        deliver(&engine, &transport, request("BYE", "", "")).await;
        deliver(&engine, &transport, request("CANCEL", "", "")).await;
        deliver(&engine, &transport, request("MESSAGE", "Content-Type: text/plain\r\n", "hi")).await;
        deliver(&engine, &transport, request("SUBSCRIBE", "Event: presence\r\n", "")).await;

        assert_eq!(codes(&transport), vec![481, 481, 200, 405]);
    }

    #[tokio::test]
    async fn test_voicemail_notify() {
        let (engine, mut signals) = engine();
        let transport = Arc::new(CapturingTransport::default());
        let body = "Messages-Waiting: yes\r\nVoice-Message: 3/7 (0/0)\r\n";
        deliver(
            &engine,
            &transport,
            request(
                "NOTIFY",
                "Event: message-summary\r\nContent-Type: application/simple-message-summary\r\n",
                body,
            ),
        )
        .await;

        assert_eq!(codes(&transport), vec![200]);
        assert_eq!(
            signals.try_recv().unwrap(),
            Signal::VoicemailNotification {
                account_id: AccountId::ip2ip(),
                count: 3
            }
        );
    }

    #[tokio::test]
    async fn test_incoming_invite_rings() {
        let (engine, mut signals) = engine();
        let transport = Arc::new(CapturingTransport::default());
        let sdp = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n\
m=audio 40000 RTP/AVP 0 101\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:101 telephone-event/8000\r\n";
        deliver(
            &engine,
            &transport,
            request("INVITE", "Content-Type: application/sdp\r\n", sdp),
        )
        .await;

        assert_eq!(codes(&transport), vec![180]);
        assert_eq!(engine.calls().len().await, 1);
        assert!(matches!(signals.try_recv().unwrap(), Signal::IncomingCall { .. }));
    }

    #[tokio::test]
    async fn test_invite_replacing_unknown_dialog() {
        let (engine, _) = engine();
        let transport = Arc::new(CapturingTransport::default());
        deliver(
            &engine,
            &transport,
            request("INVITE", "Replaces: nope@host;to-tag=a;from-tag=b\r\n", ""),
        )
        .await;

        assert_eq!(codes(&transport), vec![481]);
        assert!(engine.calls().is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_call_operations() {
        let (engine, _) = engine();
        let id = CallId::new();
        assert!(matches!(engine.hangup(&id).await, Err(LinkError::CallNotFound(_))));
        assert!(matches!(
            engine.place_call(&AccountId::new("nobody"), "bob").await,
            Err(LinkError::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_voicemail_count() {
        assert_eq!(voicemail_count("Voice-Message: 2/8\r\n"), Some(2));
        assert_eq!(voicemail_count("Messages-Waiting: no\r\n"), None);
    }
}
