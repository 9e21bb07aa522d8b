//! Client-side registration of one account with its registrar

use super::auth::DigestChallenge;
use super::builder::{generate_call_id, generate_tag, RequestBuilder};
use super::message::{header_param, HeaderAccess, SipError, SipMethod, SipRequest, SipResponse};
use super::transaction::generate_branch;
use super::transport::TransportProtocol;
use crate::domain::account::{Account, RegistrationError, RegistrationState};
use crate::domain::shared::value_objects::AccountId;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Refresh this long before the binding expires, at most
const REFRESH_MARGIN: u32 = 30;

/// Final outcome of one registration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    pub state: RegistrationState,
    pub status: Option<(u16, String)>,
    /// When to send the next REGISTER, for a live binding
    pub refresh_in: Option<Duration>,
}

impl RegistrationResult {
    fn error(kind: RegistrationError, status: Option<(u16, String)>) -> Self {
        Self {
            state: RegistrationState::Error(kind),
            status,
            refresh_in: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RegistrationStep {
    /// Provisional response, keep waiting
    Pending,
    /// Send this REGISTER instead
    Retry(SipRequest),
    Finished(RegistrationResult),
}

/// REGISTER dialog state of one account
pub struct Registration {
    account_id: AccountId,
    call_id: String,
    from_tag: String,
    cseq: u32,
    transport: TransportProtocol,
    local_host: String,
    local_port: u16,
    user_agent: String,
    expires: u32,
    unregistering: bool,
    last_nonce: Option<String>,
    nonce_count: u32,
    interval_retried: bool,
    address_retried: bool,
}

impl Registration {
    pub fn new(
        account: &Account,
        transport: TransportProtocol,
        local_host: &str,
        local_port: u16,
    ) -> Self {
        Self {
            account_id: account.id.clone(),
            call_id: generate_call_id(local_host),
            from_tag: generate_tag(),
            cseq: 0,
            transport,
            local_host: local_host.to_string(),
            local_port,
            user_agent: account.user_agent.clone(),
            expires: account.registration_expire(),
            unregistering: false,
            last_nonce: None,
            nonce_count: 0,
            interval_retried: false,
            address_retried: false,
        }
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Expiry the next REGISTER asks for
    pub fn expires(&self) -> u32 {
        self.expires
    }

    pub fn is_unregistering(&self) -> bool {
        self.unregistering
    }

    /// Fresh REGISTER for the account's configured expiry
    pub fn register(&mut self, account: &Account) -> Result<SipRequest, SipError> {
        self.reset();
        self.unregistering = false;
        if !self.interval_retried {
            self.expires = account.registration_expire();
        }
        self.build(account, None)
    }

    /// Refresh keeps an expiry the registrar already forced up
    pub fn refresh(&mut self, account: &Account) -> Result<SipRequest, SipError> {
        self.last_nonce = None;
        self.unregistering = false;
        self.build(account, None)
    }

    /// REGISTER with Expires 0
    pub fn unregister(&mut self, account: &Account) -> Result<SipRequest, SipError> {
        self.reset();
        self.unregistering = true;
        self.build(account, None)
    }

    fn reset(&mut self) {
        self.last_nonce = None;
        self.interval_retried = false;
        self.address_retried = false;
    }

    fn build(
        &mut self,
        account: &Account,
        authorization: Option<(&str, String)>,
    ) -> Result<SipRequest, SipError> {
        self.cseq += 1;
        let (address, port) = account.contact_address(&self.local_host, self.local_port);
        let contact = account.contact(&address, port);
        let from = account.from_uri(&self.local_host);
        let expires = if self.unregistering { 0 } else { self.expires };

        let mut builder = RequestBuilder::new(SipMethod::Register, &account.server_uri())
            .via(self.transport.as_str(), &address, port, &generate_branch())
            .from(&format!("{};tag={}", from, self.from_tag))
            .to(&from)
            .call_id(&self.call_id)
            .cseq(self.cseq)
            .contact(&contact)
            .user_agent(&self.user_agent)
            .expires(expires);
        if let Some(route) = &account.service_route {
            builder = builder.routes(&[route.clone()]);
        }
        if let Some((name, value)) = authorization {
            builder = builder.other(name, &value);
        }
        debug!(account = %self.account_id, cseq = self.cseq, expires, "REGISTER built");
        builder.build()
    }

    /// Classify a response to our last REGISTER
    pub fn on_response(
        &mut self,
        account: &Account,
        response: &SipResponse,
    ) -> Result<RegistrationStep, SipError> {
        let code = response.status_code();
        let status = Some((code, response.reason()));

        let result = match code {
            100..=199 => return Ok(RegistrationStep::Pending),
            200..=299 => {
                if self.unregistering {
                    info!(account = %self.account_id, "Unregistered");
                    RegistrationResult {
                        state: RegistrationState::Unregistered,
                        status,
                        refresh_in: None,
                    }
                } else {
                    let granted = granted_expiry(response).unwrap_or(self.expires);
                    info!(account = %self.account_id, expires = granted, "Registered");
                    RegistrationResult {
                        state: RegistrationState::Registered,
                        status,
                        refresh_in: Some(refresh_interval(granted)),
                    }
                }
            }
            401 | 407 => {
                if let Some(retry) = self.authorize(account, response)? {
                    return Ok(RegistrationStep::Retry(retry));
                }
                RegistrationResult::error(RegistrationError::Auth, status)
            }
            423 if !self.interval_retried => {
                self.interval_retried = true;
                let min = response
                    .header("Min-Expires")
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .unwrap_or(0);
                self.expires = self.expires.saturating_mul(2).max(min);
                warn!(
                    account = %self.account_id,
                    expires = self.expires,
                    "Registration interval too brief, retrying"
                );
                return Ok(RegistrationStep::Retry(self.build(account, None)?));
            }
            606 if !self.address_retried => {
                // Caller recorded the Via received address on the account
                self.address_retried = true;
                warn!(account = %self.account_id, "REGISTER not acceptable, retrying with learned address");
                return Ok(RegistrationStep::Retry(self.build(account, None)?));
            }
            606 => RegistrationResult::error(RegistrationError::NotAcceptable, status),
            403 | 404 => RegistrationResult::error(RegistrationError::Auth, status),
            408 | 503 => RegistrationResult::error(RegistrationError::Host, status),
            _ => RegistrationResult::error(RegistrationError::Generic, status),
        };

        if result.state.is_error() {
            warn!(account = %self.account_id, code, "Registration failed");
        }
        Ok(RegistrationStep::Finished(result))
    }

    fn authorize(
        &mut self,
        account: &Account,
        response: &SipResponse,
    ) -> Result<Option<SipRequest>, SipError> {
        let challenge = DigestChallenge::from_response(response)?;
        if self.last_nonce.as_deref() == Some(challenge.nonce.as_str()) {
            warn!(account = %self.account_id, realm = %challenge.realm, "Credentials rejected");
            return Ok(None);
        }
        let Some(credentials) = account.credentials_for(&challenge.realm).cloned() else {
            warn!(account = %self.account_id, realm = %challenge.realm, "No credentials for realm");
            return Ok(None);
        };
        self.nonce_count += 1;
        self.last_nonce = Some(challenge.nonce.clone());
        let uri = super::message::name_addr_uri(&account.server_uri());
        let answer = challenge.authorize(&credentials, "REGISTER", &uri, self.nonce_count);
        Ok(Some(self.build(account, Some((challenge.answer_header(), answer)))?))
    }

    /// No final response arrived in time
    pub fn on_timeout(&self) -> RegistrationResult {
        warn!(account = %self.account_id, "REGISTER timed out");
        RegistrationResult::error(RegistrationError::Host, Some((408, "Request Timeout".to_string())))
    }

    /// The REGISTER could not be sent
    pub fn on_transport_failure(&self) -> RegistrationResult {
        warn!(account = %self.account_id, "REGISTER could not be sent");
        RegistrationResult::error(RegistrationError::Network, None)
    }
}

/// `received` and `rport` the registrar saw us from
pub fn via_received(response: &SipResponse) -> Option<(String, Option<u16>)> {
    let via = response.top_via()?;
    let received = header_param(&via, "received")?;
    let rport = header_param(&via, "rport").and_then(|p| p.parse().ok());
    Some((received, rport))
}

/// Expiry the registrar granted: Contact `expires=` first, then Expires
fn granted_expiry(response: &SipResponse) -> Option<u32> {
    response
        .header("Contact")
        .and_then(|c| header_param(&c, "expires"))
        .or_else(|| response.header("Expires"))
        .and_then(|v| v.trim().parse().ok())
}

fn refresh_interval(expires: u32) -> Duration {
    let margin = REFRESH_MARGIN.min(expires / 2);
    Duration::from_secs(u64::from(expires.saturating_sub(margin).max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Credentials;
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;

    fn account() -> Account {
        let mut account = Account::new(AccountId::new("acc1"), "alice", "example.com");
        account.credentials.push(Credentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
            realm: "*".to_string(),
        });
        account
    }

    fn registration(account: &Account) -> Registration {
        Registration::new(account, TransportProtocol::Udp, "10.0.0.1", 5060)
    }

    fn reply(request: &SipRequest, code: u16, extra: &[(&str, &str)]) -> SipResponse {
        let mut builder = ResponseBuilder::new(code).to_tag("reg");
        for (name, value) in extra {
            builder = builder.other(name, value);
        }
        builder.build_for_request(request).unwrap()
    }

    fn finished(step: RegistrationStep) -> RegistrationResult {
        match step {
            RegistrationStep::Finished(result) => result,
            other => panic!("expected final result, got {:?}", other),
        }
    }

    fn retry(step: RegistrationStep) -> SipRequest {
        match step {
            RegistrationStep::Retry(request) => request,
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_register_request_shape() {
        let account = account();
        let mut reg = registration(&account);
        let first = reg.register(&account).unwrap();
        let second = reg.register(&account).unwrap();

        assert_eq!(first.method(), Some(SipMethod::Register));
        assert_eq!(first.uri().to_string(), "sip:example.com");
        assert_eq!(first.header("Expires").as_deref(), Some("3600"));
        assert_eq!(first.contact_uri().as_deref(), Some("sip:alice@10.0.0.1:5060"));
        assert_eq!(first.call_id(), second.call_id());
        assert_eq!(second.cseq().unwrap().seq, first.cseq().unwrap().seq + 1);

        let bye = reg.unregister(&account).unwrap();
        assert_eq!(bye.header("Expires").as_deref(), Some("0"));
    }

    #[test]
    fn test_success_and_unregister() {
        let account = account();
        let mut reg = registration(&account);
        let request = reg.register(&account).unwrap();
        let result = finished(
            reg.on_response(&account, &reply(&request, 200, &[("Expires", "600")]))
                .unwrap(),
        );
        assert_eq!(result.state, RegistrationState::Registered);
        assert_eq!(result.refresh_in, Some(Duration::from_secs(570)));

        let request = reg.unregister(&account).unwrap();
        let result = finished(reg.on_response(&account, &reply(&request, 200, &[])).unwrap());
        assert_eq!(result.state, RegistrationState::Unregistered);
        assert_eq!(result.refresh_in, None);
    }

    #[test]
    fn test_interval_too_brief_doubles_expiry_once() {
        let mut account = account();
        account.registration_expire = 60;
        let mut reg = registration(&account);
        let request = reg.register(&account).unwrap();
        assert_eq!(request.header("Expires").as_deref(), Some("60"));

        let retried = retry(reg.on_response(&account, &reply(&request, 423, &[])).unwrap());
        assert_eq!(retried.header("Expires").as_deref(), Some("120"));

        let result = finished(reg.on_response(&account, &reply(&retried, 423, &[])).unwrap());
        assert_eq!(result.state, RegistrationState::Error(RegistrationError::Generic));
    }

    #[test]
    fn test_interval_doubling_saturates() {
        let mut account = account();
        account.registration_expire = u32::MAX - 1;
        let mut reg = registration(&account);
        let request = reg.register(&account).unwrap();

        let retried = retry(reg.on_response(&account, &reply(&request, 423, &[])).unwrap());
        assert_eq!(retried.header("Expires"), Some(u32::MAX.to_string()));
    }

    #[test]
    fn test_challenge_answered_once() {
        let account = account();
        let mut reg = registration(&account);
        let request = reg.register(&account).unwrap();
        let challenge = [("WWW-Authenticate", r#"Digest realm="example.com", nonce="n1", qop="auth""#)];

        let retried = retry(reg.on_response(&account, &reply(&request, 401, &challenge)).unwrap());
        let authorization = retried.header("Authorization").unwrap();
        assert!(authorization.contains("username=\"alice\""));
        assert!(authorization.contains("uri=\"sip:example.com\""));

        let result = finished(reg.on_response(&account, &reply(&retried, 401, &challenge)).unwrap());
        assert_eq!(result.state, RegistrationState::Error(RegistrationError::Auth));
    }

    #[test]
    fn test_status_mapping() {
        let account = account();
        let cases = [
            (302, RegistrationError::Generic),
            (403, RegistrationError::Auth),
            (404, RegistrationError::Auth),
            (408, RegistrationError::Host),
            (503, RegistrationError::Host),
            (500, RegistrationError::Generic),
        ];
        for (code, expected) in cases {
            let mut reg = registration(&account);
            let request = reg.register(&account).unwrap();
            let result = finished(reg.on_response(&account, &reply(&request, code, &[])).unwrap());
            assert_eq!(result.state, RegistrationState::Error(expected), "status {}", code);
            assert_eq!(result.status.unwrap().0, code);
        }
        let reg = registration(&account);
        assert_eq!(reg.on_timeout().state, RegistrationState::Error(RegistrationError::Host));
        assert_eq!(
            reg.on_transport_failure().state,
            RegistrationState::Error(RegistrationError::Network)
        );
    }

    #[test]
    fn test_not_acceptable_retries_with_learned_address() {
        let mut account = account();
        let mut reg = registration(&account);
        let request = reg.register(&account).unwrap();
        let response = SipResponse::parse(
            format!(
                "SIP/2.0 606 Not Acceptable\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch={};received=203.0.113.7;rport=40000\r\n\
From: {}\r\n\
To: {};tag=reg\r\n\
Call-ID: {}\r\n\
CSeq: {} REGISTER\r\n\
Content-Length: 0\r\n\r\n",
                request.via_branch().unwrap(),
                request.from_header().unwrap(),
                request.to_header().unwrap(),
                request.call_id().unwrap(),
                request.cseq().unwrap().seq,
            )
            .as_bytes(),
        )
        .unwrap();

        let (received, rport) = via_received(&response).unwrap();
        assert_eq!(received, "203.0.113.7");
        assert_eq!(rport, Some(40000));
        account.set_received(Some(received), rport);

        let retried = retry(reg.on_response(&account, &response).unwrap());
        assert_eq!(retried.contact_uri().as_deref(), Some("sip:alice@203.0.113.7:40000"));

        let result = finished(reg.on_response(&account, &response).unwrap());
        assert_eq!(
            result.state,
            RegistrationState::Error(RegistrationError::NotAcceptable)
        );
    }
}
