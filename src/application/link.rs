//! The VoIP link: the application-facing handle on the SIP engine
//!
//! Owns the dispatch task that feeds received messages and timer ticks to
//! the engine. Every call and registration operation the upper layer needs
//! goes through here; outcomes arrive as [`Signal`]s on [`subscribe`].
//!
//! [`subscribe`]: SipVoipLink::subscribe

use crate::application::error::{LinkError, LinkResult};
use crate::application::notifier::{Notifier, Signal};
use crate::config::Config;
use crate::domain::account::{Account, AccountTable};
use crate::domain::call::Call;
use crate::domain::shared::value_objects::{AccountId, CallId};
use crate::infrastructure::media::{MediaFactory, ZrtpEvent};
use crate::infrastructure::protocols::sip::{InboundMessage, SipEngine, TransportManager};
use crate::infrastructure::protocols::stun::StunClient;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

type Dispatcher = JoinHandle<mpsc::Receiver<InboundMessage>>;

pub struct SipVoipLink {
    engine: Arc<SipEngine>,
    poll_interval: Duration,
    shutdown_grace: Duration,
    running: Arc<AtomicBool>,
    /// Parked here while the link is stopped
    inbound: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl SipVoipLink {
    pub async fn new(config: &Config, media: Arc<dyn MediaFactory>) -> LinkResult<Self> {
        let (tx, rx) = mpsc::channel(1000);
        let stun = Arc::new(StunClient::new(&config.sip.user_agent));
        let transports = TransportManager::new(tx, stun, config.tls.clone());

        let accounts = Arc::new(AccountTable::new(config.sip.port));
        accounts
            .update(&AccountId::ip2ip(), |ip2ip| {
                ip2ip.local_interface = config.sip.interface.clone();
                ip2ip.user_agent = config.sip.user_agent.clone();
            })
            .await?;
        for account in config.accounts() {
            info!(account = %account.id, host = %account.hostname, "Account loaded");
            accounts.insert(account).await?;
        }

        let engine = SipEngine::new(
            config.engine_settings()?,
            accounts,
            transports,
            Notifier::new(),
            media,
        );
        Ok(Self {
            engine: Arc::new(engine),
            poll_interval: config.sip.poll_interval(),
            shutdown_grace: config.sip.shutdown_grace(),
            running: Arc::new(AtomicBool::new(false)),
            inbound: Mutex::new(Some(rx)),
            dispatcher: Mutex::new(None),
        })
    }

    /// Bind the IP2IP transport and start dispatching
    pub async fn start(&self) -> LinkResult<()> {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return Err(LinkError::AlreadyRunning);
        }
        let rx = self.inbound.lock().await.take().ok_or(LinkError::AlreadyRunning)?;

        let ip2ip = self.engine.accounts().require(&AccountId::ip2ip()).await?;
        if let Err(e) = self.engine.account_transport(&ip2ip).await {
            *self.inbound.lock().await = Some(rx);
            return Err(e.into());
        }

        self.running.store(true, Ordering::SeqCst);
        *dispatcher = Some(tokio::spawn(dispatch_loop(
            self.engine.clone(),
            rx,
            self.running.clone(),
            self.poll_interval,
        )));
        info!(
            interface = %ip2ip.local_interface,
            port = ip2ip.local_port,
            "VoIP link started"
        );
        Ok(())
    }

    /// Signalling address of the IP2IP account
    pub async fn local_addr(&self) -> LinkResult<SocketAddr> {
        let ip2ip = self.engine.accounts().require(&AccountId::ip2ip()).await?;
        Ok(self.engine.account_transport(&ip2ip).await?.local_addr())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Two-phase shutdown: end calls and registrations while the dispatcher
    /// still runs, wait for their transactions up to the grace period, then
    /// stop the dispatcher and release the transports.
    pub async fn shutdown(&self) -> LinkResult<()> {
        let Some(dispatcher) = self.dispatcher.lock().await.take() else {
            return Err(LinkError::NotRunning);
        };
        info!("VoIP link shutting down");

        self.engine.hangup_all().await;
        for account_id in self.engine.registered_accounts().await {
            if let Err(e) = self.engine.unregister(&account_id).await {
                debug!(account = %account_id, "Unregister on shutdown failed: {}", e);
            }
        }

        let deadline = Instant::now() + self.shutdown_grace;
        while self.engine.pending_transactions().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
        }

        self.running.store(false, Ordering::SeqCst);
        match dispatcher.await {
            Ok(rx) => *self.inbound.lock().await = Some(rx),
            Err(e) => error!("Dispatch task failed: {}", e),
        }

        let abandoned = self.engine.clear_transactions().await;
        if abandoned > 0 {
            warn!(abandoned, "Transactions still pending at shutdown");
        }
        self.engine.purge_ended().await;
        self.engine.transports().shutdown().await;
        info!("VoIP link stopped");
        Ok(())
    }

    fn ensure_running(&self) -> LinkResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(LinkError::NotRunning)
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.engine.notifier().subscribe()
    }

    // ---- accounts

    pub async fn add_account(&self, account: Account) -> LinkResult<()> {
        Ok(self.engine.accounts().insert(account).await?)
    }

    /// Change a stored account in place
    pub async fn update_account<T>(&self, id: &AccountId, f: impl FnOnce(&mut Account) -> T) -> LinkResult<T> {
        Ok(self.engine.accounts().update(id, f).await?)
    }

    pub async fn account(&self, id: &AccountId) -> Option<Account> {
        self.engine.accounts().get(id).await
    }

    pub async fn account_ids(&self) -> Vec<AccountId> {
        self.engine.accounts().ids().await
    }

    pub async fn register(&self, id: &AccountId) -> LinkResult<()> {
        self.ensure_running()?;
        self.engine.register(id).await
    }

    pub async fn unregister(&self, id: &AccountId) -> LinkResult<()> {
        self.ensure_running()?;
        self.engine.unregister(id).await
    }

    /// Register every enabled account
    pub async fn register_all(&self) {
        for id in self.account_ids().await {
            match self.account(&id).await {
                Some(account) if account.enabled && !account.is_ip2ip() => {
                    if let Err(e) = self.register(&id).await {
                        warn!(account = %id, "Registration not sent: {}", e);
                    }
                }
                _ => {}
            }
        }
    }

    // ---- calls

    pub async fn place_call(&self, account: &AccountId, target: &str) -> LinkResult<CallId> {
        self.ensure_running()?;
        self.engine.place_call(account, target).await
    }

    pub async fn answer(&self, id: &CallId) -> LinkResult<()> {
        self.engine.answer(id).await
    }

    pub async fn refuse(&self, id: &CallId) -> LinkResult<()> {
        self.engine.refuse(id).await
    }

    pub async fn hangup(&self, id: &CallId) -> LinkResult<()> {
        self.engine.hangup(id).await
    }

    pub async fn hold(&self, id: &CallId) -> LinkResult<()> {
        self.engine.hold(id).await
    }

    pub async fn resume(&self, id: &CallId) -> LinkResult<()> {
        self.engine.resume(id).await
    }

    pub async fn transfer(&self, id: &CallId, target: &str) -> LinkResult<()> {
        self.engine.transfer(id, target).await
    }

    pub async fn attended_transfer(&self, id: &CallId, target_call: &CallId) -> LinkResult<()> {
        self.engine.attended_transfer(id, target_call).await
    }

    pub async fn send_dtmf(&self, id: &CallId, digit: char) -> LinkResult<()> {
        self.engine.send_dtmf(id, digit).await
    }

    /// Instant message to the peer of a live call
    pub async fn send_text_message(&self, id: &CallId, text: &str) -> LinkResult<()> {
        self.engine.send_text_message(id, text).await
    }

    pub async fn request_keyframe(&self, id: &CallId) -> LinkResult<()> {
        self.engine.request_keyframe(id).await
    }

    /// Feed a ZRTP callback from the media subsystem back into its call
    pub async fn on_zrtp_event(&self, id: &CallId, event: ZrtpEvent) -> LinkResult<()> {
        self.engine.on_zrtp_event(id, event).await
    }

    /// Snapshot of a call's state
    pub async fn call(&self, id: &CallId) -> Option<Call> {
        let handle = self.engine.calls().get(id).await?;
        let call = handle.lock().await;
        Some(call.call().clone())
    }

    /// Calls that have not ended yet
    pub async fn active_calls(&self) -> Vec<CallId> {
        let mut active = Vec::new();
        for (id, handle) in self.engine.calls().handles().await {
            if !handle.lock().await.is_ended() {
                active.push(id);
            }
        }
        active
    }
}

async fn dispatch_loop(
    engine: Arc<SipEngine>,
    mut rx: mpsc::Receiver<InboundMessage>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) -> mpsc::Receiver<InboundMessage> {
    debug!("Dispatch loop started");
    while running.load(Ordering::SeqCst) {
        match timeout(poll_interval, rx.recv()).await {
            Ok(Some(inbound)) => engine.handle_inbound(inbound).await,
            Ok(None) => {
                warn!("Inbound channel closed");
                break;
            }
            Err(_) => {}
        }
        engine.poll().await;
    }
    debug!("Dispatch loop stopped");
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::RecordingMediaFactory;
    use tokio_test::{assert_err, assert_ok};

    fn loopback_config(port: u16) -> Config {
        let mut config = Config::default();
        config.sip.interface = "127.0.0.1".to_string();
        config.sip.port = port;
        config
    }

    #[tokio::test]
    async fn test_operations_need_running_link() {
        let link = SipVoipLink::new(&loopback_config(0), Arc::new(RecordingMediaFactory::new()))
            .await
            .unwrap();
        assert!(!link.is_running());
        assert!(matches!(
            link.place_call(&AccountId::ip2ip(), "127.0.0.1:5090").await,
            Err(LinkError::NotRunning)
        ));
        assert!(matches!(link.shutdown().await, Err(LinkError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let link = SipVoipLink::new(&loopback_config(0), Arc::new(RecordingMediaFactory::new()))
            .await
            .unwrap();
        assert_ok!(link.start().await);
        assert!(link.is_running());
        assert_ne!(link.local_addr().await.unwrap().port(), 0);
        assert_err!(link.start().await);

        assert_ok!(link.shutdown().await);
        assert!(!link.is_running());

        // Restartable once stopped
        assert_ok!(link.start().await);
        assert_ok!(link.shutdown().await);
    }

    #[tokio::test]
    async fn test_accounts_from_config() {
        let mut config = loopback_config(0);
        config.accounts.push(crate::config::AccountConfig {
            id: "work".to_string(),
            username: "alice".to_string(),
            hostname: "sip.example.com".to_string(),
            ..Default::default()
        });
        let link = SipVoipLink::new(&config, Arc::new(RecordingMediaFactory::new()))
            .await
            .unwrap();

        let mut ids = link.account_ids().await;
        ids.sort();
        assert_eq!(ids, vec![AccountId::ip2ip(), AccountId::new("work")]);
        let ip2ip = link.account(&AccountId::ip2ip()).await.unwrap();
        assert_eq!(ip2ip.local_interface, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_unknown_call() {
        let link = SipVoipLink::new(&loopback_config(0), Arc::new(RecordingMediaFactory::new()))
            .await
            .unwrap();
        let id = CallId::new();
        assert!(link.call(&id).await.is_none());
        assert!(matches!(link.answer(&id).await, Err(LinkError::CallNotFound(_))));
    }
}
