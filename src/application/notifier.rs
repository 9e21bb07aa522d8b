//! One-way notifications to the upper application layer

use crate::domain::account::RegistrationState;
use crate::domain::call::CallStatus;
use crate::domain::shared::value_objects::{AccountId, CallId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Signals fired as side effects of call and registration transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Signal {
    IncomingCall {
        account_id: AccountId,
        call_id: CallId,
        from: String,
    },
    CallStateChanged {
        call_id: CallId,
        state: CallStatus,
        sip_status: Option<(u16, String)>,
    },
    RegistrationStateChanged {
        account_id: AccountId,
        state: RegistrationState,
        code: Option<u16>,
    },
    TransferSucceeded {
        call_id: CallId,
    },
    TransferFailed {
        call_id: CallId,
    },
    SecureSdesOn {
        call_id: CallId,
    },
    SecureSdesOff {
        call_id: CallId,
    },
    SecureZrtpOn {
        call_id: CallId,
        cipher: String,
    },
    SecureZrtpOff {
        call_id: CallId,
    },
    ShowSas {
        call_id: CallId,
        sas: String,
        verified: bool,
    },
    ZrtpNotSupported {
        call_id: CallId,
    },
    ZrtpNegotiationFailed {
        call_id: CallId,
        reason: String,
    },
    VoicemailNotification {
        account_id: AccountId,
        count: u32,
    },
    IncomingDtmf {
        call_id: CallId,
        digit: char,
    },
    IncomingMessage {
        call_id: CallId,
        from: String,
        text: String,
    },
}

/// Fan-out of signals. Publishing never waits for, or fails on, listeners.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Signal>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self { tx }
    }

    pub fn publish(&self, signal: Signal) {
        trace!(?signal, "Publishing signal");
        // No receivers is fine
        let _ = self.tx.send(signal);
    }

    pub fn publish_all(&self, signals: impl IntoIterator<Item = Signal>) {
        for signal in signals {
            self.publish(signal);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);

        let call_id = CallId::new();
        notifier.publish(Signal::TransferSucceeded { call_id });
        assert_eq!(rx.recv().await.unwrap(), Signal::TransferSucceeded { call_id });
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = Notifier::default();
        notifier.publish(Signal::VoicemailNotification {
            account_id: AccountId::new("a1"),
            count: 2,
        });
    }

    #[test]
    fn test_signal_json_shape() {
        let json = serde_json::to_value(Signal::IncomingDtmf {
            call_id: CallId::new(),
            digit: '5',
        })
        .unwrap();
        assert_eq!(json["type"], "IncomingDtmf");
        assert_eq!(json["data"]["digit"], "5");
    }
}
