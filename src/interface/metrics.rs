//! Prometheus metrics derived from link signals

use crate::application::notifier::Signal;
use crate::domain::account::RegistrationState;
use crate::domain::call::CallStatus;
use crate::domain::shared::value_objects::CallId;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Install the Prometheus exporter with its scrape endpoint on `listen`
pub fn init_metrics(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(listen).install()?;

    describe_counter!("voip_calls_total", "Calls started, by direction");
    describe_counter!("voip_calls_failed", "Calls that ended in failure, by reason");
    describe_gauge!("voip_active_calls", "Calls not yet ended");
    describe_counter!("voip_registrations_total", "Registration outcomes, by state");
    describe_counter!("voip_transfers_total", "Transfer outcomes");

    info!(%listen, "Prometheus exporter listening");
    Ok(())
}

/// Turns the signal stream into metric updates
#[derive(Debug, Default)]
pub struct SignalRecorder {
    live: HashSet<CallId>,
}

impl SignalRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_calls(&self) -> usize {
        self.live.len()
    }

    pub fn observe(&mut self, signal: &Signal) {
        match signal {
            Signal::IncomingCall { call_id, .. } => {
                if self.live.insert(*call_id) {
                    counter!("voip_calls_total", "direction" => "incoming").increment(1);
                }
            }
            Signal::CallStateChanged {
                call_id,
                state,
                sip_status,
            } => match state {
                CallStatus::Hungup | CallStatus::Busy | CallStatus::Failure => {
                    if !self.live.remove(call_id) {
                        return;
                    }
                    if *state != CallStatus::Hungup {
                        let reason = sip_status
                            .as_ref()
                            .map_or_else(|| state.as_str().to_string(), |(code, _)| code.to_string());
                        counter!("voip_calls_failed", "reason" => reason).increment(1);
                    }
                }
                // First sight of a call we did not receive: we placed it
                _ => {
                    if self.live.insert(*call_id) {
                        counter!("voip_calls_total", "direction" => "outgoing").increment(1);
                    }
                }
            },
            Signal::RegistrationStateChanged { state, .. } => {
                if *state != RegistrationState::Trying {
                    counter!("voip_registrations_total", "state" => state.label()).increment(1);
                }
            }
            Signal::TransferSucceeded { .. } => {
                counter!("voip_transfers_total", "result" => "succeeded").increment(1)
            }
            Signal::TransferFailed { .. } => {
                counter!("voip_transfers_total", "result" => "failed").increment(1)
            }
            _ => return,
        }
        gauge!("voip_active_calls").set(self.live.len() as f64);
    }
}

/// Record every signal until the link goes away
pub fn spawn_signal_recorder(mut signals: broadcast::Receiver<Signal>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut recorder = SignalRecorder::new();
        loop {
            match signals.recv().await {
                Ok(signal) => recorder.observe(&signal),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Metrics recorder fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Metrics recorder stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::value_objects::AccountId;

    fn state(call_id: CallId, state: CallStatus) -> Signal {
        Signal::CallStateChanged {
            call_id,
            state,
            sip_status: None,
        }
    }

    #[test]
    fn test_tracks_live_calls() {
        let mut recorder = SignalRecorder::new();
        let incoming = CallId::new();
        let outgoing = CallId::new();

        recorder.observe(&Signal::IncomingCall {
            account_id: AccountId::ip2ip(),
            call_id: incoming,
            from: "<sip:alice@127.0.0.1>".to_string(),
        });
        recorder.observe(&state(outgoing, CallStatus::Ringing));
        recorder.observe(&state(incoming, CallStatus::Current));
        assert_eq!(recorder.active_calls(), 2);

        recorder.observe(&state(outgoing, CallStatus::Failure));
        recorder.observe(&state(incoming, CallStatus::Hungup));
        assert_eq!(recorder.active_calls(), 0);

        // Late duplicates do not resurrect a call
        recorder.observe(&state(incoming, CallStatus::Hungup));
        assert_eq!(recorder.active_calls(), 0);
    }

    #[tokio::test]
    async fn test_recorder_stops_with_sender() {
        let (tx, rx) = broadcast::channel(8);
        let task = spawn_signal_recorder(rx);
        tx.send(state(CallId::new(), CallStatus::Ringing)).unwrap();
        drop(tx);
        task.await.unwrap();
    }
}
