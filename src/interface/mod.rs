//! Interface layer - what the daemon exposes besides the link itself

pub mod metrics;

pub use self::metrics::{init_metrics, spawn_signal_recorder, SignalRecorder};
