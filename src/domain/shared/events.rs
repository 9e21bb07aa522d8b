//! Event plumbing shared by the aggregates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Something an aggregate recorded about itself
pub trait DomainEvent: Send + Sync {
    fn metadata(&self) -> &EventMetadata;

    fn event_type(&self) -> &str {
        &self.metadata().event_type
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata().occurred_at
    }

    /// Process-wide recording order; wall clock can step backwards
    fn sequence(&self) -> u64 {
        self.metadata().sequence
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    pub event_type: String,
}

impl EventMetadata {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            occurred_at: Utc::now(),
            event_type: event_type.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_increasing() {
        let first = EventMetadata::new("call.created");
        let second = EventMetadata::new("call.ended");
        assert!(second.sequence > first.sequence);
        assert_ne!(first.event_id, second.event_id);
        assert_eq!(second.event_type, "call.ended");
    }
}
