//! Live calls, indexed by local id and by SIP Call-ID
//!
//! The table only hands out handles. Its lock is held for the lookup itself,
//! never while a call is locked or a message is on its way out.

use super::call::SipCall;
use super::transport::SipTransport;
use crate::domain::shared::value_objects::CallId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// One call, locked for every transition
pub type CallHandle = Arc<Mutex<SipCall>>;

/// Where a call's requests go
#[derive(Clone)]
pub struct CallRoute {
    pub transport: Arc<dyn SipTransport>,
    pub peer: SocketAddr,
}

struct Entry {
    handle: CallHandle,
    route: CallRoute,
    sip_call_id: String,
}

#[derive(Default)]
struct Inner {
    calls: HashMap<CallId, Entry>,
    by_sip_id: HashMap<String, CallId>,
}

/// Registry of live calls owned by the engine
#[derive(Default)]
pub struct CallTable {
    inner: RwLock<Inner>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: CallId, sip_call_id: &str, call: SipCall, route: CallRoute) -> CallHandle {
        let handle = Arc::new(Mutex::new(call));
        let mut inner = self.inner.write().await;
        inner.by_sip_id.insert(sip_call_id.to_string(), id);
        inner.calls.insert(
            id,
            Entry {
                handle: handle.clone(),
                route,
                sip_call_id: sip_call_id.to_string(),
            },
        );
        debug!(call_id = %id, sip_call_id, "Call added to table");
        handle
    }

    pub async fn get(&self, id: &CallId) -> Option<CallHandle> {
        self.inner.read().await.calls.get(id).map(|e| e.handle.clone())
    }

    pub async fn route(&self, id: &CallId) -> Option<CallRoute> {
        self.inner.read().await.calls.get(id).map(|e| e.route.clone())
    }

    /// Call owning the dialog with this SIP Call-ID
    pub async fn find_by_sip_call_id(&self, sip_call_id: &str) -> Option<(CallId, CallHandle)> {
        let inner = self.inner.read().await;
        let id = inner.by_sip_id.get(sip_call_id)?;
        inner.calls.get(id).map(|e| (*id, e.handle.clone()))
    }

    /// Forget a call. Late messages for its dialog find nothing afterwards.
    pub async fn remove(&self, id: &CallId) -> Option<CallHandle> {
        let mut inner = self.inner.write().await;
        let entry = inner.calls.remove(id)?;
        inner.by_sip_id.remove(&entry.sip_call_id);
        debug!(call_id = %id, "Call removed from table");
        Some(entry.handle)
    }

    pub async fn ids(&self) -> Vec<CallId> {
        self.inner.read().await.calls.keys().copied().collect()
    }

    pub async fn handles(&self) -> Vec<(CallId, CallHandle)> {
        self.inner
            .read()
            .await
            .calls
            .iter()
            .map(|(id, e)| (*id, e.handle.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.calls.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
