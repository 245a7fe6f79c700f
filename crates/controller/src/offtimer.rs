//! Deferred relay shutoff. At most one timer is outstanding; arming a new
//! one aborts the previous before spawning.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::relay::{Credentials, RelayClient};

/// Where the off command goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffTarget {
    pub host: String,
    pub relay_id: u32,
    pub creds: Credentials,
}

struct Pending {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    next_generation: u64,
    pending: Option<Pending>,
}

pub struct OffTimer {
    relay: RelayClient,
    slot: Arc<Mutex<Slot>>,
}

impl OffTimer {
    pub fn new(relay: RelayClient) -> Self {
        Self {
            relay,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Switch `target` off after `seconds` (at least 1), replacing any timer
    /// that is still pending.
    pub async fn arm(&self, target: OffTarget, seconds: u32) {
        let seconds = seconds.max(1);
        let mut slot = self.slot.lock().await;

        if let Some(prev) = slot.pending.take() {
            prev.handle.abort();
            debug!(generation = prev.generation, "offtimer: superseded pending shutoff");
        }

        slot.next_generation += 1;
        let generation = slot.next_generation;
        let relay = self.relay.clone();
        let shared = self.slot.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds as u64)).await;

            let ok = relay
                .set_switch(&target.host, target.relay_id, false, &target.creds)
                .await;
            if ok {
                debug!(host = %target.host, relay_id = target.relay_id, "offtimer: relay switched off");
            } else {
                warn!(host = %target.host, relay_id = target.relay_id, "offtimer: off command failed");
            }

            let mut slot = shared.lock().await;
            if slot.pending.as_ref().is_some_and(|p| p.generation == generation) {
                slot.pending = None;
            }
        });

        slot.pending = Some(Pending { generation, handle });
        debug!(generation, seconds, "offtimer: armed");
    }

    /// Abort the pending shutoff, if any. Returns whether one was pending.
    pub async fn cancel(&self) -> bool {
        match self.slot.lock().await.pending.take() {
            Some(p) => {
                p.handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn is_pending(&self) -> bool {
        self.slot.lock().await.pending.is_some()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
