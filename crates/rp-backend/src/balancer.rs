// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fleet health snapshots and backend selection.
//!
//! Selection is advisory: the snapshot map is process-local, and the prompt
//! id the backend hands back is what actually matters. `pick` refreshes
//! every snapshot first; refreshes fan out concurrently so a dead backend
//! costs exactly one probe timeout, never a serial stall.

use crate::client::BackendClient;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use rp_core::SelectionStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Probe deadline per backend.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A registered backend, as read from the server registry file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendEntry {
    /// Display name.
    pub name: String,
    /// Address (`host:port` or full URL).
    pub address: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// Liveness + load snapshot of one backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Backend address.
    pub address: String,
    /// Display name.
    pub name: String,
    /// Whether the last queue probe succeeded.
    pub online: bool,
    /// Entries currently executing.
    pub running: usize,
    /// Entries waiting.
    pub pending: usize,
    /// `running + pending`.
    pub total_load: usize,
    /// When the probe ran.
    pub last_check: DateTime<Utc>,
    /// Probe failure detail for offline backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct BalancerState {
    snapshots: Vec<HealthSnapshot>,
    round_robin: usize,
}

/// Picks a backend per job from liveness snapshots of the registered fleet.
pub struct LoadBalancer {
    backends: Vec<BackendEntry>,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    /// Build a balancer over a fixed fleet; insertion order is the
    /// tie-break order for `least_loaded`.
    pub fn new(backends: Vec<BackendEntry>) -> Self {
        let snapshots = backends
            .iter()
            .map(|b| HealthSnapshot {
                address: b.address.clone(),
                name: b.name.clone(),
                online: false,
                running: 0,
                pending: 0,
                total_load: 0,
                last_check: Utc::now(),
                last_error: Some("not probed yet".to_string()),
            })
            .collect();
        Self {
            backends,
            state: Mutex::new(BalancerState {
                snapshots,
                round_robin: 0,
            }),
        }
    }

    /// The registered fleet.
    pub fn backends(&self) -> &[BackendEntry] {
        &self.backends
    }

    /// Probe every backend concurrently and replace the snapshot map.
    pub async fn refresh(&self) {
        let probes = self.backends.iter().map(|b| async {
            let client = BackendClient::new(b.address.clone(), "health-probe");
            let queue = tokio::time::timeout(PROBE_TIMEOUT, client.get_queue()).await;
            match queue {
                Ok(Ok(queue)) => HealthSnapshot {
                    address: b.address.clone(),
                    name: b.name.clone(),
                    online: true,
                    running: queue.queue_running.len(),
                    pending: queue.queue_pending.len(),
                    total_load: queue.total_load(),
                    last_check: Utc::now(),
                    last_error: None,
                },
                Ok(Err(e)) => offline(b, e.to_string()),
                Err(_) => offline(b, format!("probe timed out after {PROBE_TIMEOUT:?}")),
            }
        });
        let snapshots = join_all(probes).await;
        for s in snapshots.iter().filter(|s| !s.online) {
            warn!(address = %s.address, error = ?s.last_error, "backend offline");
        }
        let mut state = self.state.lock().await;
        state.snapshots = snapshots;
    }

    /// Current snapshots without probing.
    pub async fn snapshots(&self) -> Vec<HealthSnapshot> {
        self.state.lock().await.snapshots.clone()
    }

    /// Refresh, then pick an online backend per `strategy`. `None` when the
    /// whole fleet is offline.
    pub async fn pick(&self, strategy: SelectionStrategy) -> Option<String> {
        self.refresh().await;
        let mut state = self.state.lock().await;
        let online: Vec<HealthSnapshot> = state
            .snapshots
            .iter()
            .filter(|s| s.online)
            .cloned()
            .collect();
        if online.is_empty() {
            return None;
        }

        let chosen = match strategy {
            SelectionStrategy::LeastLoaded => {
                // min_by_key keeps the first minimum: insertion order breaks
                // ties.
                online
                    .iter()
                    .min_by_key(|s| s.total_load)
                    .map(|s| s.address.clone())
            }
            SelectionStrategy::RoundRobin => {
                let idx = state.round_robin % online.len();
                state.round_robin = state.round_robin.wrapping_add(1);
                Some(online[idx].address.clone())
            }
            SelectionStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..online.len());
                Some(online[idx].address.clone())
            }
        };
        debug!(strategy = ?strategy, backend = ?chosen, "backend selected");
        chosen
    }
}

fn offline(entry: &BackendEntry, error: String) -> HealthSnapshot {
    HealthSnapshot {
        address: entry.address.clone(),
        name: entry.name.clone(),
        online: false,
        running: 0,
        pending: 0,
        total_load: 0,
        last_check: Utc::now(),
        last_error: Some(error),
    }
}
