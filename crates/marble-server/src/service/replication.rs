//! Per-client snapshot replication.
//!
//! Clients pull snapshots. Each connection owns a [`ClientSlot`] holding at
//! most one outstanding request; a newer request replaces an unanswered one
//! and the replaced request is counted as skipped. A responder task per
//! connection answers the current request no faster than the tickrate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use marble_core::protocol::{Frame, Framing, ServerMessage};
use marble_core::snapshot::Snapshot;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{trace, warn};
use uuid::Uuid;

/// Provides the latest committed snapshot without blocking on the tick.
pub trait SnapshotSource: Send + Sync {
    fn latest(&self) -> Arc<Snapshot>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub seq: u32,
    /// Responses mirror the request framing.
    pub framing: Framing,
}

#[derive(Debug, Default)]
struct SlotState {
    pending: Option<(u64, SnapshotRequest)>,
    next_generation: u64,
}

/// Single outstanding-request slot for one client.
#[derive(Debug, Default)]
pub struct ClientSlot {
    state: Mutex<SlotState>,
    notify: Notify,
    skipped: AtomicU64,
    answered: AtomicU64,
}

impl ClientSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a request, replacing any unanswered one. Returns its generation.
    pub fn submit(&self, request: SnapshotRequest) -> u64 {
        let generation = {
            let mut state = self.state.lock();
            if let Some((_, replaced)) = state.pending {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                trace!(seq = replaced.seq, "snapshot request replaced");
            }
            let generation = state.next_generation;
            state.next_generation += 1;
            state.pending = Some((generation, request));
            generation
        };
        self.notify.notify_one();
        generation
    }

    /// The outstanding request, if any.
    pub fn current(&self) -> Option<(u64, SnapshotRequest)> {
        self.state.lock().pending
    }

    /// Waits until a request is outstanding.
    pub async fn wait(&self) -> (u64, SnapshotRequest) {
        loop {
            if let Some(pending) = self.current() {
                return pending;
            }
            self.notify.notified().await;
        }
    }

    /// Marks `generation` answered. Returns false if it was replaced meanwhile.
    pub fn complete(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        match state.pending {
            Some((current, _)) if current == generation => {
                state.pending = None;
                self.answered.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn answered(&self) -> u64 {
        self.answered.load(Ordering::Relaxed)
    }
}

/// Answers snapshot requests for one client until its writer closes.
pub async fn serve_client(
    slot: Arc<ClientSlot>,
    source: Arc<dyn SnapshotSource>,
    writer: mpsc::Sender<Frame>,
    interval: Duration,
) {
    let mut pacer = tokio::time::interval(interval);
    pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        slot.wait().await;
        pacer.tick().await;

        // Whatever arrived while pacing wins.
        let Some((generation, request)) = slot.current() else {
            continue;
        };
        let snapshot = source.latest();
        let frame = match ServerMessage::encode_snapshot(request.seq, &snapshot, request.framing) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, seq = request.seq, "failed to encode snapshot");
                slot.complete(generation);
                continue;
            }
        };

        if !slot.complete(generation) {
            continue;
        }
        if writer.send(frame).await.is_err() {
            break;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientDiagnostics {
    pub conn_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub skipped: u64,
    pub answered: u64,
}

struct ClientEntry {
    slot: Arc<ClientSlot>,
    connected_at: DateTime<Utc>,
}

/// Live connections and their counters.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<Uuid, ClientEntry>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn_id: Uuid) -> Arc<ClientSlot> {
        let slot = Arc::new(ClientSlot::new());
        self.clients.write().insert(
            conn_id,
            ClientEntry {
                slot: slot.clone(),
                connected_at: Utc::now(),
            },
        );
        slot
    }

    pub fn unregister(&self, conn_id: &Uuid) -> bool {
        self.clients.write().remove(conn_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn diagnostics(&self) -> Vec<ClientDiagnostics> {
        let clients = self.clients.read();
        let mut list: Vec<ClientDiagnostics> = clients
            .iter()
            .map(|(conn_id, entry)| ClientDiagnostics {
                conn_id: *conn_id,
                connected_at: entry.connected_at,
                skipped: entry.slot.skipped(),
                answered: entry.slot.answered(),
            })
            .collect();
        list.sort_by_key(|client| client.connected_at);
        list
    }
}
