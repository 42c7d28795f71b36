//! Operation relay between sibling nodes.
//!
//! The relay is a thin forwarding layer. Outgoing envelopes are tagged with
//! the node id and a per-node sequence number; incoming envelopes from this
//! node are discarded. Ordering and duplicates are left to the document's
//! merge rules.

pub mod broker;
pub mod pg_broker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::operation::{encoded_len, pack, Operation, StrokeId, UserId};
pub use broker::{Broker, BrokerError, MemoryBroker, PayloadStream};
pub use pg_broker::PgBroker;

/// Largest encoded envelope handed to a broker. Postgres rejects NOTIFY
/// payloads of 8000 bytes or more.
pub const MAX_PAYLOAD_BYTES: usize = 7_800;

const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClearAllData {
    pub stroke_ids: Vec<StrokeId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClearUserData {
    pub user_id: UserId,
    pub stroke_ids: Vec<StrokeId>,
}

/// What travels on the broker topic.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum RelayEvent {
    #[serde(rename = "draw")]
    Draw(Operation),
    #[serde(rename = "clear-all")]
    ClearAll(ClearAllData),
    #[serde(rename = "clear-user")]
    ClearUser(ClearUserData),
}

impl RelayEvent {
    /// The concrete document operation this event stands for.
    pub fn operation(&self) -> Operation {
        match self {
            RelayEvent::Draw(op) => op.clone(),
            RelayEvent::ClearAll(data) => Operation::Delete { stroke_ids: data.stroke_ids.clone() },
            RelayEvent::ClearUser(data) => Operation::Delete { stroke_ids: data.stroke_ids.clone() },
        }
    }

    /// Split into events whose encoding fits in `budget` bytes.
    fn chunked(self, budget: usize) -> Vec<RelayEvent> {
        match self {
            RelayEvent::Draw(op) => {
                let empty = Operation::Delete { stroke_ids: Vec::new() };
                let wrapper = encoded_len(&RelayEvent::Draw(empty.clone())).saturating_sub(encoded_len(&empty));
                op.chunked(budget.saturating_sub(wrapper))
                    .into_iter()
                    .map(RelayEvent::Draw)
                    .collect()
            }
            RelayEvent::ClearAll(data) => {
                let overhead = encoded_len(&RelayEvent::ClearAll(ClearAllData { stroke_ids: Vec::new() }));
                let runs = pack(&data.stroke_ids, budget.saturating_sub(overhead));
                if runs.len() <= 1 {
                    return vec![RelayEvent::ClearAll(data)];
                }
                runs.into_iter()
                    .map(|ids| RelayEvent::ClearAll(ClearAllData { stroke_ids: ids.to_vec() }))
                    .collect()
            }
            RelayEvent::ClearUser(data) => {
                let overhead = encoded_len(&RelayEvent::ClearUser(ClearUserData {
                    user_id: data.user_id.clone(),
                    stroke_ids: Vec::new(),
                }));
                let runs = pack(&data.stroke_ids, budget.saturating_sub(overhead));
                if runs.len() <= 1 {
                    return vec![RelayEvent::ClearUser(data)];
                }
                runs.into_iter()
                    .map(|ids| {
                        RelayEvent::ClearUser(ClearUserData {
                            user_id: data.user_id.clone(),
                            stroke_ids: ids.to_vec(),
                        })
                    })
                    .collect()
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    pub origin: Uuid,
    pub seq: u64,
    pub board: String,
    pub event: RelayEvent,
}

/// Relay counters, updated without locks.
#[derive(Debug, Default)]
pub struct RelayStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
    echoes: AtomicU64,
    malformed: AtomicU64,
    foreign: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub dropped: u64,
    pub received: u64,
    pub echoes: u64,
    pub malformed: u64,
    pub foreign: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            echoes: self.echoes.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            foreign: self.foreign.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Publishing side of the relay, owned by the hub.
///
/// `publish` never waits: envelopes go onto a bounded queue drained by the
/// publisher task.
pub struct Relay {
    node_id: Uuid,
    board: String,
    seq: u64,
    /// Bytes left for the event once the envelope fields are encoded.
    event_budget: usize,
    tx: mpsc::Sender<RelayEnvelope>,
    stats: Arc<RelayStats>,
}

impl Relay {
    pub fn new(node_id: Uuid, board: &str, tx: mpsc::Sender<RelayEnvelope>, stats: Arc<RelayStats>) -> Self {
        let empty = RelayEvent::ClearAll(ClearAllData { stroke_ids: Vec::new() });
        let envelope = encoded_len(&RelayEnvelope {
            origin: node_id,
            seq: u64::MAX,
            board: board.to_string(),
            event: empty.clone(),
        });
        Self {
            node_id,
            board: board.to_string(),
            seq: 0,
            event_budget: MAX_PAYLOAD_BYTES.saturating_sub(envelope.saturating_sub(encoded_len(&empty))),
            tx,
            stats,
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn publish(&mut self, event: RelayEvent) {
        for event in event.chunked(self.event_budget) {
            self.seq += 1;
            let envelope = RelayEnvelope {
                origin: self.node_id,
                seq: self.seq,
                board: self.board.clone(),
                event,
            };
            if let Err(e) = self.tx.try_send(envelope) {
                RelayStats::bump(&self.stats.dropped);
                error!("Relay queue unavailable, envelope {} not fanned out: {}", self.seq, e);
            }
        }
    }
}

/// Drain the publish queue into the broker.
pub fn spawn_publisher(
    broker: Arc<dyn Broker>,
    mut rx: mpsc::Receiver<RelayEnvelope>,
    stats: Arc<RelayStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Relay publisher started ({} broker)", broker.name());
        while let Some(envelope) = rx.recv().await {
            let payload = match serde_json::to_string(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to encode envelope {}: {}", envelope.seq, e);
                    continue;
                }
            };
            match broker.publish(payload).await {
                Ok(()) => RelayStats::bump(&stats.published),
                Err(e) => {
                    // The local state is already correct; sibling nodes miss this one
                    RelayStats::bump(&stats.publish_failures);
                    error!("Failed to publish envelope {}: {}", envelope.seq, e);
                }
            }
        }
        info!("Relay publisher stopped");
    })
}

/// Parse one broker payload, keeping it only if a sibling node on the same board sent it.
pub fn accept_payload(payload: &str, node_id: Uuid, board: &str, stats: &RelayStats) -> Option<RelayEnvelope> {
    let envelope: RelayEnvelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            RelayStats::bump(&stats.malformed);
            warn!("Dropping malformed relay payload: {}", e);
            return None;
        }
    };
    if envelope.origin == node_id {
        RelayStats::bump(&stats.echoes);
        return None;
    }
    if envelope.board != board {
        RelayStats::bump(&stats.foreign);
        debug!("Ignoring envelope for board '{}'", envelope.board);
        return None;
    }
    if let Err(e) = envelope.event.operation().validate() {
        RelayStats::bump(&stats.malformed);
        warn!("Dropping invalid envelope {} from {}: {}", envelope.seq, envelope.origin, e);
        return None;
    }
    RelayStats::bump(&stats.received);
    Some(envelope)
}

/// Subscribe to the broker and forward sibling envelopes to `tx`.
///
/// The first subscription happens before this returns so that a node never
/// serves clients without a working relay. Later subscription losses are
/// retried with exponential backoff.
pub async fn start_subscriber(
    broker: Arc<dyn Broker>,
    node_id: Uuid,
    board: String,
    tx: mpsc::Sender<RelayEnvelope>,
    stats: Arc<RelayStats>,
) -> Result<JoinHandle<()>, BrokerError> {
    let first = broker.subscribe().await?;

    Ok(tokio::spawn(async move {
        let mut stream = first;
        loop {
            while let Some(item) = stream.next().await {
                let payload = match item {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Broker subscription error: {}", e);
                        continue;
                    }
                };
                if let Some(envelope) = accept_payload(&payload, node_id, &board, &stats) {
                    if tx.send(envelope).await.is_err() {
                        info!("Hub gone, relay subscriber stopping");
                        return;
                    }
                }
            }

            warn!("Broker subscription ended, resubscribing");
            let mut backoff = RESUBSCRIBE_INITIAL_BACKOFF;
            stream = loop {
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(backoff).await;
                match broker.subscribe().await {
                    Ok(stream) => {
                        info!("Broker subscription restored");
                        break stream;
                    }
                    Err(e) => {
                        error!("Resubscribe failed, retrying in {:?}: {}", backoff, e);
                        backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
                    }
                }
            };
        }
    }))
}
