//! Connected-session registry.
//!
//! The hub runs a single event loop; the sessions map is mutated only from
//! that loop, every other component reads snapshots under the reader lock.
//! Each session carries a bounded send queue; enqueue never blocks, and a
//! full or closed queue means the session is dead and gets evicted. That
//! bias (drop the slow consumer, keep the hub live) is deliberate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xfleet_protocol::Frame;
use xfleet_store::{NodeStatus, Store};

/// Capacity of each session's send queue.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// One live connection to a slave node.
///
/// Cloning shares the send queue and the last-seen clock; the hub map and
/// the connection's read task hold clones of the same session.
#[derive(Clone)]
pub struct Session {
    id: Uuid,
    node_id: i64,
    sender: mpsc::Sender<Frame>,
    last_seen: Arc<RwLock<Instant>>,
}

impl Session {
    /// Create a session and hand back the receiving end of its send queue
    /// (owned by the connection's write task).
    pub fn new(node_id: i64) -> (Self, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let session = Self {
            id: Uuid::new_v4(),
            node_id,
            sender,
            last_seen: Arc::new(RwLock::new(Instant::now())),
        };
        (session, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    /// Non-blocking enqueue. `Err` means the queue is full or closed; the
    /// caller must treat this session as dead.
    pub fn send(&self, frame: Frame) -> Result<(), Frame> {
        self.sender.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(frame) => frame,
            mpsc::error::TrySendError::Closed(frame) => frame,
        })
    }

    /// Refresh the liveness clock. Called by the read task on every inbound
    /// frame, including transport-level pings and pongs.
    pub fn touch(&self) {
        *self.last_seen.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.read().elapsed()
    }
}

enum HubEvent {
    Register(Session),
    Unregister(Uuid),
    Broadcast(Frame),
}

/// Handle to the session registry.
///
/// `Hub::new` also returns the [`HubLoop`] that must be spawned; all map
/// mutation happens there.
pub struct Hub {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    events: mpsc::Sender<HubEvent>,
}

impl Hub {
    pub fn new(store: Arc<Store>) -> (Arc<Self>, HubLoop) {
        let sessions = Arc::new(RwLock::new(HashMap::new()));
        let (events, receiver) = mpsc::channel(64);
        let hub = Arc::new(Self {
            sessions: sessions.clone(),
            events,
        });
        let hub_loop = HubLoop {
            events: receiver,
            sessions,
            store,
        };
        (hub, hub_loop)
    }

    pub async fn register(&self, session: Session) {
        let _ = self.events.send(HubEvent::Register(session)).await;
    }

    pub async fn unregister(&self, session_id: Uuid) {
        let _ = self.events.send(HubEvent::Unregister(session_id)).await;
    }

    /// Best-effort fan-out to every connected session.
    pub async fn broadcast(&self, frame: Frame) {
        let _ = self.events.send(HubEvent::Broadcast(frame)).await;
    }

    pub fn get(&self, session_id: Uuid) -> Option<Session> {
        self.sessions.read().get(&session_id).cloned()
    }

    /// First session for a node id. A reconnecting node may briefly have an
    /// old and a new session at once; first match wins.
    pub fn get_by_node(&self, node_id: i64) -> Option<Session> {
        self.sessions
            .read()
            .values()
            .find(|s| s.node_id == node_id)
            .cloned()
    }

    pub fn sessions_snapshot(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

/// The hub's single-owner event loop.
pub struct HubLoop {
    events: mpsc::Receiver<HubEvent>,
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    store: Arc<Store>,
}

impl HubLoop {
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("hub loop shutting down");
                    break;
                }
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event);
                }
            }
        }
    }

    fn handle(&self, event: HubEvent) {
        match event {
            HubEvent::Register(session) => {
                info!(
                    session_id = %session.id(),
                    node_id = session.node_id(),
                    "session registered"
                );
                self.sessions.write().insert(session.id(), session);
            }
            HubEvent::Unregister(session_id) => {
                let removed = self.sessions.write().remove(&session_id);
                if let Some(session) = removed {
                    info!(
                        session_id = %session_id,
                        node_id = session.node_id(),
                        "session unregistered"
                    );
                    // Dropping the session closes its send queue; the write
                    // task observes that and exits.
                    self.mark_offline(session.node_id());
                }
            }
            HubEvent::Broadcast(frame) => {
                let mut dead = Vec::new();
                {
                    let sessions = self.sessions.read();
                    for session in sessions.values() {
                        if session.send(frame.clone()).is_err() {
                            dead.push(session.id());
                        }
                    }
                }
                for session_id in dead {
                    warn!(session_id = %session_id, "send queue stalled, evicting session");
                    if let Some(session) = self.sessions.write().remove(&session_id) {
                        self.mark_offline(session.node_id());
                    }
                }
            }
        }
    }

    fn mark_offline(&self, node_id: i64) {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = store.update_node_status(node_id, NodeStatus::Offline) {
                warn!(node_id, %err, "failed to mark node offline");
            }
        });
    }
}

/// Policy knobs for the liveness scan.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// How often the scanner wakes up.
    pub scan_interval: Duration,
    /// A session idle longer than this is considered dead. Baseline 90 s,
    /// about 1.5x the write-side ping period.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

/// Periodically evict sessions whose last-seen is older than the timeout.
/// Unregistering also marks the backing node offline.
pub async fn run_heartbeat_monitor(
    hub: Arc<Hub>,
    config: HeartbeatConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.scan_interval);
    info!(timeout_secs = config.timeout.as_secs(), "heartbeat monitor started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for session in hub.sessions_snapshot() {
                    let idle = session.idle_for();
                    if idle > config.timeout {
                        warn!(
                            session_id = %session.id(),
                            node_id = session.node_id(),
                            idle_secs = idle.as_secs(),
                            "heartbeat timeout, evicting session"
                        );
                        hub.unregister(session.id()).await;
                    } else {
                        debug!(
                            session_id = %session.id(),
                            idle_secs = idle.as_secs(),
                            "session alive"
                        );
                    }
                }
            }
        }
    }
}
