//! Session registry: the single owner of the client-session map.
//!
//! All inbound transport events -- register, deregister, frame arrival,
//! heartbeat acknowledgement -- land here and mutate the map under one write
//! lock, so concurrent races on the same id resolve deterministically
//! (last mutation wins; a deregister racing a liveness timeout is
//! idempotent). Membership changes are published as ordered snapshots on a
//! broadcast channel; subscribers never see the live map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::frame::ScreenFrame;
use crate::session::{ClientSession, LIVENESS_TIMEOUT_MS};
use crate::stitch::{NoopStitcher, Stitcher};

/// Capacity of the membership broadcast channel. Snapshots are coalescable --
/// a lagged subscriber only needs the latest one -- so a small buffer is
/// plenty.
const MEMBERSHIP_CHANNEL_CAPACITY: usize = 16;

struct RegistryInner {
    sessions: HashMap<String, ClientSession>,
}

/// Owns the set of [`ClientSession`]s and processes inbound events.
///
/// Cheap to clone; all clones share the same map. Constructed once by the
/// process and handed to collaborators -- there is no ambient global
/// instance.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    membership_tx: broadcast::Sender<Vec<ClientSession>>,
    stitcher: Arc<dyn Stitcher>,
    liveness_timeout: Duration,
    frame_capacity: usize,
    image_capacity: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Registry with default settings: 5000 ms liveness, default queue
    /// bounds, no-op codec.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SessionRegistryBuilder {
        SessionRegistryBuilder::default()
    }

    /// Register a new sharing client. Returns `false` for a duplicate id --
    /// a logged no-op that leaves the existing session, its buffered
    /// frames, and its liveness state untouched. On success the liveness
    /// countdown is armed and a membership snapshot is emitted.
    pub fn register(&self, id: &str, name: &str) -> bool {
        let session = {
            let mut inner = self.inner.write();
            if inner.sessions.contains_key(id) {
                tracing::warn!(client = %id, "register ignored: id already present");
                return false;
            }
            let session = ClientSession::with_capacities(
                id,
                name,
                self.frame_capacity,
                self.image_capacity,
            );
            inner.sessions.insert(id.to_string(), session.clone());
            session
        };

        tracing::info!(client = %id, name = %name, "client registered");
        self.arm_liveness(&session);
        self.publish_membership();
        true
    }

    /// Remove a client, stopping its processing task and discarding its
    /// buffers. Absent ids are a silent no-op, so an explicit deregister
    /// racing a liveness timeout resolves to a single removal.
    pub fn deregister(&self, id: &str) {
        let removed = {
            let mut inner = self.inner.write();
            inner.sessions.remove(id)
        };
        let Some(session) = removed else {
            tracing::debug!(client = %id, "deregister ignored: unknown id");
            return;
        };

        session.stop_processing(self.stitcher.as_ref());
        session.cancelled.cancel();
        tracing::info!(client = %id, "client deregistered");
        self.publish_membership();
    }

    /// Buffer an arriving frame. Frames for unknown ids are dropped
    /// silently -- the client raced its own deregistration.
    pub fn on_frame_arrived(&self, id: &str, frame: ScreenFrame) {
        let session = self.get(id);
        match session {
            Some(session) => session.put_frame(frame),
            None => tracing::debug!(client = %id, "frame dropped: unknown id"),
        }
    }

    /// Reset a client's liveness countdown. Unknown ids are a no-op.
    pub fn on_heartbeat_ack(&self, id: &str) {
        match self.get(id) {
            Some(session) => session.reset_liveness(),
            None => tracing::debug!(client = %id, "heartbeat ignored: unknown id"),
        }
    }

    /// Look up a session by id, returning a clone if present.
    pub fn get(&self, id: &str) -> Option<ClientSession> {
        self.inner.read().sessions.get(id).cloned()
    }

    /// Snapshot of all current sessions, ordered by id for determinism.
    pub fn snapshot(&self) -> Vec<ClientSession> {
        let inner = self.inner.read();
        let mut sessions: Vec<ClientSession> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to membership snapshots. Each accepted register/deregister
    /// (explicit or timeout) emits the full post-change session list.
    pub fn subscribe_membership(&self) -> broadcast::Receiver<Vec<ClientSession>> {
        self.membership_tx.subscribe()
    }

    /// The codec driven by session start/stop transitions.
    pub fn stitcher(&self) -> Arc<dyn Stitcher> {
        self.stitcher.clone()
    }

    /// Remove every session, cancelling their tasks. Used at shutdown.
    pub fn drain(&self) {
        let sessions: Vec<ClientSession> = {
            let mut inner = self.inner.write();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        if sessions.is_empty() {
            return;
        }
        for session in &sessions {
            session.stop_processing(self.stitcher.as_ref());
            session.cancelled.cancel();
        }
        tracing::info!(count = sessions.len(), "registry drained");
        self.publish_membership();
    }

    /// Arm the one-shot liveness countdown for a fresh session.
    ///
    /// The task waits for the countdown to expire -- heartbeat resets extend
    /// it -- and then deregisters the client exactly once. Session
    /// cancellation (explicit deregister, drain) retires the task without
    /// firing.
    fn arm_liveness(&self, session: &ClientSession) {
        let registry = self.clone();
        let id = session.id.clone();
        let liveness = session.liveness.clone();
        let cancelled = session.cancelled.clone();
        let timeout = self.liveness_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = liveness.expired(timeout) => {
                    tracing::info!(client = %id, timeout_ms = timeout.as_millis() as u64,
                        "liveness timeout, deregistering");
                    registry.deregister(&id);
                }
                _ = cancelled.cancelled() => {}
            }
        });
    }

    fn publish_membership(&self) {
        // Ignore error -- no subscribers yet is fine.
        let _ = self.membership_tx.send(self.snapshot());
    }
}

/// Builder for [`SessionRegistry`], covering the knobs the config file
/// exposes.
pub struct SessionRegistryBuilder {
    stitcher: Arc<dyn Stitcher>,
    liveness_timeout: Duration,
    frame_capacity: usize,
    image_capacity: usize,
}

impl Default for SessionRegistryBuilder {
    fn default() -> Self {
        Self {
            stitcher: Arc::new(NoopStitcher),
            liveness_timeout: Duration::from_millis(LIVENESS_TIMEOUT_MS),
            frame_capacity: crate::session::DEFAULT_FRAME_QUEUE_CAPACITY,
            image_capacity: crate::session::DEFAULT_IMAGE_QUEUE_CAPACITY,
        }
    }
}

impl SessionRegistryBuilder {
    pub fn stitcher(mut self, stitcher: Arc<dyn Stitcher>) -> Self {
        self.stitcher = stitcher;
        self
    }

    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn frame_capacity(mut self, capacity: usize) -> Self {
        self.frame_capacity = capacity;
        self
    }

    pub fn image_capacity(mut self, capacity: usize) -> Self {
        self.image_capacity = capacity;
        self
    }

    pub fn build(self) -> SessionRegistry {
        let (membership_tx, _) = broadcast::channel(MEMBERSHIP_CHANNEL_CAPACITY);
        SessionRegistry {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
            })),
            membership_tx,
            stitcher: self.stitcher,
            liveness_timeout: self.liveness_timeout,
            frame_capacity: self.frame_capacity,
            image_capacity: self.image_capacity,
        }
    }
}
