//! Per-client session state.
//!
//! A [`ClientSession`] tracks one broadcasting client: identity, pin flag,
//! the raw-frame and decoded-image buffers, the liveness countdown, and the
//! background consumption task that drains images while the client is in
//! the active window. The [`crate::registry::SessionRegistry`] owns the set
//! of sessions; each `ClientSession` is `Clone` with shared internals, so
//! registry, controller, and codec all operate on the same state.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::buffer::BoundedQueue;
use crate::frame::{Image, ScreenFrame};
use crate::stitch::Stitcher;

/// Maximum silence tolerated before a client is presumed dead, in
/// milliseconds. Reset by every heartbeat acknowledgement.
pub const LIVENESS_TIMEOUT_MS: u64 = 5000;

/// Default capacity of the raw-frame buffer.
pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 64;

/// Default capacity of the decoded-image buffer.
pub const DEFAULT_IMAGE_QUEUE_CAPACITY: usize = 16;

/// Tracks the instant of the last heartbeat acknowledgement.
///
/// Each [`reset`](Self::reset) re-arms the countdown; [`expired`](Self::expired)
/// resolves once `timeout` passes with no reset. One resolution per arming --
/// the waiting task fires its handler and exits, and only a fresh arming
/// (session creation) starts a new countdown task.
#[derive(Clone)]
pub struct LivenessTracker {
    tx: Arc<watch::Sender<Instant>>,
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessTracker {
    /// Create a tracker seeded with the current instant, so the countdown
    /// starts at construction.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self { tx: Arc::new(tx) }
    }

    /// Restart the countdown.
    pub fn reset(&self) {
        self.tx.send_replace(Instant::now());
    }

    /// Milliseconds elapsed since the last reset.
    pub fn silence_ms(&self) -> u64 {
        self.tx.borrow().elapsed().as_millis() as u64
    }

    /// Resolve once `timeout` has elapsed since the last reset.
    ///
    /// A reset during the wait restarts the remaining time; the method never
    /// resolves early.
    pub async fn expired(&self, timeout: Duration) {
        let mut rx = self.tx.subscribe();
        loop {
            let last = *rx.borrow_and_update();
            let elapsed = last.elapsed();
            if elapsed >= timeout {
                return;
            }
            let remaining = timeout - elapsed;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    // Re-check: a reset may have landed between the sleep
                    // expiring and this task running.
                    let last = *rx.borrow_and_update();
                    if last.elapsed() >= timeout {
                        return;
                    }
                }
                res = rx.changed() => {
                    if res.is_err() {
                        // Sender dropped -- session is gone, countdown moot.
                        return;
                    }
                    // Reset observed -- loop with a fresh remaining.
                }
            }
        }
    }
}

/// Handle to the active background consumption task.
struct ProcessingHandle {
    cancel: CancellationToken,
}

/// The server-side state of one sharing client.
///
/// Cloning is cheap (Arc internals) and all clones observe the same queues,
/// pin flag, and processing state.
#[derive(Clone)]
pub struct ClientSession {
    /// Stable unique id assigned by the transport layer.
    pub id: String,
    /// Display name. Sessions sort by name in the viewport.
    pub name: String,
    pinned: Arc<AtomicBool>,
    frames: BoundedQueue<ScreenFrame>,
    images: BoundedQueue<Image>,
    pub liveness: LivenessTracker,
    processing: Arc<Mutex<Option<ProcessingHandle>>>,
    /// Fires when the session is removed from the registry. Background
    /// tasks select on this to exit promptly instead of operating on ghost
    /// state.
    pub cancelled: CancellationToken,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pinned", &self.pinned())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Create a session with the default queue capacities.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_capacities(
            id,
            name,
            DEFAULT_FRAME_QUEUE_CAPACITY,
            DEFAULT_IMAGE_QUEUE_CAPACITY,
        )
    }

    /// Create a session with explicit queue capacities.
    pub fn with_capacities(
        id: impl Into<String>,
        name: impl Into<String>,
        frame_capacity: usize,
        image_capacity: usize,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            pinned: Arc::new(AtomicBool::new(false)),
            frames: BoundedQueue::new(frame_capacity),
            images: BoundedQueue::new(image_capacity),
            liveness: LivenessTracker::new(),
            processing: Arc::new(Mutex::new(None)),
            cancelled: CancellationToken::new(),
        }
    }

    pub fn pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Release);
    }

    /// Buffer a raw frame from the client, evicting the oldest on overflow.
    pub fn put_frame(&self, frame: ScreenFrame) {
        if self.frames.push(frame).is_some() {
            tracing::debug!(
                client = %self.id,
                dropped = self.frames.dropped(),
                "frame buffer full, dropped oldest frame"
            );
        }
    }

    /// Pop the oldest buffered frame; `None` when the buffer is empty.
    pub fn take_frame(&self) -> Option<ScreenFrame> {
        self.frames.pop()
    }

    /// Buffer a decoded image from the codec, evicting the oldest on
    /// overflow.
    pub fn put_image(&self, image: Image) {
        if self.images.push(image).is_some() {
            tracing::debug!(
                client = %self.id,
                dropped = self.images.dropped(),
                "image buffer full, dropped oldest image"
            );
        }
    }

    /// Pop the oldest buffered image; `None` when the buffer is empty.
    pub fn take_image(&self) -> Option<Image> {
        self.images.pop()
    }

    /// Wait for the next decoded image. Used by the consumption loop so an
    /// empty buffer parks the task instead of spinning.
    pub async fn next_image(&self) -> Image {
        self.images.recv().await
    }

    /// Restart the liveness countdown. Called for every accepted heartbeat
    /// acknowledgement.
    pub fn reset_liveness(&self) {
        self.liveness.reset();
    }

    /// True while a consumption task is registered.
    pub fn is_processing(&self) -> bool {
        self.processing.lock().is_some()
    }

    /// Start the codec's stitching loop and spawn the consumption task.
    ///
    /// `consume` receives a cancellation token scoped to this activation;
    /// the token also fires if the session itself is deregistered. Calling
    /// this on an already-processing session restarts it: the previous task
    /// is cancelled before the new handle is stored, so no task leaks.
    pub fn start_processing<F, Fut>(&self, stitcher: &dyn Stitcher, consume: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        stitcher.start_stitching(self);

        let cancel = self.cancelled.child_token();
        let task = consume(cancel.clone());

        let previous = {
            let mut slot = self.processing.lock();
            slot.replace(ProcessingHandle { cancel })
        };
        if let Some(previous) = previous {
            tracing::debug!(client = %self.id, "restarting consumption task");
            previous.cancel.cancel();
        }

        tokio::spawn(task);
    }

    /// Stop the codec's stitching loop, cancel the consumption task, and
    /// clear both buffers. Safe on an already-stopped session.
    pub fn stop_processing(&self, stitcher: &dyn Stitcher) {
        stitcher.stop_stitching(self);

        if let Some(handle) = self.processing.lock().take() {
            handle.cancel.cancel();
        }
        self.clear_queues();
    }

    /// Clear both buffers with both locks held, so no caller observes one
    /// queue cleared and the other not.
    fn clear_queues(&self) {
        let mut frames = self.frames.lock();
        let mut images = self.images.lock();
        frames.clear();
        images.clear();
    }

    /// Number of buffered raw frames.
    pub fn frame_backlog(&self) -> usize {
        self.frames.len()
    }

    /// Number of buffered decoded images.
    pub fn image_backlog(&self) -> usize {
        self.images.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Resolution;
    use crate::stitch::testing::RecordingStitcher;
    use crate::stitch::NoopStitcher;
    use std::sync::atomic::AtomicUsize;

    fn frame() -> ScreenFrame {
        ScreenFrame::unchanged(Resolution::new(100, 100))
    }

    fn image() -> Image {
        Image::new(Resolution::new(100, 100), vec![0u8; 4])
    }

    #[tokio::test]
    async fn frame_queue_is_fifo() {
        let session = ClientSession::new("c1", "Amy");
        let first = ScreenFrame::unchanged(Resolution::new(1, 1));
        let second = ScreenFrame::unchanged(Resolution::new(2, 2));
        session.put_frame(first.clone());
        session.put_frame(second.clone());
        assert_eq!(session.take_frame(), Some(first));
        assert_eq!(session.take_frame(), Some(second));
        assert_eq!(session.take_frame(), None);
    }

    #[tokio::test]
    async fn empty_pops_return_none() {
        let session = ClientSession::new("c1", "Amy");
        assert!(session.take_frame().is_none());
        assert!(session.take_image().is_none());
    }

    #[tokio::test]
    async fn frame_overflow_keeps_freshest() {
        let session = ClientSession::with_capacities("c1", "Amy", 2, 2);
        session.put_frame(ScreenFrame::unchanged(Resolution::new(1, 1)));
        session.put_frame(ScreenFrame::unchanged(Resolution::new(2, 2)));
        session.put_frame(ScreenFrame::unchanged(Resolution::new(3, 3)));
        assert_eq!(session.frame_backlog(), 2);
        assert_eq!(
            session.take_frame().unwrap().resolution,
            Resolution::new(2, 2),
            "oldest frame should have been evicted"
        );
    }

    #[tokio::test]
    async fn pinned_flag_is_shared_across_clones() {
        let session = ClientSession::new("c1", "Amy");
        let clone = session.clone();
        clone.set_pinned(true);
        assert!(session.pinned());
    }

    #[tokio::test]
    async fn next_image_wakes_on_put() {
        let session = ClientSession::new("c1", "Amy");
        let consumer = session.clone();
        let handle = tokio::spawn(async move { consumer.next_image().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.put_image(image());

        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("next_image should wake on put")
            .unwrap();
        assert_eq!(got.resolution, Resolution::new(100, 100));
    }

    #[tokio::test]
    async fn start_processing_invokes_stitcher_and_spawns_task() {
        let session = ClientSession::new("c1", "Amy");
        let stitcher = RecordingStitcher::default();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        session.start_processing(&stitcher, move |_cancel| async move {
            ran_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(stitcher.starts.load(Ordering::SeqCst), 1);
        assert!(session.is_processing());
    }

    #[tokio::test]
    async fn restart_cancels_previous_task() {
        let session = ClientSession::new("c1", "Amy");
        let cancelled_count = Arc::new(AtomicUsize::new(0));

        let counter = cancelled_count.clone();
        session.start_processing(&NoopStitcher, move |cancel| async move {
            cancel.cancelled().await;
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Second start replaces the first; its token must fire.
        session.start_processing(&NoopStitcher, |cancel| async move {
            cancel.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            cancelled_count.load(Ordering::SeqCst),
            1,
            "first task should observe cancellation after restart"
        );
        assert!(session.is_processing());
    }

    #[tokio::test]
    async fn stop_processing_cancels_and_clears() {
        let session = ClientSession::new("c1", "Amy");
        let stitcher = RecordingStitcher::default();
        let observed_cancel = Arc::new(AtomicBool::new(false));

        let flag = observed_cancel.clone();
        session.start_processing(&stitcher, move |cancel| async move {
            cancel.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        session.put_frame(frame());
        session.put_image(image());
        session.stop_processing(&stitcher);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(observed_cancel.load(Ordering::SeqCst));
        assert!(!session.is_processing());
        assert_eq!(session.frame_backlog(), 0);
        assert_eq!(session.image_backlog(), 0);
        assert_eq!(stitcher.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_processing_on_idle_session_is_noop() {
        let session = ClientSession::new("c1", "Amy");
        session.put_frame(frame());
        // Never started -- still clears, never panics.
        session.stop_processing(&NoopStitcher);
        session.stop_processing(&NoopStitcher);
        assert_eq!(session.frame_backlog(), 0);
    }

    #[tokio::test]
    async fn session_cancellation_reaches_consumption_task() {
        let session = ClientSession::new("c1", "Amy");
        let observed = Arc::new(AtomicBool::new(false));

        let flag = observed.clone();
        session.start_processing(&NoopStitcher, move |cancel| async move {
            cancel.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        // Deregistration cancels the session token, not the per-activation
        // token; the child token must still fire.
        session.cancelled.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_expires_after_timeout() {
        let tracker = LivenessTracker::new();
        let start = tokio::time::Instant::now();
        tracker.expired(Duration::from_millis(5000)).await;
        assert!(start.elapsed() >= Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn liveness_reset_extends_deadline() {
        let tracker = LivenessTracker::new();

        let t = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            t.reset();
        });

        let start = Instant::now();
        tracker.expired(Duration::from_millis(80)).await;
        // Reset at ~30ms restarts the countdown: total >= 30 + 80.
        assert!(
            start.elapsed() >= Duration::from_millis(110),
            "reset should have extended the countdown, got {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn silence_ms_tracks_resets() {
        let tracker = LivenessTracker::new();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(tracker.silence_ms() >= 30);
        tracker.reset();
        assert!(tracker.silence_ms() < 30);
    }
}
