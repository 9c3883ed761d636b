//! Viewport controller: decides which clients are actively streaming.
//!
//! The display has a fixed tile budget per page. The controller consumes
//! membership snapshots from the registry, sorts and paginates the sessions,
//! computes the active window for the current page, and diffs it against the
//! previous window: clients leaving the window are told to stop sending,
//! clients entering are told to start at the page's resolution and get a
//! consumption task forwarding their decoded images to the rendering sink.
//!
//! All controller state lives behind a single mutex, so membership
//! notifications and user pin/unpin/page requests are linearizable -- two
//! window recomputations never interleave.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::frame::{Image, Resolution};
use crate::registry::SessionRegistry;
use crate::session::ClientSession;
use crate::stitch::Stitcher;

/// Maximum number of tiles on a single page.
pub const MAX_TILES: usize = 9;

/// Rows and columns for each window size 0..=9.
const PAGE_GRID: [(u32, u32); MAX_TILES + 1] = [
    (1, 1), // 0 tiles (blank page)
    (1, 1), // 1
    (1, 2), // 2
    (1, 3), // 3
    (2, 2), // 4
    (2, 3), // 5
    (2, 3), // 6
    (3, 3), // 7
    (3, 3), // 8
    (3, 3), // 9
];

/// The per-tile capture resolution requested from active clients.
const TILE_RESOLUTION: Resolution = Resolution::new(100, 100);

/// Grid shape and capture resolution for one page of tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    pub rows: u32,
    pub cols: u32,
    pub resolution: Resolution,
}

impl PageLayout {
    /// Layout for a window of `size` sessions. Size 0 maps to a blank
    /// layout with the zero resolution.
    pub fn for_size(size: usize) -> Self {
        let (rows, cols) = PAGE_GRID[size.min(MAX_TILES)];
        let resolution = if size == 0 {
            Resolution::ZERO
        } else {
            TILE_RESOLUTION
        };
        Self {
            rows,
            cols,
            resolution,
        }
    }
}

/// Control verb sent to broadcasting clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Begin (or continue) streaming at the carried resolution.
    Send,
    /// Pause streaming.
    Stop,
}

/// An outbound control instruction for a set of clients, handed to the
/// transport layer for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub client_ids: Vec<String>,
    pub command: ControlCommand,
    pub resolution: Resolution,
}

/// Destination for decoded images pulled by consumption tasks.
///
/// Implementations must return quickly -- the consumption task calls this
/// inline between pulls.
pub trait RenderSink: Send + Sync {
    fn present(&self, client_id: &str, image: Image);
}

/// Render sink retaining the most recent image per client. The display
/// layer reads from here at its own cadence.
#[derive(Clone, Default)]
pub struct LatestImages {
    inner: Arc<RwLock<HashMap<String, Image>>>,
}

impl LatestImages {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent image presented for `client_id`, if any.
    pub fn latest(&self, client_id: &str) -> Option<Image> {
        self.inner.read().get(client_id).cloned()
    }

    /// Drop the retained image for a client that left the window.
    pub fn forget(&self, client_id: &str) {
        self.inner.write().remove(client_id);
    }
}

impl RenderSink for LatestImages {
    fn present(&self, client_id: &str, image: Image) {
        self.inner.write().insert(client_id.to_string(), image);
    }
}

struct ViewportState {
    page: usize,
    /// Raw membership snapshot; display order is re-derived on every
    /// recomputation so pin-flag changes take effect immediately.
    subscribers: Vec<ClientSession>,
    window: Vec<ClientSession>,
    layout: PageLayout,
}

/// Selects the active window of clients and drives start/stop transitions.
#[derive(Clone)]
pub struct ViewportController {
    state: Arc<Mutex<ViewportState>>,
    commands: mpsc::UnboundedSender<Broadcast>,
    sink: Arc<dyn RenderSink>,
    stitcher: Arc<dyn Stitcher>,
    max_tiles: usize,
}

impl ViewportController {
    pub fn new(
        stitcher: Arc<dyn Stitcher>,
        sink: Arc<dyn RenderSink>,
        commands: mpsc::UnboundedSender<Broadcast>,
    ) -> Self {
        Self::with_max_tiles(stitcher, sink, commands, MAX_TILES)
    }

    /// Controller with a non-default tile budget. `max_tiles` is capped at
    /// the layout table size.
    pub fn with_max_tiles(
        stitcher: Arc<dyn Stitcher>,
        sink: Arc<dyn RenderSink>,
        commands: mpsc::UnboundedSender<Broadcast>,
        max_tiles: usize,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ViewportState {
                page: 1,
                subscribers: Vec::new(),
                window: Vec::new(),
                layout: PageLayout::for_size(0),
            })),
            commands,
            sink,
            stitcher,
            max_tiles: max_tiles.clamp(1, MAX_TILES),
        }
    }

    /// Consume membership snapshots from the registry until `cancel` fires.
    ///
    /// A lagged receiver resyncs from a fresh registry snapshot rather than
    /// acting on stale membership.
    pub fn attach(&self, registry: &SessionRegistry, cancel: CancellationToken) {
        let controller = self.clone();
        let registry = registry.clone();
        let mut rx = registry.subscribe_membership();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = rx.recv() => match result {
                        Ok(snapshot) => controller.on_membership_changed(snapshot),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "membership receiver lagged, resyncing");
                            controller.on_membership_changed(registry.snapshot());
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Replace the subscriber snapshot and recompute the window.
    pub fn on_membership_changed(&self, sessions: Vec<ClientSession>) {
        let mut state = self.state.lock();
        state.subscribers = sessions;
        self.recompute_locked(&mut state);
    }

    /// Pin a session: it gets an exclusive page, and the view navigates to
    /// that page. Unknown ids are a logged no-op.
    pub fn pin(&self, client_id: &str) {
        let mut state = self.state.lock();
        let Some(session) = state.subscribers.iter().find(|s| s.id == client_id) else {
            tracing::debug!(client = %client_id, "pin ignored: unknown id");
            return;
        };
        session.set_pinned(true);
        let ordered = display_order(&state.subscribers);
        if let Some(page) = page_of(&ordered, client_id, self.max_tiles) {
            state.page = page;
        }
        self.recompute_locked(&mut state);
    }

    /// Unpin a session, returning it to the general pool sorted by name.
    ///
    /// Navigates back one page -- a heuristic, not a guaranteed return to
    /// the client's new page; the clamp in recomputation keeps it valid.
    pub fn unpin(&self, client_id: &str) {
        let mut state = self.state.lock();
        let Some(session) = state.subscribers.iter().find(|s| s.id == client_id) else {
            tracing::debug!(client = %client_id, "unpin ignored: unknown id");
            return;
        };
        session.set_pinned(false);
        state.page = state.page.saturating_sub(1).max(1);
        self.recompute_locked(&mut state);
    }

    /// Navigate to page `page` (1-based). Out-of-range requests clamp to
    /// the nearest valid page during recomputation.
    pub fn set_page(&self, page: usize) {
        let mut state = self.state.lock();
        state.page = page.max(1);
        self.recompute_locked(&mut state);
    }

    /// Current page number.
    pub fn page(&self) -> usize {
        self.state.lock().page
    }

    /// Ids of the sessions in the current window, in display order.
    pub fn window_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .window
            .iter()
            .map(|s| s.id.clone())
            .collect()
    }

    /// Grid layout of the current window.
    pub fn layout(&self) -> PageLayout {
        self.state.lock().layout
    }

    /// Recompute the active window for the current page and apply the diff.
    ///
    /// Runs entirely under the state lock; the only side effects are
    /// non-blocking command sends and task spawn/cancel on the sessions
    /// crossing the window boundary.
    fn recompute_locked(&self, state: &mut ViewportState) {
        let ordered = display_order(&state.subscribers);
        let total = ordered.len();

        state.page = state.page.clamp(1, page_count(&ordered, self.max_tiles));

        let (window, layout) = if total == 0 {
            (Vec::new(), PageLayout::for_size(0))
        } else {
            let skip = count_to_skip(&ordered, state.page, self.max_tiles);
            let size = if ordered[skip].pinned() {
                1
            } else {
                (total - skip).min(self.max_tiles)
            };
            let window = ordered[skip..skip + size].to_vec();
            (window, PageLayout::for_size(size))
        };

        let previous = std::mem::take(&mut state.window);
        let prev_ids: HashSet<&str> = previous.iter().map(|s| s.id.as_str()).collect();
        let new_ids: HashSet<&str> = window.iter().map(|s| s.id.as_str()).collect();

        let joiners: Vec<ClientSession> = window
            .iter()
            .filter(|s| !prev_ids.contains(s.id.as_str()))
            .cloned()
            .collect();
        let leavers: Vec<ClientSession> = previous
            .into_iter()
            .filter(|s| !new_ids.contains(s.id.as_str()))
            .collect();

        state.window = window;
        state.layout = layout;

        if !joiners.is_empty() {
            self.broadcast(&joiners, ControlCommand::Send, layout.resolution);
            for session in &joiners {
                self.start_consumption(session);
            }
        }
        if !leavers.is_empty() {
            self.broadcast(&leavers, ControlCommand::Stop, Resolution::ZERO);
            for session in &leavers {
                session.stop_processing(self.stitcher.as_ref());
            }
        }
    }

    fn broadcast(&self, sessions: &[ClientSession], command: ControlCommand, resolution: Resolution) {
        let broadcast = Broadcast {
            client_ids: sessions.iter().map(|s| s.id.clone()).collect(),
            command,
            resolution,
        };
        // A closed channel means the transport is gone (shutdown path).
        if self.commands.send(broadcast).is_err() {
            tracing::debug!("command channel closed, dropping broadcast");
        }
    }

    /// Start stitching and spawn the image consumption loop for a session
    /// that just entered the window.
    fn start_consumption(&self, session: &ClientSession) {
        let sink = self.sink.clone();
        let consumer = session.clone();
        session.start_processing(self.stitcher.as_ref(), move |cancel| async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    image = consumer.next_image() => sink.present(&consumer.id, image),
                }
            }
            tracing::debug!(client = %consumer.id, "consumption loop exited");
        });
    }
}

/// Display order: sorted by name ascending, pinned sessions moved to the
/// front. Both partitions preserve their relative name order.
fn display_order(sessions: &[ClientSession]) -> Vec<ClientSession> {
    let mut sorted = sessions.to_vec();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let (pinned, unpinned): (Vec<_>, Vec<_>) =
        sorted.into_iter().partition(|s| s.pinned());
    pinned.into_iter().chain(unpinned).collect()
}

/// Number of sessions preceding `page` in the display order. Each pinned
/// session occupies one page alone; runs of unpinned sessions are chunked
/// into pages of up to `max_tiles`.
fn count_to_skip(ordered: &[ClientSession], page: usize, max_tiles: usize) -> usize {
    let mut skip = 0;
    for _ in 1..page {
        if skip >= ordered.len() {
            break;
        }
        if ordered[skip].pinned() {
            skip += 1;
        } else {
            skip += max_tiles;
        }
    }
    skip.min(ordered.len().saturating_sub(1))
}

/// Total number of pages for the given display order. An empty list still
/// has one (blank) page.
fn page_count(ordered: &[ClientSession], max_tiles: usize) -> usize {
    let mut pages = 0;
    let mut idx = 0;
    while idx < ordered.len() {
        if ordered[idx].pinned() {
            idx += 1;
        } else {
            idx += max_tiles;
        }
        pages += 1;
    }
    pages.max(1)
}

/// The page on which `client_id` appears, or `None` if absent.
fn page_of(ordered: &[ClientSession], client_id: &str, max_tiles: usize) -> Option<usize> {
    let mut page = 1;
    let mut idx = 0;
    while idx < ordered.len() {
        if ordered[idx].pinned() {
            if ordered[idx].id == client_id {
                return Some(page);
            }
            idx += 1;
        } else {
            let limit = (ordered.len() - idx).min(max_tiles);
            if ordered[idx..idx + limit].iter().any(|s| s.id == client_id) {
                return Some(page);
            }
            idx += max_tiles;
        }
        page += 1;
    }
    None
}
