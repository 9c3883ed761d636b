//! Codec seam: the frame-to-image stitching lifecycle.
//!
//! The pixel-level work of folding a run of [`crate::frame::ScreenFrame`]
//! diffs into a displayable [`crate::frame::Image`] belongs to an external
//! codec. This crate only drives its lifecycle: stitching is started when a
//! session enters the active window and stopped when it leaves. A codec
//! implementation is expected to pull raw frames with
//! [`ClientSession::take_frame`] and publish results with
//! [`ClientSession::put_image`].

use crate::session::ClientSession;

/// Lifecycle hooks for the external stitching codec.
pub trait Stitcher: Send + Sync {
    /// Begin stitching for a session that just became active.
    fn start_stitching(&self, session: &ClientSession);

    /// Stop stitching for a session that left the active window. Must be
    /// safe to call for a session that was never started.
    fn stop_stitching(&self, session: &ClientSession);
}

/// Stitcher that does nothing. Used headless, and wherever only the
/// session/windowing machinery is under test.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStitcher;

impl Stitcher for NoopStitcher {
    fn start_stitching(&self, _session: &ClientSession) {}

    fn stop_stitching(&self, _session: &ClientSession) {}
}
