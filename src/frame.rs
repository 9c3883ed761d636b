//! Screen frame and image data model.
//!
//! A [`ScreenFrame`] is what a broadcasting client sends: the resolution it
//! captured at plus an ordered list of rectangular diff patches against its
//! previous capture. An [`Image`] is the display-ready result the stitching
//! codec produces from a run of frames. The stitching itself lives behind
//! the [`crate::stitch::Stitcher`] seam; this module only defines the data
//! that crosses it.

use serde::{Deserialize, Serialize};

/// A display resolution in pixels, `(width, height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// The zero resolution, sent with `Stop` commands and used for an empty
    /// display window.
    pub const ZERO: Resolution = Resolution::new(0, 0);
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One rectangular patch of changed pixels: position, extent, and the RGB
/// value filling it. Clients coalesce changed regions into runs of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffPatch {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub rgb: (u8, u8, u8),
}

/// An incremental screen update from one client: the capture resolution and
/// the ordered patches changed since the previous frame.
///
/// Ordering matters -- patches overwrite each other left to right, and frames
/// must reach the codec in arrival order (the per-session queue preserves
/// FIFO).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenFrame {
    pub resolution: Resolution,
    pub patches: Vec<DiffPatch>,
}

impl ScreenFrame {
    pub fn new(resolution: Resolution, patches: Vec<DiffPatch>) -> Self {
        Self {
            resolution,
            patches,
        }
    }

    /// A frame with no patches -- a keep-alive capture with no visible change.
    pub fn unchanged(resolution: Resolution) -> Self {
        Self::new(resolution, Vec::new())
    }
}

/// A display-ready bitmap produced by the stitching codec.
///
/// The pixel payload is opaque to this crate; the codec writes it and the
/// rendering sink reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub resolution: Resolution,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn new(resolution: Resolution, pixels: Vec<u8>) -> Self {
        Self { resolution, pixels }
    }
}
