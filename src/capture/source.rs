use anyhow::Result;
use async_trait::async_trait;
use image::RgbaImage;

/// Measured bounding box of the view being recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewBounds {
    pub width: f64,
    pub height: f64,
}

impl ViewBounds {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Produces bitmaps of the live replay view on demand.
///
/// A capture may take longer than one capture tick; callers serialize access
/// through the capture guard rather than relying on tick cadence.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// `None` while the target view is not mounted.
    async fn bounds(&self) -> Option<ViewBounds>;

    async fn capture(&self, width: u32, height: u32) -> Result<RgbaImage>;
}
