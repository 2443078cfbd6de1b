//! Frame capture pipeline: a fixed-size surface fed by a periodic capture
//! loop that never lets two captures overlap.

mod controller;
mod guard;
pub(crate) mod loop_worker;
mod renderer;
mod source;
mod surface;

pub use controller::{read_surface, CaptureConfig, CapturePipeline};
pub use guard::{CaptureGuard, CapturePermit, GuardState};
pub use loop_worker::{capture_frame, capture_loop, CaptureContext, DegradedHook, InFlightCapture};
pub use renderer::{render_view, ReplayViewRenderer, DEFAULT_TAIL_ROWS, DEFAULT_VIEW_HEIGHT, DEFAULT_VIEW_WIDTH};
pub use source::{FrameSource, ViewBounds};
pub use surface::{parse_hex_color, surface_dimensions, CaptureSurface, MIN_SURFACE_HEIGHT, MIN_SURFACE_WIDTH};
