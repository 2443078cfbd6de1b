pub mod controller;
pub mod state;
pub mod timeline;

pub use controller::{PlaybackEngine, PlaybackEvent, PlaybackSnapshot, DEFAULT_TICK_INTERVAL};
pub use state::{PlaybackSpeed, PlaybackState, PlaybackStatus};
pub use timeline::{ReplayTimeline, VisibleWindow};
