pub mod replay;
pub mod timestamp;

pub use replay::{
    EventKind, KpiScores, KpiTimelineEntry, OperationLogEntry, Position, ReplayData, Session,
    StateSnapshot,
};
