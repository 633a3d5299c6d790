//! Playout pipeline
//!
//! Everything between a parsed datagram and an emitted sink event:
//! - Timing: `clock` (local monotonic ms) and `sync` (sender→local mapping
//!   plus network-condition estimation, kept in one module so they can never
//!   drift apart on clock assumptions)
//! - Buffering: `jitter` (deadline-ordered adaptive hold) with `state`
//!   tracking its fill/play/drain lifecycle
//! - Subtitles: `subtitles` (per-session heap of show/hide cues on the same
//!   timeline)
//! - Tasks: `receiver` (socket-owning receive stage, shared playout tick,
//!   coordinator), all implementing `stage::PipelineStage`
//! - Observability: `health` counters for everything that never reaches a
//!   session

pub mod clock;
pub mod health;
pub mod jitter;
pub mod receiver;
pub mod stage;
pub mod state;
pub mod subtitles;
pub mod sync;
pub mod types;

pub use clock::ReceiverClock;
pub use health::{HealthSummary, ReceiverHealth};
pub use jitter::{JitterBuffer, MemoryBudget};
pub use stage::PipelineStage;
pub use state::BufferState;
pub use subtitles::SubtitleScheduler;
pub use sync::{ConditionEstimator, NetworkCondition, SyncEngine};
pub use types::{SubtitleData, TimedChunk};
