//! speechlink: low-latency receiver core for streamed synthesized speech
//!
//! Session negotiation runs over a reliable control plane; audio datagrams
//! arrive on a UDP data plane that bypasses the broker entirely. This crate
//! is the data-plane core: it turns a jittered, lossy stream of timestamped
//! datagrams into deadline-scheduled play events with time-aligned subtitle
//! cues, and leaves every outward surface (broker transport, audio device,
//! subtitle display, config files, process lifecycle) to the embedder.
//!
//! # Architecture
//!
//! ```text
//! UDP socket → receive stage → per-session inbound queue →
//!   playout tick → jitter buffer → SinkEvent::Play
//!                → subtitle heap → SubtitleEvent::Show / Hide
//! ```
//!
//! One task owns the socket and all ingest state (sequence accounting,
//! condition estimation, deadline computation); one shared 5 ms tick drives
//! every session's jitter buffer and subtitle heap. The two touch disjoint
//! halves of each session and meet only at the inbound queue.
//!
//! # Example
//!
//! ```no_run
//! use speechlink::config::ReceiverConfig;
//! use speechlink::events::SinkEvent;
//! use speechlink::pipeline::receiver::ReceiverCoordinator;
//!
//! # async fn run() -> speechlink::Result<()> {
//! let (core, mut events) = ReceiverCoordinator::start(ReceiverConfig::default()).await?;
//! while let Some(event) = events.sink_rx.recv().await {
//!     if let SinkEvent::Play { payload, deadline_ms, .. } = event {
//!         // hand the buffer to the audio device
//!     }
//! }
//! core.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod negotiator;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod shutdown;

pub use config::ReceiverConfig;
pub use control::{ControlMessage, EndReason};
pub use error::{Error, Result};
pub use events::{EventBus, EventReceivers, SinkEvent, SubtitleEvent};
pub use negotiator::Negotiator;
pub use pipeline::receiver::ReceiverCoordinator;
pub use protocol::{AudioFormat, AudioPacket};
pub use session::{SessionState, SessionStats};
pub use shutdown::ShutdownSignal;
