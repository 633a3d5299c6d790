//! Receiver-side tasks
//!
//! The receive stage owns the socket and the ingest half of every session;
//! the playout stage owns the tick and the playout half; the coordinator
//! wires them up and tears them down.

pub mod coordinator;
pub mod playout_stage;
pub mod receive_stage;

pub use coordinator::ReceiverCoordinator;
pub use playout_stage::PlayoutStage;
pub use receive_stage::ReceiveStage;
