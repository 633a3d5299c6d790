//! Pipeline stage trait
//!
//! Each stage owns one loop: the receive stage owns the socket, the playout
//! stage owns the tick. Stages run under `tokio::spawn` and stop when their
//! shutdown signal fires or their channels close.

use anyhow::Result;
use async_trait::async_trait;

/// A long-running pipeline task
#[async_trait]
pub trait PipelineStage: Send {
    /// Run the stage until shutdown.
    async fn run(&mut self) -> Result<()>;

    /// Stage name for logging
    fn name(&self) -> &'static str;
}
