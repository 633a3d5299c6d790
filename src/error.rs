//! Error types for speechlink
//!
//! # Error Severity
//!
//! The receiver distinguishes four severities; only the last two surface as
//! values of [`Error`]:
//!
//! - **Transient packet errors** (malformed datagram, unknown session,
//!   endpoint mismatch, duplicate, late arrival): counted in
//!   [`crate::pipeline::health::ReceiverHealth`] or the session statistics
//!   and discarded. They never unwind and never abort the receive loop.
//!
//! - **Session-scoped errors** (memory cap exceeded, declared/observed format
//!   mismatch): counted, logged at `warn`, the session continues degraded.
//!
//! - **Session-fatal errors** (sink repeatedly refusing): the session moves
//!   to draining with reason `ERROR` and the control plane is notified.
//!
//! - **Core-fatal errors** (socket bind failure, startup allocation): these
//!   are the `Error` values returned to the embedder. No automatic recovery
//!   is attempted; in particular the core never re-binds its socket.

use thiserror::Error;

/// Errors surfaced to the embedder
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("unknown session: {0}")]
    SessionNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
