//! Control-plane negotiator
//!
//! The thin orchestration surface between the broker client and the data
//! plane. It consumes inbound [`ControlMessage`]s from whatever transport
//! the outer system runs, registers and tears down sessions, and emits the
//! replies the broker expects. It owns no socket and no timer beyond the
//! end-of-session drain wait.
//!
//! `SESSION_END` answers only after the session's jitter buffer has emptied,
//! or after a two-second grace period, whichever comes first; the final
//! statistics ride on the `SESSION_ENDED` confirmation either way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use tokio::sync::mpsc;

use crate::control::{ControlMessage, EndReason};
use crate::pipeline::types::InboundItem;
use crate::protocol::{self, AudioFormat};
use crate::session::registry::SessionRegistry;
use crate::session::SessionState;
use crate::pipeline::clock::ReceiverClock;
use crate::shutdown::ShutdownSignal;

/// How long a `SESSION_END` waits for the buffer to drain.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Poll step while waiting out the grace period.
const DRAIN_POLL: Duration = Duration::from_millis(20);

pub struct Negotiator {
    registry: Arc<SessionRegistry>,
    clock: ReceiverClock,
    /// Advertised in `SESSION_READY`.
    udp_endpoint: SocketAddr,
    suggested_buffer_ms: u32,
    inbound: mpsc::Receiver<ControlMessage>,
    outbound: mpsc::Sender<ControlMessage>,
    shutdown: ShutdownSignal,
    /// When set, conditions for every live session are published on this
    /// cadence.
    report_interval: Option<Duration>,
}

impl Negotiator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        clock: ReceiverClock,
        udp_endpoint: SocketAddr,
        suggested_buffer_ms: u32,
        inbound: mpsc::Receiver<ControlMessage>,
        outbound: mpsc::Sender<ControlMessage>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            registry,
            clock,
            udp_endpoint,
            suggested_buffer_ms,
            inbound,
            outbound,
            shutdown,
            report_interval: None,
        }
    }

    /// Publish periodic `NETWORK_REPORT` messages for live sessions.
    pub fn with_condition_reports(mut self, interval: Duration) -> Self {
        self.report_interval = Some(interval);
        self
    }

    /// Process control messages until shutdown or the broker side closes.
    pub async fn run(mut self) -> Result<()> {
        info!("negotiator: started (data plane {})", self.udp_endpoint);

        let mut report_tick = self
            .report_interval
            .map(tokio::time::interval)
            .unwrap_or_else(|| tokio::time::interval(Duration::from_secs(3_600)));
        report_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        report_tick.tick().await; // immediate first tick is uninteresting

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = report_tick.tick(), if self.report_interval.is_some() => {
                    self.publish_conditions().await;
                }
                msg = self.inbound.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle(msg).await;
                }
            }
        }

        info!("negotiator: finished");
        Ok(())
    }

    async fn handle(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::SessionStart {
                session_id,
                client_endpoint,
                expected_format,
                sample_rate,
                ..
            } => {
                self.handle_start(session_id, client_endpoint, expected_format, sample_rate)
                    .await;
            }

            ControlMessage::SessionEnd {
                session_id, reason, ..
            } => {
                self.handle_end(session_id, reason);
            }

            ControlMessage::Subtitle {
                session_id,
                subtitle,
            } => {
                let Some(session) = self.registry.lookup(&session_id) else {
                    warn!("subtitle for unknown session {}", session_id);
                    return;
                };
                if session
                    .inbound_tx
                    .try_send(InboundItem::Subtitle(subtitle))
                    .is_err()
                {
                    warn!("session {}: subtitle queue full", session_id);
                }
            }

            // Receiver-emitted kinds looping back are noise
            other => {
                warn!("negotiator: ignoring {:?}", other.session_id());
            }
        }
    }

    async fn handle_start(
        &self,
        session_id: String,
        client_endpoint: String,
        format: AudioFormat,
        sample_rate: u32,
    ) {
        let endpoint: Option<SocketAddr> = client_endpoint.parse().ok();
        let ready = protocol::valid_session_id(&session_id) && endpoint.is_some();

        if let Some(endpoint) = endpoint.filter(|_| ready) {
            self.registry.register(
                &session_id,
                endpoint,
                format,
                sample_rate,
                self.clock.now_ms(),
            );
        } else {
            warn!(
                "rejecting SESSION_START for {:?} (endpoint {:?})",
                session_id, client_endpoint
            );
        }

        let reply = ControlMessage::SessionReady {
            session_id,
            receiver_ready: ready,
            udp_endpoint: self.udp_endpoint.to_string(),
            buffer_size_ms: self.suggested_buffer_ms,
        };
        if self.outbound.send(reply).await.is_err() {
            warn!("negotiator: outbound channel closed");
        }
    }

    fn handle_end(&self, session_id: String, reason: EndReason) {
        let Some(session) = self.registry.lookup(&session_id) else {
            info!("SESSION_END for unknown session {} (no-op)", session_id);
            return;
        };

        info!("session {}: end requested ({:?})", session_id, reason);
        session.set_state(SessionState::Draining);

        let registry = Arc::clone(&self.registry);
        let outbound = self.outbound.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            // Give the buffer its grace period to empty; a stuck sink does
            // not hold the control plane hostage.
            let wait = async {
                while session.state() != SessionState::Terminated {
                    tokio::time::sleep(DRAIN_POLL).await;
                }
            };
            let _ = tokio::time::timeout(DRAIN_GRACE, shutdown.select(wait)).await;

            if let Some(statistics) = registry.deregister(&session_id) {
                let _ = outbound
                    .send(ControlMessage::SessionEnded {
                        session_id,
                        statistics,
                    })
                    .await;
            }
        });
    }

    async fn publish_conditions(&self) {
        for session in self.registry.snapshot() {
            if session.state() != SessionState::Active {
                continue;
            }
            let msg = ControlMessage::NetworkReport {
                session_id: session.id().to_string(),
                conditions: session.condition(),
            };
            if self.outbound.send(msg).await.is_err() {
                return;
            }
        }
    }
}
