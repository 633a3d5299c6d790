//! Receive stage
//!
//! Sole owner of the data-plane socket. One datagram is one packet; each
//! iteration parses, attributes, validates the source address, updates the
//! session's sequence cursor and condition estimate, maps the packet onto
//! the local timeline and hands the resulting chunk to the session's inbound
//! queue. Nothing here blocks except the socket read.
//!
//! Everything that can go wrong with a single datagram is transient: it is
//! counted and the loop moves on. The only error that leaves this stage is a
//! socket failure, which is reported upward; re-binding is the embedder's
//! call.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;

use crate::pipeline::clock::ReceiverClock;
use crate::pipeline::health::ReceiverHealth;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::{InboundItem, TimedChunk};
use crate::protocol::{self, AudioPacket};
use crate::session::registry::SessionRegistry;
use crate::session::{Session, SessionState};
use crate::shutdown::ShutdownSignal;

/// Largest datagram the receive loop accepts.
const RECV_BUF_LEN: usize = 64 * 1024;

const STATS_LOG_INTERVAL_SECS: u64 = 30;

/// Sequence distances below this count as forward progress; the rest of the
/// u32 space is treated as behind the cursor (wrap-aware).
const SEQ_FORWARD_WINDOW: u32 = 0x8000_0000;

pub struct ReceiveStage {
    socket: Arc<UdpSocket>,
    registry: Arc<SessionRegistry>,
    clock: ReceiverClock,
    health: Arc<ReceiverHealth>,
    shutdown: ShutdownSignal,
}

impl ReceiveStage {
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<SessionRegistry>,
        clock: ReceiverClock,
        health: Arc<ReceiverHealth>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            socket,
            registry,
            clock,
            health,
            shutdown,
        }
    }

    fn handle_datagram(&self, datagram: &[u8], src: std::net::SocketAddr) {
        let pkt = match protocol::parse_packet(datagram) {
            Ok(pkt) => pkt,
            Err(e) => {
                self.health.record_malformed();
                debug!("malformed datagram from {}: {}", src, e);
                return;
            }
        };

        let Some(session) = self.registry.lookup(&pkt.session_id) else {
            self.health.record_unattributed();
            debug!("packet for unknown session {}", pkt.session_id);
            return;
        };

        if session.endpoint() != src {
            self.health.record_endpoint_mismatch();
            debug!(
                "session {}: source {} does not match registered {}",
                pkt.session_id,
                src,
                session.endpoint()
            );
            return;
        }

        let now_ms = self.clock.now_ms();
        session.touch(now_ms);
        if session.state() == SessionState::Pending {
            session.set_state(SessionState::Active);
            info!("session {}: first packet (seq {})", pkt.session_id, pkt.sequence);
        }

        self.ingest(&session, pkt, now_ms);
    }

    /// Sequence accounting, condition update and deadline computation for
    /// one attributed packet.
    fn ingest(&self, session: &Arc<Session>, pkt: AudioPacket, now_ms: u64) {
        let is_last = pkt.is_last;
        let payload_len = pkt.payload.len();

        let items = {
            let mut ingest = session.ingest.lock().unwrap();

            match ingest.expected_seq {
                None => {
                    ingest.expected_seq = Some(pkt.sequence.wrapping_add(1));
                }
                Some(expected) => {
                    let ahead = pkt.sequence.wrapping_sub(expected);
                    if ahead == 0 {
                        ingest.expected_seq = Some(pkt.sequence.wrapping_add(1));
                    } else if ahead < SEQ_FORWARD_WINDOW {
                        ingest.estimator.on_lost(ahead as u64);
                        ingest.expected_seq = Some(pkt.sequence.wrapping_add(1));
                    } else if pkt.sequence == expected.wrapping_sub(1) {
                        ingest.estimator.on_duplicate();
                        debug!(
                            "session {}: duplicate seq {}",
                            session.id(),
                            pkt.sequence
                        );
                        return;
                    } else {
                        // Behind the cursor but maybe still inside the
                        // buffer's window; the gap it fills stops counting
                        // as lost.
                        ingest.estimator.on_reordered();
                    }
                }
            }

            let declared = session.format().0;
            if pkt.format != declared {
                if ingest.format_mismatches == 0 {
                    warn!(
                        "session {}: declared format {} but packets carry {}",
                        session.id(),
                        declared,
                        pkt.format
                    );
                }
                ingest.format_mismatches += 1;
            }

            ingest.estimator.on_packet(&pkt, now_ms);
            let condition = ingest.estimator.condition(now_ms);
            session.set_condition(condition);

            let sched = ingest.sync.schedule(&pkt, &condition, now_ms);
            let rebase = ingest.sync.maybe_slew(&condition, now_ms);

            let mut items = Vec::with_capacity(3);
            if let Some(audio_start) = sched.baseline_established {
                items.push(InboundItem::Baseline(audio_start));
            }
            if let Some(delta) = rebase {
                items.push(InboundItem::Rebase(delta));
            }
            items.push(InboundItem::Chunk(TimedChunk {
                session_id: pkt.session_id,
                payload: pkt.payload,
                format: pkt.format,
                sample_rate: pkt.sample_rate,
                deadline_ms: sched.deadline_ms,
                duration_ms: sched.duration_ms,
                sequence: pkt.sequence,
                subtitle: None,
                received_at_ms: now_ms,
                buffer_ms: 0,
            }));
            items
        };

        self.health.record_accepted(payload_len);
        for item in items {
            if session.inbound_tx.try_send(item).is_err() {
                self.health.record_memory_pressure();
                debug!("session {}: inbound queue full, chunk dropped", session.id());
                break;
            }
        }

        if is_last {
            session.set_state(SessionState::Draining);
            info!("session {}: last packet seen, draining", session.id());
        }
    }
}

#[async_trait]
impl PipelineStage for ReceiveStage {
    async fn run(&mut self) -> Result<()> {
        let local = self.socket.local_addr()?;
        info!("ReceiveStage: listening on {}", local);

        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut last_stats = Instant::now();

        loop {
            let Some(received) = self.shutdown.select(self.socket.recv_from(&mut buf)).await
            else {
                break;
            };

            match received {
                Ok((len, src)) => self.handle_datagram(&buf[..len], src),
                Err(e) => {
                    self.health.record_socket_error();
                    error!("ReceiveStage: socket error: {}", e);
                    return Err(e.into());
                }
            }

            if last_stats.elapsed().as_secs() >= STATS_LOG_INTERVAL_SECS {
                info!("ReceiveStage: {}", self.health.summary());
                last_stats = Instant::now();
            }
        }

        info!("ReceiveStage: finished ({})", self.health.summary());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ReceiveStage"
    }
}
