//! Playout stage
//!
//! One shared tick loop drives every session: drains the inbound queues into
//! the jitter buffers, releases chunks whose hold expired, services subtitle
//! heaps, runs buffer adaptation and walks sessions through draining to
//! termination. Ticks fire every 5 ms, comfortably inside the 10 ms
//! granularity the rest of the pipeline assumes.
//!
//! A full event channel is sink backpressure: the refused event is kept at
//! the head of a pending queue and everything behind it waits for the next
//! tick. Order is preserved, nothing is re-sorted around a busy sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;

use crate::events::{EventBus, SinkEvent, SubtitleEvent};
use crate::pipeline::clock::ReceiverClock;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::subtitles::SubtitleAction;
use crate::pipeline::types::InboundItem;
use crate::session::registry::SessionRegistry;
use crate::session::{PlayoutState, Session, SessionState};
use crate::shutdown::ShutdownSignal;

const TICK_INTERVAL: Duration = Duration::from_millis(5);

const STATS_LOG_INTERVAL_SECS: u64 = 30;

/// A sink refusing this many ticks in a row (~2 s) is session-fatal.
const SINK_BUSY_FATAL_TICKS: u32 = 400;

/// What came of pushing pending events at the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushStatus {
    Flushed,
    Busy,
    /// The subscriber dropped its receiver.
    SinkGone,
}

pub struct PlayoutStage {
    registry: Arc<SessionRegistry>,
    clock: ReceiverClock,
    bus: EventBus,
    shutdown: ShutdownSignal,
}

impl PlayoutStage {
    pub fn new(
        registry: Arc<SessionRegistry>,
        clock: ReceiverClock,
        bus: EventBus,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            registry,
            clock,
            bus,
            shutdown,
        }
    }

    /// One tick's worth of work for one session.
    fn service(&self, session: &Arc<Session>, now_ms: u64) {
        let mut playout = session.playout.lock().unwrap();

        // Read the lifecycle state before draining the queue: the receive
        // task enqueues the final chunk before it marks the session
        // draining, so this order guarantees the chunk is seen first.
        let session_draining = !session.state().is_live();

        // Ingest everything queued since the last tick. The baseline notice
        // always precedes the first chunk, so subtitles anchor in time.
        loop {
            match playout.inbound_rx.try_recv() {
                Ok(InboundItem::Baseline(audio_start)) => {
                    playout.subtitles.set_baseline(audio_start, now_ms);
                }
                Ok(InboundItem::Rebase(delta)) => playout.subtitles.rebase(delta),
                Ok(InboundItem::Subtitle(sub)) => playout.subtitles.schedule(&sub, now_ms),
                Ok(InboundItem::Chunk(chunk)) => {
                    if let Some(sub) = &chunk.subtitle {
                        playout.subtitles.schedule(sub, now_ms);
                    }
                    let condition = session.condition();
                    playout.jitter.insert(chunk, &condition, now_ms);
                }
                Err(_) => break,
            }
        }

        if session_draining && playout.jitter.state().is_live() {
            playout.jitter.begin_drain();
        }

        // Backpressure from a previous tick: retry, and only release more
        // once the backlog cleared.
        match self.flush_pending(&mut playout) {
            FlushStatus::Flushed => playout.consecutive_busy = 0,
            FlushStatus::Busy => {
                playout.consecutive_busy += 1;
                if playout.consecutive_busy == SINK_BUSY_FATAL_TICKS {
                    error!(
                        "session {}: sink refused for {} ticks, draining",
                        session.id(),
                        SINK_BUSY_FATAL_TICKS
                    );
                    session.set_state(SessionState::Draining);
                }
                return;
            }
            FlushStatus::SinkGone => {
                session.set_state(SessionState::Draining);
            }
        }

        let out = playout.jitter.tick(now_ms);
        for released in out.released {
            playout.played_audio_ms += released.chunk.duration_ms;
            let chunk = released.chunk;
            playout.pending_sink.push_back(SinkEvent::Play {
                session_id: chunk.session_id,
                payload: chunk.payload,
                format: chunk.format,
                sample_rate: chunk.sample_rate,
                deadline_ms: chunk.deadline_ms,
                sequence: chunk.sequence,
                out_of_order: released.out_of_order,
            });
        }
        if out.underrun {
            playout.pending_sink.push_back(SinkEvent::Underrun {
                session_id: session.id().to_string(),
            });
        }

        for cue in playout.subtitles.due(now_ms) {
            let event = match cue.action {
                SubtitleAction::Show => SubtitleEvent::Show {
                    session_id: session.id().to_string(),
                    text: cue.text,
                    late: cue.late,
                },
                SubtitleAction::Hide => SubtitleEvent::Hide {
                    session_id: session.id().to_string(),
                    text: cue.text,
                    late: cue.late,
                },
            };
            playout.pending_subtitles.push_back(event);
        }

        if out.drained && !playout.drain_emitted {
            playout.drain_emitted = true;
            playout.pending_sink.push_back(SinkEvent::Drain {
                session_id: session.id().to_string(),
            });
        }

        playout.jitter.adapt(now_ms, session.condition().jitter_ms);

        let _ = self.flush_pending(&mut playout);

        // Termination waits until the drain notice actually left the queue,
        // so `SESSION_ENDED` never races a trailing event.
        if playout.drain_emitted
            && !playout.drain_notified
            && playout.pending_sink.is_empty()
            && playout.pending_subtitles.is_empty()
        {
            playout.drain_notified = true;
            session.set_state(SessionState::Terminated);
            session.drained.notify_waiters();
            info!("session {}: drained", session.id());
        }
    }

    /// Push pending events at the sink. A closed audio sink is fatal for
    /// its sessions; a closed subtitle subscriber merely discards cues.
    fn flush_pending(&self, playout: &mut PlayoutState) -> FlushStatus {
        while let Some(event) = playout.pending_sink.front() {
            match self.bus.sink_tx.try_send(event.clone()) {
                Ok(()) => {
                    playout.pending_sink.pop_front();
                }
                Err(TrySendError::Full(_)) => return FlushStatus::Busy,
                Err(TrySendError::Closed(_)) => {
                    playout.pending_sink.clear();
                    return FlushStatus::SinkGone;
                }
            }
        }
        while let Some(event) = playout.pending_subtitles.front() {
            match self.bus.subtitle_tx.try_send(event.clone()) {
                Ok(()) => {
                    playout.pending_subtitles.pop_front();
                }
                Err(TrySendError::Full(_)) => return FlushStatus::Busy,
                Err(TrySendError::Closed(_)) => {
                    playout.pending_subtitles.clear();
                    break;
                }
            }
        }
        FlushStatus::Flushed
    }
}

#[async_trait]
impl PipelineStage for PlayoutStage {
    async fn run(&mut self) -> Result<()> {
        info!("PlayoutStage: started ({:?} ticks)", TICK_INTERVAL);

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_stats = Instant::now();

        loop {
            if self.shutdown.select(interval.tick()).await.is_none() {
                break;
            }

            let now_ms = self.clock.now_ms();
            for session in self.registry.snapshot() {
                self.service(&session, now_ms);
            }

            if last_stats.elapsed().as_secs() >= STATS_LOG_INTERVAL_SECS {
                info!("PlayoutStage: {} live sessions", self.registry.len());
                last_stats = Instant::now();
            }
        }

        info!("PlayoutStage: finished");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "PlayoutStage"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JitterConfig, MemoryConfig, SubtitleConfig};
    use crate::pipeline::types::{SubtitleData, TimedChunk};
    use crate::protocol::AudioFormat;
    use bytes::Bytes;

    fn setup(capacity: usize) -> (PlayoutStage, Arc<SessionRegistry>, crate::events::EventReceivers) {
        let registry = Arc::new(SessionRegistry::new(
            JitterConfig::default(),
            &MemoryConfig::default(),
            SubtitleConfig::default(),
        ));
        let (bus, receivers) = EventBus::channel(capacity);
        let stage = PlayoutStage::new(
            Arc::clone(&registry),
            ReceiverClock::new(),
            bus,
            ShutdownSignal::new(),
        );
        (stage, registry, receivers)
    }

    fn chunk(session: &str, seq: u32, deadline_ms: u64) -> TimedChunk {
        TimedChunk {
            session_id: session.to_string(),
            payload: Bytes::from(vec![0u8; 40]),
            format: AudioFormat::Pcm,
            sample_rate: 44_100,
            deadline_ms,
            duration_ms: 20.0,
            sequence: seq,
            subtitle: None,
            received_at_ms: 0,
            buffer_ms: 0,
        }
    }

    async fn feed(session: &Arc<Session>, item: InboundItem) {
        session.inbound_tx.send(item).await.unwrap();
    }

    #[tokio::test]
    async fn test_chunks_flow_to_sink_in_deadline_order() {
        let (stage, registry, mut rx) = setup(64);
        let session = registry.register(
            "s",
            "127.0.0.1:4000".parse().unwrap(),
            AudioFormat::Pcm,
            44_100,
            0,
        );

        feed(&session, InboundItem::Chunk(chunk("s", 2, 1_120))).await;
        feed(&session, InboundItem::Chunk(chunk("s", 1, 1_100))).await;

        // Inserted on one tick, released on a later one
        stage.service(&session, 1_000);
        stage.service(&session, 2_000);

        let mut seqs = Vec::new();
        while let Ok(ev) = rx.sink_rx.try_recv() {
            if let SinkEvent::Play { sequence, .. } = ev {
                seqs.push(sequence);
            }
        }
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_busy_sink_delays_without_reorder() {
        let (stage, registry, mut rx) = setup(1);
        let session = registry.register(
            "s",
            "127.0.0.1:4000".parse().unwrap(),
            AudioFormat::Pcm,
            44_100,
            0,
        );

        for seq in 1..=3u32 {
            feed(
                &session,
                InboundItem::Chunk(chunk("s", seq, 1_100 + seq as u64 * 20)),
            )
            .await;
        }
        stage.service(&session, 1_000);
        stage.service(&session, 2_000);

        // Channel holds one event; the rest are pending in order
        let mut seqs = Vec::new();
        loop {
            match rx.sink_rx.try_recv() {
                Ok(SinkEvent::Play { sequence, .. }) => {
                    seqs.push(sequence);
                    // Make room, then let the next tick retry
                    stage.service(&session, 2_000);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_draining_session_terminates_after_empty() {
        let (stage, registry, mut rx) = setup(64);
        let session = registry.register(
            "s",
            "127.0.0.1:4000".parse().unwrap(),
            AudioFormat::Pcm,
            44_100,
            0,
        );
        session.set_state(SessionState::Active);

        feed(&session, InboundItem::Chunk(chunk("s", 1, 1_100))).await;
        stage.service(&session, 1_000);

        session.set_state(SessionState::Draining);
        stage.service(&session, 2_000);

        assert_eq!(session.state(), SessionState::Terminated);
        let mut saw_drain = false;
        while let Ok(ev) = rx.sink_rx.try_recv() {
            if matches!(ev, SinkEvent::Drain { .. }) {
                saw_drain = true;
            }
        }
        assert!(saw_drain);

        // No further Play events after termination
        feed(&session, InboundItem::Chunk(chunk("s", 2, 3_100))).await;
        stage.service(&session, 4_000);
        assert!(
            !matches!(rx.sink_rx.try_recv(), Ok(SinkEvent::Play { .. })),
            "terminated session must not play"
        );
    }

    #[tokio::test]
    async fn test_subtitles_anchor_to_baseline() {
        let (stage, registry, mut rx) = setup(64);
        let session = registry.register(
            "s",
            "127.0.0.1:4000".parse().unwrap(),
            AudioFormat::Pcm,
            44_100,
            0,
        );

        feed(
            &session,
            InboundItem::Subtitle(SubtitleData {
                text: "hello".to_string(),
                start_ms: 0,
                end_ms: 500,
                tts_offset_ms: None,
                confidence: None,
            }),
        )
        .await;
        feed(&session, InboundItem::Baseline(1_500)).await;

        stage.service(&session, 1_000);
        assert!(rx.subtitle_rx.try_recv().is_err());

        stage.service(&session, 1_500);
        match rx.subtitle_rx.try_recv().unwrap() {
            SubtitleEvent::Show { text, late, .. } => {
                assert_eq!(text, "hello");
                assert!(!late);
            }
            other => panic!("expected show, got {:?}", other),
        }

        stage.service(&session, 2_000);
        assert!(matches!(
            rx.subtitle_rx.try_recv().unwrap(),
            SubtitleEvent::Hide { .. }
        ));
    }

    #[tokio::test]
    async fn test_rebase_shifts_pending_cues() {
        let (stage, registry, mut rx) = setup(64);
        let session = registry.register(
            "s",
            "127.0.0.1:4000".parse().unwrap(),
            AudioFormat::Pcm,
            44_100,
            0,
        );

        feed(&session, InboundItem::Baseline(2_000)).await;
        feed(
            &session,
            InboundItem::Subtitle(SubtitleData {
                text: "x".to_string(),
                start_ms: 0,
                end_ms: 500,
                tts_offset_ms: None,
                confidence: None,
            }),
        )
        .await;
        feed(&session, InboundItem::Rebase(100)).await;

        stage.service(&session, 1_000);
        // Originally due at 2_000; slewed to 2_100
        stage.service(&session, 2_050);
        assert!(rx.subtitle_rx.try_recv().is_err());
        stage.service(&session, 2_100);
        assert!(matches!(
            rx.subtitle_rx.try_recv().unwrap(),
            SubtitleEvent::Show { .. }
        ));
    }
}
