//! Downstream event surface
//!
//! The core never talks to a sound card or a display. It emits typed events
//! on two channels and external sinks (platform audio, OBS text source,
//! overlay, toast) subscribe to whichever they need. The capability set is
//! deliberately narrow: play a buffer at a deadline, show text, hide text.
//!
//! Backpressure: the playout stage sends with `try_send`. A full channel is
//! the sink saying "busy"; the pending event is kept and retried on the
//! next tick, at most 5 ms later, without reordering.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::AudioFormat;

/// Audio-side events
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// Deliver this buffer to the audio device. `deadline_ms` is the
    /// local-clock instant the audio was scheduled for; late delivery shows
    /// up as the difference against the receiver clock.
    Play {
        session_id: String,
        payload: Bytes,
        format: AudioFormat,
        sample_rate: u32,
        deadline_ms: u64,
        sequence: u32,
        /// Emitted behind a higher sequence; the sink may skip it.
        out_of_order: bool,
    },

    /// The buffer ran dry mid-session. The sink decides whether to insert
    /// silence or conceal.
    Underrun { session_id: String },

    /// The session's buffer finished draining; no further `Play` events for
    /// this session will follow.
    Drain { session_id: String },
}

/// Subtitle-side events. The core never persists text.
#[derive(Debug, Clone)]
pub enum SubtitleEvent {
    Show {
        session_id: String,
        text: String,
        /// The cue was already overdue when scheduled.
        late: bool,
    },
    Hide {
        session_id: String,
        text: String,
        late: bool,
    },
}

/// Sending half of the event surface, held by the playout stage
#[derive(Debug, Clone)]
pub struct EventBus {
    pub sink_tx: mpsc::Sender<SinkEvent>,
    pub subtitle_tx: mpsc::Sender<SubtitleEvent>,
}

/// Receiving half, handed to the embedder
#[derive(Debug)]
pub struct EventReceivers {
    pub sink_rx: mpsc::Receiver<SinkEvent>,
    pub subtitle_rx: mpsc::Receiver<SubtitleEvent>,
}

impl EventBus {
    /// Create the bus and its subscriber ends.
    pub fn channel(capacity: usize) -> (EventBus, EventReceivers) {
        let (sink_tx, sink_rx) = mpsc::channel(capacity);
        let (subtitle_tx, subtitle_rx) = mpsc::channel(capacity);
        (
            EventBus {
                sink_tx,
                subtitle_tx,
            },
            EventReceivers {
                sink_rx,
                subtitle_rx,
            },
        )
    }
}

impl SinkEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SinkEvent::Play { session_id, .. }
            | SinkEvent::Underrun { session_id }
            | SinkEvent::Drain { session_id } => session_id,
        }
    }
}
