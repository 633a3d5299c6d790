//! Control-plane messages
//!
//! Session lifecycle runs over a reliable pub/sub channel owned by the outer
//! system; this module only defines the JSON message set and leaves the
//! transport to the broker client. Messages are tagged by a `type` field:
//!
//! ```json
//! {"type":"SESSION_START","session_id":"abc","audio_stream_port":8001,
//!  "client_endpoint":"10.0.0.5:40000","expected_format":"pcm",
//!  "sample_rate":44100}
//! ```

use serde::{Deserialize, Serialize};

use crate::pipeline::sync::NetworkCondition;
use crate::pipeline::types::SubtitleData;
use crate::protocol::AudioFormat;
use crate::session::SessionStats;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    Completed,
    Error,
    Timeout,
    ClientDisconnect,
}

/// Everything that crosses the control plane, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Broker → receiver: negotiate a new stream.
    SessionStart {
        session_id: String,
        audio_stream_port: u16,
        /// `host:port` the datagrams will come from.
        client_endpoint: String,
        expected_format: AudioFormat,
        sample_rate: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_duration_ms: Option<u64>,
    },

    /// Receiver → broker: ready to take datagrams.
    SessionReady {
        session_id: String,
        receiver_ready: bool,
        /// `host:port` the receiver is listening on.
        udp_endpoint: String,
        buffer_size_ms: u32,
    },

    /// Broker → receiver: stop the stream.
    SessionEnd {
        session_id: String,
        reason: EndReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        statistics: Option<SessionStats>,
    },

    /// Receiver → broker: confirmation with final statistics.
    SessionEnded {
        session_id: String,
        statistics: SessionStats,
    },

    /// Broker → receiver: a subtitle record for a running session. The UDP
    /// wire format carries no subtitle field; text rides the reliable path.
    Subtitle {
        session_id: String,
        #[serde(flatten)]
        subtitle: SubtitleData,
    },

    /// Receiver → broker: optional periodic condition report.
    NetworkReport {
        session_id: String,
        conditions: NetworkCondition,
    },
}

impl ControlMessage {
    pub fn session_id(&self) -> &str {
        match self {
            ControlMessage::SessionStart { session_id, .. }
            | ControlMessage::SessionReady { session_id, .. }
            | ControlMessage::SessionEnd { session_id, .. }
            | ControlMessage::SessionEnded { session_id, .. }
            | ControlMessage::Subtitle { session_id, .. }
            | ControlMessage::NetworkReport { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_start_json_shape() {
        let json = r#"{
            "type": "SESSION_START",
            "session_id": "abc",
            "audio_stream_port": 8001,
            "client_endpoint": "10.0.0.5:40000",
            "expected_format": "pcm",
            "sample_rate": 44100
        }"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        match msg {
            ControlMessage::SessionStart {
                session_id,
                expected_format,
                sample_rate,
                estimated_duration_ms,
                ..
            } => {
                assert_eq!(session_id, "abc");
                assert_eq!(expected_format, AudioFormat::Pcm);
                assert_eq!(sample_rate, 44_100);
                assert!(estimated_duration_ms.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_ready_roundtrip() {
        let msg = ControlMessage::SessionReady {
            session_id: "abc".to_string(),
            receiver_ready: true,
            udp_endpoint: "0.0.0.0:8001".to_string(),
            buffer_size_ms: 100,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"SESSION_READY""#));
        assert_eq!(serde_json::from_str::<ControlMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn test_end_reason_wire_names() {
        let msg = ControlMessage::SessionEnd {
            session_id: "abc".to_string(),
            reason: EndReason::ClientDisconnect,
            statistics: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""reason":"CLIENT_DISCONNECT""#));
    }

    #[test]
    fn test_subtitle_fields_flattened() {
        let json = r#"{
            "type": "SUBTITLE",
            "session_id": "abc",
            "text": "hello",
            "start_ms": 0,
            "end_ms": 500
        }"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        match msg {
            ControlMessage::Subtitle { subtitle, .. } => {
                assert_eq!(subtitle.text, "hello");
                assert_eq!(subtitle.end_ms, 500);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
