//! Signaling Codec
//!
//! JSON wire format:
//! `{ "type": ..., "roomId": ..., "from": ..., "to"?: ..., "payload"?: ... }`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::*;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("failed to encode {kind}: {source}")]
pub struct EncodeError {
    kind: String,
    #[source]
    source: serde_json::Error,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    room_id: String,
    from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

/// Encode an envelope to its JSON text form
pub fn encode(envelope: &Envelope) -> Result<String, EncodeError> {
    let message = &envelope.message;
    let payload = payload_of(message).map_err(|source| EncodeError {
        kind: message.kind().to_string(),
        source,
    })?;
    let raw = RawEnvelope {
        kind: message.kind().to_string(),
        room_id: envelope.room_id.clone(),
        from: envelope.from.clone(),
        to: envelope.to.clone(),
        payload,
    };
    serde_json::to_string(&raw).map_err(|source| EncodeError {
        kind: message.kind().to_string(),
        source,
    })
}

/// Decode an envelope. Unknown `type` values decode to [`SignalMessage::Unknown`].
pub fn decode(bytes: impl AsRef<[u8]>) -> Result<Envelope, DecodeError> {
    let raw: RawEnvelope =
        serde_json::from_slice(bytes.as_ref()).map_err(DecodeError::Malformed)?;
    let message = message_from(&raw.kind, raw.payload)?;
    Ok(Envelope {
        room_id: raw.room_id,
        from: raw.from,
        to: raw.to,
        message,
    })
}

fn payload_of(message: &SignalMessage) -> Result<Value, serde_json::Error> {
    match message {
        SignalMessage::Offer(p) | SignalMessage::Answer(p) => serde_json::to_value(p),
        SignalMessage::IceCandidate(p) => serde_json::to_value(p),
        SignalMessage::Chunk(p) => serde_json::to_value(p),
        SignalMessage::PlaybackPlay(p) => serde_json::to_value(p),
        SignalMessage::PlaybackPause(p) | SignalMessage::PlaybackSeek(p) => {
            serde_json::to_value(p)
        }
        SignalMessage::MediaSelected(p) => serde_json::to_value(p),
        SignalMessage::StateSnapshot(p) => serde_json::to_value(p),
        SignalMessage::Chat(p) => serde_json::to_value(p),
        SignalMessage::VoiceState(p) => serde_json::to_value(p),
        SignalMessage::StateSnapshotRequest | SignalMessage::VoiceJoin | SignalMessage::VoiceLeave => {
            Ok(Value::Null)
        }
        SignalMessage::Unknown { payload, .. } => Ok(payload.clone()),
    }
}

fn message_from(kind: &str, payload: Value) -> Result<SignalMessage, DecodeError> {
    let invalid = |source| DecodeError::Payload {
        kind: kind.to_string(),
        source,
    };
    let message = match kind {
        "offer" => SignalMessage::Offer(serde_json::from_value(payload).map_err(invalid)?),
        "answer" => SignalMessage::Answer(serde_json::from_value(payload).map_err(invalid)?),
        "ice-candidate" => {
            SignalMessage::IceCandidate(serde_json::from_value(payload).map_err(invalid)?)
        }
        "chunk" => SignalMessage::Chunk(serde_json::from_value(payload).map_err(invalid)?),
        "playback-play" => {
            SignalMessage::PlaybackPlay(serde_json::from_value(payload).map_err(invalid)?)
        }
        "playback-pause" => {
            SignalMessage::PlaybackPause(serde_json::from_value(payload).map_err(invalid)?)
        }
        "playback-seek" => {
            SignalMessage::PlaybackSeek(serde_json::from_value(payload).map_err(invalid)?)
        }
        "media-selected" => {
            SignalMessage::MediaSelected(serde_json::from_value(payload).map_err(invalid)?)
        }
        "state-snapshot-request" => SignalMessage::StateSnapshotRequest,
        "state-snapshot" => {
            SignalMessage::StateSnapshot(serde_json::from_value(payload).map_err(invalid)?)
        }
        "chat" => SignalMessage::Chat(serde_json::from_value(payload).map_err(invalid)?),
        "voice-join" => SignalMessage::VoiceJoin,
        "voice-leave" => SignalMessage::VoiceLeave,
        "voice-state" => {
            SignalMessage::VoiceState(serde_json::from_value(payload).map_err(invalid)?)
        }
        other => SignalMessage::Unknown {
            kind: other.to_string(),
            payload,
        },
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{MediaDescriptor, MediaKind};

    #[test]
    fn test_wire_names() {
        let env = Envelope::new(
            "ABCD2345",
            "alice",
            Some("bob".into()),
            SignalMessage::IceCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }),
        );
        let json: Value = serde_json::from_str(&encode(&env).unwrap()).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["roomId"], "ABCD2345");
        assert_eq!(json["to"], "bob");
        assert_eq!(json["payload"]["sdpMid"], "0");
        assert_eq!(json["payload"]["sdpMLineIndex"], 0);

        let decoded = decode(json.to_string()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_broadcast_without_payload() {
        let env = Envelope::new("R", "bob", None, SignalMessage::StateSnapshotRequest);
        let text = encode(&env).unwrap();
        assert!(!text.contains("\"to\""));
        assert!(!text.contains("payload"));
        assert_eq!(decode(&text).unwrap().message, SignalMessage::StateSnapshotRequest);
    }

    #[test]
    fn test_decode_from_foreign_client() {
        let text = r#"{
            "type": "media-selected",
            "roomId": "R",
            "from": "alice",
            "payload": {"descriptor": {"kind": "file", "name": "movie.mp4", "size": 50000000, "locator": "m1"}}
        }"#;
        match decode(text).unwrap().message {
            SignalMessage::MediaSelected(p) => {
                assert_eq!(p.descriptor.kind, MediaKind::File);
                assert_eq!(p.descriptor, MediaDescriptor::file("movie.mp4", 50_000_000, "m1"));
                assert_eq!(p.at_timestamp, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let text = r#"{"type":"chunk","roomId":"R","from":"alice",
            "payload":{"mediaItemId":"m1","sequence":3,"totalChunks":4,"bytesBase64":"AAEC"}}"#;
        match decode(text).unwrap().message {
            SignalMessage::Chunk(c) => {
                assert_eq!(c.sequence, 3);
                assert_eq!(c.total_size, None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let text = r#"{"type":"reaction","roomId":"R","from":"bob","payload":{"emoji":"🎉"}}"#;
        let env = decode(text).unwrap();
        match &env.message {
            SignalMessage::Unknown { kind, payload } => {
                assert_eq!(kind, "reaction");
                assert_eq!(payload["emoji"], "🎉");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        // Forwarded unchanged
        let again: Value = serde_json::from_str(&encode(&env).unwrap()).unwrap();
        assert_eq!(again["type"], "reaction");
        assert_eq!(again["payload"]["emoji"], "🎉");
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"type":"offer","from":"a"}"#),
            Err(DecodeError::Malformed(_))
        ));
        match decode(r#"{"type":"playback-play","roomId":"R","from":"a","payload":{"positionSeconds":1.0}}"#) {
            Err(DecodeError::Payload { kind, .. }) => assert_eq!(kind, "playback-play"),
            other => panic!("expected payload error, got {other:?}"),
        }
    }
}
