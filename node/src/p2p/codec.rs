use std::io;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::p2p::messages::RpcMessage;

/// Byte terminating every frame on the wire.
pub const FRAME_DELIMITER: u8 = b'|';

/// Upper bound on a single buffered frame; a full-chain inventory fits well
/// under this, anything larger is a broken or hostile peer.
const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// One frame is `json({"msg": base64(json(payload))}) + '|'`. The delimiter
/// lets a reader recover message boundaries when frames coalesce or split
/// across reads; base64 keeps the delimiter out of the envelope body.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    msg: String,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid envelope or payload JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Splits the byte stream into delimiter-bounded segments and writes framed
/// envelopes. Payload decoding is left to [`decode_payload`] so a malformed
/// segment can be dropped without tearing the connection down.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, io::Error> {
        if let Some(position) = src.iter().position(|&byte| byte == FRAME_DELIMITER) {
            let mut frame = src.split_to(position + 1);
            frame.truncate(position);
            return Ok(Some(frame));
        }
        if src.len() > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unterminated frame exceeds maximum size",
            ));
        }
        Ok(None)
    }
}

impl Encoder<RpcMessage> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, message: RpcMessage, dst: &mut BytesMut) -> Result<(), io::Error> {
        let payload = serde_json::to_vec(&message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let envelope = Envelope {
            msg: BASE64.encode(payload),
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        dst.reserve(bytes.len() + 1);
        dst.put_slice(&bytes);
        dst.put_u8(FRAME_DELIMITER);
        Ok(())
    }
}

/// Unwrap one delimiter-free segment into an RPC message.
pub fn decode_payload(segment: &[u8]) -> Result<RpcMessage, FrameError> {
    let envelope: Envelope = serde_json::from_slice(segment)?;
    let raw = BASE64.decode(envelope.msg.as_bytes())?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: RpcMessage) -> BytesMut {
        let mut buffer = BytesMut::new();
        FrameCodec.encode(message, &mut buffer).unwrap();
        buffer
    }

    #[test]
    fn round_trip() {
        let message = RpcMessage::GetLastBlock {
            latest_block_height: 7,
        };
        let mut buffer = encode(message.clone());
        let segment = FrameCodec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decode_payload(&segment).unwrap(), message);
        assert!(buffer.is_empty());
    }

    #[test]
    fn coalesced_frames_split_cleanly() {
        let first = RpcMessage::GetLastBlock {
            latest_block_height: 1,
        };
        let second = RpcMessage::ListLastBlocks {
            last_block_height: 2,
        };
        let mut buffer = encode(first.clone());
        buffer.extend_from_slice(&encode(second.clone()));

        let mut codec = FrameCodec;
        let a = codec.decode(&mut buffer).unwrap().unwrap();
        let b = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decode_payload(&a).unwrap(), first);
        assert_eq!(decode_payload(&b).unwrap(), second);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let encoded = encode(RpcMessage::End {
            server_address: ("127.0.0.1".to_string(), 13337),
        });
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::from(&encoded[..encoded.len() / 2]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&encoded[encoded.len() / 2..]);
        assert!(codec.decode(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn malformed_segment_is_reported_not_fatal() {
        let mut buffer = BytesMut::from(&b"{not json|"[..]);
        let segment = FrameCodec.decode(&mut buffer).unwrap().unwrap();
        assert!(decode_payload(&segment).is_err());
    }

    #[test]
    fn unknown_verb_is_reported() {
        let payload = BASE64.encode(br#"{"launchMissiles":{}}"#);
        let segment = format!(r#"{{"msg":"{payload}"}}"#);
        assert!(decode_payload(segment.as_bytes()).is_err());
    }
}
