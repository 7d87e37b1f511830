use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::ProgressEvent;

/// Maximum size of a single event frame (64 KB)
const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Server-Sent Events codec for progress events
///
/// Wire format (one event per frame):
/// ```text
/// event: progress
/// data: {"step":1,"message":"...","status":"in_progress","simulated":false}
/// <blank line>
/// ```
///
/// The decoder ignores comment lines (starting with `:`) and fields other than `data`,
/// and joins multiple `data` lines with `\n` as the SSE grammar prescribes.
#[derive(Debug, Default)]
pub struct SseCodec {
    _private: (),
}

impl SseCodec {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

/// Locate the end of the next frame, returning (payload_end, frame_end)
fn find_frame_end(src: &[u8]) -> Option<(usize, usize)> {
    for i in 0..src.len() {
        if src[i..].starts_with(b"\n\n") {
            return Some((i, i + 2));
        }
        if src[i..].starts_with(b"\r\n\r\n") {
            return Some((i, i + 4));
        }
    }
    None
}

impl Decoder for SseCodec {
    type Item = ProgressEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some((payload_end, frame_end)) = find_frame_end(src) else {
                if src.len() > MAX_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge(src.len()));
                }
                return Ok(None);
            };

            if payload_end > MAX_FRAME_SIZE {
                return Err(CodecError::FrameTooLarge(payload_end));
            }

            let frame = src.split_to(frame_end);
            let text =
                std::str::from_utf8(&frame[..payload_end]).map_err(|_| CodecError::InvalidUtf8)?;

            let data = text
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect::<Vec<_>>()
                .join("\n");

            // Comment-only or keep-alive frames carry no data
            if data.is_empty() {
                continue;
            }

            return Ok(Some(serde_json::from_str(&data)?));
        }
    }
}

impl Encoder<ProgressEvent> for SseCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ProgressEvent, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;

        if json.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(json.len()));
        }

        // serde_json never emits raw newlines, so a single data line is enough
        dst.reserve(json.len() + 32);
        dst.put_slice(b"event: progress\ndata: ");
        dst.put_slice(&json);
        dst.put_slice(b"\n\n");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::EventStatus;

    fn event(step: u8, status: EventStatus) -> ProgressEvent {
        ProgressEvent {
            step,
            message: format!("step {step}"),
            status,
            simulated: false,
        }
    }

    #[test]
    fn test_encoded_frame_layout() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(event(1, EventStatus::InProgress), &mut buf)
            .unwrap();

        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with("event: progress\ndata: {"));
        assert!(text.ends_with("}\n\n"));
        assert!(text.contains(r#""status":"in_progress""#));
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(event(2, EventStatus::Success), &mut buf).unwrap();

        let full_len = buf.len();
        let mut partial = buf.split_to(full_len / 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, event(2, EventStatus::Success));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_skips_comments_and_handles_crlf() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::from(
            ": keep-alive\n\nretry: 1000\r\ndata: {\"step\":4,\"message\":\"m\",\"status\":\"failure\"}\r\n\r\n",
        );
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.step, 4);
        assert_eq!(decoded.status, EventStatus::Failure);
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut codec = SseCodec::new();
        let mut buf = BytesMut::from(vec![b'a'; MAX_FRAME_SIZE + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
