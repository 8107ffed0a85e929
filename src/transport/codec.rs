//! Delimiter-based framing.
//!
//! Each envelope is written as its JSON encoding followed by [`DELIMITER`].
//! The decoder scans the inbound byte stream for the delimiter and yields the
//! raw frame bytes; JSON decoding is left to the dispatcher so that a
//! malformed frame can be dropped without tearing the stream down.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::transport::message::Envelope;
use crate::utils::MqError;

/// Reserved frame terminator. Never occurs unescaped inside an encoded envelope.
pub const DELIMITER: &[u8] = b"~@~";

/// Default upper bound for a single frame, delimiter excluded.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 65535;

#[derive(Debug, Clone)]
pub struct DelimiterCodec {
    max_frame_length: usize,
    /// Offset up to which the buffer is known not to contain a delimiter.
    next_index: usize,
}

impl DelimiterCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            next_index: 0,
        }
    }

    fn find_delimiter(&self, buf: &[u8]) -> Option<usize> {
        let start = self.next_index.saturating_sub(DELIMITER.len() - 1);
        buf[start..]
            .windows(DELIMITER.len())
            .position(|w| w == DELIMITER)
            .map(|pos| start + pos)
    }
}

impl Default for DelimiterCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for DelimiterCodec {
    type Item = Bytes;
    type Error = MqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, MqError> {
        match self.find_delimiter(src) {
            Some(at) => {
                self.next_index = 0;
                if at > self.max_frame_length {
                    return Err(MqError::Frame(format!(
                        "frame of {at} bytes exceeds limit {}",
                        self.max_frame_length
                    )));
                }
                let frame = src.split_to(at).freeze();
                src.advance(DELIMITER.len());
                Ok(Some(frame))
            }
            None => {
                if src.len() > self.max_frame_length + DELIMITER.len() {
                    return Err(MqError::Frame(format!(
                        "no delimiter within {} bytes",
                        self.max_frame_length
                    )));
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }
}

/// Serialize `envelope` into one frame payload, delimiter not included.
///
/// A `~` inside a JSON string is written as the escape `\u007e` whenever the
/// payload would otherwise contain [`DELIMITER`]; decoding restores it.
/// Payloads longer than `max_frame_length` are refused.
pub fn encode_payload(envelope: &Envelope, max_frame_length: usize) -> Result<Bytes, MqError> {
    let mut json = serde_json::to_vec(envelope)?;
    if contains_delimiter(&json) {
        json = escape_tildes(&json);
    }
    if json.len() > max_frame_length {
        return Err(MqError::Frame(format!(
            "envelope {} is {} bytes, limit {}",
            envelope.trace_id,
            json.len(),
            max_frame_length
        )));
    }
    Ok(Bytes::from(json))
}

fn contains_delimiter(buf: &[u8]) -> bool {
    buf.windows(DELIMITER.len()).any(|w| w == DELIMITER)
}

// `~` is never structural JSON and never part of a multi-byte UTF-8
// sequence, so every occurrence sits inside a string literal.
fn escape_tildes(json: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(json.len() + 16);
    for &b in json {
        if b == b'~' {
            out.extend_from_slice(br"\u007e");
        } else {
            out.push(b);
        }
    }
    out
}

impl Encoder<Envelope> for DelimiterCodec {
    type Error = MqError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), MqError> {
        let payload = encode_payload(&item, self.max_frame_length)?;
        Encoder::<Bytes>::encode(self, payload, dst)
    }
}

/// Writes a payload already produced by [`encode_payload`].
impl Encoder<Bytes> for DelimiterCodec {
    type Error = MqError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), MqError> {
        if payload.len() > self.max_frame_length || contains_delimiter(&payload) {
            return Err(MqError::Frame(format!(
                "refusing unframeable payload of {} bytes",
                payload.len()
            )));
        }
        dst.reserve(payload.len() + DELIMITER.len());
        dst.put_slice(&payload);
        dst.put_slice(DELIMITER);
        Ok(())
    }
}
