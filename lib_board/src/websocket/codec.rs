//! # Frame Codec
//!
//! RFC 6455 framing for the upgraded transport. Outbound frames are always
//! final and unmasked. Inbound frames are decoded one at a time from a byte
//! buffer; the caller owns the buffer and advances it by the consumed length.
//!
//! Extended lengths use the 16-bit form up to 65,535 bytes and the 8-byte form
//! above that, of which only the low 32 bits are honoured. Anything longer
//! than the configured ceiling is refused in both directions.

use base64::{Engine, prelude::BASE64_STANDARD};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::error::ProtocolError;

/// Fixed GUID appended to the client key during the opening handshake.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Payload ceiling of the reference deployment.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 65_535;

const FIN_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_MASK: u8 = 0x7F;
const LENGTH_16: u8 = 126;
const LENGTH_64: u8 = 127;

/// Derives the `Sec-WebSocket-Accept` value for a client handshake key.
pub fn compute_handshake_accept(request_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(request_key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

/// A decoded data frame. `payload` is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub mask_key: Option<[u8; 4]>,
    pub payload_length: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    /// The payload as text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Result of decoding one frame from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A text or binary frame ready for the application.
    Frame(Frame),
    /// The peer asked to tear the connection down.
    Close,
    /// Control frame, unknown opcode or undecodable text; already logged.
    Skipped,
    /// Header announced more than the ceiling. Only the header was consumed;
    /// the caller must discard `payload_length` further bytes.
    Oversized { payload_length: u64 },
}

/// Encoder/decoder bound to one payload ceiling.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_message_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LENGTH)
    }
}

impl FrameCodec {
    pub fn new(max_message_length: usize) -> Self {
        Self { max_message_length }
    }

    pub fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    /// Builds a final, unmasked frame. Fails before producing any bytes if
    /// the payload is over the ceiling.
    pub fn encode(&self, payload: &[u8], opcode: Opcode) -> Result<Vec<u8>, ProtocolError> {
        self.build(payload, opcode, None)
    }

    /// Builds a final frame masked with `mask_key`, as a client would send it.
    pub fn encode_masked(
        &self,
        payload: &[u8],
        opcode: Opcode,
        mask_key: [u8; 4],
    ) -> Result<Vec<u8>, ProtocolError> {
        self.build(payload, opcode, Some(mask_key))
    }

    fn build(
        &self,
        payload: &[u8],
        opcode: Opcode,
        mask_key: Option<[u8; 4]>,
    ) -> Result<Vec<u8>, ProtocolError> {
        let len = payload.len();
        if len > self.max_message_length || u32::try_from(len).is_err() {
            return Err(ProtocolError::PayloadTooLarge {
                size: len as u64,
                max: self.max_message_length,
            });
        }

        let mask_flag = if mask_key.is_some() { MASK_BIT } else { 0 };
        let mut frame = Vec::with_capacity(header_len_for(len) + 4 + len);
        frame.push(FIN_BIT | opcode.as_u8());

        if len <= 125 {
            frame.push(mask_flag | len as u8);
        } else if len <= 65_535 {
            frame.push(mask_flag | LENGTH_16);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(mask_flag | LENGTH_64);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match mask_key {
            Some(key) => {
                frame.extend_from_slice(&key);
                frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
            }
            None => frame.extend_from_slice(payload),
        }

        Ok(frame)
    }

    /// Decodes the first frame in `buf`.
    ///
    /// Returns `None` when more bytes are needed, otherwise the decoded frame
    /// and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Option<(Decoded, usize)> {
        if buf.len() < 2 {
            return None;
        }

        let fin = buf[0] & FIN_BIT != 0;
        let raw_opcode = buf[0] & OPCODE_MASK;
        let masked = buf[1] & MASK_BIT != 0;
        let base_len = buf[1] & LENGTH_MASK;

        let (payload_length, mut offset) = match base_len {
            LENGTH_16 => {
                let bytes = buf.get(2..4)?;
                (u64::from(u16::from_be_bytes([bytes[0], bytes[1]])), 4)
            }
            LENGTH_64 => {
                let bytes = buf.get(2..10)?;
                let high = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let low = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                if high != 0 {
                    // 64-bit lengths are not supported; report the full value.
                    let full = (u64::from(high) << 32) | u64::from(low);
                    return Some((Decoded::Oversized { payload_length: full }, 10));
                }
                (u64::from(low), 10)
            }
            n => (u64::from(n), 2),
        };

        let mask_key = if masked {
            let key = buf.get(offset..offset + 4)?;
            offset += 4;
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        if payload_length > self.max_message_length as u64 {
            return Some((Decoded::Oversized { payload_length }, offset));
        }

        let end = offset + payload_length as usize;
        if buf.len() < end {
            return None;
        }

        let Some(opcode) = Opcode::from_u8(raw_opcode) else {
            warn!("Dropping frame with unexpected opcode {:#x}", raw_opcode);
            return Some((Decoded::Skipped, end));
        };

        match opcode {
            Opcode::Close => {
                debug!("Received close frame");
                return Some((Decoded::Close, end));
            }
            Opcode::Ping => {
                debug!("Received ping, not answering");
                return Some((Decoded::Skipped, end));
            }
            Opcode::Pong => return Some((Decoded::Skipped, end)),
            Opcode::Text | Opcode::Binary => {}
        }

        if !fin {
            warn!("Received a fragmented frame; processing the fragment on its own");
        }
        if !masked {
            warn!("Received an unmasked frame from the client");
        }

        let mut payload = buf[offset..end].to_vec();
        if let Some(key) = mask_key {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        if opcode == Opcode::Text && std::str::from_utf8(&payload).is_err() {
            warn!("Dropping text frame whose payload is not valid UTF-8");
            return Some((Decoded::Skipped, end));
        }

        Some((
            Decoded::Frame(Frame {
                fin,
                opcode,
                masked,
                mask_key,
                payload_length,
                payload,
            }),
            end,
        ))
    }
}

fn header_len_for(len: usize) -> usize {
    match len {
        0..=125 => 2,
        126..=65_535 => 4,
        _ => 10,
    }
}
