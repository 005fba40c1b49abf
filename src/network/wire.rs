//! Binary wire codec for peer-to-peer messages.
//!
//! The peer channel is unreliable and unordered, so every datagram is
//! self-contained: a 1-byte tag followed by a fixed per-tag layout, all
//! integers big-endian. Input bundles repeat a `(u32 frame, u16 index,
//! varint action)` triple up to the configured redundancy count. The digest
//! frame is exactly 13 bytes.
//!
//! | Tag  | Name             | Payload                                  |
//! |------|------------------|------------------------------------------|
//! | 0x01 | Input bundle     | repeated (frame, index, action) triples  |
//! | 0x02 | Ping             | u64 timestamp (ms)                       |
//! | 0x03 | Pong             | original ping timestamp                  |
//! | 0x04 | Keepalive        | —                                        |
//! | 0x05 | Episode end      | u32 final frame                          |
//! | 0x06 | Episode ready    | u32 seed, u32 start frame                |
//! | 0x07 | Frame digest     | u32 frame, 8 digest bytes                |
//!
//! Unknown tags are a protocol violation: the decoder rejects them and the
//! session ends rather than guessing.

use std::error::Error;
use std::fmt;

use crate::network::messages::{InputBundle, InputFrame, PeerMessage};
use crate::{Action, Digest8, Frame, ParticipantIndex};

/// Message tag: input bundle.
pub const TAG_INPUT_BUNDLE: u8 = 0x01;
/// Message tag: ping.
pub const TAG_PING: u8 = 0x02;
/// Message tag: pong.
pub const TAG_PONG: u8 = 0x03;
/// Message tag: keepalive.
pub const TAG_KEEPALIVE: u8 = 0x04;
/// Message tag: episode-end marker.
pub const TAG_EPISODE_END: u8 = 0x05;
/// Message tag: episode-ready.
pub const TAG_EPISODE_READY: u8 = 0x06;
/// Message tag: frame digest.
pub const TAG_FRAME_DIGEST: u8 = 0x07;

/// Exact size of an encoded frame-digest message.
pub const FRAME_DIGEST_LEN: usize = 13;

/// Errors produced while encoding or decoding wire frames.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WireError {
    /// The buffer ended before the fixed layout was complete.
    Truncated {
        /// Bytes the layout still needed.
        needed: usize,
        /// Bytes that were available.
        available: usize,
    },
    /// The leading tag byte is not a known message type.
    UnknownTag(u8),
    /// A varint ran past its maximum width.
    VarintOverflow,
    /// A fixed-size message carried extra bytes.
    TrailingBytes {
        /// The message tag.
        tag: u8,
        /// Unexpected extra byte count.
        extra: usize,
    },
    /// The message was empty.
    Empty,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "truncated frame: needed {needed} bytes, had {available}")
            },
            Self::UnknownTag(tag) => write!(f, "unknown message tag 0x{tag:02x}"),
            Self::VarintOverflow => f.write_str("varint exceeded 32 bits"),
            Self::TrailingBytes { tag, extra } => {
                write!(f, "message 0x{tag:02x} carried {extra} trailing bytes")
            },
            Self::Empty => f.write_str("empty datagram"),
        }
    }
}

impl Error for WireError {}

/// Encodes a message into `out` (cleared first).
pub fn encode(message: &PeerMessage, out: &mut Vec<u8>) {
    out.clear();
    match message {
        PeerMessage::InputBundle(inputs) => {
            out.push(TAG_INPUT_BUNDLE);
            for input in inputs {
                out.extend_from_slice(&input.frame.as_u32().to_be_bytes());
                out.extend_from_slice(&input.index.as_u16().to_be_bytes());
                write_varint(input.action.as_u32(), out);
            }
        },
        PeerMessage::Ping { timestamp_ms } => {
            out.push(TAG_PING);
            out.extend_from_slice(&timestamp_ms.to_be_bytes());
        },
        PeerMessage::Pong { timestamp_ms } => {
            out.push(TAG_PONG);
            out.extend_from_slice(&timestamp_ms.to_be_bytes());
        },
        PeerMessage::Keepalive => out.push(TAG_KEEPALIVE),
        PeerMessage::EpisodeEnd { final_frame } => {
            out.push(TAG_EPISODE_END);
            out.extend_from_slice(&final_frame.as_u32().to_be_bytes());
        },
        PeerMessage::EpisodeReady { seed, start_frame } => {
            out.push(TAG_EPISODE_READY);
            out.extend_from_slice(&seed.to_be_bytes());
            out.extend_from_slice(&start_frame.as_u32().to_be_bytes());
        },
        PeerMessage::FrameDigest { frame, digest } => {
            out.push(TAG_FRAME_DIGEST);
            out.extend_from_slice(&frame.as_u32().to_be_bytes());
            out.extend_from_slice(digest.as_bytes());
            debug_assert_eq!(out.len(), FRAME_DIGEST_LEN);
        },
    }
}

/// Decodes a single datagram.
pub fn decode(bytes: &[u8]) -> Result<PeerMessage, WireError> {
    let (&tag, body) = bytes.split_first().ok_or(WireError::Empty)?;
    match tag {
        TAG_INPUT_BUNDLE => {
            let mut inputs = InputBundle::new();
            let mut cursor = body;
            while !cursor.is_empty() {
                let frame = read_u32(&mut cursor)?;
                let index = read_u16(&mut cursor)?;
                let action = read_varint(&mut cursor)?;
                inputs.push(InputFrame {
                    frame: Frame::new(frame),
                    index: ParticipantIndex::new(index),
                    action: Action(action),
                });
            }
            Ok(PeerMessage::InputBundle(inputs))
        },
        TAG_PING => {
            let timestamp_ms = read_u64_exact(tag, body)?;
            Ok(PeerMessage::Ping { timestamp_ms })
        },
        TAG_PONG => {
            let timestamp_ms = read_u64_exact(tag, body)?;
            Ok(PeerMessage::Pong { timestamp_ms })
        },
        TAG_KEEPALIVE => {
            if body.is_empty() {
                Ok(PeerMessage::Keepalive)
            } else {
                Err(WireError::TrailingBytes {
                    tag,
                    extra: body.len(),
                })
            }
        },
        TAG_EPISODE_END => {
            let mut cursor = body;
            let final_frame = read_u32(&mut cursor)?;
            ensure_consumed(tag, cursor)?;
            Ok(PeerMessage::EpisodeEnd {
                final_frame: Frame::new(final_frame),
            })
        },
        TAG_EPISODE_READY => {
            let mut cursor = body;
            let seed = read_u32(&mut cursor)?;
            let start_frame = read_u32(&mut cursor)?;
            ensure_consumed(tag, cursor)?;
            Ok(PeerMessage::EpisodeReady {
                seed,
                start_frame: Frame::new(start_frame),
            })
        },
        TAG_FRAME_DIGEST => {
            let mut cursor = body;
            let frame = read_u32(&mut cursor)?;
            if cursor.len() < 8 {
                return Err(WireError::Truncated {
                    needed: 8,
                    available: cursor.len(),
                });
            }
            let mut digest = [0u8; 8];
            digest.copy_from_slice(&cursor[..8]);
            ensure_consumed(tag, &cursor[8..])?;
            Ok(PeerMessage::FrameDigest {
                frame: Frame::new(frame),
                digest: Digest8(digest),
            })
        },
        unknown => Err(WireError::UnknownTag(unknown)),
    }
}

fn ensure_consumed(tag: u8, rest: &[u8]) -> Result<(), WireError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(WireError::TrailingBytes {
            tag,
            extra: rest.len(),
        })
    }
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, WireError> {
    if cursor.len() < 4 {
        return Err(WireError::Truncated {
            needed: 4,
            available: cursor.len(),
        });
    }
    let (head, tail) = cursor.split_at(4);
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(head);
    *cursor = tail;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u16(cursor: &mut &[u8]) -> Result<u16, WireError> {
    if cursor.len() < 2 {
        return Err(WireError::Truncated {
            needed: 2,
            available: cursor.len(),
        });
    }
    let (head, tail) = cursor.split_at(2);
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(head);
    *cursor = tail;
    Ok(u16::from_be_bytes(bytes))
}

fn read_u64_exact(tag: u8, body: &[u8]) -> Result<u64, WireError> {
    if body.len() < 8 {
        return Err(WireError::Truncated {
            needed: 8,
            available: body.len(),
        });
    }
    if body.len() > 8 {
        return Err(WireError::TrailingBytes {
            tag,
            extra: body.len() - 8,
        });
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(body);
    Ok(u64::from_be_bytes(bytes))
}

/// LEB128-style varint: 7 bits per byte, high bit is the continuation flag.
fn write_varint(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(cursor: &mut &[u8]) -> Result<u32, WireError> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    loop {
        let (&byte, tail) = cursor.split_first().ok_or(WireError::Truncated {
            needed: 1,
            available: 0,
        })?;
        *cursor = tail;
        if shift >= 32 {
            return Err(WireError::VarintOverflow);
        }
        value |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
