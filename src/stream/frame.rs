//! Frame headers for multiplexed stdio streams.
//!
//! [`FrameDecoder`] is a push decoder over byte slices. It never reads from an
//! I/O source itself, so the same state machine drives both the async
//! [`Demultiplexer`](super::Demultiplexer) and plain in-memory decoding.

use thiserror::Error;

use super::Stdio;

/// The 8-byte header preceding every frame of a multiplexed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    /// The stream the payload belongs to.
    pub stdio: Stdio,

    /// Payload length in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Encoded header size.
    pub const SIZE: usize = 8;

    /// A header for `length` bytes of `stdio`.
    pub fn new(stdio: Stdio, length: u32) -> Self {
        Self { stdio, length }
    }

    /// Encode the header: the stdio tag as little-endian, the length as big-endian.
    ///
    /// ```
    /// # use dockerdriver::stream::{FrameHeader, Stdio};
    /// let header = FrameHeader::new(Stdio::Stderr, 258).encode();
    /// assert_eq!(header, [2, 0, 0, 0, 0, 0, 1, 2]);
    /// ```
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..4].copy_from_slice(&self.stdio.tag().to_le_bytes());
        bytes[4..].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Decode a complete header.
    pub fn decode(bytes: [u8; Self::SIZE]) -> Result<Self, MalformedFrame> {
        let [t0, t1, t2, t3, l0, l1, l2, l3] = bytes;
        let stdio = Stdio::try_from(u32::from_le_bytes([t0, t1, t2, t3]))?;
        let length = u32::from_be_bytes([l0, l1, l2, l3]);
        Ok(Self { stdio, length })
    }
}

/// A frame header could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MalformedFrame {
    /// The stdio tag was not 0, 1 or 2.
    #[error("unknown stdio tag {0}")]
    UnknownStdio(u32),
}

/// Where the decoder is within the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Collecting header bytes; `filled` have been seen so far.
    AwaitingHeader {
        /// Header bytes already buffered.
        filled: usize,
    },

    /// Inside a frame's payload.
    AwaitingPayload {
        /// The frame's header.
        header: FrameHeader,
        /// Payload bytes not yet consumed.
        remaining: u32,
    },

    /// The stream ended, or a malformed header was seen.
    Finished,
}

/// The result of feeding bytes to the decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// All input was consumed without completing a header or payload chunk.
    NeedMore,

    /// A complete header. Its payload follows.
    Header(FrameHeader),

    /// Payload bytes for the current frame.
    Payload(&'a [u8]),

    /// The decoder has finished; no input was consumed.
    Finished,
}

/// How the stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// On a frame boundary.
    Clean,

    /// Partway through a header, after this many bytes.
    TruncatedHeader(usize),

    /// Partway through a payload, with this many bytes missing.
    TruncatedPayload(u32),
}

/// Push decoder for multiplexed streams.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    state: DecoderState,
    header: [u8; FrameHeader::SIZE],
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// A decoder waiting for the first header.
    pub fn new() -> Self {
        Self {
            state: DecoderState::AwaitingHeader { filled: 0 },
            header: [0; FrameHeader::SIZE],
        }
    }

    /// Current state.
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Header bytes still needed before the next header completes, if a header is
    /// being collected.
    pub fn header_bytes_needed(&self) -> Option<usize> {
        match self.state {
            DecoderState::AwaitingHeader { filled } => Some(FrameHeader::SIZE - filled),
            _ => None,
        }
    }

    /// Consume bytes from the front of `input`, advancing it past whatever was used.
    pub fn decode<'a>(&mut self, input: &mut &'a [u8]) -> Result<Decoded<'a>, MalformedFrame> {
        match self.state {
            DecoderState::Finished => Ok(Decoded::Finished),
            DecoderState::AwaitingHeader { filled } => {
                if input.is_empty() {
                    return Ok(Decoded::NeedMore);
                }

                let data: &'a [u8] = *input;
                let take = (FrameHeader::SIZE - filled).min(data.len());
                self.header[filled..filled + take].copy_from_slice(&data[..take]);
                *input = &data[take..];

                let filled = filled + take;
                if filled < FrameHeader::SIZE {
                    self.state = DecoderState::AwaitingHeader { filled };
                    return Ok(Decoded::NeedMore);
                }

                let header = match FrameHeader::decode(self.header) {
                    Ok(header) => header,
                    Err(error) => {
                        self.state = DecoderState::Finished;
                        return Err(error);
                    }
                };
                self.state = if header.length == 0 {
                    DecoderState::AwaitingHeader { filled: 0 }
                } else {
                    DecoderState::AwaitingPayload {
                        header,
                        remaining: header.length,
                    }
                };
                Ok(Decoded::Header(header))
            }
            DecoderState::AwaitingPayload { remaining, .. } => {
                if input.is_empty() {
                    return Ok(Decoded::NeedMore);
                }

                let data: &'a [u8] = *input;
                let take = (remaining as usize).min(data.len());
                let (payload, rest) = data.split_at(take);
                *input = rest;
                self.consume_payload(take as u64);
                Ok(Decoded::Payload(payload))
            }
        }
    }

    /// Record payload bytes consumed outside of [`decode`](Self::decode).
    pub fn consume_payload(&mut self, n: u64) {
        if let DecoderState::AwaitingPayload { header, remaining } = self.state {
            let remaining = u64::from(remaining).saturating_sub(n);
            self.state = if remaining == 0 {
                DecoderState::AwaitingHeader { filled: 0 }
            } else {
                DecoderState::AwaitingPayload {
                    header,
                    // Bounded above by the original u32 remaining.
                    remaining: remaining as u32,
                }
            };
        }
    }

    /// The source ended. Reports where, and moves to [`DecoderState::Finished`].
    pub fn finish(&mut self) -> Ending {
        let ending = match self.state {
            DecoderState::AwaitingHeader { filled: 0 } | DecoderState::Finished => Ending::Clean,
            DecoderState::AwaitingHeader { filled } => Ending::TruncatedHeader(filled),
            DecoderState::AwaitingPayload { remaining, .. } => Ending::TruncatedPayload(remaining),
        };
        self.state = DecoderState::Finished;
        ending
    }
}
