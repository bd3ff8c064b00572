//! Container stdio streams.
//!
//! Docker multiplexes a container's stdin, stdout and stderr over a single byte
//! stream when the container has no TTY. Each chunk is preceded by an 8-byte
//! header:
//!
//! ```text
//! [ stdio tag: u32 little-endian ][ payload length: u32 big-endian ]
//! ```
//!
//! The [`Demultiplexer`] decodes those headers and yields one [`Fragment`] per
//! frame, each bounded to exactly the frame's payload. TTY containers send a raw
//! stream, which is yielded as a single untagged fragment.
//!
//! [`StreamHandle`] ties a demultiplexer to the connection it reads from, and to
//! the raw output channel when the stream was upgraded.

use std::fmt;

pub mod bounded;
mod demux;
pub mod frame;
mod handle;

pub use self::bounded::{BoundedReader, Budget};
pub use self::demux::{Demultiplexer, Fragment, Mode};
pub use self::frame::{FrameHeader, MalformedFrame};
pub use self::handle::{Sink, Source, StreamHandle};

/// Which standard stream a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Stdio {
    /// Standard input, echoed back by some attach sessions.
    Stdin = 0,

    /// Standard output.
    Stdout = 1,

    /// Standard error.
    Stderr = 2,
}

impl Stdio {
    /// Decode a wire tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Stdio::Stdin),
            1 => Some(Stdio::Stdout),
            2 => Some(Stdio::Stderr),
            _ => None,
        }
    }

    /// The wire tag for this stream.
    pub fn tag(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Stdio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stdio::Stdin => "stdin",
            Stdio::Stdout => "stdout",
            Stdio::Stderr => "stderr",
        })
    }
}

impl TryFrom<u32> for Stdio {
    type Error = MalformedFrame;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        Stdio::from_tag(tag).ok_or(MalformedFrame::UnknownStdio(tag))
    }
}
