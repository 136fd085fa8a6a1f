// Pure Rust Ogg Opus container reader
//
// Copyright (c) 2016 est31 <MTest31@outlook.com>
// and contributors. All rights reserved.
// Licensed under MIT license, or Apache 2 license,
// at your option. Please see the LICENSE file
// attached to this source distribution for details.

/*!
The error taxonomy surfaced by this crate.

Every fallible operation funnels into [`Error`]. Recoverable per-page issues (holes,
foreign-stream pages, unreadable TOCs) never reach the caller directly; they are absorbed
internally and either retried or folded into a single [`Error::Hole`] at the next delivery
boundary. Everything else that escapes `open` or a read/seek call leaves the reader in a
state from which only dropping it is valid.
*/

use std::fmt;

/// Errors produced while reading an Ogg Opus stream.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Normal end of stream; not a failure.
    #[error("end of stream")]
    Eof,

    /// A lost packet or page was detected. Non-fatal; the caller may continue reading.
    #[error("a hole was detected in the packet sequence")]
    Hole,

    /// The byte source signaled a read, seek, or tell failure.
    #[error("byte source I/O error: {0}")]
    Read(#[from] std::io::Error),

    /// An internal invariant we rely on was violated by a peer component.
    #[error("an internal invariant was violated")]
    Fault,

    /// A postcondition relied upon was violated by a peer library (the external decoder).
    #[error("a peer component violated its contract")]
    Impossible,

    /// A seek was attempted on a source without seek capability.
    #[error("the byte source is not seekable")]
    NotSeekable,

    /// An out-of-range index, negative offset, or missing required capability was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The Opus header pair is malformed or arranged illegally.
    #[error("malformed or illegally arranged Opus header: {0}")]
    BadHeader(&'static str),

    /// The bytes are not Ogg, or no Opus stream is present.
    #[error("not an Ogg Opus stream")]
    NotFormat,

    /// Structural inconsistency between links (e.g. the reverse page search fell off the
    /// start of the file).
    #[error("structural inconsistency between links: {0}")]
    BadLink(&'static str),

    /// A granule position violates a stream or link invariant.
    #[error("invalid granule position timestamp: {0}")]
    BadTimestamp(&'static str),

    /// The external decoder rejected an audio packet.
    #[error("the decoder rejected an audio packet")]
    BadPacket,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Internal "not found / retry exhausted" signal.
///
/// Used between internal helpers and never allowed to escape to a caller. Call sites that
/// would otherwise surface it must convert it to a concrete [`Error`] or retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NotFound;

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not found (internal)")
    }
}
