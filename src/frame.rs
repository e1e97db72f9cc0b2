//! # Wire Frames
//!
//! A wire frame is an ordered sequence of byte-string parts, serialized with
//! bincode under a hard size limit and carried on the stream as a u32-BE
//! length-prefixed record. The first part names the command as
//! `category.command`; a handful of single-word first parts are reserved for
//! the protocol itself.
//!
//! | First part | Meaning |
//! |---|---|
//! | `category.command` | Command invocation (requests add a reply tag part) |
//! | `REPLY` | Reply; followed by the reply tag and body parts |
//! | `HI` / `BYE` | Connection liveness ping / graceful goodbye |
//! | `FORBIDDEN`, `FORBIDDEN_MN` | Authorization refusal for a request |
//! | `UNKNOWNCOMMAND` | Command lookup failure notice |
//!
//! Limits are enforced on both encode and decode; a frame that violates them
//! never reaches a handler, and on the receive side the connection is
//! dropped.

use bincode::Options;
use thiserror::Error;

/// Reserved first parts. Anything else must be a `category.command` name.
pub(crate) const HI: &[u8] = b"HI";
pub(crate) const BYE: &[u8] = b"BYE";
pub(crate) const REPLY: &[u8] = b"REPLY";
pub(crate) const FORBIDDEN: &[u8] = b"FORBIDDEN";
pub(crate) const FORBIDDEN_MN: &[u8] = b"FORBIDDEN_MN";
pub(crate) const UNKNOWN_COMMAND: &[u8] = b"UNKNOWNCOMMAND";

/// Maximum number of parts in one frame.
pub(crate) const MAX_PARTS: usize = 256;

/// Maximum total serialized frame size (10 MiB).
/// Prevents memory exhaustion from a single oversized record.
pub(crate) const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum reply tag length in bytes.
pub(crate) const MAX_REPLY_TAG: usize = 32;

/// A multipart message as it travels on the wire.
pub(crate) type Frame = Vec<Vec<u8>>;

#[derive(Debug, Error)]
pub(crate) enum FrameError {
    #[error("frame has no parts")]
    Empty,
    #[error("frame command part is empty")]
    EmptyCommand,
    #[error("frame has {0} parts (max {MAX_PARTS})")]
    TooManyParts(usize),
    #[error("frame is {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("frame does not deserialize: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Bincode options with the frame size limit enforced.
/// Always used for deserialization so hostile lengths cannot allocate.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

fn validate(parts: &[Vec<u8>]) -> Result<(), FrameError> {
    if parts.is_empty() {
        return Err(FrameError::Empty);
    }
    if parts[0].is_empty() {
        return Err(FrameError::EmptyCommand);
    }
    if parts.len() > MAX_PARTS {
        return Err(FrameError::TooManyParts(parts.len()));
    }
    let total: usize = parts.iter().map(Vec::len).sum();
    if total > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(total));
    }
    Ok(())
}

/// Serialize a frame for the wire. The u32-BE record prefix is added by the
/// stream layer.
pub(crate) fn encode(parts: &Frame) -> Result<Vec<u8>, FrameError> {
    validate(parts)?;
    let bytes = bincode_options().serialize(parts)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Deserialize and validate one record's payload.
pub(crate) fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    let parts: Frame = bincode_options().deserialize(bytes)?;
    validate(&parts)?;
    Ok(parts)
}

/// Render a per-connection request counter as a fixed-width reply tag.
pub(crate) fn reply_tag(counter: u64) -> Vec<u8> {
    counter.to_be_bytes().to_vec()
}

/// True when a first part is one of the reserved protocol words.
pub(crate) fn is_reserved(name: &[u8]) -> bool {
    matches!(
        name,
        HI | BYE | REPLY | FORBIDDEN | FORBIDDEN_MN | UNKNOWN_COMMAND
    )
}
