//! Record marking over a byte stream.
//!
//! Every record is one or more fragments. Each fragment starts with a 4-byte
//! big-endian header: the top bit flags the last fragment of the record, the
//! low 31 bits give the fragment length.
//!
//! - [`RecordAssembler`]: sans-IO inbound engine, fed with whatever the stream
//!   returned and polled for complete records
//! - [`RecordMarkCodec`]: the same engine as a `tokio_util` codec

mod assembler;
mod codec;

pub use assembler::{FramingState, RecordAssembler, RecordPoll};
pub use codec::RecordMarkCodec;

use bytes::{BufMut, Bytes, BytesMut};

use crate::xdr::{MemXdr, XdrError, XdrStream};

/// Last-fragment flag in a record-mark header.
pub const LAST_FRAG: u32 = 0x8000_0000;

/// Largest length a single fragment header can carry.
pub const MAX_FRAGMENT_LEN: usize = 0x7fff_ffff;

/// Default cap on an assembled record.
pub const DEFAULT_MAX_RECORD: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("record of at least {len} bytes exceeds limit of {max}")]
    RecordTooLarge { len: usize, max: usize },
    #[error("fragment of {0} bytes cannot be represented in a record mark")]
    FragmentTooLong(usize),
    #[error("stream ended in the middle of a record")]
    Truncated,
    #[error("framing engine has ended")]
    Ended,
    #[error("failed to encode record: {0}")]
    Encode(#[from] XdrError),
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a record-mark header.
pub fn fragment_header(len: usize, last: bool) -> Result<u32, FramingError> {
    if len > MAX_FRAGMENT_LEN {
        return Err(FramingError::FragmentTooLong(len));
    }
    let mut header = len as u32;
    if last {
        header |= LAST_FRAG;
    }
    Ok(header)
}

/// Split a header into `(last, len)`.
pub fn parse_header(header: u32) -> (bool, usize) {
    (header & LAST_FRAG != 0, (header & !LAST_FRAG) as usize)
}

/// Encode one record as a single final fragment.
///
/// Space for the header is reserved first; once `body` has written the
/// payload the header is back-filled with its length.
pub fn encode_marked(
    body: impl FnOnce(&mut MemXdr) -> Result<(), XdrError>,
) -> Result<Bytes, FramingError> {
    let mut xdr = MemXdr::encoder();
    xdr.put_u32(0)?;
    body(&mut xdr)?;
    let len = xdr.position() - 4;
    xdr.set_position(0)?;
    xdr.put_u32(fragment_header(len, true)?)?;
    Ok(xdr.into_bytes())
}

/// Append `body` to `dst` as fragments of at most `max_fragment` bytes.
///
/// An empty body still produces one (empty, final) fragment.
pub fn write_record(
    body: &[u8],
    max_fragment: usize,
    dst: &mut BytesMut,
) -> Result<(), FramingError> {
    let max_fragment = max_fragment.clamp(1, MAX_FRAGMENT_LEN);
    let count = body.len().div_ceil(max_fragment).max(1);
    dst.reserve(body.len() + 4 * count);

    let mut chunks = body.chunks(max_fragment).peekable();
    if chunks.peek().is_none() {
        dst.put_u32(fragment_header(0, true)?);
        return Ok(());
    }
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        dst.put_u32(fragment_header(chunk.len(), last)?);
        dst.put_slice(chunk);
    }
    Ok(())
}
