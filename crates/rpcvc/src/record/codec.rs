//! Record-marking codec for framed streams.
//!
//! Works over any AsyncRead/AsyncWrite via `FramedRead`/`FramedWrite`, and
//! sans-IO by calling `decode`/`encode` directly on buffers.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{FramingError, MAX_FRAGMENT_LEN, RecordAssembler, RecordPoll, write_record};
use crate::segment::SegmentChain;

/// Decodes complete records; encodes bodies as record-marked fragments.
#[derive(Debug)]
pub struct RecordMarkCodec {
    assembler: RecordAssembler,
    max_fragment: usize,
}

impl Default for RecordMarkCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordMarkCodec {
    pub fn new() -> Self {
        Self {
            assembler: RecordAssembler::new(),
            max_fragment: MAX_FRAGMENT_LEN,
        }
    }

    pub fn with_max_record(mut self, max_record: usize) -> Self {
        self.assembler = RecordAssembler::with_max_record(max_record);
        self
    }

    /// Split outgoing records into fragments of at most this many bytes.
    pub fn with_max_fragment(mut self, max_fragment: usize) -> Self {
        self.max_fragment = max_fragment;
        self
    }
}

impl Decoder for RecordMarkCodec {
    type Item = SegmentChain;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            self.assembler.push(src.split().freeze());
        }
        match self.assembler.poll_record()? {
            RecordPoll::Complete(record) => Ok(Some(record)),
            RecordPoll::WouldBlock => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(record) = self.decode(src)? {
            return Ok(Some(record));
        }
        let partial = self.assembler.mid_record() || self.assembler.buffered() > 0;
        self.assembler.end();
        if partial {
            return Err(FramingError::Truncated);
        }
        Ok(None)
    }
}

impl Encoder<Bytes> for RecordMarkCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(len = item.len(), "Encoding record");
        write_record(&item, self.max_fragment, dst)
    }
}
