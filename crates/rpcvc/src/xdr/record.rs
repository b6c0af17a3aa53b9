//! XDR decoding over an assembled record.
//!
//! The record stays in the segments it arrived in; reads walk a cursor across
//! them and only copy when a caller asks for bytes that straddle a boundary.

use bytes::Bytes;

use super::{XdrError, XdrOp, XdrStream};
use crate::segment::SegmentChain;

/// Decode-only XDR stream over one complete record.
#[derive(Debug)]
pub struct RecordXdr {
    slices: Vec<Bytes>,
    len: usize,
    idx: usize,
    off: usize,
    pos: usize,
    destroyed: bool,
}

impl RecordXdr {
    pub fn new(record: SegmentChain) -> Self {
        let len = record.len();
        Self {
            slices: record.into_slices(),
            len,
            idx: 0,
            off: 0,
            pos: 0,
            destroyed: false,
        }
    }

    /// Total record length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Skip past slices the cursor has fully consumed.
    fn settle(&mut self) {
        while self.idx < self.slices.len() && self.off == self.slices[self.idx].len() {
            self.idx += 1;
            self.off = 0;
        }
    }

    fn check(&self, needed: usize) -> Result<(), XdrError> {
        if self.destroyed {
            return Err(XdrError::Destroyed);
        }
        let available = self.len - self.pos;
        if available < needed {
            return Err(XdrError::Exhausted { needed, available });
        }
        Ok(())
    }
}

impl XdrStream for RecordXdr {
    fn op(&self) -> XdrOp {
        if self.destroyed {
            XdrOp::Free
        } else {
            XdrOp::Decode
        }
    }

    fn get_u32(&mut self) -> Result<u32, XdrError> {
        let mut word = [0u8; 4];
        self.get_bytes(&mut word)?;
        Ok(u32::from_be_bytes(word))
    }

    fn put_u32(&mut self, _value: u32) -> Result<(), XdrError> {
        Err(XdrError::WrongDirection(self.op()))
    }

    fn get_bytes(&mut self, dst: &mut [u8]) -> Result<(), XdrError> {
        self.check(dst.len())?;
        let mut filled = 0;
        while filled < dst.len() {
            self.settle();
            let slice = &self.slices[self.idx];
            let take = (slice.len() - self.off).min(dst.len() - filled);
            dst[filled..filled + take].copy_from_slice(&slice[self.off..self.off + take]);
            self.off += take;
            filled += take;
        }
        self.pos += dst.len();
        Ok(())
    }

    fn put_bytes(&mut self, _src: &[u8]) -> Result<(), XdrError> {
        Err(XdrError::WrongDirection(self.op()))
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn set_position(&mut self, pos: usize) -> Result<(), XdrError> {
        if self.destroyed {
            return Err(XdrError::Destroyed);
        }
        if pos > self.len {
            return Err(XdrError::PositionOutOfRange { pos, len: self.len });
        }
        let mut rest = pos;
        self.idx = 0;
        self.off = 0;
        while rest > 0 {
            let slice_len = self.slices[self.idx].len();
            if rest < slice_len {
                self.off = rest;
                break;
            }
            rest -= slice_len;
            self.idx += 1;
        }
        self.pos = pos;
        Ok(())
    }

    fn remaining(&self) -> usize {
        if self.destroyed {
            0
        } else {
            self.len - self.pos
        }
    }

    fn inline(&mut self, len: usize) -> Option<&[u8]> {
        if self.check(len).is_err() {
            return None;
        }
        self.settle();
        if len == 0 {
            return Some(&[]);
        }
        let start = self.off;
        let slice = self.slices.get(self.idx)?;
        if slice.len() - start < len {
            return None;
        }
        self.off += len;
        self.pos += len;
        Some(&self.slices[self.idx][start..start + len])
    }

    fn destroy(&mut self) {
        self.slices = Vec::new();
        self.len = 0;
        self.idx = 0;
        self.off = 0;
        self.pos = 0;
        self.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_of(parts: &[&[u8]]) -> RecordXdr {
        let mut chain = SegmentChain::new();
        for p in parts {
            chain.push(Bytes::copy_from_slice(p));
        }
        RecordXdr::new(chain)
    }

    #[test]
    fn words_straddling_segments_decode() {
        let mut xdr = record_of(&[&[0, 0], &[0, 5, 0], &[0, 0, 6]]);
        assert_eq!(xdr.get_u32().unwrap(), 5);
        assert_eq!(xdr.get_u32().unwrap(), 6);
        assert_eq!(xdr.remaining(), 0);
    }

    #[test]
    fn inline_only_within_one_segment() {
        let mut xdr = record_of(&[b"abcd", b"efgh"]);
        assert_eq!(xdr.inline(2), Some(&b"ab"[..]));
        assert_eq!(xdr.inline(4), None);
        assert_eq!(xdr.position(), 2);
        assert_eq!(xdr.inline(2), Some(&b"cd"[..]));
        assert_eq!(xdr.inline(4), Some(&b"efgh"[..]));
    }

    #[test]
    fn opaque_spanning_segments_falls_back_to_copy() {
        let mut xdr = record_of(&[&[0, 0, 0, 3, b'x'], &[b'y', b'z', 0]]);
        assert_eq!(&xdr.get_opaque(8).unwrap()[..], b"xyz");
        assert_eq!(xdr.remaining(), 0);
    }

    #[test]
    fn set_position_rescans_from_start() {
        let mut xdr = record_of(&[&[0, 0, 0, 1], &[0, 0], &[0, 2]]);
        xdr.get_u32().unwrap();
        xdr.get_u32().unwrap();
        xdr.set_position(4).unwrap();
        assert_eq!(xdr.get_u32().unwrap(), 2);
        xdr.set_position(0).unwrap();
        assert_eq!(xdr.get_u32().unwrap(), 1);
    }

    #[test]
    fn writes_are_refused() {
        let mut xdr = record_of(&[&[0; 4]]);
        assert_eq!(xdr.put_u32(1), Err(XdrError::WrongDirection(XdrOp::Decode)));
    }

    #[test]
    fn destroy_twice_releases_payload() {
        let mut xdr = record_of(&[&[0, 0, 0, 1]]);
        xdr.destroy();
        xdr.destroy();
        assert_eq!(xdr.op(), XdrOp::Free);
        assert_eq!(xdr.len(), 0);
        assert_eq!(xdr.get_u32(), Err(XdrError::Destroyed));
        assert_eq!(xdr.set_position(0), Err(XdrError::Destroyed));
    }
}
