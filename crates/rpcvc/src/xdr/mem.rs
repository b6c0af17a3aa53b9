//! XDR over one flat memory buffer.

use bytes::{Bytes, BytesMut};

use super::{XdrError, XdrOp, XdrStream};

enum Storage {
    Write(BytesMut),
    Read(Bytes),
    Freed,
}

/// Flat-buffer XDR backend.
///
/// Encoders may rewind with [`XdrStream::set_position`] and overwrite earlier
/// words (used to back-fill record-mark headers); writes past the end grow the
/// buffer.
pub struct MemXdr {
    storage: Storage,
    pos: usize,
}

impl MemXdr {
    pub fn encoder() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: Storage::Write(BytesMut::with_capacity(capacity)),
            pos: 0,
        }
    }

    pub fn decoder(bytes: Bytes) -> Self {
        Self {
            storage: Storage::Read(bytes),
            pos: 0,
        }
    }

    /// Bytes written (encoder) or the whole input (decoder).
    pub fn into_bytes(self) -> Bytes {
        match self.storage {
            Storage::Write(buf) => buf.freeze(),
            Storage::Read(bytes) => bytes,
            Storage::Freed => Bytes::new(),
        }
    }

    fn len(&self) -> usize {
        match &self.storage {
            Storage::Write(buf) => buf.len(),
            Storage::Read(bytes) => bytes.len(),
            Storage::Freed => 0,
        }
    }

    fn readable(&self, needed: usize) -> Result<&[u8], XdrError> {
        match &self.storage {
            Storage::Read(bytes) => {
                let available = bytes.len() - self.pos;
                if available < needed {
                    return Err(XdrError::Exhausted { needed, available });
                }
                Ok(&bytes[self.pos..self.pos + needed])
            }
            Storage::Write(_) => Err(XdrError::WrongDirection(XdrOp::Encode)),
            Storage::Freed => Err(XdrError::Destroyed),
        }
    }
}

impl XdrStream for MemXdr {
    fn op(&self) -> XdrOp {
        match self.storage {
            Storage::Write(_) => XdrOp::Encode,
            Storage::Read(_) => XdrOp::Decode,
            Storage::Freed => XdrOp::Free,
        }
    }

    fn get_u32(&mut self) -> Result<u32, XdrError> {
        let word = self.readable(4)?;
        let value = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        self.pos += 4;
        Ok(value)
    }

    fn put_u32(&mut self, value: u32) -> Result<(), XdrError> {
        self.put_bytes(&value.to_be_bytes())
    }

    fn get_bytes(&mut self, dst: &mut [u8]) -> Result<(), XdrError> {
        let src = self.readable(dst.len())?;
        dst.copy_from_slice(src);
        self.pos += dst.len();
        Ok(())
    }

    fn put_bytes(&mut self, src: &[u8]) -> Result<(), XdrError> {
        let pos = self.pos;
        let buf = match &mut self.storage {
            Storage::Write(buf) => buf,
            Storage::Read(_) => return Err(XdrError::WrongDirection(XdrOp::Decode)),
            Storage::Freed => return Err(XdrError::Destroyed),
        };
        let overlap = (buf.len() - pos).min(src.len());
        buf[pos..pos + overlap].copy_from_slice(&src[..overlap]);
        buf.extend_from_slice(&src[overlap..]);
        self.pos += src.len();
        Ok(())
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn set_position(&mut self, pos: usize) -> Result<(), XdrError> {
        if matches!(self.storage, Storage::Freed) {
            return Err(XdrError::Destroyed);
        }
        let len = self.len();
        if pos > len {
            return Err(XdrError::PositionOutOfRange { pos, len });
        }
        self.pos = pos;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.len() - self.pos
    }

    fn inline(&mut self, len: usize) -> Option<&[u8]> {
        let start = self.pos;
        match &self.storage {
            Storage::Read(bytes) if bytes.len() - start >= len => {
                self.pos += len;
                Some(&bytes[start..start + len])
            }
            _ => None,
        }
    }

    fn destroy(&mut self) {
        self.storage = Storage::Freed;
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_backfills_earlier_word() {
        let mut xdr = MemXdr::encoder();
        xdr.put_u32(0).unwrap();
        xdr.put_u32(0xdead_beef).unwrap();
        let end = xdr.position();

        xdr.set_position(0).unwrap();
        xdr.put_u32(0x8000_0004).unwrap();
        assert_eq!(xdr.position(), 4);
        assert_eq!(end, 8);

        assert_eq!(
            &xdr.into_bytes()[..],
            &[0x80, 0, 0, 4, 0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn decoder_rejects_writes() {
        let mut xdr = MemXdr::decoder(Bytes::from_static(&[0, 0, 0, 1]));
        assert_eq!(
            xdr.put_u32(1),
            Err(XdrError::WrongDirection(XdrOp::Decode))
        );
        assert_eq!(xdr.get_u32().unwrap(), 1);
    }

    #[test]
    fn exhausted_read_does_not_move_position() {
        let mut xdr = MemXdr::decoder(Bytes::from_static(&[0, 0]));
        assert!(matches!(
            xdr.get_u32(),
            Err(XdrError::Exhausted {
                needed: 4,
                available: 2
            })
        ));
        assert_eq!(xdr.position(), 0);
    }

    #[test]
    fn inline_borrows_in_place() {
        let mut xdr = MemXdr::decoder(Bytes::from_static(b"abcdefgh"));
        assert_eq!(xdr.inline(3), Some(&b"abc"[..]));
        assert_eq!(xdr.position(), 3);
        assert_eq!(xdr.inline(6), None);
        assert_eq!(xdr.position(), 3);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut xdr = MemXdr::decoder(Bytes::from_static(&[0, 0, 0, 1]));
        xdr.destroy();
        xdr.destroy();
        assert_eq!(xdr.op(), XdrOp::Free);
        assert_eq!(xdr.get_u32(), Err(XdrError::Destroyed));
        assert_eq!(xdr.remaining(), 0);
    }

    #[test]
    fn set_position_past_end_fails() {
        let mut xdr = MemXdr::encoder();
        xdr.put_u32(1).unwrap();
        assert_eq!(
            xdr.set_position(5),
            Err(XdrError::PositionOutOfRange { pos: 5, len: 4 })
        );
    }
}
