//! Canonical (XDR) encoding of RPC envelopes.
//!
//! [`XdrStream`] is the pluggable codec: fixed-width integers and opaque byte
//! ranges in the big-endian, 4-byte aligned wire format. Two backends exist:
//!
//! - **mem**: [`MemXdr`], over one flat buffer (encode or decode)
//! - **record**: [`RecordXdr`], decode over an assembled record's segment chain
//!
//! Values implement [`XdrEncode`] / [`XdrDecode`]. Decoding builds new values
//! rather than filling caller-owned ones, and [`decode_atomic`] rewinds the
//! stream when a decode fails part way through.

mod mem;
mod record;

pub use mem::MemXdr;
pub use record::RecordXdr;

use bytes::Bytes;

/// Direction of an XDR stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdrOp {
    Encode,
    Decode,
    /// Destroyed; every further access fails.
    Free,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XdrError {
    #[error("buffer exhausted: needed {needed} bytes, {available} available")]
    Exhausted { needed: usize, available: usize },
    #[error("length {len} exceeds limit {max}")]
    TooLong { len: usize, max: usize },
    #[error("invalid boolean value {0}")]
    InvalidBool(u32),
    #[error("invalid {what} discriminant {value}")]
    InvalidDiscriminant { what: &'static str, value: u32 },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("position {pos} outside stream of {len} bytes")]
    PositionOutOfRange { pos: usize, len: usize },
    #[error("operation not valid on a {0:?} stream")]
    WrongDirection(XdrOp),
    #[error("{0} bytes left over after decoding")]
    TrailingBytes(usize),
    #[error("stream destroyed")]
    Destroyed,
}

/// Number of pad bytes needed to round `len` up to a 4-byte boundary.
pub fn pad_len(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

const PAD: [u8; 4] = [0; 4];

/// A bidirectional XDR codec over some backing storage.
///
/// Backends implement the primitive word and byte moves; everything else is
/// provided on top of those.
pub trait XdrStream {
    fn op(&self) -> XdrOp;

    fn get_u32(&mut self) -> Result<u32, XdrError>;

    fn put_u32(&mut self, value: u32) -> Result<(), XdrError>;

    /// Fill `dst` exactly; no alignment handling.
    fn get_bytes(&mut self, dst: &mut [u8]) -> Result<(), XdrError>;

    /// Write `src` exactly; no alignment handling.
    fn put_bytes(&mut self, src: &[u8]) -> Result<(), XdrError>;

    fn position(&self) -> usize;

    fn set_position(&mut self, pos: usize) -> Result<(), XdrError>;

    /// Bytes left to decode (or written past the position when encoding).
    fn remaining(&self) -> usize;

    /// Borrow the next `len` bytes in place and advance past them.
    ///
    /// Returns `None` if the bytes are not available contiguously; callers
    /// fall back to [`XdrStream::get_bytes`].
    fn inline(&mut self, len: usize) -> Option<&[u8]>;

    /// Release the backing storage. Safe to call more than once.
    fn destroy(&mut self);

    fn get_i32(&mut self) -> Result<i32, XdrError> {
        Ok(self.get_u32()? as i32)
    }

    fn put_i32(&mut self, value: i32) -> Result<(), XdrError> {
        self.put_u32(value as u32)
    }

    fn get_u64(&mut self) -> Result<u64, XdrError> {
        let hi = self.get_u32()? as u64;
        let lo = self.get_u32()? as u64;
        Ok((hi << 32) | lo)
    }

    fn put_u64(&mut self, value: u64) -> Result<(), XdrError> {
        self.put_u32((value >> 32) as u32)?;
        self.put_u32(value as u32)
    }

    fn get_i64(&mut self) -> Result<i64, XdrError> {
        Ok(self.get_u64()? as i64)
    }

    fn put_i64(&mut self, value: i64) -> Result<(), XdrError> {
        self.put_u64(value as u64)
    }

    fn get_bool(&mut self) -> Result<bool, XdrError> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(XdrError::InvalidBool(other)),
        }
    }

    fn put_bool(&mut self, value: bool) -> Result<(), XdrError> {
        self.put_u32(value as u32)
    }

    /// Fixed-length opaque data followed by padding to a 4-byte boundary.
    fn get_opaque_fixed(&mut self, len: usize) -> Result<Bytes, XdrError> {
        let padded = len + pad_len(len);
        if self.remaining() < padded {
            return Err(XdrError::Exhausted {
                needed: padded,
                available: self.remaining(),
            });
        }
        let data = match self.inline(len) {
            Some(slice) => Bytes::copy_from_slice(slice),
            None => {
                let mut buf = vec![0u8; len];
                self.get_bytes(&mut buf)?;
                Bytes::from(buf)
            }
        };
        let mut pad = [0u8; 4];
        self.get_bytes(&mut pad[..pad_len(len)])?;
        Ok(data)
    }

    fn put_opaque_fixed(&mut self, data: &[u8]) -> Result<(), XdrError> {
        self.put_bytes(data)?;
        self.put_bytes(&PAD[..pad_len(data.len())])
    }

    /// Variable-length opaque data: a length word, the bytes, then padding.
    fn get_opaque(&mut self, max: usize) -> Result<Bytes, XdrError> {
        let len = self.get_u32()? as usize;
        if len > max {
            return Err(XdrError::TooLong { len, max });
        }
        self.get_opaque_fixed(len)
    }

    fn put_opaque(&mut self, data: &[u8], max: usize) -> Result<(), XdrError> {
        if data.len() > max || data.len() > u32::MAX as usize {
            return Err(XdrError::TooLong {
                len: data.len(),
                max,
            });
        }
        self.put_u32(data.len() as u32)?;
        self.put_opaque_fixed(data)
    }

    fn get_string(&mut self, max: usize) -> Result<String, XdrError> {
        let raw = self.get_opaque(max)?;
        String::from_utf8(raw.to_vec()).map_err(|_| XdrError::InvalidUtf8)
    }

    fn put_string(&mut self, value: &str, max: usize) -> Result<(), XdrError> {
        self.put_opaque(value.as_bytes(), max)
    }
}

/// A value with a canonical encoding.
pub trait XdrEncode {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError>;
}

/// A value that can be decoded from its canonical encoding.
pub trait XdrDecode: Sized {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError>;
}

/// Decode a `T`, rewinding `xdr` to where it started if decoding fails.
pub fn decode_atomic<T: XdrDecode>(xdr: &mut dyn XdrStream) -> Result<T, XdrError> {
    let mark = xdr.position();
    match T::decode(xdr) {
        Ok(value) => Ok(value),
        Err(e) => {
            if xdr.op() != XdrOp::Free {
                // The mark was a valid position a moment ago.
                let _ = xdr.set_position(mark);
            }
            Err(e)
        }
    }
}

/// Encode `value` into a fresh buffer.
pub fn to_bytes<T: XdrEncode + ?Sized>(value: &T) -> Result<Bytes, XdrError> {
    let mut xdr = MemXdr::encoder();
    value.encode(&mut xdr)?;
    Ok(xdr.into_bytes())
}

/// Decode a `T` from `bytes`, requiring every byte to be consumed.
pub fn from_bytes<T: XdrDecode>(bytes: Bytes) -> Result<T, XdrError> {
    let mut xdr = MemXdr::decoder(bytes);
    let value = T::decode(&mut xdr)?;
    if xdr.remaining() != 0 {
        return Err(XdrError::TrailingBytes(xdr.remaining()));
    }
    Ok(value)
}

/// The empty argument/result list.
impl XdrEncode for () {
    fn encode(&self, _xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        Ok(())
    }
}

impl XdrDecode for () {
    fn decode(_xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        Ok(())
    }
}

impl XdrEncode for u32 {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        xdr.put_u32(*self)
    }
}

impl XdrDecode for u32 {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        xdr.get_u32()
    }
}

impl XdrEncode for i32 {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        xdr.put_i32(*self)
    }
}

impl XdrDecode for i32 {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        xdr.get_i32()
    }
}

impl XdrEncode for u64 {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        xdr.put_u64(*self)
    }
}

impl XdrDecode for u64 {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        xdr.get_u64()
    }
}

impl XdrEncode for i64 {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        xdr.put_i64(*self)
    }
}

impl XdrDecode for i64 {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        xdr.get_i64()
    }
}

impl XdrEncode for bool {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        xdr.put_bool(*self)
    }
}

impl XdrDecode for bool {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        xdr.get_bool()
    }
}

/// Counted arrays (`T<>`), unbounded apart from the backing buffer.
impl<T: XdrEncode> XdrEncode for Vec<T> {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        if self.len() > u32::MAX as usize {
            return Err(XdrError::TooLong {
                len: self.len(),
                max: u32::MAX as usize,
            });
        }
        xdr.put_u32(self.len() as u32)?;
        for item in self {
            item.encode(xdr)?;
        }
        Ok(())
    }
}

impl<T: XdrDecode> XdrDecode for Vec<T> {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        let count = xdr.get_u32()? as usize;
        // Every element takes at least one word; reject counts the buffer cannot hold.
        if count.saturating_mul(4) > xdr.remaining() {
            return Err(XdrError::Exhausted {
                needed: count.saturating_mul(4),
                available: xdr.remaining(),
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(xdr)?);
        }
        Ok(items)
    }
}

/// Optional data (`T *`), encoded as a boolean followed by the value.
impl<T: XdrEncode> XdrEncode for Option<T> {
    fn encode(&self, xdr: &mut dyn XdrStream) -> Result<(), XdrError> {
        match self {
            Some(value) => {
                xdr.put_bool(true)?;
                value.encode(xdr)
            }
            None => xdr.put_bool(false),
        }
    }
}

impl<T: XdrDecode> XdrDecode for Option<T> {
    fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
        if xdr.get_bool()? {
            Ok(Some(T::decode(xdr)?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pair {
        a: u32,
        b: u64,
    }

    impl XdrDecode for Pair {
        fn decode(xdr: &mut dyn XdrStream) -> Result<Self, XdrError> {
            Ok(Pair {
                a: xdr.get_u32()?,
                b: xdr.get_u64()?,
            })
        }
    }

    #[test]
    fn pad_len_rounds_to_word() {
        assert_eq!(pad_len(0), 0);
        assert_eq!(pad_len(1), 3);
        assert_eq!(pad_len(3), 1);
        assert_eq!(pad_len(4), 0);
        assert_eq!(pad_len(5), 3);
    }

    #[test]
    fn scalars_roundtrip() {
        let mut enc = MemXdr::encoder();
        enc.put_i32(-2).unwrap();
        enc.put_u64(0x0102_0304_0506_0708).unwrap();
        enc.put_i64(i64::MIN).unwrap();
        enc.put_bool(true).unwrap();
        enc.put_string("starttls", 16).unwrap();
        enc.put_opaque(&[9, 9, 9, 9, 9], 8).unwrap();

        let mut dec = MemXdr::decoder(enc.into_bytes());
        assert_eq!(dec.get_i32().unwrap(), -2);
        assert_eq!(dec.get_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(dec.get_i64().unwrap(), i64::MIN);
        assert!(dec.get_bool().unwrap());
        assert_eq!(dec.get_string(16).unwrap(), "starttls");
        assert_eq!(&dec.get_opaque(8).unwrap()[..], &[9, 9, 9, 9, 9]);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn hyper_is_high_word_first() {
        let bytes = to_bytes(&1u64).unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn opaque_is_padded_with_zeros() {
        let mut enc = MemXdr::encoder();
        enc.put_opaque(b"abcde", 16).unwrap();
        assert_eq!(
            &enc.into_bytes()[..],
            &[0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e', 0, 0, 0]
        );
    }

    #[test]
    fn opaque_over_limit_is_rejected() {
        let mut dec = MemXdr::decoder(Bytes::from_static(&[0, 0, 1, 0]));
        assert_eq!(
            dec.get_opaque(16),
            Err(XdrError::TooLong { len: 256, max: 16 })
        );
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let mut dec = MemXdr::decoder(Bytes::from_static(&[0, 0, 0, 2]));
        assert_eq!(dec.get_bool(), Err(XdrError::InvalidBool(2)));
    }

    #[test]
    fn failed_decode_rewinds_the_stream() {
        // a = 7, then only half of b.
        let mut dec = MemXdr::decoder(Bytes::from_static(&[0, 0, 0, 7, 0, 0, 0, 1]));
        let err = decode_atomic::<Pair>(&mut dec).unwrap_err();
        assert!(matches!(err, XdrError::Exhausted { .. }));
        assert_eq!(dec.position(), 0);
        assert_eq!(dec.get_u32().unwrap(), 7);
    }

    #[test]
    fn vec_and_option_roundtrip() {
        let value: (Vec<u32>, Option<u64>) = (vec![1, 2, 3], Some(42));
        let mut enc = MemXdr::encoder();
        value.0.encode(&mut enc).unwrap();
        value.1.encode(&mut enc).unwrap();

        let mut dec = MemXdr::decoder(enc.into_bytes());
        assert_eq!(Vec::<u32>::decode(&mut dec).unwrap(), vec![1, 2, 3]);
        assert_eq!(Option::<u64>::decode(&mut dec).unwrap(), Some(42));
    }

    #[test]
    fn vec_count_larger_than_buffer_is_rejected() {
        let mut dec = MemXdr::decoder(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]));
        assert!(matches!(
            Vec::<u32>::decode(&mut dec),
            Err(XdrError::Exhausted { .. })
        ));
    }

    #[test]
    fn from_bytes_rejects_trailing_data() {
        let err = from_bytes::<u32>(Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 2])).unwrap_err();
        assert_eq!(err, XdrError::TrailingBytes(4));
    }
}
