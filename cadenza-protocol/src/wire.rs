//! Buffer-level primitives for frame payloads.
//!
//! A payload is a tag byte followed by typed fields. Integers are
//! little-endian; strings are a `u32` length followed by UTF-8 bytes.
//! Decoding happens on a fully materialised frame, so the cursor here is
//! synchronous and bounds-checked throughout.

use crate::error::ProtocolError;

/// Ceiling for a single string inside a payload.
pub const MAX_STRING_SIZE: u32 = 1024 * 1024;

/// Ceiling for list lengths inside a payload.
pub const MAX_LIST_SIZE: u32 = 65536;

/// Bounds-checked reader over a frame payload.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::ShortPayload {
                needed: n - self.remaining(),
                context,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self, context: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, context)?[0])
    }

    pub fn get_u32(&mut self, context: &'static str) -> Result<u32, ProtocolError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4, context)?);
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn get_u64(&mut self, context: &'static str) -> Result<u64, ProtocolError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8, context)?);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn get_bool(&mut self, context: &'static str) -> Result<bool, ProtocolError> {
        Ok(self.get_u8(context)? != 0)
    }

    pub fn get_string(&mut self, context: &'static str) -> Result<String, ProtocolError> {
        let len = self.get_u32(context)?;
        if len > MAX_STRING_SIZE {
            return Err(ProtocolError::StringTooLong {
                length: len as u64,
                max: MAX_STRING_SIZE as u64,
            });
        }
        let bytes = self.take(len as usize, context)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { context })
    }

    pub fn get_string_list(&mut self, context: &'static str) -> Result<Vec<String>, ProtocolError> {
        let len = self.get_u32(context)?;
        if len > MAX_LIST_SIZE {
            return Err(ProtocolError::ListTooLong {
                length: len as u64,
                max: MAX_LIST_SIZE as u64,
            });
        }
        let mut result = Vec::with_capacity(len as usize);
        for _ in 0..len {
            result.push(self.get_string(context)?);
        }
        Ok(result)
    }

    /// Assert the payload is fully consumed.
    pub fn finish(self) -> Result<(), ProtocolError> {
        if self.remaining() > 0 {
            return Err(ProtocolError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

pub fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(value as u8);
}

pub fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

pub fn put_string_list(buf: &mut Vec<u8>, values: &[String]) {
    put_u32(buf, values.len() as u32);
    for value in values {
        put_string(buf, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_roundtrip() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 0x42);
        put_u32(&mut buf, 7);
        put_u64(&mut buf, u64::MAX);
        put_bool(&mut buf, true);
        put_string(&mut buf, "nix");
        put_string_list(&mut buf, &["a".into(), "".into()]);

        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.get_u8("t").unwrap(), 0x42);
        assert_eq!(cur.get_u32("t").unwrap(), 7);
        assert_eq!(cur.get_u64("t").unwrap(), u64::MAX);
        assert!(cur.get_bool("t").unwrap());
        assert_eq!(cur.get_string("t").unwrap(), "nix");
        assert_eq!(
            cur.get_string_list("t").unwrap(),
            vec!["a".to_string(), String::new()]
        );
        cur.finish().unwrap();
    }

    #[test]
    fn test_short_payload() {
        let mut cur = Cursor::new(&[1, 2, 3]);
        let err = cur.get_u64("eight bytes").unwrap_err();
        assert!(matches!(err, ProtocolError::ShortPayload { needed: 5, .. }));
    }

    #[test]
    fn test_string_length_lies() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 10);
        buf.extend_from_slice(b"abc");
        let mut cur = Cursor::new(&buf);
        assert!(matches!(
            cur.get_string("s").unwrap_err(),
            ProtocolError::ShortPayload { .. }
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let cur = Cursor::new(&[0]);
        assert!(matches!(
            cur.finish().unwrap_err(),
            ProtocolError::TrailingBytes(1)
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 2);
        buf.extend_from_slice(&[0xff, 0xfe]);
        let mut cur = Cursor::new(&buf);
        assert!(matches!(
            cur.get_string("s").unwrap_err(),
            ProtocolError::InvalidUtf8 { .. }
        ));
    }
}
