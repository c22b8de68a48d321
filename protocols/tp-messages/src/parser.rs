//! Bounds-checked little-endian primitives of the sv2 binary encoding:
//! fixed-width integers, `STR0_255`/`B0_255` (u8 length prefix), `B0_64K`
//! (u16 prefix), `B0_16M` (u24 prefix) and the sequence types built from
//! them.

use crate::error::{Error, Result};

/// Sequential reader over a message payload.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::OutOfBound);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        let b = self.read_bytes(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn read_u256(&mut self) -> Result<[u8; 32]> {
        let b = self.read_bytes(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(b);
        Ok(arr)
    }

    pub fn read_b0255(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u8()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_b064k(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_b016m(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u24()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_str0255(&mut self) -> Result<String> {
        let bytes = self.read_b0255()?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    pub fn read_seq0255_u256(&mut self) -> Result<Vec<[u8; 32]>> {
        let count = self.read_u8()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_u256()?);
        }
        Ok(out)
    }

    pub fn read_seq064k_b016m(&mut self) -> Result<Vec<Vec<u8>>> {
        let count = self.read_u16()? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_b016m()?);
        }
        Ok(out)
    }
}

pub(crate) fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u24(out: &mut Vec<u8>, v: u32) -> Result<()> {
    if v >= 1 << 24 {
        return Err(Error::FieldTooLong {
            max: (1 << 24) - 1,
            actual: v as usize,
        });
    }
    out.extend_from_slice(&v.to_le_bytes()[..3]);
    Ok(())
}

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_bool(out: &mut Vec<u8>, v: bool) {
    out.push(v as u8);
}

pub(crate) fn put_b0255(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.len() > u8::MAX as usize {
        return Err(Error::FieldTooLong {
            max: u8::MAX as usize,
            actual: bytes.len(),
        });
    }
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn put_b064k(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.len() > u16::MAX as usize {
        return Err(Error::FieldTooLong {
            max: u16::MAX as usize,
            actual: bytes.len(),
        });
    }
    put_u16(out, bytes.len() as u16);
    out.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn put_b016m(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    put_u24(out, bytes.len() as u32).map_err(|_| Error::FieldTooLong {
        max: (1 << 24) - 1,
        actual: bytes.len(),
    })?;
    out.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn put_str0255(out: &mut Vec<u8>, s: &str) -> Result<()> {
    put_b0255(out, s.as_bytes())
}

pub(crate) fn put_seq0255_u256(out: &mut Vec<u8>, items: &[[u8; 32]]) -> Result<()> {
    if items.len() > u8::MAX as usize {
        return Err(Error::FieldTooLong {
            max: u8::MAX as usize,
            actual: items.len(),
        });
    }
    out.push(items.len() as u8);
    for item in items {
        out.extend_from_slice(item);
    }
    Ok(())
}

pub(crate) fn put_seq064k_b016m(out: &mut Vec<u8>, items: &[Vec<u8>]) -> Result<()> {
    if items.len() > u16::MAX as usize {
        return Err(Error::FieldTooLong {
            max: u16::MAX as usize,
            actual: items.len(),
        });
    }
    put_u16(out, items.len() as u16);
    for item in items {
        put_b016m(out, item)?;
    }
    Ok(())
}
