use crate::error::{PeerError, PeerResult};

/// Cursor over a byte buffer with the primitive reads the wire protocol is
/// built from. All multi-byte scalars are little endian except the network
/// address port, which is big endian.
pub struct ByteBufferParser<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> ByteBufferParser<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        ByteBufferParser { buffer, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.pos
    }

    pub fn read(&mut self, size: usize) -> PeerResult<&'a [u8]> {
        self.eof_check(size)?;
        let range = self.pos..self.pos + size;
        self.pos += size;
        Ok(&self.buffer[range])
    }

    pub fn read_u8(&mut self) -> PeerResult<u8> {
        Ok(self.read(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> PeerResult<u16> {
        Ok(u16::from_le_bytes(self.read(2)?.try_into().unwrap()))
    }

    pub fn read_u16_be(&mut self) -> PeerResult<u16> {
        Ok(u16::from_be_bytes(self.read(2)?.try_into().unwrap()))
    }

    pub fn read_u32_le(&mut self) -> PeerResult<u32> {
        Ok(u32::from_le_bytes(self.read(4)?.try_into().unwrap()))
    }

    pub fn read_i32_le(&mut self) -> PeerResult<i32> {
        Ok(i32::from_le_bytes(self.read(4)?.try_into().unwrap()))
    }

    pub fn read_u64_le(&mut self) -> PeerResult<u64> {
        Ok(u64::from_le_bytes(self.read(8)?.try_into().unwrap()))
    }

    pub fn read_i64_le(&mut self) -> PeerResult<i64> {
        Ok(i64::from_le_bytes(self.read(8)?.try_into().unwrap()))
    }

    /// Variable length integer
    /// (https://en.bitcoin.it/wiki/Protocol_documentation#Variable_length_integer):
    /// a tag byte below 0xFD is the value itself, otherwise the tag selects a
    /// u16/u32/u64 little-endian field.
    pub fn read_var_int(&mut self) -> PeerResult<u64> {
        match self.read_u8()? {
            0xFD => Ok(self.read_u16_le()? as u64),
            0xFE => Ok(self.read_u32_le()? as u64),
            0xFF => self.read_u64_le(),
            tag => Ok(tag as u64),
        }
    }

    /// var_int length followed by that many raw bytes. No UTF-8 validation.
    pub fn read_var_str(&mut self) -> PeerResult<&'a [u8]> {
        let length = self.read_var_int()? as usize;
        self.read(length)
    }

    fn eof_check(&self, want_bytes: usize) -> PeerResult<()> {
        if self.remaining() < want_bytes {
            Err(PeerError::Read(format!(
                "can not read {} bytes from buffer of size {}",
                want_bytes,
                self.buffer.len()
            )))
        } else {
            Ok(())
        }
    }
}

pub struct ByteBufferComposer {
    buffer: Vec<u8>,
}

impl ByteBufferComposer {
    pub fn new() -> Self {
        ByteBufferComposer { buffer: vec![] }
    }

    pub fn result(self) -> Vec<u8> {
        self.buffer
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn append_var_int(&mut self, n: u64) {
        if n < 0xFD {
            self.append(&[n as u8]);
        } else if n <= 0xFFFF {
            self.append(&[0xFD]);
            self.append(&(n as u16).to_le_bytes());
        } else if n <= 0xFFFF_FFFF {
            self.append(&[0xFE]);
            self.append(&(n as u32).to_le_bytes());
        } else {
            self.append(&[0xFF]);
            self.append(&n.to_le_bytes());
        }
    }

    pub fn append_var_str(&mut self, bytes: &[u8]) {
        self.append_var_int(bytes.len() as u64);
        self.append(bytes);
    }
}

impl Default for ByteBufferComposer {
    fn default() -> Self {
        Self::new()
    }
}
