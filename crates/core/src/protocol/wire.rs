//! Big-endian byte reader/writer shared by the cell and message codecs

/// Errors produced while decoding cells and messages
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown message type {0}")]
    UnknownType(u8),

    #[error("Unknown address type {0}")]
    UnknownAddressType(u8),

    #[error("Field too large: {0} bytes")]
    Oversize(usize),

    #[error("{0} trailing bytes after message")]
    TrailingData(usize),

    #[error("Invalid key length {0}")]
    BadKeyLength(usize),

    #[error("Packet does not carry the community prefix")]
    BadPrefix,

    #[error("Hostname is not valid UTF-8")]
    InvalidHostname,
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

impl From<CodecError> for anontunnel_common::TunnelError {
    fn from(err: CodecError) -> Self {
        Self::malformed(err.to_string())
    }
}

/// Cursor over a received buffer
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

    pub fn bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CodecError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> CodecResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Everything not consumed yet
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Fail if anything is left over
    pub fn finish(&self) -> CodecResult<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingData(n)),
        }
    }
}

/// Growable output buffer
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reports_truncation() {
        let mut reader = Reader::new(&[0, 1, 2]);
        assert_eq!(reader.u16().unwrap(), 1);
        assert_eq!(
            reader.u32().unwrap_err(),
            CodecError::Truncated {
                needed: 4,
                available: 1
            }
        );
    }

    #[test]
    fn test_finish_rejects_trailing_bytes() {
        let mut reader = Reader::new(&[0, 0, 0, 7, 9]);
        assert_eq!(reader.u32().unwrap(), 7);
        assert_eq!(reader.finish().unwrap_err(), CodecError::TrailingData(1));
    }
}
