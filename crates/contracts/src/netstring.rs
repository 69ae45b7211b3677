//! Netstring framing: each message travels as `<decimal length>:<payload>,`.

pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum NetstringError {
    Oversized { len: usize, max: usize },
    Malformed(&'static str),
}

impl std::fmt::Display for NetstringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetstringError::Oversized { len, max } => {
                write!(f, "netstring frame of {} bytes exceeds limit {}", len, max)
            }
            NetstringError::Malformed(what) => write!(f, "malformed netstring: {}", what),
        }
    }
}

impl std::error::Error for NetstringError {}

pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(b',');
    out
}

/// Incremental decoder over a byte stream; feed chunks in, pop whole frames
/// out. Bytes of an incomplete frame are retained across calls.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_len: usize) -> Self {
        FrameBuffer {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, NetstringError> {
        let Some(colon) = self.buf.iter().position(|b| *b == b':') else {
            // No length terminator yet; bound how long a length prefix can get.
            if self.buf.len() > 20 {
                return Err(NetstringError::Malformed("length prefix too long"));
            }
            if self.buf.iter().any(|b| !b.is_ascii_digit()) {
                return Err(NetstringError::Malformed("length prefix not numeric"));
            }
            return Ok(None);
        };

        if colon == 0 || colon > 20 {
            return Err(NetstringError::Malformed("bad length prefix"));
        }

        let digits = &self.buf[..colon];
        if digits.iter().any(|b| !b.is_ascii_digit()) {
            return Err(NetstringError::Malformed("length prefix not numeric"));
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(NetstringError::Malformed("unparsable length prefix"))?;

        if len > self.max_frame_len {
            return Err(NetstringError::Oversized {
                len,
                max: self.max_frame_len,
            });
        }

        let frame_end = colon + 1 + len;
        if self.buf.len() <= frame_end {
            return Ok(None);
        }
        if self.buf[frame_end] != b',' {
            return Err(NetstringError::Malformed("missing trailing comma"));
        }

        let payload = self.buf[colon + 1..frame_end].to_vec();
        self.buf.drain(..=frame_end);
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_delimited_frame() {
        assert_eq!(encode(b"hello"), b"5:hello,".to_vec());
        assert_eq!(encode(b""), b"0:,".to_vec());
    }

    #[test]
    fn decoder_handles_split_and_back_to_back_frames() {
        let mut buf = FrameBuffer::new(DEFAULT_MAX_FRAME_LEN);
        buf.extend(b"5:he");
        assert_eq!(buf.next_frame().unwrap(), None);
        buf.extend(b"llo,3:abc,");
        assert_eq!(buf.next_frame().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(buf.next_frame().unwrap(), Some(b"abc".to_vec()));
        assert_eq!(buf.next_frame().unwrap(), None);
    }

    #[test]
    fn decoder_rejects_oversized_frame() {
        let mut buf = FrameBuffer::new(8);
        buf.extend(b"9:aaaaaaaaa,");
        assert_eq!(
            buf.next_frame().unwrap_err(),
            NetstringError::Oversized { len: 9, max: 8 }
        );
    }

    #[test]
    fn decoder_rejects_garbage() {
        let mut buf = FrameBuffer::new(64);
        buf.extend(b"x:abc,");
        assert!(buf.next_frame().is_err());

        let mut buf = FrameBuffer::new(64);
        buf.extend(b"3:abcX");
        assert_eq!(
            buf.next_frame().unwrap_err(),
            NetstringError::Malformed("missing trailing comma")
        );
    }
}
