use crate::error::CodecError;

/// Little-endian cursor over one frame body.
///
/// Every read that would run past the end of the frame fails with
/// [`CodecError::Framing`], reporting the total length the frame would have
/// needed.
pub(crate) struct FrameReader<'a> {
    tag: u8,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    /// Starts reading right after the tag byte.
    pub(crate) fn new(tag: u8, frame: &'a [u8]) -> Self {
        Self {
            tag,
            buf: frame,
            pos: 1,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Fails unless at least `n` more bytes are available.
    pub(crate) fn require(&self, n: usize) -> Result<(), CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Framing {
                tag: self.tag,
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.require(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.require(n)?;
        self.pos += n;
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub(crate) fn i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    pub(crate) fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    /// Reads UTF-16LE code units up to and including a zero terminator.
    ///
    /// Unpaired surrogates are replaced rather than rejected.
    pub(crate) fn utf16_zstring(&mut self) -> Result<String, CodecError> {
        let mut units = Vec::new();
        loop {
            match self.u16()? {
                0 => break,
                unit => units.push(unit),
            }
        }
        Ok(String::from_utf16_lossy(&units))
    }
}
