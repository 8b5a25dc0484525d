//! Buffered access to a single archive volume.

use crate::byte_search::find_byte;
use crate::error::{RarError, Result};
use crate::format::{Format, MAX_SFX_SIZE, SIG_PREFIX};
use crate::options::VolumeFile;

/// Buffered reader over one volume file.
///
/// Provides the peek / slice / discard primitives the block parsers need,
/// plus signature discovery. Short reads at EOF are reported as
/// [`RarError::UnexpectedEof`] whenever a non-zero prefix was consumed.
pub(crate) struct VolumeSource {
    inner: Box<dyn VolumeFile>,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    off: u64,
    eof: bool,
}

impl VolumeSource {
    pub(crate) fn new(inner: Box<dyn VolumeFile>, buffer_size: usize) -> Self {
        Self {
            inner,
            buf: vec![0; buffer_size.max(64)],
            start: 0,
            end: 0,
            off: 0,
            eof: false,
        }
    }

    /// Bytes consumed from the volume so far.
    pub(crate) fn offset(&self) -> u64 {
        self.off
    }

    fn buffered(&self) -> usize {
        self.end - self.start
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered());
        self.start += n;
        self.off += n as u64;
    }

    /// Reads more data from the source, compacting the buffer first.
    /// Returns the number of bytes added (0 only at EOF).
    fn fill(&mut self) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let n = self.inner.read(&mut self.buf[self.end..])?;
        self.end += n;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    /// Makes at least `n` bytes available if the source has them, growing
    /// the buffer when `n` exceeds its capacity.
    fn ensure(&mut self, n: usize) -> Result<()> {
        if n > self.buf.len() {
            // peek larger than the configured buffer; grow to fit
            let mut grown = vec![0; n.next_power_of_two()];
            grown[..self.buffered()].copy_from_slice(&self.buf[self.start..self.end]);
            self.end = self.buffered();
            self.start = 0;
            self.buf = grown;
        }
        while self.buffered() < n {
            if self.fill()? == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Returns up to `n` bytes without consuming them. The slice is shorter
    /// than `n` only at EOF.
    pub(crate) fn peek(&mut self, n: usize) -> Result<&[u8]> {
        self.ensure(n)?;
        let end = self.end.min(self.start + n);
        Ok(&self.buf[self.start..end])
    }

    /// Returns and consumes exactly `n` bytes, or fails with
    /// [`RarError::UnexpectedEof`]. The slice is valid until the next call.
    pub(crate) fn read_slice(&mut self, n: usize) -> Result<&[u8]> {
        self.ensure(n)?;
        if self.buffered() < n {
            return Err(RarError::UnexpectedEof);
        }
        let start = self.start;
        self.consume(n);
        Ok(&self.buf[start..start + n])
    }

    /// Reads a single byte.
    pub(crate) fn read_byte(&mut self) -> Result<u8> {
        if self.buffered() == 0 && self.fill()? == 0 {
            return Err(RarError::UnexpectedEof);
        }
        let b = self.buf[self.start];
        self.consume(1);
        Ok(b)
    }

    /// Reads into `out`, returning 0 only at EOF.
    pub(crate) fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buffered() == 0 {
            if out.len() >= self.buf.len() {
                // large read, bypass the buffer
                let n = self.inner.read(out)?;
                if n == 0 {
                    self.eof = true;
                }
                self.off += n as u64;
                return Ok(n);
            }
            if self.fill()? == 0 {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buffered());
        out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
        self.consume(n);
        Ok(n)
    }

    /// Discards exactly `n` bytes, seeking when the source supports it.
    pub(crate) fn discard(&mut self, n: u64) -> Result<()> {
        let buffered = self.buffered() as u64;
        if n <= buffered {
            self.consume(n as usize);
            return Ok(());
        }
        let mut left = n - buffered;
        self.consume(buffered as usize);
        if let Some(seek) = self.inner.as_seek() {
            seek.seek(std::io::SeekFrom::Current(left as i64))?;
            self.off += left;
            return Ok(());
        }
        while left > 0 {
            let want = (left as usize).min(self.buf.len());
            self.ensure(want.min(self.buf.len()))?;
            let have = self.buffered().min(want);
            if have == 0 {
                return Err(RarError::UnexpectedEof);
            }
            self.consume(have);
            left -= have as u64;
        }
        Ok(())
    }

    /// Searches for the RAR signature and returns the archive format it
    /// pins. Scans no more than [`MAX_SFX_SIZE`] bytes.
    pub(crate) fn find_signature(&mut self) -> Result<Format> {
        let mut scanned: u64 = 0;
        while scanned <= MAX_SFX_SIZE {
            let capacity = self.buf.len();
            let window = self.peek(capacity)?;
            if window.is_empty() {
                return Err(RarError::NoSignature);
            }
            let Some(i) = find_byte(window, SIG_PREFIX[0]) else {
                let n = window.len();
                self.consume(n);
                scanned += n as u64;
                continue;
            };
            self.consume(i);
            scanned += i as u64;

            let sig = self.peek(8)?;
            if sig.len() < 7 {
                return Err(RarError::NoSignature);
            }
            if !sig.starts_with(SIG_PREFIX) {
                self.consume(1);
                scanned += 1;
                continue;
            }
            if sig[6] == 0 {
                self.consume(Format::Rar15.signature_len());
                return Ok(Format::Rar15);
            }
            if sig.len() >= 8 && sig[6] == 1 && sig[7] == 0 {
                self.consume(Format::Rar50.signature_len());
                return Ok(Format::Rar50);
            }
            self.consume(1);
            scanned += 1;
        }
        Err(RarError::NoSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    struct NoSeek(std::io::Cursor<Vec<u8>>);

    impl Read for NoSeek {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl VolumeFile for NoSeek {}

    fn source(data: &[u8]) -> VolumeSource {
        VolumeSource::new(Box::new(NoSeek(std::io::Cursor::new(data.to_vec()))), 64)
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut src = source(b"abcdef");
        assert_eq!(src.peek(3).unwrap(), b"abc");
        assert_eq!(src.peek(3).unwrap(), b"abc");
        assert_eq!(src.read_slice(3).unwrap(), b"abc");
        assert_eq!(src.offset(), 3);
    }

    #[test]
    fn test_peek_short_at_eof() {
        let mut src = source(b"ab");
        assert_eq!(src.peek(10).unwrap(), b"ab");
    }

    #[test]
    fn test_read_slice_grows_past_buffer() {
        let data: Vec<u8> = (0..200u8).collect();
        let mut src = source(&data);
        assert_eq!(src.read_slice(150).unwrap(), &data[..150]);
        assert_eq!(src.offset(), 150);
    }

    #[test]
    fn test_read_slice_short_is_error() {
        let mut src = source(b"abc");
        assert!(matches!(
            src.read_slice(4),
            Err(RarError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_discard_without_seek() {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut src = source(&data);
        src.discard(200).unwrap();
        assert_eq!(src.read_byte().unwrap(), 200);
        assert!(matches!(src.discard(100), Err(RarError::UnexpectedEof)));
    }

    #[test]
    fn test_find_signature_at_start() {
        let mut src = source(b"Rar!\x1a\x07\x00rest");
        assert_eq!(src.find_signature().unwrap(), Format::Rar15);
        assert_eq!(src.read_byte().unwrap(), b'r');
    }

    #[test]
    fn test_find_signature_v5_after_stub() {
        let mut data = vec![b'R'; 1000]; // lots of false starts
        data.extend_from_slice(b"Rar!\x1a\x07\x01\x00x");
        let mut src = source(&data);
        assert_eq!(src.find_signature().unwrap(), Format::Rar50);
        assert_eq!(src.read_byte().unwrap(), b'x');
    }

    #[test]
    fn test_find_signature_missing() {
        let mut src = source(b"not a rar file");
        assert!(matches!(src.find_signature(), Err(RarError::NoSignature)));
    }

    #[test]
    fn test_find_signature_bad_version_byte() {
        let mut src = source(b"Rar!\x1a\x07\x02\x00");
        assert!(matches!(src.find_signature(), Err(RarError::NoSignature)));
    }
}
