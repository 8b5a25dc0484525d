//! File blocks and the reader that walks them across volumes.

use crate::error::{RarError, Result};
use crate::format::Format;
use crate::header::FileHeader;
use crate::manager::Volume;
use crate::volume::VolumeSource;

/// Decoder selector carried by each file block. Zero means stored data.
pub(crate) const DECODE_NONE: u8 = 0;
pub(crate) const DECODE29: u8 = 29;
pub(crate) const DECODE50: u8 = 50;

/// Checksum contract for one file.
#[derive(Clone)]
pub(crate) struct BlockChecksum {
    /// HMAC-SHA-256 key applied over the computed sum, for encrypted v5
    /// archives.
    pub(crate) key: Option<Vec<u8>>,
    /// Expected checksum bytes (4 for CRC32).
    pub(crate) sum: Vec<u8>,
}

/// One file block: the public header plus the bookkeeping needed to splice,
/// decrypt, decode and verify the file it belongs to.
///
/// The first block of a file carries the complete [`FileHeader`]; follow-up
/// blocks repeat the name and sizes. Exactly one block per complete file
/// has `last` set.
#[derive(Clone)]
pub(crate) struct FileBlockHeader {
    pub(crate) first: bool,
    pub(crate) last: bool,
    /// The archive as a whole is solid.
    pub(crate) arc_solid: bool,
    /// Log2 of the decode window size.
    pub(crate) win_size: u8,
    /// Decoder selector ([`DECODE_NONE`], [`DECODE29`], [`DECODE50`]).
    pub(crate) dec_ver: u8,
    pub(crate) checksum: Option<BlockChecksum>,
    /// AES key and IV for encrypted file data.
    pub(crate) cipher: Option<(Vec<u8>, Vec<u8>)>,
    /// Packed bytes of this file preceding this block.
    pub(crate) packed_off: u64,
    /// Offset of this block's packed data within its volume file.
    pub(crate) data_off: u64,
    /// Volume the block lives in.
    pub(crate) vol_num: usize,
    pub(crate) header: FileHeader,
}

/// Outcome of asking a format parser for the next file block.
pub(crate) enum BlockOutcome {
    Block(FileBlockHeader),
    /// An end marker said the archive continues in the next volume.
    VolumeEnd,
    /// An end marker said the archive is complete.
    ArchiveEnd,
    /// The volume ended without an end marker; only opening the next
    /// volume can tell whether the archive continues.
    VolumeOrArchiveEnd,
}

/// On-disk block format parser; one implementation per archive format.
pub(crate) trait FormatReader {
    /// Parses headers at the current position until a file block, an end
    /// marker, or the end of the volume is found.
    fn next_block(&mut self, src: &mut VolumeSource) -> Result<BlockOutcome>;

    /// Resets per-volume state (header encryption) when a new volume is
    /// opened.
    fn reset(&mut self);

    fn format(&self) -> Format;

    /// True once the archive header has declared the old volume naming
    /// scheme. Only meaningful for the v1.5 format.
    fn old_naming(&self) -> bool {
        false
    }
}

/// Yields file block headers in archive order, transparently crossing
/// volume boundaries, and reads the packed data of the current block.
pub(crate) struct BlockReader {
    vol: Volume,
    parser: Box<dyn FormatReader>,
    /// Packed bytes remaining in the current block's data area.
    remaining: u64,
}

impl BlockReader {
    pub(crate) fn new(vol: Volume, parser: Box<dyn FormatReader>) -> Self {
        debug_assert_eq!(vol.format, parser.format());
        Self {
            vol,
            parser,
            remaining: 0,
        }
    }

    /// Positions the reader at the start of a block that has already been
    /// parsed, for random access.
    pub(crate) fn resume_at(vol: Volume, parser: Box<dyn FormatReader>, h: &FileBlockHeader) -> Self {
        debug_assert_eq!(vol.format, parser.format());
        Self {
            vol,
            parser,
            remaining: h.header.packed_size,
        }
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Discards the rest of the current block and returns the next file
    /// block header, or `None` at end of archive.
    pub(crate) fn next(&mut self) -> Result<Option<FileBlockHeader>> {
        self.skip_block()?;
        loop {
            let outcome = self.parser.next_block(&mut self.vol.src)?;
            if let Some(vm) = &self.vol.vm {
                vm.set_old_naming(self.parser.old_naming());
            }
            let ambiguous = match outcome {
                BlockOutcome::Block(mut h) => {
                    h.vol_num = self.vol.num;
                    h.data_off = self.vol.src.offset();
                    self.remaining = h.header.packed_size;
                    return Ok(Some(h));
                }
                BlockOutcome::ArchiveEnd => return Ok(None),
                BlockOutcome::VolumeEnd => false,
                BlockOutcome::VolumeOrArchiveEnd => true,
            };
            if self.vol.vm.is_none() {
                if ambiguous {
                    return Ok(None);
                }
                return Err(RarError::FileNameRequired);
            }
            match self.vol.advance() {
                Ok(()) => {
                    self.parser.reset();
                }
                Err(e) if ambiguous && e.is_not_found() => {
                    // missing volume with an ambiguous end marker means the
                    // archive simply ended here
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads packed data from the current block. Returns 0 when the block
    /// is exhausted.
    pub(crate) fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = out.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.vol.src.read(&mut out[..want])?;
        if n == 0 {
            // the volume ended inside a block's declared data area
            return Err(RarError::UnexpectedEof);
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    pub(crate) fn read_byte(&mut self) -> Result<Option<u8>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let b = self.vol.src.read_byte()?;
        self.remaining -= 1;
        Ok(Some(b))
    }

    /// Returns up to `max` bytes of the current block as a slice, without
    /// copying when the volume buffer allows it.
    pub(crate) fn read_chunk(&mut self, max: usize) -> Result<&[u8]> {
        if self.remaining == 0 || max == 0 {
            return Ok(&[]);
        }
        let want = max.min(self.remaining.min(usize::MAX as u64) as usize);
        let available = {
            let peeked = self.vol.src.peek(want)?;
            if peeked.is_empty() {
                return Err(RarError::UnexpectedEof);
            }
            peeked.len()
        };
        let n = available.min(want);
        self.remaining -= n as u64;
        self.vol.src.read_slice(n)
    }

    /// Discards `n` bytes of the current block's data.
    pub(crate) fn discard(&mut self, n: u64) -> Result<()> {
        debug_assert!(n <= self.remaining);
        self.remaining -= n;
        self.vol.src.discard(n)
    }

    /// Discards the rest of the current block's data.
    pub(crate) fn skip_block(&mut self) -> Result<()> {
        if self.remaining > 0 {
            let n = self.remaining;
            self.remaining = 0;
            self.vol.src.discard(n)?;
        }
        Ok(())
    }
}
