//! Splicing one file's packed bytes out of its sequence of blocks.

use std::sync::Arc;

use crate::block::{BlockReader, FileBlockHeader};
use crate::error::{RarError, Result};
use crate::manager::VolumeManager;
use crate::parse::new_format_reader;

/// Rewind state for random access readers.
struct Origin {
    vm: Arc<VolumeManager>,
    first: FileBlockHeader,
    password: Option<String>,
}

/// Reads the packed bytes of one file, transparently crossing block and
/// volume boundaries.
///
/// After the first block of a file, every further block must repeat the
/// file's name without the first-block flag; anything else is an invalid
/// file block. If the archive ends before the block marked last, the file
/// is truncated and reading fails.
pub(crate) struct PackedFileReader {
    blocks: BlockReader,
    cur: Option<FileBlockHeader>,
    /// Stitch buffer for block-aligned reads crossing file blocks.
    spill: Vec<u8>,
    origin: Option<Origin>,
}

impl PackedFileReader {
    pub(crate) fn new(blocks: BlockReader) -> Self {
        Self {
            blocks,
            cur: None,
            spill: Vec::new(),
            origin: None,
        }
    }

    /// Opens a reader positioned at the start of `first`'s packed data, for
    /// random access through a [`File`] handle.
    ///
    /// [`File`]: crate::File
    pub(crate) fn open_at(
        vm: &Arc<VolumeManager>,
        first: &FileBlockHeader,
        password: Option<String>,
    ) -> Result<Self> {
        let mut vol = vm.open_known(first.vol_num)?;
        vol.vm = Some(vm.clone());
        vol.src.discard(first.data_off)?;
        let parser = new_format_reader(vm.format(), password.clone());
        let blocks = BlockReader::resume_at(vol, parser, first);
        Ok(Self {
            blocks,
            cur: Some(first.clone()),
            spill: Vec::new(),
            origin: Some(Origin {
                vm: vm.clone(),
                first: first.clone(),
                password,
            }),
        })
    }

    /// Skips the rest of the current file and returns the next file's first
    /// block header, or `None` at end of archive.
    pub(crate) fn next_file(&mut self) -> Result<Option<FileBlockHeader>> {
        self.skip()?;
        let Some(mut h) = self.blocks.next()? else {
            self.cur = None;
            return Ok(None);
        };
        if !h.first {
            return Err(RarError::InvalidFileBlock);
        }
        h.packed_off = 0;
        self.cur = Some(h.clone());
        Ok(Some(h))
    }

    /// Advances to the next block of the current file. Invalid to call on
    /// the last block.
    fn next_block_in_file(&mut self) -> Result<()> {
        let cur = self.cur.as_ref().expect("no current file");
        let name = cur.header.name.clone();
        let packed_off = cur.packed_off + cur.header.packed_size;
        let Some(mut h) = self.blocks.next()? else {
            // archive ended, but the file hasn't
            return Err(RarError::UnexpectedArchiveEnd);
        };
        if h.first || h.header.name != name {
            return Err(RarError::InvalidFileBlock);
        }
        h.packed_off = packed_off;
        self.cur = Some(h);
        Ok(())
    }

    /// Reads packed data for the current file.  Returns 0 at end of file.
    pub(crate) fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        loop {
            let n = self.blocks.read(out)?;
            if n > 0 {
                return Ok(n);
            }
            match &self.cur {
                None => return Ok(0),
                Some(h) if h.last => return Ok(0),
                _ => self.next_block_in_file()?,
            }
        }
    }

    pub(crate) fn read_byte(&mut self) -> Result<Option<u8>> {
        loop {
            if let Some(b) = self.blocks.read_byte()? {
                return Ok(Some(b));
            }
            match &self.cur {
                None => return Ok(None),
                Some(h) if h.last => return Ok(None),
                _ => self.next_block_in_file()?,
            }
        }
    }

    /// Discards everything up to and including the last block of the
    /// current file.
    pub(crate) fn skip(&mut self) -> Result<()> {
        if self.cur.is_none() {
            return Ok(());
        }
        while !self.cur.as_ref().unwrap().last {
            self.blocks.skip_block()?;
            self.next_block_in_file()?;
        }
        self.blocks.skip_block()
    }

    /// Returns a slice whose length is a non-zero multiple of `block_size`,
    /// at most `max` bytes, stitching across file blocks when the trailing
    /// residue of a block is smaller than one unit. Returns an empty slice
    /// at end of file; a trailing residue shorter than `block_size` is
    /// consumed and discarded.
    pub(crate) fn blocks(&mut self, block_size: usize, max: usize) -> Result<&[u8]> {
        debug_assert!(block_size > 0 && max >= block_size);
        self.spill.clear();
        let mut target = block_size;
        let rem = self.blocks.remaining() as usize;
        if rem >= block_size {
            let cap = (max - max % block_size).max(block_size);
            target = cap.min(rem - rem % block_size);
        }
        while self.spill.len() < target {
            if self.blocks.remaining() == 0 {
                match &self.cur {
                    None => break,
                    Some(h) if h.last => break,
                    _ => self.next_block_in_file()?,
                }
                continue;
            }
            let want = target - self.spill.len();
            let chunk = self.blocks.read_chunk(want)?;
            if chunk.is_empty() {
                return Err(RarError::UnexpectedEof);
            }
            self.spill.extend_from_slice(chunk);
        }
        if self.spill.len() < block_size {
            self.spill.clear();
            return Ok(&[]);
        }
        Ok(&self.spill)
    }

    /// Packed offset of the next byte [`read`] would return, from the start
    /// of the file's packed data.
    ///
    /// [`read`]: PackedFileReader::read
    pub(crate) fn packed_pos(&self) -> u64 {
        match &self.cur {
            Some(h) => h.packed_off + h.header.packed_size - self.blocks.remaining(),
            None => 0,
        }
    }

    /// Repositions a random access reader to the given packed offset.
    /// Positions past the end of the file saturate at the end.
    pub(crate) fn seek_to(&mut self, off: u64) -> Result<()> {
        let pos = self.packed_pos();
        if off < pos {
            self.rewind()?;
        }
        let mut left = off - self.packed_pos();
        while left > 0 {
            let avail = self.blocks.remaining();
            if avail == 0 {
                match &self.cur {
                    None => return Ok(()),
                    Some(h) if h.last => return Ok(()),
                    _ => self.next_block_in_file()?,
                }
                continue;
            }
            let n = left.min(avail);
            self.blocks.discard(n)?;
            left -= n;
        }
        Ok(())
    }

    /// Reopens the file at its first block.
    fn rewind(&mut self) -> Result<()> {
        let origin = self
            .origin
            .as_ref()
            .expect("rewind on a sequential reader");
        let fresh = Self::open_at(&origin.vm, &origin.first, origin.password.clone())?;
        *self = fresh;
        Ok(())
    }
}
