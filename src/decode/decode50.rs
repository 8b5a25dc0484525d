//! RAR v5 ("5.0") decoder: LZ with Huffman coded symbols, bit-budgeted
//! blocks, and inline filter records.

use super::bit_reader::LimitedBitReader;
use super::filters::{arm_filter, delta_filter, e8_filter};
use super::huffman::HuffmanTable;
use super::window::Window;
use super::{ByteInput, Decoder, FilterBlock};
use crate::block::DECODE50;
use crate::error::{RarError, Result};

const MAIN_SIZE: usize = 306;
const OFFSET_SIZE: usize = 64;
const LOW_OFFSET_SIZE: usize = 16;
const LENGTH_SIZE: usize = 44;
const TABLE_SIZE: usize = MAIN_SIZE + OFFSET_SIZE + LOW_OFFSET_SIZE + LENGTH_SIZE;

/// RAR v5 decoder state.
pub(crate) struct Decode50 {
    br: LimitedBitReader,
    main: HuffmanTable,
    offset: HuffmanTable,
    low_offset: HuffmanTable,
    length: HuffmanTable,
    old_dist: [usize; 4],
    last_len: usize,
    /// The current block is the file's last.
    last_block: bool,
    done: bool,
}

impl Decode50 {
    pub(crate) fn new() -> Self {
        Self {
            br: LimitedBitReader::new(),
            main: HuffmanTable::new(),
            offset: HuffmanTable::new(),
            low_offset: HuffmanTable::new(),
            length: HuffmanTable::new(),
            old_dist: [0; 4],
            last_len: 0,
            last_block: false,
            done: false,
        }
    }

    /// Reads a compressed block header: flags, checksum, block size in
    /// bits, and optionally new code tables.
    fn read_block_header(&mut self, input: &mut dyn ByteInput) -> Result<()> {
        let flags = self.br.read_byte_raw(input)?;
        let byte_count = ((flags >> 3) & 3) + 1;
        if byte_count == 4 {
            return Err(RarError::CorruptBlockHeader);
        }
        let expected = self.br.read_byte_raw(input)?;
        let mut sum = 0x5au8 ^ flags;
        let mut block_bytes: u64 = 0;
        for i in 0..byte_count {
            let b = self.br.read_byte_raw(input)?;
            sum ^= b;
            block_bytes |= (b as u64) << (8 * i);
        }
        if sum != expected || block_bytes == 0 {
            return Err(RarError::CorruptBlockHeader);
        }
        let block_bits = (flags & 7) as i64 + 1 + (block_bytes as i64 - 1) * 8;
        self.br.set_limit(block_bits);
        self.last_block = flags & 0x40 != 0;
        if flags & 0x80 != 0 {
            self.read_tables(input)?;
        }
        Ok(())
    }

    fn read_tables(&mut self, input: &mut dyn ByteInput) -> Result<()> {
        let mut pre = [0u8; 20];
        let mut i = 0;
        while i < pre.len() {
            let n = self.br.read_bits(input, 4)? as u8;
            if n == 0x0F {
                let zeros = self.br.read_bits(input, 4)? as usize;
                if zeros > 0 {
                    for _ in 0..(zeros + 2).min(pre.len() - i) {
                        pre[i] = 0;
                        i += 1;
                    }
                    continue;
                }
            }
            pre[i] = n;
            i += 1;
        }
        let mut precode = HuffmanTable::new();
        precode.build(&pre)?;

        let mut table = [0u8; TABLE_SIZE];
        let mut i = 0;
        while i < TABLE_SIZE {
            let sym = precode.read_sym(&mut self.br, input)?;
            match sym {
                0..=15 => {
                    table[i] = sym as u8;
                    i += 1;
                }
                16 | 17 => {
                    if i == 0 {
                        return Err(RarError::CorruptBlockHeader);
                    }
                    let count = if sym == 16 {
                        3 + self.br.read_bits(input, 3)? as usize
                    } else {
                        11 + self.br.read_bits(input, 7)? as usize
                    };
                    let prev = table[i - 1];
                    for _ in 0..count.min(TABLE_SIZE - i) {
                        table[i] = prev;
                        i += 1;
                    }
                }
                18 | 19 => {
                    let count = if sym == 18 {
                        3 + self.br.read_bits(input, 3)? as usize
                    } else {
                        11 + self.br.read_bits(input, 7)? as usize
                    };
                    for _ in 0..count.min(TABLE_SIZE - i) {
                        table[i] = 0;
                        i += 1;
                    }
                }
                _ => return Err(RarError::CorruptBlockHeader),
            }
        }

        let mut off = 0;
        self.main.build(&table[off..off + MAIN_SIZE])?;
        off += MAIN_SIZE;
        self.offset.build(&table[off..off + OFFSET_SIZE])?;
        off += OFFSET_SIZE;
        self.low_offset.build(&table[off..off + LOW_OFFSET_SIZE])?;
        off += LOW_OFFSET_SIZE;
        self.length.build(&table[off..off + LENGTH_SIZE])?;
        Ok(())
    }

    /// Reads a little-endian value stored as a 2-bit byte count followed by
    /// that many bytes.
    fn read_filter_data(&mut self, input: &mut dyn ByteInput) -> Result<u32> {
        let count = self.br.read_bits(input, 2)? + 1;
        let mut v = 0u32;
        for i in 0..count {
            v |= self.br.read_bits(input, 8)? << (8 * i);
        }
        Ok(v)
    }

    /// Reads an inline filter record (main symbol 256).
    fn read_filter(&mut self, input: &mut dyn ByteInput, buffered: usize) -> Result<FilterBlock> {
        let block_start = self.read_filter_data(input)? as usize;
        let block_len = self.read_filter_data(input)? as usize;
        let filter = match self.br.read_bits(input, 3)? {
            0 => {
                let channels = self.br.read_bits(input, 5)? as usize + 1;
                delta_filter(channels)
            }
            1 => e8_filter(false),
            2 => e8_filter(true),
            3 => arm_filter(),
            _ => return Err(RarError::InvalidFilter),
        };
        Ok(FilterBlock {
            offset: block_start + buffered,
            length: block_len,
            filter,
        })
    }

    /// Converts a length slot to a match length, reading extra bits as
    /// needed.
    fn slot_to_length(&mut self, input: &mut dyn ByteInput, slot: usize) -> Result<usize> {
        if slot < 8 {
            return Ok(slot + 2);
        }
        let lbits = (slot / 4 - 1) as u8;
        let base = ((4 | (slot & 3)) << lbits) + 2;
        let extra = self.br.read_bits(input, lbits)? as usize;
        Ok(base + extra)
    }

    fn read_length(&mut self, input: &mut dyn ByteInput) -> Result<usize> {
        let slot = self.length.read_sym(&mut self.br, input)? as usize;
        if slot >= LENGTH_SIZE {
            return Err(RarError::CorruptBlockHeader);
        }
        self.slot_to_length(input, slot)
    }

    /// Reads a new match distance, applying the length correction for far
    /// matches.
    fn read_offset(&mut self, input: &mut dyn ByteInput, len: &mut usize) -> Result<usize> {
        let slot = self.offset.read_sym(&mut self.br, input)? as usize;
        if slot >= OFFSET_SIZE {
            return Err(RarError::CorruptBlockHeader);
        }
        let mut dist: u64 = slot as u64;
        if slot >= 4 {
            let dbits = slot / 2 - 1;
            dist = (2 | (slot as u64 & 1)) << dbits;
            if dbits >= 4 {
                if dbits > 4 {
                    dist += (self.br.read_bits(input, (dbits - 4) as u8)? as u64) << 4;
                }
                let low = self.low_offset.read_sym(&mut self.br, input)? as u64;
                dist += low;
            } else {
                dist += self.br.read_bits(input, dbits as u8)? as u64;
            }
        }
        let dist = dist + 1;
        if dist > 0x100 {
            *len += 1;
            if dist > 0x2000 {
                *len += 1;
                if dist > 0x40000 {
                    *len += 1;
                }
            }
        }
        Ok(dist as usize)
    }

    fn insert_old_dist(&mut self, dist: usize) {
        self.old_dist.copy_within(0..3, 1);
        self.old_dist[0] = dist;
    }
}

impl Decoder for Decode50 {
    fn init(&mut self, reset: bool) -> Result<()> {
        self.br.set_limit(0);
        self.done = false;
        self.last_block = false;
        if reset {
            self.old_dist = [0; 4];
            self.last_len = 0;
        }
        Ok(())
    }

    fn fill(&mut self, win: &mut Window, input: &mut dyn ByteInput) -> Result<Vec<FilterBlock>> {
        let mut fl = Vec::new();
        while win.available() > 0 && !self.done {
            if self.br.exhausted() {
                if self.last_block {
                    self.done = true;
                    break;
                }
                self.read_block_header(input)?;
                continue;
            }
            let sym = self.main.read_sym(&mut self.br, input)?;
            match sym {
                0..=255 => win.write_byte(sym as u8),
                256 => {
                    let fb = self.read_filter(input, win.buffered())?;
                    fl.push(fb);
                }
                257 => {
                    // repeat the previous match
                    if self.last_len != 0 {
                        win.copy_bytes(self.last_len, self.old_dist[0]);
                    }
                }
                258..=261 => {
                    let idx = sym as usize - 258;
                    let dist = self.old_dist[idx];
                    self.old_dist.copy_within(0..idx, 1);
                    self.old_dist[0] = dist;
                    let len = self.read_length(input)?;
                    self.last_len = len;
                    win.copy_bytes(len, dist);
                }
                262..=305 => {
                    let slot = sym as usize - 262;
                    let mut len = self.slot_to_length(input, slot)?;
                    let dist = self.read_offset(input, &mut len)?;
                    self.insert_old_dist(dist);
                    self.last_len = len;
                    win.copy_bytes(len, dist);
                }
                _ => return Err(RarError::CorruptBlockHeader),
            }
        }
        Ok(fl)
    }

    fn version(&self) -> u8 {
        DECODE50
    }
}
