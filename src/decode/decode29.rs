//! RAR v3 ("2.9") decoder: LZ with Huffman coded symbols and VM-delivered
//! filters.
//!
//! Filter programs are matched against the well-known stock programs by
//! length and CRC32 and run through the native filter implementations;
//! archives carrying custom programs (or PPMd blocks) are rejected.

use super::bit_reader::BitReader;
use super::filters::{delta_filter, e8_filter};
use super::huffman::HuffmanTable;
use super::window::Window;
use super::{ByteInput, Decoder, FilterBlock};
use crate::block::DECODE29;
use crate::error::{RarError, Result};

const MAIN_SIZE: usize = 299;
const OFFSET_SIZE: usize = 60;
const LOW_OFFSET_SIZE: usize = 17;
const LENGTH_SIZE: usize = 28;
const TABLE_SIZE: usize = MAIN_SIZE + OFFSET_SIZE + LOW_OFFSET_SIZE + LENGTH_SIZE;

/// How many length codes each distance-extra-bit width contributes to the
/// 60-slot distance table.
const DIST_BIT_COUNTS: [u8; 19] = [4, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 14, 0, 12];

/// Base lengths and extra bits for the 28 length codes.
const LENGTH_BASE: [u32; LENGTH_SIZE] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 32, 40, 48, 56, 64, 80, 96, 112, 128,
    160, 192, 224,
];
const LENGTH_BITS: [u8; LENGTH_SIZE] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5,
];

/// Short match distances for symbols 263-270 (length is always two).
const SHORT_BASE: [u32; 8] = [0, 4, 8, 16, 32, 64, 128, 192];
const SHORT_BITS: [u8; 8] = [2, 2, 3, 4, 5, 6, 6, 6];

/// Maximum accepted VM program size.
const MAX_VM_CODE: u32 = 0x10000;

/// Stock v3 filter programs, identified by CRC32 and length of the program
/// bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
enum StockFilter {
    E8,
    E8E9,
    Itanium,
    Delta,
    Rgb,
    Audio,
}

const STOCK_FILTERS: [(u32, usize, StockFilter); 6] = [
    (0xad57_6887, 53, StockFilter::E8),
    (0x3cd7_e57e, 57, StockFilter::E8E9),
    (0x3769_893f, 120, StockFilter::Itanium),
    (0x0e06_077d, 29, StockFilter::Delta),
    (0x1c2c_5dc8, 149, StockFilter::Rgb),
    (0xbc85_e701, 216, StockFilter::Audio),
];

/// RAR v3 decoder state.
pub(crate) struct Decode29 {
    br: BitReader,
    main: HuffmanTable,
    offset: HuffmanTable,
    low_offset: HuffmanTable,
    length: HuffmanTable,
    /// Code length table; v3 transmits deltas against the previous table.
    table: [u8; TABLE_SIZE],
    tables_read: bool,
    /// The current file's stream is complete.
    done: bool,

    dist_base: [u32; OFFSET_SIZE],
    dist_bits: [u8; OFFSET_SIZE],

    old_dist: [u32; 4],
    last_dist: u32,
    last_len: u32,
    low_offset_repeats: u32,
    prev_low_offset: u32,

    /// Per-program block lengths, reused when a filter is re-invoked
    /// without a length of its own.
    filter_lengths: Vec<usize>,
    filter_kinds: Vec<StockFilter>,
    last_filter: usize,
}

impl Decode29 {
    pub(crate) fn new() -> Self {
        let mut dist_base = [0u32; OFFSET_SIZE];
        let mut dist_bits = [0u8; OFFSET_SIZE];
        let mut dist = 0u32;
        let mut slot = 0usize;
        for (bits, &count) in DIST_BIT_COUNTS.iter().enumerate() {
            for _ in 0..count {
                dist_base[slot] = dist;
                dist_bits[slot] = bits as u8;
                dist += 1 << bits;
                slot += 1;
            }
        }
        Self {
            br: BitReader::new(),
            main: HuffmanTable::new(),
            offset: HuffmanTable::new(),
            low_offset: HuffmanTable::new(),
            length: HuffmanTable::new(),
            table: [0; TABLE_SIZE],
            tables_read: false,
            done: false,
            dist_base,
            dist_bits,
            old_dist: [0; 4],
            last_dist: 0,
            last_len: 0,
            low_offset_repeats: 0,
            prev_low_offset: 0,
            filter_lengths: Vec::new(),
            filter_kinds: Vec::new(),
            last_filter: 0,
        }
    }

    fn init_filters(&mut self) {
        self.filter_lengths.clear();
        self.filter_kinds.clear();
        self.last_filter = 0;
    }

    /// Reads the per-block code length tables.
    fn read_tables(&mut self, input: &mut dyn ByteInput) -> Result<()> {
        self.br.align_byte();
        if self.br.read_bits(input, 1)? != 0 {
            // PPMd block; the text model is out of scope
            return Err(RarError::UnknownDecoder(DECODE29));
        }
        if self.br.read_bits(input, 1)? == 0 {
            self.table.fill(0);
        }

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

        let mut i = 0;
        while i < TABLE_SIZE {
            let sym = precode.read_sym(&mut self.br, input)?;
            match sym {
                0..=15 => {
                    // lengths are coded as deltas against the old table
                    self.table[i] = (self.table[i] + sym as u8) & 0x0F;
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
                    let prev = self.table[i - 1];
                    for _ in 0..count.min(TABLE_SIZE - i) {
                        self.table[i] = prev;
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
                        self.table[i] = 0;
                        i += 1;
                    }
                }
                _ => return Err(RarError::CorruptBlockHeader),
            }
        }

        let mut off = 0;
        self.main.build(&self.table[off..off + MAIN_SIZE])?;
        off += MAIN_SIZE;
        self.offset.build(&self.table[off..off + OFFSET_SIZE])?;
        off += OFFSET_SIZE;
        self.low_offset.build(&self.table[off..off + LOW_OFFSET_SIZE])?;
        off += LOW_OFFSET_SIZE;
        self.length.build(&self.table[off..off + LENGTH_SIZE])?;

        self.tables_read = true;
        Ok(())
    }

    /// Reads a match length from the length code table.
    fn read_length(&mut self, input: &mut dyn ByteInput) -> Result<u32> {
        let sym = self.length.read_sym(&mut self.br, input)? as usize;
        if sym >= LENGTH_SIZE {
            return Err(RarError::CorruptBlockHeader);
        }
        let extra = if LENGTH_BITS[sym] > 0 {
            self.br.read_bits(input, LENGTH_BITS[sym])?
        } else {
            0
        };
        Ok(LENGTH_BASE[sym] + extra + 2)
    }

    /// Reads a match distance, using the low-offset table (with its
    /// repeat-16 cache) for wide distance slots.
    fn read_distance(&mut self, input: &mut dyn ByteInput) -> Result<u32> {
        let slot = self.offset.read_sym(&mut self.br, input)? as usize;
        if slot >= OFFSET_SIZE {
            return Err(RarError::CorruptBlockHeader);
        }
        let bits = self.dist_bits[slot];
        let mut dist = self.dist_base[slot] + 1;
        if bits > 0 {
            if bits >= 4 {
                if bits > 4 {
                    dist += self.br.read_bits(input, bits - 4)? << 4;
                }
                let low = if self.low_offset_repeats > 0 {
                    self.low_offset_repeats -= 1;
                    self.prev_low_offset
                } else {
                    let sym = self.low_offset.read_sym(&mut self.br, input)? as u32;
                    if sym == 16 {
                        self.low_offset_repeats = 15 - 1;
                        self.prev_low_offset
                    } else {
                        self.prev_low_offset = sym;
                        sym
                    }
                };
                dist += low;
            } else {
                dist += self.br.read_bits(input, bits)?;
            }
        }
        Ok(dist)
    }

    fn insert_old_dist(&mut self, dist: u32) {
        self.old_dist.copy_within(0..3, 1);
        self.old_dist[0] = dist;
    }

    /// Reads a VM filter envelope after main symbol 257.
    fn read_vm_code(
        &mut self,
        input: &mut dyn ByteInput,
        buffered: usize,
    ) -> Result<FilterBlock> {
        let flags = self.br.read_bits(input, 8)?;
        let mut length = (flags & 7) + 1;
        if length == 7 {
            length = self.br.read_bits(input, 8)? + 7;
        } else if length == 8 {
            length = self.br.read_bits(input, 16)?;
        }
        if length == 0 {
            return Err(RarError::InvalidFilter);
        }
        let mut code = vec![0u8; length as usize];
        self.br.read_full(input, &mut code)?;
        // the first byte is an xor checksum of the rest
        let mut x = 0u8;
        for &c in &code[1..] {
            x ^= c;
        }
        if x != code[0] {
            return Err(RarError::InvalidFilter);
        }
        self.parse_vm_filter(flags as u8, &code[1..], buffered)
    }

    /// Parses the filter program envelope and maps the program onto a
    /// native filter.
    fn parse_vm_filter(
        &mut self,
        flags: u8,
        data: &[u8],
        buffered: usize,
    ) -> Result<FilterBlock> {
        let mut input = super::SliceInput::new(data);
        let input = &mut input as &mut dyn ByteInput;
        let mut br = BitReader::new();

        let pos = if flags & 0x80 != 0 {
            let n = br.read_v3_u32(input)?;
            if n == 0 {
                self.init_filters();
                0
            } else {
                (n - 1) as usize
            }
        } else {
            self.last_filter
        };
        if pos > self.filter_lengths.len() {
            return Err(RarError::InvalidFilter);
        }
        self.last_filter = pos;
        let new_filter = pos == self.filter_lengths.len();
        if new_filter {
            self.filter_lengths.push(0);
        }

        let mut block_start = br.read_v3_u32(input)? as usize;
        if flags & 0x40 != 0 {
            block_start += 258;
        }
        let block_len = if flags & 0x20 != 0 {
            let l = br.read_v3_u32(input)? as usize;
            self.filter_lengths[pos] = l;
            l
        } else {
            self.filter_lengths[pos]
        };

        let mut registers = [0u32; 7];
        if flags & 0x10 != 0 {
            let mask = br.read_bits(input, 7)?;
            for (i, r) in registers.iter_mut().enumerate() {
                if mask & (1 << i) != 0 {
                    *r = br.read_v3_u32(input)?;
                }
            }
        }

        if new_filter {
            let code_size = br.read_v3_u32(input)?;
            if code_size == 0 || code_size >= MAX_VM_CODE {
                return Err(RarError::InvalidFilter);
            }
            let mut code = vec![0u8; code_size as usize];
            br.read_full(input, &mut code)?;
            let crc = crc32fast::hash(&code);
            let kind = STOCK_FILTERS
                .iter()
                .find(|&&(c, l, _)| c == crc && l == code.len())
                .map(|&(_, _, k)| k)
                .ok_or(RarError::UnsupportedFilter)?;
            self.filter_kinds.push(kind);
        }
        let kind = self.filter_kinds[pos];

        if flags & 0x08 != 0 {
            // global data block; the native filters take their parameters
            // from the registers instead
            let data_size = br.read_v3_u32(input)? as usize;
            if data_size > 0x2000 {
                return Err(RarError::InvalidFilter);
            }
            let mut sink = vec![0u8; data_size];
            br.read_full(input, &mut sink)?;
        }

        let filter = match kind {
            StockFilter::Delta => delta_filter(registers[0] as usize),
            StockFilter::E8 => e8_filter(false),
            StockFilter::E8E9 => e8_filter(true),
            StockFilter::Itanium | StockFilter::Rgb | StockFilter::Audio => {
                return Err(RarError::UnsupportedFilter)
            }
        };
        Ok(FilterBlock {
            offset: block_start + buffered,
            length: block_len,
            filter,
        })
    }

    fn fill_inner(
        &mut self,
        win: &mut Window,
        input: &mut dyn ByteInput,
        fl: &mut Vec<FilterBlock>,
    ) -> Result<()> {
        if !self.tables_read {
            self.read_tables(input)?;
        }
        while win.available() > 0 && !self.done {
            let sym = self.main.read_sym(&mut self.br, input)?;
            match sym {
                0..=255 => win.write_byte(sym as u8),
                256 => {
                    // end of block
                    if self.br.read_bits(input, 1)? != 0 {
                        self.read_tables(input)?;
                        continue;
                    }
                    let new_table = self.br.read_bits(input, 1)? != 0;
                    self.tables_read = !new_table;
                    self.done = true;
                }
                257 => {
                    let fb = self.read_vm_code(input, win.buffered())?;
                    fl.push(fb);
                }
                258 => {
                    if self.last_len > 0 {
                        win.copy_bytes(self.last_len as usize, self.last_dist as usize);
                    }
                }
                259..=262 => {
                    let idx = sym as usize - 259;
                    let dist = self.old_dist[idx];
                    let len = self.read_length(input)?;
                    // move the used distance to the front of the history
                    self.old_dist.copy_within(0..idx, 1);
                    self.old_dist[0] = dist;
                    self.last_dist = dist;
                    self.last_len = len;
                    win.copy_bytes(len as usize, dist as usize);
                }
                263..=270 => {
                    let idx = sym as usize - 263;
                    let extra = if SHORT_BITS[idx] > 0 {
                        self.br.read_bits(input, SHORT_BITS[idx])?
                    } else {
                        0
                    };
                    let dist = SHORT_BASE[idx] + extra + 1;
                    self.insert_old_dist(dist);
                    self.last_dist = dist;
                    self.last_len = 2;
                    win.copy_bytes(2, dist as usize);
                }
                271..=298 => {
                    let idx = sym as usize - 271;
                    let extra = if LENGTH_BITS[idx] > 0 {
                        self.br.read_bits(input, LENGTH_BITS[idx])?
                    } else {
                        0
                    };
                    let mut len = LENGTH_BASE[idx] + extra + 3;
                    let dist = self.read_distance(input)?;
                    if dist >= 0x2000 {
                        len += 1;
                        if dist >= 0x40000 {
                            len += 1;
                        }
                    }
                    self.insert_old_dist(dist);
                    self.last_dist = dist;
                    self.last_len = len;
                    win.copy_bytes(len as usize, dist as usize);
                }
                _ => return Err(RarError::CorruptBlockHeader),
            }
        }
        Ok(())
    }
}

impl Decoder for Decode29 {
    fn init(&mut self, reset: bool) -> Result<()> {
        self.br.reset();
        self.done = false;
        if reset {
            self.table.fill(0);
            self.tables_read = false;
            self.old_dist = [0; 4];
            self.last_dist = 0;
            self.last_len = 0;
            self.low_offset_repeats = 0;
            self.prev_low_offset = 0;
            self.init_filters();
        }
        Ok(())
    }

    fn fill(&mut self, win: &mut Window, input: &mut dyn ByteInput) -> Result<Vec<FilterBlock>> {
        let mut fl = Vec::new();
        if self.done {
            return Ok(fl);
        }
        match self.fill_inner(win, input, &mut fl) {
            Ok(()) => Ok(fl),
            // the packed stream ended; the file is as long as it is
            Err(RarError::DecoderOutOfData) => {
                self.done = true;
                Ok(fl)
            }
            Err(e) => Err(e),
        }
    }

    fn version(&self) -> u8 {
        DECODE29
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::SliceInput;

    #[test]
    fn test_distance_table_shape() {
        let d = Decode29::new();
        // first four slots are direct distances
        assert_eq!(&d.dist_base[..5], &[0, 1, 2, 3, 4]);
        assert_eq!(&d.dist_bits[..5], &[0, 0, 0, 0, 1]);
        // final slot covers the top of the 4MB window range
        assert_eq!(d.dist_bits[OFFSET_SIZE - 1], 18);
        assert!(d.dist_base[OFFSET_SIZE - 1] > 0x100000);
    }

    #[test]
    fn test_ppm_block_rejected() {
        let mut d = Decode29::new();
        d.init(true).unwrap();
        let mut win = Window::new();
        win.reset(18, true);
        // first bit set selects the PPM text model
        let mut input = SliceInput::new(&[0x80, 0, 0, 0]);
        assert!(matches!(
            d.fill(&mut win, &mut input),
            Err(RarError::UnknownDecoder(DECODE29))
        ));
    }

    #[test]
    fn test_empty_input_finishes() {
        let mut d = Decode29::new();
        d.init(true).unwrap();
        // tables survive from a previous solid segment in this scenario
        d.tables_read = true;
        d.main.build(&[1, 2, 2]).unwrap();
        let mut win = Window::new();
        win.reset(18, true);
        let mut input = SliceInput::new(&[]);
        let fl = d.fill(&mut win, &mut input).unwrap();
        assert!(fl.is_empty());
        assert!(d.done);
    }
}
