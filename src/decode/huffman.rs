//! Canonical Huffman decoding.
//!
//! Both RAR decoders transmit code lengths (up to 15 bits) and decode
//! symbols against the canonical code assignment.

use super::bit_reader::BitStream;
use super::ByteInput;
use crate::error::{RarError, Result};

pub(crate) const MAX_CODE_LENGTH: u8 = 15;

/// Canonical Huffman decode table built from code lengths.
#[derive(Default)]
pub(crate) struct HuffmanTable {
    /// One past the last canonical code of each length.
    limit: [u32; MAX_CODE_LENGTH as usize + 1],
    /// First canonical code of each length.
    first: [u32; MAX_CODE_LENGTH as usize + 1],
    /// Index into `symbols` of the first symbol of each length.
    pos: [u32; MAX_CODE_LENGTH as usize + 1],
    /// Symbols ordered by (code length, symbol value).
    symbols: Vec<u16>,
    min_len: u8,
}

impl HuffmanTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the table from per-symbol code lengths. Lengths of zero
    /// mean the symbol does not occur.
    pub(crate) fn build(&mut self, lengths: &[u8]) -> Result<()> {
        let mut count = [0u32; MAX_CODE_LENGTH as usize + 1];
        for &len in lengths {
            if len > 0 {
                if len > MAX_CODE_LENGTH {
                    return Err(RarError::CorruptBlockHeader);
                }
                count[len as usize] += 1;
            }
        }

        self.min_len = 0;
        let mut code = 0u32;
        let mut pos = 0u32;
        for l in 1..=MAX_CODE_LENGTH as usize {
            code <<= 1;
            self.first[l] = code;
            self.pos[l] = pos;
            code += count[l];
            pos += count[l];
            self.limit[l] = code;
            if self.min_len == 0 && count[l] > 0 {
                self.min_len = l as u8;
            }
        }

        self.symbols.clear();
        self.symbols.resize(pos as usize, 0);
        let mut next = self.pos;
        for (sym, &len) in lengths.iter().enumerate() {
            if len > 0 {
                let i = next[len as usize] as usize;
                self.symbols[i] = sym as u16;
                next[len as usize] += 1;
            }
        }
        Ok(())
    }

    /// Decodes one symbol, reading only as many bits as the code needs.
    pub(crate) fn read_sym<B: BitStream + ?Sized>(
        &self,
        br: &mut B,
        input: &mut dyn ByteInput,
    ) -> Result<u16> {
        if self.min_len == 0 {
            return Err(RarError::CorruptBlockHeader);
        }
        let (v, k) = br.read_bits_max(input, MAX_CODE_LENGTH)?;
        if k == 0 {
            return Err(RarError::DecoderOutOfData);
        }
        // left-align what we got against the 15-bit code space
        let v15 = v << (MAX_CODE_LENGTH - k);
        let mut l = self.min_len;
        loop {
            let code = v15 >> (MAX_CODE_LENGTH - l);
            if code < self.limit[l as usize] {
                break;
            }
            l += 1;
            if l > MAX_CODE_LENGTH {
                return Err(RarError::CorruptBlockHeader);
            }
        }
        if l > k {
            // the stream ended inside a code
            return Err(RarError::DecoderOutOfData);
        }
        br.unread_bits(k - l);
        let code = v15 >> (MAX_CODE_LENGTH - l);
        let idx = (self.pos[l as usize] + (code - self.first[l as usize])) as usize;
        self.symbols
            .get(idx)
            .copied()
            .ok_or(RarError::CorruptBlockHeader)
    }
}
