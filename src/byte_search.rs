//! Fast byte search using SWAR over u64 words.
//!
//! Used by the signature scanner, which may have to walk up to a megabyte
//! of self-extracting stub before the archive proper starts.

const LO: u64 = 0x0101_0101_0101_0101;
const HI: u64 = 0x8080_8080_8080_8080;

/// Find the first occurrence of `needle` in `haystack`.
#[inline]
pub(crate) fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    let broadcast = LO.wrapping_mul(u64::from(needle));
    let mut chunks = haystack.chunks_exact(8);

    for (ci, chunk) in chunks.by_ref().enumerate() {
        let word = u64::from_le_bytes(chunk.try_into().unwrap());
        let xored = word ^ broadcast;
        let has_match = xored.wrapping_sub(LO) & !xored & HI;
        if has_match != 0 {
            return Some(ci * 8 + (has_match.trailing_zeros() as usize / 8));
        }
    }

    let tail_start = haystack.len() - chunks.remainder().len();
    chunks
        .remainder()
        .iter()
        .position(|&b| b == needle)
        .map(|i| tail_start + i)
}
