//! RAR 1.5 - 4.x block format parser.

use std::collections::HashMap;
use std::time::Duration;

use super::HeaderBuf;
use crate::block::{
    BlockChecksum, BlockOutcome, FileBlockHeader, FormatReader, DECODE29, DECODE_NONE,
};
use crate::crypto::{derive_keys_v3, CbcDec, CIPHER_BLOCK_SIZE};
use crate::error::{RarError, Result};
use crate::format::{dos_time, Format};
use crate::header::{FileHeader, HostOs};
use crate::volume::VolumeSource;

// Header types.
const BLOCK_MAIN: u8 = 0x73;
const BLOCK_FILE: u8 = 0x74;
const BLOCK_SERVICE: u8 = 0x7A;
const BLOCK_END: u8 = 0x7B;

// Main header flags.
const MAIN_SOLID: u16 = 0x0008;
const MAIN_NEW_NAMING: u16 = 0x0010;
const MAIN_PASSWORD: u16 = 0x0080;

// File header flags.
const FILE_SPLIT_BEFORE: u16 = 0x0001;
const FILE_SPLIT_AFTER: u16 = 0x0002;
const FILE_ENCRYPTED: u16 = 0x0004;
const FILE_SOLID: u16 = 0x0010;
const FILE_LARGE: u16 = 0x0100;
const FILE_UNICODE: u16 = 0x0200;
const FILE_SALT: u16 = 0x0400;
const FILE_VERSION: u16 = 0x0800;
const FILE_EXT_TIME: u16 = 0x1000;

// Generic flags.
const BLOCK_HAS_DATA: u16 = 0x8000;

// End header flags.
const END_NEXT_VOLUME: u16 = 0x0001;

/// Parser for the v1.5 on-disk block format.
pub(crate) struct Archive15 {
    password: Option<String>,
    /// Headers are encrypted (`rar -hp` archives).
    encrypted: bool,
    arc_solid: bool,
    old_naming: bool,
    /// v3 key derivation is expensive; cache per salt.
    kdf_cache: HashMap<Vec<u8>, ([u8; 16], [u8; 16])>,
    /// Current header bytes, decrypted if necessary.
    hbuf: Vec<u8>,
}

impl Archive15 {
    pub(crate) fn new(password: Option<String>) -> Self {
        Self {
            password,
            encrypted: false,
            arc_solid: false,
            old_naming: true,
            kdf_cache: HashMap::new(),
            hbuf: Vec::new(),
        }
    }

    fn keys_for(&mut self, salt: &[u8]) -> Result<([u8; 16], [u8; 16])> {
        let pass = self
            .password
            .as_deref()
            .ok_or(RarError::PasswordRequired)?;
        if let Some(k) = self.kdf_cache.get(salt) {
            return Ok(*k);
        }
        let keys = derive_keys_v3(pass, salt);
        self.kdf_cache.insert(salt.to_vec(), keys);
        Ok(keys)
    }

    /// Reads one header into `hbuf`, decrypting when the archive has
    /// encrypted headers, and validates its CRC. Returns false on a clean
    /// EOF at a header boundary.
    fn read_header(&mut self, src: &mut VolumeSource) -> Result<bool> {
        self.hbuf.clear();
        if self.encrypted {
            if src.peek(1)?.is_empty() {
                return Ok(false);
            }
            // every encrypted header carries its own salt
            let salt = src.read_slice(8)?.to_vec();
            let (key, iv) = self.keys_for(&salt)?;
            let mut dec = CbcDec::new(&key, &iv)?;
            let mut block = [0u8; CIPHER_BLOCK_SIZE];
            block.copy_from_slice(src.read_slice(CIPHER_BLOCK_SIZE)?);
            dec.decrypt(&mut block);
            self.hbuf.extend_from_slice(&block);

            let size = u16::from_le_bytes([self.hbuf[5], self.hbuf[6]]) as usize;
            if size < 7 {
                return Err(RarError::CorruptBlockHeader);
            }
            while self.hbuf.len() < size {
                block.copy_from_slice(src.read_slice(CIPHER_BLOCK_SIZE)?);
                dec.decrypt(&mut block);
                self.hbuf.extend_from_slice(&block);
            }
            self.hbuf.truncate(size);
        } else {
            if src.peek(1)?.is_empty() {
                return Ok(false);
            }
            let base = src.read_slice(7)?;
            self.hbuf.extend_from_slice(base);
            let size = u16::from_le_bytes([self.hbuf[5], self.hbuf[6]]) as usize;
            if size < 7 {
                return Err(RarError::CorruptBlockHeader);
            }
            let rest = src.read_slice(size - 7)?;
            self.hbuf.extend_from_slice(rest);
        }

        let stored = u16::from_le_bytes([self.hbuf[0], self.hbuf[1]]);
        let computed = crc32fast::hash(&self.hbuf[2..]) as u16;
        if stored != computed {
            return Err(RarError::BadHeaderCrc);
        }
        Ok(true)
    }

    fn parse_file_block(&mut self, flags: u16, body: &[u8]) -> Result<FileBlockHeader> {
        let mut b = HeaderBuf::new(body);
        let pack_size = b.u32le()?;
        let unp_size = b.u32le()?;
        let host_os = b.byte()?;
        let file_crc = b.u32le()?;
        let file_time = b.u32le()?;
        let unp_ver = b.byte()?;
        let method = b.byte()?;
        let name_size = b.u16le()? as usize;
        let attributes = b.u32le()?;

        let mut packed = pack_size as u64;
        let mut unpacked = unp_size as u64;
        let mut unknown_size = unp_size == u32::MAX;
        if flags & FILE_LARGE != 0 {
            let high_pack = b.u32le()?;
            let high_unp = b.u32le()?;
            packed |= (high_pack as u64) << 32;
            unpacked |= (high_unp as u64) << 32;
            unknown_size = unp_size == u32::MAX && high_unp == u32::MAX;
        }

        let name_bytes = b.bytes(name_size)?;
        let mut name = if flags & FILE_UNICODE != 0 {
            decode_name(name_bytes)
        } else {
            String::from_utf8_lossy(name_bytes).into_owned()
        };
        name = name.replace('\\', "/");

        let mut version = 0;
        if flags & FILE_VERSION != 0 {
            if let Some(i) = name.rfind(';') {
                if let Ok(v) = name[i + 1..].parse() {
                    version = v;
                    name.truncate(i);
                }
            }
        }

        let salt = if flags & FILE_SALT != 0 {
            b.bytes(8)?.to_vec()
        } else {
            Vec::new()
        };

        let dict = (flags >> 5) & 7;
        let is_dir = dict == 7;

        let mut header = FileHeader {
            name,
            is_dir,
            solid: flags & FILE_SOLID != 0,
            host_os: HostOs::from_u8(host_os),
            attributes: attributes as u64,
            packed_size: packed,
            unpacked_size: unpacked,
            unknown_size,
            modification_time: Some(dos_time(file_time)),
            creation_time: None,
            access_time: None,
            version,
        };
        if flags & FILE_EXT_TIME != 0 {
            read_ext_times(&mut b, &mut header)?;
        }

        let dec_ver = if method == 0x30 || is_dir {
            DECODE_NONE
        } else {
            match unp_ver {
                29 | 36 => DECODE29,
                v => return Err(RarError::UnknownDecoder(v)),
            }
        };

        let cipher = if flags & FILE_ENCRYPTED != 0 {
            let (key, iv) = self.keys_for(&salt)?;
            Some((key.to_vec(), iv.to_vec()))
        } else {
            None
        };

        let first = flags & FILE_SPLIT_BEFORE == 0;
        let last = flags & FILE_SPLIT_AFTER == 0;
        // for split files the per-volume sums cover single parts only;
        // whole-file verification applies to unsplit files
        let checksum = if first && last && !is_dir {
            Some(BlockChecksum {
                key: None,
                sum: file_crc.to_le_bytes().to_vec(),
            })
        } else {
            None
        };

        Ok(FileBlockHeader {
            first,
            last,
            arc_solid: self.arc_solid,
            win_size: if is_dir { 0 } else { 16 + dict as u8 },
            dec_ver,
            checksum,
            cipher,
            packed_off: 0,
            data_off: 0,
            vol_num: 0,
            header,
        })
    }
}

impl FormatReader for Archive15 {
    fn next_block(&mut self, src: &mut VolumeSource) -> Result<BlockOutcome> {
        loop {
            if !self.read_header(src)? {
                // ran out of volume without an end marker
                return Ok(BlockOutcome::VolumeOrArchiveEnd);
            }
            let htype = self.hbuf[2];
            let flags = u16::from_le_bytes([self.hbuf[3], self.hbuf[4]]);
            let body = self.hbuf[7..].to_vec();

            match htype {
                BLOCK_MAIN => {
                    self.arc_solid = flags & MAIN_SOLID != 0;
                    self.old_naming = flags & MAIN_NEW_NAMING == 0;
                    self.encrypted = flags & MAIN_PASSWORD != 0;
                }
                BLOCK_FILE => {
                    return Ok(BlockOutcome::Block(self.parse_file_block(flags, &body)?));
                }
                BLOCK_SERVICE => {
                    // service records (comments, recovery data) share the
                    // file header layout; only the data size matters here
                    let mut b = HeaderBuf::new(&body);
                    let mut data_size = b.u32le()? as u64;
                    if flags & FILE_LARGE != 0 {
                        // the high half sits past the fixed fields
                        b.bytes(21)?;
                        data_size |= (b.u32le()? as u64) << 32;
                    }
                    src.discard(data_size)?;
                }
                BLOCK_END => {
                    if flags & END_NEXT_VOLUME != 0 {
                        return Ok(BlockOutcome::VolumeEnd);
                    }
                    return Ok(BlockOutcome::ArchiveEnd);
                }
                _ => {
                    // unknown or legacy block; skip any trailing data area
                    if flags & BLOCK_HAS_DATA != 0 {
                        let mut b = HeaderBuf::new(&body);
                        let data_size = b.u32le()? as u64;
                        src.discard(data_size)?;
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        // per-header encryption state is derived on demand; nothing to do
    }

    fn format(&self) -> Format {
        Format::Rar15
    }

    fn old_naming(&self) -> bool {
        self.old_naming
    }
}

/// Decodes the RAR compressed unicode file name format: an 8-bit name
/// followed by a NUL and an opcode stream extending it to UTF-16.
fn decode_name(buf: &[u8]) -> String {
    let Some(split) = buf.iter().position(|&b| b == 0) else {
        return String::from_utf8_lossy(buf).into_owned();
    };
    let name = &buf[..split];
    let enc = &buf[split + 1..];
    let mut pos = 0;
    let mut next = || -> Option<u8> {
        let b = enc.get(pos).copied();
        pos += 1;
        b
    };

    let Some(high) = next() else {
        return String::from_utf8_lossy(name).into_owned();
    };
    let high = (high as u16) << 8;
    let mut out: Vec<u16> = Vec::new();
    let mut flags = 0u8;
    let mut bits = 0u8;
    loop {
        if bits == 0 {
            match next() {
                Some(f) => {
                    flags = f;
                    bits = 8;
                }
                None => break,
            }
        }
        let op = flags >> 6;
        flags <<= 2;
        bits -= 2;
        let ok = match op {
            0 => next().map(|b| out.push(b as u16)).is_some(),
            1 => next().map(|b| out.push(b as u16 | high)).is_some(),
            2 => match (next(), next()) {
                (Some(lo), Some(hi)) => {
                    out.push(lo as u16 | (hi as u16) << 8);
                    true
                }
                _ => false,
            },
            _ => match next() {
                Some(n) if n & 0x80 != 0 => match next() {
                    Some(c) => {
                        for _ in 0..(n & 0x7F) + 2 {
                            if out.len() >= name.len() {
                                break;
                            }
                            out.push(name[out.len()].wrapping_add(c) as u16 | high);
                        }
                        true
                    }
                    None => false,
                },
                Some(n) => {
                    for _ in 0..n + 2 {
                        if out.len() >= name.len() {
                            break;
                        }
                        out.push(name[out.len()] as u16);
                    }
                    true
                }
                None => false,
            },
        };
        if !ok {
            break;
        }
    }
    String::from_utf16_lossy(&out)
}

/// Reads the extended time record: one nibble of flags per timestamp
/// (modification, creation, access, archive), each optionally followed by
/// a DOS time and up to three bytes of 100ns precision.
fn read_ext_times(b: &mut HeaderBuf, h: &mut FileHeader) -> Result<()> {
    let flags = b.u16le()?;
    for i in 0..4 {
        let n = (flags >> (12 - i * 4)) & 0x0F;
        if n & 8 == 0 {
            continue;
        }
        let mut t = if i == 0 {
            h.modification_time
                .unwrap_or(std::time::UNIX_EPOCH)
        } else {
            dos_time(b.u32le()?)
        };
        if n & 4 != 0 {
            t += Duration::from_secs(1);
        }
        let count = (n & 3) as usize;
        let mut frac = 0u32;
        for j in 0..count {
            frac |= (b.byte()? as u32) << ((j + 3 - count) * 8);
        }
        t += Duration::from_nanos(frac as u64 * 100);
        match i {
            0 => h.modification_time = Some(t),
            1 => h.creation_time = Some(t),
            2 => h.access_time = Some(t),
            _ => {} // archive time, not surfaced
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_name_plain_section() {
        // no NUL: plain 8-bit name
        assert_eq!(decode_name(b"hello.txt"), "hello.txt");
    }

    #[test]
    fn test_decode_name_unicode_ops() {
        // name "ab", then: high byte 0x04, flag byte selecting op 1 twice
        // (byte | high) producing U+04xx characters
        let buf = [b'a', b'b', 0, 0x04, 0b0101_0000, 0x10, 0x11];
        let s = decode_name(&buf);
        let wide: Vec<u16> = s.encode_utf16().collect();
        assert_eq!(wide, vec![0x0410, 0x0411]);
    }

    #[test]
    fn test_decode_name_copy_run() {
        // op 3 without the high bit copies n+2 bytes of the 8-bit name
        let buf = [b'a', b'b', b'c', 0, 0x00, 0b1100_0000, 0x01];
        assert_eq!(decode_name(&buf), "abc");
    }
}
