//! RAR 5.0 block format parser.

use std::collections::HashMap;

use super::HeaderBuf;
use crate::block::{
    BlockChecksum, BlockOutcome, FileBlockHeader, FormatReader, DECODE50, DECODE_NONE,
};
use crate::crypto::{derive_keys_v5, CbcDec, Keys50, CIPHER_BLOCK_SIZE};
use crate::error::{RarError, Result};
use crate::format::{unix_time, windows_filetime, Format};
use crate::header::{FileHeader, HostOs};
use crate::volume::VolumeSource;

// Header types.
const HEAD_MAIN: u64 = 1;
const HEAD_FILE: u64 = 2;
const HEAD_SERVICE: u64 = 3;
const HEAD_CRYPT: u64 = 4;
const HEAD_END: u64 = 5;

// Generic header flags.
const HFL_EXTRA: u64 = 0x0001;
const HFL_DATA: u64 = 0x0002;
const HFL_SPLIT_BEFORE: u64 = 0x0008;
const HFL_SPLIT_AFTER: u64 = 0x0010;

// Main archive flags.
const ARC_VOLNUM: u64 = 0x0002;
const ARC_SOLID: u64 = 0x0004;

// File flags.
const FILE_IS_DIR: u64 = 0x0001;
const FILE_HAS_UTIME: u64 = 0x0002;
const FILE_HAS_CRC: u64 = 0x0004;
const FILE_UNKNOWN_SIZE: u64 = 0x0008;

// Extra record types in file headers.
const EXTRA_CRYPT: u64 = 0x01;
const EXTRA_HASH: u64 = 0x02;
const EXTRA_HTIME: u64 = 0x03;
const EXTRA_VERSION: u64 = 0x04;

// End of archive flags.
const END_NEXT_VOLUME: u64 = 0x0001;

/// Encryption record flags (archive and file variants).
const CRYPT_PSW_CHECK: u64 = 0x0001;
const CRYPT_USE_MAC: u64 = 0x0002;

/// Upper bound on a single header's size; anything bigger is corruption.
const MAX_HEADER_SIZE: u64 = 0x200000;

/// Parser for the v5.0 on-disk block format.
pub(crate) struct Archive50 {
    password: Option<String>,
    arc_solid: bool,
    /// AES-256 key for encrypted headers, from the archive encryption
    /// header.
    header_key: Option<[u8; 32]>,
    /// PBKDF2 is expensive; cache derived keys per salt.
    kdf_cache: HashMap<Vec<u8>, Keys50>,
    hbuf: Vec<u8>,
}

impl Archive50 {
    pub(crate) fn new(password: Option<String>) -> Self {
        Self {
            password,
            arc_solid: false,
            header_key: None,
            kdf_cache: HashMap::new(),
            hbuf: Vec::new(),
        }
    }

    fn keys_for(&mut self, salt: &[u8], lg2_count: u8) -> Result<Keys50> {
        let pass = self
            .password
            .as_deref()
            .ok_or(RarError::PasswordRequired)?;
        if let Some(k) = self.kdf_cache.get(salt) {
            return Ok(k.clone());
        }
        let keys = derive_keys_v5(pass, salt, lg2_count);
        self.kdf_cache.insert(salt.to_vec(), keys.clone());
        Ok(keys)
    }

    /// Reads one header's data bytes into `hbuf`, decrypting when the
    /// archive has encrypted headers, and validates the header CRC.
    /// Returns false on a clean EOF at a header boundary.
    fn read_header(&mut self, src: &mut VolumeSource) -> Result<bool> {
        self.hbuf.clear();
        if src.peek(1)?.is_empty() {
            return Ok(false);
        }
        if let Some(key) = self.header_key {
            let mut iv = [0u8; CIPHER_BLOCK_SIZE];
            iv.copy_from_slice(src.read_slice(CIPHER_BLOCK_SIZE)?);
            let mut dec = CbcDec::new(&key, &iv)?;
            let mut block = [0u8; CIPHER_BLOCK_SIZE];
            block.copy_from_slice(src.read_slice(CIPHER_BLOCK_SIZE)?);
            dec.decrypt(&mut block);
            self.hbuf.extend_from_slice(&block);

            let (crc, data_start, size) = {
                let mut b = HeaderBuf::new(&self.hbuf);
                let crc = b.u32le().map_err(|_| RarError::CorruptBlockHeader)?;
                let size = b.uvarint().map_err(|_| RarError::CorruptBlockHeader)?;
                (crc, self.hbuf.len() - b.remaining(), size)
            };
            if size == 0 || size > MAX_HEADER_SIZE {
                return Err(RarError::CorruptBlockHeader);
            }
            let total = data_start + size as usize;
            while self.hbuf.len() < total {
                block.copy_from_slice(src.read_slice(CIPHER_BLOCK_SIZE)?);
                dec.decrypt(&mut block);
                self.hbuf.extend_from_slice(&block);
            }
            if crc32fast::hash(&self.hbuf[4..total]) != crc {
                return Err(RarError::BadHeaderCrc);
            }
            // drop the crc and size prefix, keep the header data
            self.hbuf.truncate(total);
            self.hbuf.drain(..data_start);
            return Ok(true);
        }

        let crc = {
            let b = src.read_slice(4)?;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        };
        // the CRC covers the size vint as well as the data
        let mut prefix = Vec::with_capacity(4);
        let mut size = 0u64;
        let mut shift = 0;
        loop {
            if shift >= 70 {
                return Err(RarError::CorruptBlockHeader);
            }
            let b = src.read_byte()?;
            prefix.push(b);
            size |= u64::from(b & 0x7F) << shift.min(63);
            if b & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        if size == 0 || size > MAX_HEADER_SIZE {
            return Err(RarError::CorruptBlockHeader);
        }
        self.hbuf.extend_from_slice(src.read_slice(size as usize)?);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&prefix);
        hasher.update(&self.hbuf);
        if hasher.finalize() != crc {
            return Err(RarError::BadHeaderCrc);
        }
        Ok(true)
    }

    /// Parses the archive encryption header and arms header decryption.
    fn parse_crypt_header(&mut self, b: &mut HeaderBuf) -> Result<()> {
        let version = b.uvarint()?;
        if version != 0 {
            return Err(RarError::UnknownVersion);
        }
        let flags = b.uvarint()?;
        let lg2_count = b.byte()?;
        if lg2_count > 24 {
            return Err(RarError::CorruptBlockHeader);
        }
        let salt = b.bytes(16)?.to_vec();
        let keys = self.keys_for(&salt, lg2_count)?;
        if flags & CRYPT_PSW_CHECK != 0 {
            let check = b.bytes(12)?;
            if check[..8] != keys.check {
                return Err(RarError::BadPassword);
            }
        }
        self.header_key = Some(keys.key);
        Ok(())
    }

    fn parse_file_block(
        &mut self,
        hflags: u64,
        data_size: u64,
        b: &mut HeaderBuf,
    ) -> Result<FileBlockHeader> {
        let file_flags = b.uvarint()?;
        let unpacked_size = b.uvarint()?;
        let attributes = b.uvarint()?;
        let mtime = if file_flags & FILE_HAS_UTIME != 0 {
            Some(unix_time(b.u32le()?))
        } else {
            None
        };
        let file_crc = if file_flags & FILE_HAS_CRC != 0 {
            Some(b.u32le()?)
        } else {
            None
        };
        let comp = b.uvarint()?;
        let algo_version = (comp & 0x3F) as u8;
        let solid = comp & 0x40 != 0;
        let method = (comp >> 7) & 7;
        let win_size = ((comp >> 10) & 0x0F) as u8 + 17;
        let host_os = match b.uvarint()? {
            0 => HostOs::Windows,
            1 => HostOs::Unix,
            _ => HostOs::Unknown,
        };
        let name_len = b.uvarint()? as usize;
        if name_len > b.remaining() {
            return Err(RarError::CorruptFileHeader);
        }
        let name = String::from_utf8_lossy(b.bytes(name_len)?)
            .replace('\\', "/");

        let is_dir = file_flags & FILE_IS_DIR != 0;
        let mut header = FileHeader {
            name,
            is_dir,
            solid,
            host_os,
            attributes,
            packed_size: data_size,
            unpacked_size,
            unknown_size: file_flags & FILE_UNKNOWN_SIZE != 0,
            modification_time: mtime,
            creation_time: None,
            access_time: None,
            version: 0,
        };

        let mut cipher = None;
        let mut checksum_key = None;
        // the extra area sits at the end of the header data
        while b.remaining() > 0 {
            let rec_size = b.uvarint()?;
            let rec = b.bytes(rec_size as usize)?;
            let mut r = HeaderBuf::new(rec);
            match r.uvarint()? {
                EXTRA_CRYPT => {
                    if r.uvarint()? != 0 {
                        return Err(RarError::UnknownVersion);
                    }
                    let cflags = r.uvarint()?;
                    let lg2_count = r.byte()?;
                    if lg2_count > 24 {
                        return Err(RarError::CorruptFileHeader);
                    }
                    let salt = r.bytes(16)?.to_vec();
                    let iv = r.bytes(16)?.to_vec();
                    let keys = self.keys_for(&salt, lg2_count)?;
                    if cflags & CRYPT_PSW_CHECK != 0 {
                        let check = r.bytes(12)?;
                        if check[..8] != keys.check {
                            return Err(RarError::BadPassword);
                        }
                    }
                    if cflags & CRYPT_USE_MAC != 0 {
                        checksum_key = Some(keys.hash_key.to_vec());
                    }
                    cipher = Some((keys.key.to_vec(), iv));
                }
                EXTRA_HASH => {
                    // blake2sp whole-file hash; not verified by this crate
                    let _hash_type = r.uvarint()?;
                }
                EXTRA_HTIME => {
                    read_times(&mut r, &mut header)?;
                }
                EXTRA_VERSION => {
                    let _vflags = r.uvarint()?;
                    header.version = r.uvarint()? as u32;
                }
                _ => {}
            }
        }

        let dec_ver = if method == 0 || is_dir {
            DECODE_NONE
        } else if algo_version == 0 {
            DECODE50
        } else {
            return Err(RarError::UnknownDecoder(algo_version));
        };

        let first = hflags & HFL_SPLIT_BEFORE == 0;
        let last = hflags & HFL_SPLIT_AFTER == 0;
        let checksum = match file_crc {
            Some(crc) if first && last && !is_dir => Some(BlockChecksum {
                key: checksum_key,
                sum: crc.to_le_bytes().to_vec(),
            }),
            _ => None,
        };

        Ok(FileBlockHeader {
            first,
            last,
            arc_solid: self.arc_solid,
            win_size: if is_dir { 0 } else { win_size },
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

impl FormatReader for Archive50 {
    fn next_block(&mut self, src: &mut VolumeSource) -> Result<BlockOutcome> {
        loop {
            if !self.read_header(src)? {
                return Ok(BlockOutcome::VolumeOrArchiveEnd);
            }
            let hbuf = std::mem::take(&mut self.hbuf);
            let mut b = HeaderBuf::new(&hbuf);
            let htype = b.uvarint()?;
            let hflags = b.uvarint()?;
            let extra_size = if hflags & HFL_EXTRA != 0 {
                b.uvarint()?
            } else {
                0
            };
            let data_size = if hflags & HFL_DATA != 0 {
                b.uvarint()?
            } else {
                0
            };
            let _ = extra_size;

            let outcome = match htype {
                HEAD_MAIN => {
                    let arc_flags = b.uvarint()?;
                    self.arc_solid = arc_flags & ARC_SOLID != 0;
                    if arc_flags & ARC_VOLNUM != 0 {
                        let _volnum = b.uvarint()?;
                    }
                    None
                }
                HEAD_CRYPT => {
                    self.parse_crypt_header(&mut b)?;
                    None
                }
                HEAD_FILE => Some(BlockOutcome::Block(
                    self.parse_file_block(hflags, data_size, &mut b)?,
                )),
                HEAD_SERVICE => {
                    // service data (comments, recovery records) is skipped
                    src.discard(data_size)?;
                    None
                }
                HEAD_END => {
                    if b.uvarint()? & END_NEXT_VOLUME != 0 {
                        Some(BlockOutcome::VolumeEnd)
                    } else {
                        Some(BlockOutcome::ArchiveEnd)
                    }
                }
                _ => {
                    // unknown header; skip it and any data area
                    src.discard(data_size)?;
                    None
                }
            };
            self.hbuf = hbuf;
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }
    }

    fn reset(&mut self) {
        // a fresh volume restarts header encryption at its own crypt
        // header
        self.header_key = None;
    }

    fn format(&self) -> Format {
        Format::Rar50
    }
}

/// Reads the high-precision time record.
fn read_times(r: &mut HeaderBuf, h: &mut FileHeader) -> Result<()> {
    let flags = r.uvarint()?;
    let unix = flags & 0x01 != 0;
    let mut times = [None, None, None];
    for (i, t) in times.iter_mut().enumerate() {
        if flags & (0x02 << i) == 0 {
            continue;
        }
        *t = if unix {
            Some(unix_time(r.u32le()?))
        } else {
            windows_filetime(r.u64le()?)
        };
    }
    if unix && flags & 0x10 != 0 {
        // nanosecond parts follow, one per stored time
        for t in times.iter_mut() {
            if let Some(time) = t {
                let ns = r.u32le()?;
                *t = Some(*time + std::time::Duration::from_nanos(ns as u64));
            }
        }
    }
    if times[0].is_some() {
        h.modification_time = times[0];
    }
    if times[1].is_some() {
        h.creation_time = times[1];
    }
    if times[2].is_some() {
        h.access_time = times[2];
    }
    Ok(())
}
