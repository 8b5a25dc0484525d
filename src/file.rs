//! Archive listing and random access to individual files.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::block::{BlockReader, FileBlockHeader, DECODE_NONE};
use crate::checksum::FileChecksum;
use crate::decode::DecodeReader;
use crate::decrypt::CipherBlockReader;
use crate::error::{RarError, Result};
use crate::header::FileHeader;
use crate::manager::VolumeManager;
use crate::options::Options;
use crate::packed::PackedFileReader;
use crate::parse::new_format_reader;
use crate::reader::FileInput;

/// Walks an archive's headers and returns a handle per file, recording
/// where each file's packed data starts so it can be reopened later
/// without reparsing.
pub fn list(path: &str, options: Options) -> Result<Vec<File>> {
    let (vm, vol) = VolumeManager::open(path, &options)?;
    let parser = new_format_reader(vm.format(), options.password.clone());
    let mut pr = PackedFileReader::new(BlockReader::new(vol, parser));
    let mut files = Vec::new();
    while let Some(h) = pr.next_file()? {
        files.push(File {
            header: h.header.clone(),
            first: h,
            vm: vm.clone(),
            password: options.password.clone(),
        });
    }
    Ok(files)
}

/// One file from a listing. Opening it reads the file independently of
/// the listing and of any other open files.
pub struct File {
    /// The file's metadata.
    pub header: FileHeader,
    first: FileBlockHeader,
    vm: Arc<VolumeManager>,
    password: Option<String>,
}

impl File {
    /// Opens the file for reading from the start.
    ///
    /// Solid files cannot be opened this way; their decoder state depends
    /// on the files before them, so they fail with
    /// [`RarError::SolidOpenUnsupported`].
    pub fn open(&self) -> Result<FileReader> {
        if self.header.solid {
            return Err(RarError::SolidOpenUnsupported);
        }
        let pr = PackedFileReader::open_at(&self.vm, &self.first, self.password.clone())?;
        let cipher = match &self.first.cipher {
            Some((key, iv)) => Some(CipherBlockReader::new(key, iv)?),
            None => None,
        };
        let decode = if self.first.dec_ver != DECODE_NONE {
            let mut d = DecodeReader::new();
            d.init(self.first.dec_ver, self.first.win_size, true)?;
            Some(d)
        } else {
            None
        };
        Ok(FileReader {
            pr,
            cipher,
            decode,
            size: if self.header.unknown_size {
                None
            } else {
                Some(self.header.unpacked_size)
            },
            pos: 0,
            checksum: self.first.checksum.as_ref().map(FileChecksum::new),
            checksum_armed: true,
        })
    }
}

/// Reads one archived file.
///
/// Stored (uncompressed) files also support [`Seek`]; seeking through the
/// decrypting layer re-seeds the cipher from the preceding ciphertext
/// block. Compressed files only read sequentially.
pub struct FileReader {
    pr: PackedFileReader,
    cipher: Option<CipherBlockReader>,
    decode: Option<DecodeReader>,
    size: Option<u64>,
    pos: u64,
    checksum: Option<FileChecksum>,
    /// Seeking breaks the running hash; verification is disabled after
    /// the first seek away from a straight read-through.
    checksum_armed: bool,
}

impl FileReader {
    fn read_decoded(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(d) = &mut self.decode {
            let mut input = FileInput {
                pr: &mut self.pr,
                cipher: self.cipher.as_mut(),
            };
            d.read(&mut input, buf)
        } else if let Some(c) = &mut self.cipher {
            c.read(&mut self.pr, buf)
        } else {
            self.pr.read(buf)
        }
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let want = match self.size {
            Some(size) => {
                let left = size.saturating_sub(self.pos);
                if left == 0 {
                    if self.checksum_armed {
                        if let Some(cs) = &mut self.checksum {
                            cs.verify()?;
                        }
                    }
                    return Ok(0);
                }
                buf.len().min(left.min(usize::MAX as u64) as usize)
            }
            None => buf.len(),
        };
        let n = self.read_decoded(&mut buf[..want])?;
        if n == 0 {
            if self.size.is_some() {
                return Err(RarError::ShortFile);
            }
            if self.checksum_armed {
                if let Some(cs) = &mut self.checksum {
                    cs.verify()?;
                }
            }
            return Ok(0);
        }
        self.pos += n as u64;
        if let Some(cs) = &mut self.checksum {
            cs.update(&buf[..n]);
        }
        Ok(n)
    }

    fn seek_inner(&mut self, target: u64) -> Result<()> {
        if self.decode.is_some() {
            return Err(RarError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "seek in a compressed file",
            )));
        }
        if target != self.pos {
            self.checksum_armed = false;
        }
        match &mut self.cipher {
            Some(c) => c.seek(&mut self.pr, target)?,
            None => self.pr.seek_to(target)?,
        }
        self.pos = target;
        Ok(())
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf).map_err(io::Error::from)
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => match self.size {
                Some(size) => size.checked_add_signed(d),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "seek from end of a file of unknown size",
                    ))
                }
            },
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        };
        self.seek_inner(target).map_err(io::Error::from)?;
        Ok(self.pos)
    }
}
