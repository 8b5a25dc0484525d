//! Sequential iteration over the files of an archive.

use std::io::{self, Read};
use std::sync::Arc;

use crate::block::{BlockReader, DECODE_NONE};
use crate::checksum::FileChecksum;
use crate::decode::{ByteInput, DecodeReader};
use crate::decrypt::CipherBlockReader;
use crate::error::{RarError, Result};
use crate::header::FileHeader;
use crate::manager::{Volume, VolumeManager};
use crate::options::{Options, VolumeFile};
use crate::packed::PackedFileReader;
use crate::parse::new_format_reader;
use crate::volume::VolumeSource;

/// Adapts an arbitrary reader into a (non-seekable) volume.
struct StreamVolume<R>(R);

impl<R: Read> Read for StreamVolume<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Read + Send> VolumeFile for StreamVolume<R> {}

/// The per-file input the decoder pulls packed bytes from: the packed file
/// reader, optionally through the decrypting wrapper.
pub(crate) struct FileInput<'a> {
    pub(crate) pr: &'a mut PackedFileReader,
    pub(crate) cipher: Option<&'a mut CipherBlockReader>,
}

impl ByteInput for FileInput<'_> {
    fn read_byte(&mut self) -> Result<Option<u8>> {
        match &mut self.cipher {
            Some(c) => c.read_byte(self.pr),
            None => self.pr.read_byte(),
        }
    }
}

/// Sequential reader over the files in a RAR archive.
///
/// [`next`] advances to the following file's header; [`Read`] then yields
/// that file's decoded bytes. Readers are not safe for concurrent use.
/// Dropping the reader releases the current volume's file handle.
///
/// ```rust,ignore
/// let mut rar = Reader::open("archive.rar", Options::new())?;
/// while let Some(file) = rar.next()? {
///     println!("{} ({} bytes)", file.name, file.unpacked_size);
///     let mut data = Vec::new();
///     rar.read_to_end(&mut data)?;
/// }
/// ```
///
/// [`next`]: Reader::next
pub struct Reader {
    pr: PackedFileReader,
    /// Decoder state persists across files in solid archives.
    decode: DecodeReader,
    cipher: Option<CipherBlockReader>,
    compressed: bool,
    /// The current file must be fully decoded before the next one (solid
    /// archives chain decoder state).
    solid_drain: bool,
    /// Plaintext bytes still expected, when the size is known.
    limit: Option<u64>,
    checksum: Option<FileChecksum>,
    vm: Option<Arc<VolumeManager>>,
    active: bool,
    finished: bool,
}

impl Reader {
    /// Creates a reader over a raw byte stream. Only single-volume
    /// archives can be read this way; multi-volume archives need
    /// [`Reader::open`] so further volumes can be located.
    pub fn new<R: Read + Send + 'static>(r: R, options: Options) -> Result<Self> {
        let mut src = VolumeSource::new(Box::new(StreamVolume(r)), options.buffer_size);
        let format = src.find_signature()?;
        let vol = Volume::single(src, format);
        let parser = new_format_reader(format, options.password.clone());
        Ok(Self::from_parts(BlockReader::new(vol, parser), None))
    }

    /// Opens an archive by the path of its first volume.
    pub fn open(path: &str, options: Options) -> Result<Self> {
        let (vm, vol) = VolumeManager::open(path, &options)?;
        let parser = new_format_reader(vm.format(), options.password.clone());
        Ok(Self::from_parts(BlockReader::new(vol, parser), Some(vm)))
    }

    fn from_parts(blocks: BlockReader, vm: Option<Arc<VolumeManager>>) -> Self {
        Self {
            pr: PackedFileReader::new(blocks),
            decode: DecodeReader::new(),
            cipher: None,
            compressed: false,
            solid_drain: false,
            limit: None,
            checksum: None,
            vm,
            active: false,
            finished: true,
        }
    }

    /// Advances to the next file and returns its header, or `None` at the
    /// end of the archive.
    pub fn next(&mut self) -> Result<Option<FileHeader>> {
        if self.solid_drain && !self.finished {
            // decoder state for the following files depends on this one
            // being decoded in full
            let mut sink = [0u8; 4096];
            while self.read_decoded(&mut sink)? > 0 {}
        }
        self.pr.skip()?;

        let Some(h) = self.pr.next_file()? else {
            self.active = false;
            self.finished = true;
            return Ok(None);
        };

        self.cipher = match &h.cipher {
            Some((key, iv)) => Some(CipherBlockReader::new(key, iv)?),
            None => None,
        };
        self.compressed = h.dec_ver != DECODE_NONE;
        if self.compressed {
            self.decode.init(h.dec_ver, h.win_size, !h.header.solid)?;
        }
        self.solid_drain = self.compressed && h.arc_solid;
        self.limit = if h.header.unknown_size {
            None
        } else {
            Some(h.header.unpacked_size)
        };
        self.checksum = h.checksum.as_ref().map(FileChecksum::new);
        self.active = true;
        self.finished = false;
        Ok(Some(h.header))
    }

    /// Names of the volumes opened so far. Empty for stream readers.
    pub fn volumes(&self) -> Vec<String> {
        self.vm
            .as_ref()
            .map(|vm| vm.volume_names())
            .unwrap_or_default()
    }

    fn read_decoded(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.compressed {
            let mut input = FileInput {
                pr: &mut self.pr,
                cipher: self.cipher.as_mut(),
            };
            self.decode.read(&mut input, buf)
        } else if let Some(c) = &mut self.cipher {
            c.read(&mut self.pr, buf)
        } else {
            self.pr.read(buf)
        }
    }

    /// Applies the declared-size limit: padding past it is cut off, and an
    /// early end of the inner stream is a short file.
    fn read_limited(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.limit {
            Some(0) => Ok(0),
            Some(left) => {
                let want = buf.len().min(left.min(usize::MAX as u64) as usize);
                let n = self.read_decoded(&mut buf[..want])?;
                if n == 0 {
                    return Err(RarError::ShortFile);
                }
                self.limit = Some(left - n as u64);
                Ok(n)
            }
            None => self.read_decoded(buf),
        }
    }

    pub(crate) fn read_file(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.active || buf.is_empty() {
            return Ok(0);
        }
        let n = self.read_limited(buf)?;
        if n > 0 {
            if let Some(cs) = &mut self.checksum {
                cs.update(&buf[..n]);
            }
        } else {
            self.finished = true;
            if let Some(cs) = &mut self.checksum {
                // deferred verification surfaces on the read hitting EOF
                cs.verify()?;
            }
        }
        Ok(n)
    }
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_file(buf).map_err(io::Error::from)
    }
}
