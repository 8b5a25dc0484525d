//! Archive opening options and the filesystem abstraction.

use std::fs;
use std::io::{self, Read, Seek};
use std::sync::Arc;

/// Maximum password length in Unicode code points. Longer passwords are
/// truncated, matching the archiver.
const MAX_PASSWORD: usize = 128;

/// Default capacity of the buffered volume reader.
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 4096;

/// One open archive volume.
///
/// Volumes are read sequentially; [`as_seek`] lets sources that support it
/// opt in to seeking, which is used for fast skips and for random access via
/// [`File::open`].
///
/// [`as_seek`]: VolumeFile::as_seek
/// [`File::open`]: crate::File::open
pub trait VolumeFile: Read + Send {
    /// Returns a seek handle when the source supports repositioning.
    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        None
    }
}

impl VolumeFile for fs::File {
    fn as_seek(&mut self) -> Option<&mut dyn Seek> {
        Some(self)
    }
}

/// Opens archive volumes by name.
///
/// The default implementation uses the OS filesystem. Custom implementations
/// can serve volumes from memory, the network, or any other byte source.
pub trait Filesystem: Send + Sync {
    fn open(&self, name: &str) -> io::Result<Box<dyn VolumeFile>>;
}

/// The OS filesystem.
pub(crate) struct OsFilesystem;

impl Filesystem for OsFilesystem {
    fn open(&self, name: &str) -> io::Result<Box<dyn VolumeFile>> {
        Ok(Box::new(fs::File::open(name)?))
    }
}

/// Options for opening an archive.
///
/// # Example
///
/// ```rust,ignore
/// use rar_decode::{Options, Reader};
///
/// let opts = Options::new().password("secret").buffer_size(1 << 16);
/// let mut rar = Reader::open("archive.part001.rar", opts)?;
/// ```
#[derive(Clone)]
pub struct Options {
    pub(crate) buffer_size: usize,
    pub(crate) password: Option<String>,
    pub(crate) filesystem: Arc<dyn Filesystem>,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    pub fn new() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            password: None,
            filesystem: Arc::new(OsFilesystem),
        }
    }

    /// Sets the capacity of the buffered reader used for each volume.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(64);
        self
    }

    /// Sets the password used to decrypt encrypted archives.
    ///
    /// Passwords longer than 128 code points are truncated.
    pub fn password(mut self, password: &str) -> Self {
        let mut pass = password.to_string();
        if let Some((i, _)) = pass.char_indices().nth(MAX_PASSWORD) {
            pass.truncate(i);
        }
        self.password = Some(pass);
        self
    }

    /// Sets the filesystem used to open archive volumes.
    pub fn filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.filesystem = fs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_truncated() {
        let long: String = std::iter::repeat('x').take(200).collect();
        let opts = Options::new().password(&long);
        assert_eq!(opts.password.as_deref().map(|p| p.chars().count()), Some(128));
    }

    #[test]
    fn test_password_truncated_multibyte() {
        let long: String = std::iter::repeat('é').take(200).collect();
        let opts = Options::new().password(&long);
        assert_eq!(opts.password.as_deref().map(|p| p.chars().count()), Some(128));
    }

    #[test]
    fn test_defaults() {
        let opts = Options::new();
        assert_eq!(opts.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(opts.password.is_none());
    }
}
