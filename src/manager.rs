//! Multi-volume name resolution and volume handles.

use std::sync::{Arc, Mutex};

use crate::error::{RarError, Result};
use crate::format::Format;
use crate::names::{fix_file_extension, has_digits, next_new_vol_name, next_old_vol_name};
use crate::options::{Filesystem, Options};
use crate::volume::VolumeSource;

/// Name state shared by every reader derived from one archive.
struct Shared {
    /// Volume file names resolved so far, indexed by volume number.
    files: Vec<String>,
    /// Sticky flag: the archive uses the old `.rNN` naming scheme.
    old: bool,
}

/// Resolves and opens the volumes of a multi-volume archive.
///
/// Shared by the sequential reader and by every [`File`] handle obtained
/// from a listing, so random access can reopen volumes without reparsing.
///
/// [`File`]: crate::File
pub(crate) struct VolumeManager {
    dir: String,
    fs: Arc<dyn Filesystem>,
    buffer_size: usize,
    format: Format,
    shared: Mutex<Shared>,
}

impl VolumeManager {
    /// Opens the first volume of an archive by path.
    pub(crate) fn open(path: &str, opts: &Options) -> Result<(Arc<VolumeManager>, Volume)> {
        if path.is_empty() {
            return Err(RarError::ArchiveNameEmpty);
        }
        let (dir, file) = split_path(path);
        let inner = opts.filesystem.open(path)?;
        let mut src = VolumeSource::new(inner, opts.buffer_size);
        let format = src.find_signature()?;
        let vm = Arc::new(VolumeManager {
            dir,
            fs: opts.filesystem.clone(),
            buffer_size: opts.buffer_size,
            format,
            shared: Mutex::new(Shared {
                files: vec![file],
                old: false,
            }),
        });
        let vol = Volume {
            vm: Some(vm.clone()),
            src,
            num: 0,
            format,
        };
        Ok((vm, vol))
    }

    pub(crate) fn format(&self) -> Format {
        self.format
    }

    /// Full paths of every volume resolved so far.
    pub(crate) fn volume_names(&self) -> Vec<String> {
        let sh = self.shared.lock().unwrap();
        sh.files.iter().map(|f| format!("{}{}", self.dir, f)).collect()
    }

    /// Records the naming scheme declared by the archive header. Only
    /// honoured before the second volume's name has been computed.
    pub(crate) fn set_old_naming(&self, old: bool) {
        let mut sh = self.shared.lock().unwrap();
        if sh.files.len() == 1 {
            sh.old = old;
        }
    }

    /// Reopens a volume whose name is already known, positioned at the
    /// very start of the file. The volume was validated when first
    /// opened, so the signature is not re-scanned; callers seek by
    /// absolute block offsets.
    pub(crate) fn open_known(&self, num: usize) -> Result<Volume> {
        let name = {
            let sh = self.shared.lock().unwrap();
            sh.files
                .get(num)
                .cloned()
                .ok_or(RarError::FileNameRequired)?
        };
        let path = format!("{}{}", self.dir, name);
        let inner = self.fs.open(&path)?;
        let src = VolumeSource::new(inner, self.buffer_size);
        Ok(Volume {
            vm: None, // filled in by the caller
            src,
            num,
            format: self.format,
        })
    }

    /// Opens the volume after `cur`, resolving its name if it has not been
    /// seen before. A not-found error from the filesystem propagates so the
    /// caller can decide whether it means end-of-archive.
    pub(crate) fn open_next(&self, cur: usize) -> Result<VolumeSource> {
        let mut sh = self.shared.lock().unwrap();
        let next = cur + 1;
        if next < sh.files.len() {
            let name = sh.files[next].clone();
            return self.open_checked(&name);
        }
        if next != sh.files.len() {
            // volumes are resolved strictly in order
            return Err(RarError::FileNameRequired);
        }

        let mut file = sh.files[cur].clone();
        if next == 1 {
            file = fix_file_extension(&file);
            // the new naming scheme needs a volume number in the name
            if !sh.old && has_digits(&file) {
                let new_name = next_new_vol_name(&file);
                match self.open_checked(&new_name) {
                    Ok(src) => {
                        sh.files.push(new_name);
                        return Ok(src);
                    }
                    Err(e) if e.is_not_found() => {
                        let old_name = next_old_vol_name(&file);
                        match self.open_checked(&old_name) {
                            Ok(src) => {
                                sh.old = true;
                                sh.files.push(old_name);
                                return Ok(src);
                            }
                            Err(e2) if e2.is_not_found() => return Err(e),
                            Err(e2) => return Err(e2),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            sh.old = true;
        }
        let name = if sh.old {
            next_old_vol_name(&file)
        } else {
            next_new_vol_name(&file)
        };
        let src = self.open_checked(&name)?;
        sh.files.push(name);
        Ok(src)
    }

    /// Opens a volume file, locates its signature and checks that the
    /// format matches the archive.
    fn open_checked(&self, name: &str) -> Result<VolumeSource> {
        let path = format!("{}{}", self.dir, name);
        let inner = self.fs.open(&path)?;
        let mut src = VolumeSource::new(inner, self.buffer_size);
        let format = src.find_signature()?;
        if format != self.format {
            return Err(RarError::VersionMismatch);
        }
        Ok(src)
    }
}

/// One open volume: a buffered source plus its position in the volume
/// sequence.
pub(crate) struct Volume {
    pub(crate) vm: Option<Arc<VolumeManager>>,
    pub(crate) src: VolumeSource,
    pub(crate) num: usize,
    pub(crate) format: Format,
}

impl Volume {
    /// A single-volume archive read from a raw byte stream.
    pub(crate) fn single(src: VolumeSource, format: Format) -> Self {
        Self {
            vm: None,
            src,
            num: 0,
            format,
        }
    }

    /// Replaces the current volume with the next one in the sequence.
    /// Dropping the old source releases its file handle.
    pub(crate) fn advance(&mut self) -> Result<()> {
        let vm = self.vm.as_ref().ok_or(RarError::FileNameRequired)?;
        let src = vm.open_next(self.num)?;
        self.src = src;
        self.num += 1;
        Ok(())
    }
}

/// Splits a path into (directory prefix, file name), keeping the trailing
/// separator on the directory like the archiver does.
fn split_path(path: &str) -> (String, String) {
    match path.rfind(['/', '\\']) {
        Some(i) => (path[..i + 1].to_string(), path[i + 1..].to_string()),
        None => (String::new(), path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(
            split_path("dir/sub/a.rar"),
            ("dir/sub/".to_string(), "a.rar".to_string())
        );
        assert_eq!(split_path("a.rar"), (String::new(), "a.rar".to_string()));
    }
}
