//! Read-only RAR archive decoder.
//!
//! Provides sequential access to the files inside single- and
//! multi-volume RAR archives (formats 1.5 through 5.0), and random access
//! to non-solid files.
//!
//! ## Features
//! - Multi-volume archives with both naming schemes (`.part002.rar`,
//!   `.r00`)
//! - Self-extracting archives (the signature is located inside the stub)
//! - Encrypted files and encrypted headers (AES-CBC, v3 and v5 key
//!   derivation)
//! - v3 (`decode29`) and v5 (`decode50`) LZ decompression with the delta,
//!   x86 and ARM post-processing filters
//! - Checksum verification (CRC32, HMAC-folded for encrypted v5 archives)
//!
//! ## Reading an archive
//!
//! ```rust,ignore
//! use rar_decode::{Options, Reader};
//! use std::io::Read;
//!
//! let mut rar = Reader::open("archive.part001.rar", Options::new())?;
//! while let Some(file) = rar.next()? {
//!     if file.is_dir {
//!         continue;
//!     }
//!     let mut contents = Vec::new();
//!     rar.read_to_end(&mut contents)?;
//!     println!("{}: {} bytes", file.name, contents.len());
//! }
//! ```
//!
//! ## Random access
//!
//! ```rust,ignore
//! use rar_decode::{list, Options};
//! use std::io::{Read, Seek, SeekFrom};
//!
//! for file in list("archive.rar", Options::new())? {
//!     let mut r = file.open()?;
//!     r.seek(SeekFrom::Start(1024))?;
//!     // ...
//! }
//! ```
//!
//! Solid archives chain decoder state across files, so solid files can
//! only be reached through sequential iteration; [`File::open`] refuses
//! them.

mod block;
mod byte_search;
mod checksum;
mod crypto;
mod decode;
mod decrypt;
mod error;
mod file;
mod format;
mod header;
mod manager;
mod names;
mod options;
mod packed;
mod parse;
mod reader;
mod volume;

pub use error::{RarError, Result};
pub use file::{list, File, FileReader};
pub use header::{FileHeader, HostOs, MODE_DIR, MODE_SYMLINK};
pub use options::{Filesystem, Options, VolumeFile};
pub use reader::Reader;
