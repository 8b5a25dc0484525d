//! Error types for RAR archive decoding.
//!
//! This module provides the [`RarError`] type which covers all possible
//! errors that can occur while parsing, decrypting or decompressing RAR
//! archives.
//!
//! ## Error Categories
//!
//! | Category | Errors | Description |
//! |----------|--------|-------------|
//! | Format | [`NoSignature`], [`UnknownVersion`], [`VersionMismatch`] | File is not a usable RAR archive |
//! | Headers | [`CorruptBlockHeader`], [`CorruptFileHeader`], [`BadHeaderCrc`] | A block header is damaged |
//! | Files | [`InvalidFileBlock`], [`UnexpectedArchiveEnd`], [`ShortFile`], [`BadFileChecksum`] | File data is damaged or truncated |
//! | Decoding | [`UnknownDecoder`], [`MultipleDecoders`], [`DecoderOutOfData`] | Compressed stream problems |
//! | Filters | [`TooManyFilters`], [`InvalidFilter`], [`UnsupportedFilter`] | Post-processing filter problems |
//! | Encryption | [`PasswordRequired`], [`BadPassword`] | Password problems |
//! | I/O | [`Io`], [`UnexpectedEof`] | Underlying read errors |
//!
//! [`NoSignature`]: RarError::NoSignature
//! [`UnknownVersion`]: RarError::UnknownVersion
//! [`VersionMismatch`]: RarError::VersionMismatch
//! [`CorruptBlockHeader`]: RarError::CorruptBlockHeader
//! [`CorruptFileHeader`]: RarError::CorruptFileHeader
//! [`BadHeaderCrc`]: RarError::BadHeaderCrc
//! [`InvalidFileBlock`]: RarError::InvalidFileBlock
//! [`UnexpectedArchiveEnd`]: RarError::UnexpectedArchiveEnd
//! [`ShortFile`]: RarError::ShortFile
//! [`BadFileChecksum`]: RarError::BadFileChecksum
//! [`UnknownDecoder`]: RarError::UnknownDecoder
//! [`MultipleDecoders`]: RarError::MultipleDecoders
//! [`DecoderOutOfData`]: RarError::DecoderOutOfData
//! [`TooManyFilters`]: RarError::TooManyFilters
//! [`InvalidFilter`]: RarError::InvalidFilter
//! [`UnsupportedFilter`]: RarError::UnsupportedFilter
//! [`PasswordRequired`]: RarError::PasswordRequired
//! [`BadPassword`]: RarError::BadPassword
//! [`Io`]: RarError::Io
//! [`UnexpectedEof`]: RarError::UnexpectedEof

use std::fmt;
use std::io;

/// Error type for RAR operations.
///
/// Covers every error surfaced by this crate. Implements
/// [`std::error::Error`] for integration with the Rust error handling
/// ecosystem, and converts into [`std::io::Error`] so that the readers can
/// be driven through [`std::io::Read`].
#[derive(Debug)]
pub enum RarError {
    /// No RAR signature was found in the first `0x100000` bytes.
    NoSignature,

    /// A later volume has a different archive format version than the first.
    VersionMismatch,

    /// An archive was opened with an empty file name.
    ArchiveNameEmpty,

    /// A multi-volume operation needs a file name but the reader was
    /// constructed from a raw byte stream.
    FileNameRequired,

    /// The decoded file is shorter than the size declared in its header.
    ShortFile,

    /// A file block did not belong to the file being read.
    ///
    /// Blocks of one file must share its name, and only the first block may
    /// carry the first-block flag.
    InvalidFileBlock,

    /// The archive ended while file blocks were still expected.
    UnexpectedArchiveEnd,

    /// The checksum of a decoded file did not match its header.
    BadFileChecksum,

    /// Random access was attempted on a solid file.
    ///
    /// Solid files depend on decoder state from earlier files and can only
    /// be read through sequential iteration.
    SolidOpenUnsupported,

    /// The archive format version is not supported.
    UnknownVersion,

    /// A block header is malformed.
    CorruptBlockHeader,

    /// A file header is malformed.
    CorruptFileHeader,

    /// A block header failed its CRC check.
    BadHeaderCrc,

    /// A file needs a decoder this crate does not provide.
    ///
    /// The `u8` value is the decoder version from the file header.
    UnknownDecoder(u8),

    /// Files in one archive requested different decoder versions.
    MultipleDecoders,

    /// The decoder needed more data than the packed file contains.
    DecoderOutOfData,

    /// More than the maximum number of filters were queued for one file.
    TooManyFilters,

    /// A filter block was placed before an earlier filter, or a chained
    /// filter's length did not match the previous filter's output.
    InvalidFilter,

    /// A v3 filter program was not one of the recognised stock filters.
    UnsupportedFilter,

    /// The archive is encrypted and no password was supplied.
    PasswordRequired,

    /// The supplied password failed the archive's password check.
    BadPassword,

    /// The underlying source ended in the middle of a read.
    UnexpectedEof,

    /// An I/O error from the underlying source.
    Io(io::Error),
}

impl fmt::Display for RarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSignature => write!(f, "RAR signature not found"),
            Self::VersionMismatch => write!(f, "volume version mismatch"),
            Self::ArchiveNameEmpty => write!(f, "archive name empty"),
            Self::FileNameRequired => write!(f, "file name required for multi-volume archive"),
            Self::ShortFile => write!(f, "decoded file too short"),
            Self::InvalidFileBlock => write!(f, "invalid file block"),
            Self::UnexpectedArchiveEnd => write!(f, "unexpected end of archive"),
            Self::BadFileChecksum => write!(f, "bad file checksum"),
            Self::SolidOpenUnsupported => write!(f, "random access to solid files not supported"),
            Self::UnknownVersion => write!(f, "unknown archive version"),
            Self::CorruptBlockHeader => write!(f, "corrupt block header"),
            Self::CorruptFileHeader => write!(f, "corrupt file header"),
            Self::BadHeaderCrc => write!(f, "bad header crc"),
            Self::UnknownDecoder(v) => write!(f, "unknown decoder version: {}", v),
            Self::MultipleDecoders => {
                write!(f, "multiple decoder versions in a single archive")
            }
            Self::DecoderOutOfData => {
                write!(f, "decoder expected more data than is in the packed file")
            }
            Self::TooManyFilters => write!(f, "too many filters"),
            Self::InvalidFilter => write!(f, "invalid filter"),
            Self::UnsupportedFilter => write!(f, "unsupported filter"),
            Self::PasswordRequired => write!(f, "password required for encrypted archive"),
            Self::BadPassword => write!(f, "incorrect password"),
            Self::UnexpectedEof => write!(f, "unexpected end of file"),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for RarError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RarError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Self::UnexpectedEof;
        }
        Self::Io(e)
    }
}

impl From<RarError> for io::Error {
    fn from(e: RarError) -> Self {
        match e {
            RarError::Io(e) => e,
            RarError::UnexpectedEof => {
                io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected end of file")
            }
            e => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

impl RarError {
    /// True if the error wraps a not-found error from the filesystem.
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, RarError>;
