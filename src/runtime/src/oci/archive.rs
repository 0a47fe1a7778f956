//! Decompression adapter for local image archives.
//!
//! Every supported container (tar, tar+gzip, tar+bzip2, tar+lz4, tar+zstd)
//! is presented as one [`ArchiveReader`] with a single [`ArchiveReader::close`]
//! that releases the decompressor (when it has anything to release) and
//! always closes the underlying handle, aggregating both failures.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use lz4_flex::frame::FrameDecoder;
use nodeboot_core::error::{MultiError, Result, StageError};

/// Largest zstd window accepted, matching `zstd --long=31`.
const ZSTD_WINDOW_LOG_MAX: u32 = 31;

/// Archive container, selected by file name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    Gzip,
    Bzip2,
    Lz4,
    Zstd,
}

impl ArchiveFormat {
    /// Pick the container for a file name, case-insensitively.
    ///
    /// Returns `Ok(None)` for `.txt` sidecars (checksums, image lists) that
    /// live next to archives and are not archives themselves.
    pub fn from_path(path: &Path) -> Result<Option<Self>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let has_suffix = |suffixes: &[&str]| suffixes.iter().any(|s| name.ends_with(s));

        let format = if has_suffix(&[".txt"]) {
            return Ok(None);
        } else if has_suffix(&[".tar"]) {
            Self::Tar
        } else if has_suffix(&[".tar.lz4"]) {
            Self::Lz4
        } else if has_suffix(&[".tar.bz2", ".tbz"]) {
            Self::Bzip2
        } else if has_suffix(&[".tar.gz", ".tgz"]) {
            Self::Gzip
        } else if has_suffix(&[".tar.zst", ".tzst"]) {
            Self::Zstd
        } else {
            return Err(StageError::UnsupportedArchive(path.display().to_string()));
        };

        Ok(Some(format))
    }

    /// Open `path` and wrap it in the matching decompressor.
    pub fn open(self, path: &Path) -> Result<ArchiveReader> {
        let file = File::open(path).map_err(|e| {
            StageError::Archive(format!("Failed to open {}: {}", path.display(), e))
        })?;
        self.wrap(file).map_err(|e| {
            StageError::Archive(format!(
                "Failed to initialize decompressor for {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Wrap an already open handle in the matching decompressor.
    pub fn wrap<H: Read + Closer>(self, handle: H) -> io::Result<ArchiveReader<H>> {
        Ok(match self {
            Self::Tar => ArchiveReader::Plain(handle),
            Self::Gzip => ArchiveReader::Gzip(GzDecoder::new(handle)),
            Self::Bzip2 => ArchiveReader::Bzip2(BzDecoder::new(handle)),
            Self::Lz4 => ArchiveReader::Lz4(FrameDecoder::new(handle)),
            Self::Zstd => {
                let mut decoder = zstd::stream::read::Decoder::new(handle)?;
                decoder.window_log_max(ZSTD_WINDOW_LOG_MAX)?;
                ArchiveReader::Zstd(decoder)
            }
        })
    }
}

/// A handle whose release can fail.
pub trait Closer {
    fn close(self) -> io::Result<()>;
}

impl Closer for File {
    #[cfg(unix)]
    fn close(self) -> io::Result<()> {
        use std::os::unix::io::IntoRawFd;

        let fd = self.into_raw_fd();
        // SAFETY: `into_raw_fd` transferred ownership of the descriptor to us,
        // so it is closed exactly once here.
        if unsafe { libc::close(fd) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn close(self) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

/// A readable archive stream with a single close operation.
pub enum ArchiveReader<H: Read + Closer = File> {
    /// Uncompressed tar.
    Plain(H),
    /// gzip verifies its CRC trailer on close when the data was read through.
    Gzip(GzDecoder<H>),
    /// bzip2 has nothing to release.
    Bzip2(BzDecoder<H>),
    /// lz4 has nothing to release.
    Lz4(FrameDecoder<H>),
    /// zstd frees its context on close and cannot fail doing so.
    Zstd(zstd::stream::read::Decoder<'static, BufReader<H>>),
}

impl<H: Read + Closer> ArchiveReader<H> {
    /// Release the decompressor and close the underlying handle.
    ///
    /// The handle is closed even when the decompressor reports a failure;
    /// both failures are returned together.
    pub fn close(self) -> Result<()> {
        let mut errs = MultiError::new();

        let handle = match self {
            Self::Plain(handle) => handle,
            Self::Bzip2(decoder) => decoder.into_inner(),
            Self::Lz4(decoder) => decoder.into_inner(),
            Self::Zstd(decoder) => decoder.finish().into_inner(),
            Self::Gzip(mut decoder) => {
                // A caller that consumed all data stops just short of the
                // trailer; one more read checks it. Streams abandoned midway
                // are released without decompressing the remainder.
                let mut next = [0u8; 1];
                if let Err(e) = decoder.read(&mut next) {
                    errs.push(StageError::Archive(format!(
                        "gzip stream failed verification: {}",
                        e
                    )));
                }
                decoder.into_inner()
            }
        };

        if let Err(e) = handle.close() {
            errs.push(StageError::Io(e));
        }

        errs.into_result()
    }
}

impl<H: Read + Closer> Read for ArchiveReader<H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Gzip(r) => r.read(buf),
            Self::Bzip2(r) => r.read(buf),
            Self::Lz4(r) => r.read(buf),
            Self::Zstd(r) => r.read(buf),
        }
    }
}

impl<H: Read + Closer> std::fmt::Debug for ArchiveReader<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Plain(_) => "tar",
            Self::Gzip(_) => "gzip",
            Self::Bzip2(_) => "bzip2",
            Self::Lz4(_) => "lz4",
            Self::Zstd(_) => "zstd",
        };
        f.debug_tuple("ArchiveReader").field(&kind).finish()
    }
}
