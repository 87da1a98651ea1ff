//! # Archive Containers
//!
//! The external archiving capability used by the writer. The core never encodes
//! bytes itself: it hands a [`CompressJob`] to an [`ArchiveBackend`] and reads
//! back an [`ArchiveManifest`] to verify the result.
//!
//! [`NativeBackend`] implements the supported containers on top of `zip`,
//! `tar`, `zstd` and `xz2`. Archives are written to a temporary file next to the
//! destination and only moved into place once complete, and never over an
//! existing file.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::common::{member_name, ArchiveManifest};
use crate::error::ConfigurationError;

/// Files at least this large need zip64 extensions.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Container formats the native backend can write and inspect.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    #[default]
    #[serde(rename = "zip")]
    Zip,
    /// Zip container with the comic-book extension.
    #[serde(rename = "cbz")]
    Cbz,
    #[serde(rename = "tar.zst")]
    TarZst,
    #[serde(rename = "tar.xz")]
    TarXz,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 4] = [
        ArchiveFormat::Zip,
        ArchiveFormat::Cbz,
        ArchiveFormat::TarZst,
        ArchiveFormat::TarXz,
    ];

    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Cbz => "cbz",
            ArchiveFormat::TarZst => "tar.zst",
            ArchiveFormat::TarXz => "tar.xz",
        }
    }

    /// Detects a supported format from the file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            return Some(ArchiveFormat::TarZst);
        }
        if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            return Some(ArchiveFormat::TarXz);
        }
        match name.rsplit_once('.')?.1 {
            "zip" => Some(ArchiveFormat::Zip),
            "cbz" => Some(ArchiveFormat::Cbz),
            _ => None,
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArchiveFormat {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().trim_start_matches('.').to_ascii_lowercase();
        ArchiveFormat::ALL
            .into_iter()
            .find(|f| f.extension() == wanted)
            .ok_or_else(|| ConfigurationError::UnsupportedFormat(s.to_string()))
    }
}

/// One request to the archiver: pack `sources` into `destination`.
#[derive(Debug, Clone)]
pub struct CompressJob<'a> {
    pub sources: &'a [PathBuf],
    /// Member names are the source paths relative to this directory.
    pub base_dir: &'a Path,
    pub destination: &'a Path,
    /// 0 (fastest) to 9 (smallest).
    pub level: u8,
    pub format: ArchiveFormat,
}

/// The archiving capability the writer delegates to.
pub trait ArchiveBackend: Send + Sync {
    /// Writes the archive and returns its size on disk.
    ///
    /// Must fail with [`io::ErrorKind::AlreadyExists`] rather than replace an
    /// existing destination.
    fn compress(&self, job: &CompressJob<'_>) -> io::Result<u64>;

    /// Counts the regular-file members of an archive and sums their sizes.
    fn inspect(&self, archive: &Path) -> io::Result<ArchiveManifest>;
}

/// Backend built on the `zip`, `tar`, `zstd` and `xz2` crates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

impl ArchiveBackend for NativeBackend {
    fn compress(&self, job: &CompressJob<'_>) -> io::Result<u64> {
        let parent = match job.destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(parent)?;

        match job.format {
            ArchiveFormat::Zip | ArchiveFormat::Cbz => write_zip(tmp.as_file_mut(), job)?,
            ArchiveFormat::TarZst => {
                let level = 1 + 2 * i32::from(job.level);
                let encoder = zstd::stream::write::Encoder::new(tmp.as_file_mut(), level)?;
                let encoder = write_tar(encoder, job)?;
                encoder.finish()?;
            }
            ArchiveFormat::TarXz => {
                let encoder = xz2::write::XzEncoder::new(tmp.as_file_mut(), u32::from(job.level));
                let encoder = write_tar(encoder, job)?;
                encoder.finish()?;
            }
        }
        tmp.as_file_mut().sync_all()?;

        let file = tmp
            .persist_noclobber(job.destination)
            .map_err(|e| e.error)?;
        Ok(file.metadata()?.len())
    }

    fn inspect(&self, archive: &Path) -> io::Result<ArchiveManifest> {
        let format = ArchiveFormat::from_path(archive).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported archive format: {}", archive.display()),
            )
        })?;
        let file = File::open(archive)?;
        match format {
            ArchiveFormat::Zip | ArchiveFormat::Cbz => inspect_zip(file),
            ArchiveFormat::TarZst => inspect_tar(zstd::stream::read::Decoder::new(file)?),
            ArchiveFormat::TarXz => inspect_tar(xz2::read::XzDecoder::new(file)),
        }
    }
}

fn zip_err(err: ZipError) -> io::Error {
    match err {
        ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

fn write_zip(out: &mut File, job: &CompressJob<'_>) -> io::Result<()> {
    let mut zip = ZipWriter::new(out);
    let (method, level) = if job.level == 0 {
        (CompressionMethod::Stored, None)
    } else {
        (CompressionMethod::Deflated, Some(i32::from(job.level)))
    };

    for src in job.sources {
        let mut input = File::open(src)?;
        let size = input.metadata()?.len();
        let options = FileOptions::default()
            .compression_method(method)
            .compression_level(level)
            .large_file(size >= ZIP64_THRESHOLD);
        zip.start_file(member_name(src, job.base_dir), options)
            .map_err(zip_err)?;
        io::copy(&mut input, &mut zip)?;
    }
    zip.finish().map_err(zip_err)?;
    Ok(())
}

fn write_tar<W: Write>(sink: W, job: &CompressJob<'_>) -> io::Result<W> {
    let mut builder = tar::Builder::new(sink);
    for src in job.sources {
        builder.append_path_with_name(src, member_name(src, job.base_dir))?;
    }
    builder.into_inner()
}

fn inspect_zip(file: File) -> io::Result<ArchiveManifest> {
    let mut archive = ZipArchive::new(file).map_err(zip_err)?;
    let mut manifest = ArchiveManifest::default();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(zip_err)?;
        if entry.is_dir() {
            continue;
        }
        manifest.member_count += 1;
        manifest.total_size += entry.size();
    }
    Ok(manifest)
}

fn inspect_tar<R: Read>(reader: R) -> io::Result<ArchiveManifest> {
    let mut archive = tar::Archive::new(reader);
    let mut manifest = ArchiveManifest::default();
    for entry in archive.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        manifest.member_count += 1;
        manifest.total_size += entry.size();
    }
    Ok(manifest)
}

/// Removes a produced archive, ignoring a file that is already gone.
pub(crate) fn discard(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
