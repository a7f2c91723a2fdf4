//! Archive reading and writing.
//!
//! The romset folder stores one zip per set, so zip is the only format
//! written; zip, 7z and rar archives can all be read (a staging folder
//! handed to the rebuilder may contain any of them). Listing a zip's
//! entries with their stored CRC32s is the fast path for scanning:
//! it avoids decompressing anything when no header rule is active.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Errors raised by archive operations.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    /// The archive could not be opened or decoded.
    #[error("cannot read archive {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    /// The file extension maps to no supported format.
    #[error("unsupported archive format: {0}")]
    Unsupported(PathBuf),

    /// An I/O error occurred while extracting or writing.
    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Archive formats readable by [`extract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Zip,
    SevenZ,
    Rar,
}

fn format_of(path: &Path) -> Option<Format> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "zip" => Some(Format::Zip),
        "7z" => Some(Format::SevenZ),
        "rar" => Some(Format::Rar),
        _ => None,
    }
}

/// Whether the path looks like an archive [`extract`] can open.
#[must_use]
pub fn is_archive(path: &Path) -> bool {
    format_of(path).is_some()
}

/// Lists a zip's file entries with their stored CRC32s, in central
/// directory order. Directory entries are excluded. The CRC is
/// formatted the way DATs record it: uppercase, zero-padded to 8
/// characters, and empty for a zero-size entry.
///
/// # Errors
///
/// Returns [`ArchiveError::Unreadable`] when the zip cannot be opened.
pub fn list_with_crc(path: &Path) -> Result<BTreeMap<String, String>, ArchiveError> {
    let mut archive = open_zip(path)?;
    let mut data = BTreeMap::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| ArchiveError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if entry.is_dir() {
            continue;
        }
        let crc = if entry.size() == 0 {
            String::new()
        } else {
            format!("{:08X}", entry.crc32())
        };
        data.insert(entry.name().to_string(), crc);
    }
    Ok(data)
}

/// Ordered list of file entry paths in an archive of any supported
/// format.
///
/// # Errors
///
/// Returns [`ArchiveError`] when the archive cannot be opened or the
/// extension is not a supported format.
pub fn list_paths(path: &Path) -> Result<Vec<String>, ArchiveError> {
    let unreadable = |message: String| ArchiveError::Unreadable {
        path: path.to_path_buf(),
        message,
    };
    match format_of(path).ok_or_else(|| ArchiveError::Unsupported(path.to_path_buf()))? {
        Format::Zip => {
            let mut archive = open_zip(path)?;
            let mut names = Vec::with_capacity(archive.len());
            for i in 0..archive.len() {
                let entry = archive.by_index(i).map_err(|e| unreadable(e.to_string()))?;
                if !entry.is_dir() {
                    names.push(entry.name().to_string());
                }
            }
            Ok(names)
        }
        Format::SevenZ => {
            let reader = sevenz_rust::SevenZReader::open(path, sevenz_rust::Password::empty())
                .map_err(|e| unreadable(e.to_string()))?;
            Ok(reader
                .archive()
                .files
                .iter()
                .filter(|f| !f.is_directory())
                .map(|f| f.name().to_string())
                .collect())
        }
        Format::Rar => {
            let archive = unrar::Archive::new(path)
                .open_for_listing()
                .map_err(|e| unreadable(e.to_string()))?;
            let mut names = Vec::new();
            for header in archive {
                let header = header.map_err(|e| unreadable(e.to_string()))?;
                if header.is_file() {
                    names.push(header.filename.to_string_lossy().into_owned());
                }
            }
            Ok(names)
        }
    }
}

/// Extracts an archive into `destination`, creating the directory tree
/// as needed. Timestamps and permissions are restored where the format
/// records them (zip does; the other readers restore what they can).
///
/// # Errors
///
/// Returns [`ArchiveError`] on unreadable archives, unsupported
/// formats, or extraction I/O failures.
pub fn extract(path: &Path, destination: &Path) -> Result<(), ArchiveError> {
    std::fs::create_dir_all(destination).map_err(|e| ArchiveError::Io {
        path: destination.to_path_buf(),
        source: e,
    })?;
    let unreadable = |message: String| ArchiveError::Unreadable {
        path: path.to_path_buf(),
        message,
    };
    match format_of(path).ok_or_else(|| ArchiveError::Unsupported(path.to_path_buf()))? {
        Format::Zip => {
            let mut archive = open_zip(path)?;
            archive
                .extract(destination)
                .map_err(|e| unreadable(e.to_string()))
        }
        Format::SevenZ => sevenz_rust::decompress_file(path, destination)
            .map_err(|e| unreadable(e.to_string())),
        Format::Rar => {
            let mut archive = unrar::Archive::new(path)
                .open_for_processing()
                .map_err(|e| unreadable(e.to_string()))?;
            while let Some(header) = archive.read_header().map_err(|e| unreadable(e.to_string()))? {
                archive = if header.entry().is_file() {
                    header
                        .extract_with_base(destination)
                        .map_err(|e| unreadable(e.to_string()))?
                } else {
                    header.skip().map_err(|e| unreadable(e.to_string()))?
                };
            }
            Ok(())
        }
    }
}

/// Writes `files` into a deflate zip at `out_path`. Entry names are the
/// file paths with the `root` prefix stripped, using forward slashes.
///
/// # Errors
///
/// Returns [`ArchiveError::Io`] on read/write failures and
/// [`ArchiveError::Unreadable`] when the zip cannot be finalised.
pub fn write_zip(
    out_path: &Path,
    files: &[PathBuf],
    root: &Path,
    level: i64,
) -> Result<(), ArchiveError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| ArchiveError::Io {
            path: path.clone(),
            source,
        }
    };
    let zip_err = |e: zip::result::ZipError| ArchiveError::Unreadable {
        path: out_path.to_path_buf(),
        message: e.to_string(),
    };

    let out = File::create(out_path).map_err(io_err(out_path))?;
    let mut writer = ZipWriter::new(out);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(level));

    for file in files {
        let name = file
            .strip_prefix(root)
            .unwrap_or(file)
            .to_string_lossy()
            .replace('\\', "/");
        writer.start_file(name, options).map_err(zip_err)?;
        let mut reader = File::open(file).map_err(io_err(file))?;
        io::copy(&mut reader, &mut writer).map_err(io_err(file))?;
    }
    writer.finish().map_err(zip_err)?.flush().map_err(io_err(out_path))?;
    Ok(())
}

fn open_zip(path: &Path) -> Result<ZipArchive<BufReader<File>>, ArchiveError> {
    let file = File::open(path).map_err(|e| ArchiveError::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    ZipArchive::new(BufReader::new(file)).map_err(|e| ArchiveError::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
