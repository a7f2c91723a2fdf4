//! Streaming file hashing for ROM identification.
//!
//! Computes the three digests a DAT catalog records for every rom
//! (CRC32, MD5 and SHA-1) plus the file size, in a single 16 KiB
//! streaming pass. An optional [`HeaderRule`] makes the pass skip a
//! fixed-size header when the file's magic bytes match the rule, which
//! is how cartridge dumps with loader headers are matched against
//! headerless catalog entries.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use sha1::Sha1;

use crate::headers::HeaderRule;

/// Read chunk size for the streaming pass.
const CHUNK_SIZE: usize = 16 * 1024;

/// Errors that can occur while hashing a file.
#[derive(thiserror::Error, Debug)]
pub enum HashError {
    /// The file to hash was not found.
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// An I/O error occurred while reading the file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Size and digests of a single file, formatted the way DAT catalogs
/// record them.
///
/// All three hash strings are uppercase hex; the CRC32 is zero-padded
/// to 8 characters. A zero-length file has all three strings empty,
/// matching the blank-rom convention used by DAT files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHashes {
    /// File size in bytes (header excluded when a rule matched).
    pub size: u64,
    /// Uppercase CRC32, 8 characters, or empty for a zero-length file.
    pub crc32: String,
    /// Uppercase MD5, or empty for a zero-length file.
    pub md5: String,
    /// Uppercase SHA-1, or empty for a zero-length file.
    pub sha1: String,
}

/// Hashes a file, optionally applying a header-skip rule.
///
/// Streams the file in fixed-size chunks, feeding CRC32, MD5 and SHA-1
/// at once. When `rule` is given, the prefix covering the rule's data
/// checks is buffered first: if every check matches, the digests cover
/// only the bytes from the rule's start offset onwards and the reported
/// size excludes the header; if any check fails, the whole file is
/// hashed as if no rule existed.
///
/// # Errors
///
/// Returns [`HashError`] when the file cannot be opened or read.
pub fn hash_file(path: &Path, rule: Option<&HeaderRule>) -> Result<FileHashes, HashError> {
    let file = File::open(path).map_err(|e| open_error(path, e))?;
    let size = file
        .metadata()
        .map_err(|e| HashError::Io {
            path: path.to_path_buf(),
            source: e,
        })?
        .len();
    let mut reader = BufReader::new(file);

    let mut crc32 = crc32fast::Hasher::new();
    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();
    let mut hashed_size = size;

    if let Some(rule) = rule {
        // Buffer the prefix the rule needs to look at before deciding
        // whether the header is skipped.
        let prefix_len = rule.prefix_len().min(size) as usize;
        let mut prefix = vec![0u8; prefix_len];
        reader.read_exact(&mut prefix).map_err(|e| HashError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        if rule.matches(&prefix) {
            // The prefix always covers the header, so hashing resumes
            // inside the buffered bytes.
            let skip = rule.start_offset.min(size) as usize;
            hashed_size = size - skip as u64;
            update_all(&mut crc32, &mut md5, &mut sha1, &prefix[skip..]);
        } else {
            update_all(&mut crc32, &mut md5, &mut sha1, &prefix);
        }
    }

    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).map_err(|e| HashError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        update_all(&mut crc32, &mut md5, &mut sha1, &buf[..n]);
    }

    // Blank roms are recorded with empty hash strings in DATs.
    if hashed_size == 0 {
        return Ok(FileHashes {
            size: 0,
            crc32: String::new(),
            md5: String::new(),
            sha1: String::new(),
        });
    }

    Ok(FileHashes {
        size: hashed_size,
        crc32: format!("{:08X}", crc32.finalize()),
        md5: upper_hex(&md5.finalize()),
        sha1: upper_hex(&sha1.finalize()),
    })
}

fn update_all(crc32: &mut crc32fast::Hasher, md5: &mut Md5, sha1: &mut Sha1, chunk: &[u8]) {
    crc32.update(chunk);
    md5.update(chunk);
    sha1.update(chunk);
}

fn open_error(path: &Path, source: std::io::Error) -> HashError {
    if source.kind() == std::io::ErrorKind::NotFound {
        HashError::NotFound(path.to_path_buf())
    } else {
        HashError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn upper_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
