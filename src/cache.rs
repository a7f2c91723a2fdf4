//! Persistent reconciliation state, one cache file per catalog.
//!
//! The cache records, for every catalog entry, whether a matching file
//! is present in the romset (`Passed`) or not (`Missing`), together
//! with the hashes that were actually consulted when the file was
//! verified. It makes rescans cheap, since entries already `Passed` are
//! skipped, and survives catalog updates through
//! [`Cache::update_against_dat`].
//!
//! # File format
//!
//! UTF-8 text, LF line endings, whitespace-separated double-quoted
//! fields with no escape mechanism (quoted fields may contain spaces):
//!
//! ```text
//! romorganizer cache version 1.0
//! "catalog.dat" "/path/to/romset/" "12" "40" "118" "202"
//!
//! "Set Name" "rom name.bin" "DEADBEEF" "-" "-" "Passed"
//! ```
//!
//! The literal `-` marks a hash that was not computed for that file;
//! comparisons treat it as "do not compare". Every mutation rewrites
//! the whole document to a sibling temp file and commits with an
//! atomic rename, so readers never observe a partially written cache.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::dat::{catalog_stem, DatIndex};

/// First line of every cache file.
pub const SIGNATURE: &str = "romorganizer cache version 1.0";

/// Wire sentinel for a hash that was not consulted.
pub const HASH_NOT_CHECKED: &str = "-";

/// Errors raised by cache operations.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// The cache file could not be read.
    #[error("cannot read cache {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The cache file does not parse; the user must delete it.
    #[error("cache {path} is corrupt ({message}); delete it and rescan")]
    Corrupt { path: PathBuf, message: String },

    /// The rewritten cache could not be committed to disk.
    #[error("cannot write cache {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Verification state of one catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// A file with matching hashes is present under the canonical name.
    Passed,
    /// No matching file was found for this catalog entry.
    Missing,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "Passed"),
            Self::Missing => write!(f, "Missing"),
        }
    }
}

/// One cache row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub set_name: String,
    pub rom_name: String,
    pub crc32: String,
    /// Uppercase MD5, or [`HASH_NOT_CHECKED`].
    pub md5: String,
    /// Uppercase SHA-1, or [`HASH_NOT_CHECKED`].
    pub sha1: String,
    pub status: EntryStatus,
}

/// Set/rom tallies stored in the cache header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub sets_have: usize,
    pub sets_total: usize,
    pub roms_have: usize,
    pub roms_total: usize,
}

/// A loaded cache document, tied to the file it was read from.
#[derive(Debug)]
pub struct Cache {
    path: PathBuf,
    /// Catalog filename recorded when the cache was created or last
    /// refreshed.
    pub dat_filename: String,
    /// Romset folder this cache describes.
    pub folder_path: String,
    pub counts: Counts,
    entries: Vec<CacheEntry>,
}

impl Cache {
    /// Cache file location for a catalog: the catalog stem without its
    /// date suffix, under the cache directory, with a `.cache`
    /// extension. Successive dumps of the same system therefore share
    /// one cache.
    #[must_use]
    pub fn path_for(dat_path: &Path, cache_dir: &Path) -> PathBuf {
        cache_dir.join(format!("{}.cache", catalog_stem(dat_path)))
    }

    /// Creates a blank cache on disk with zeroed counts.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`] when the file cannot be written.
    pub fn create(path: &Path, dat_filename: &str, folder_path: &str) -> Result<Self, CacheError> {
        let cache = Self {
            path: path.to_path_buf(),
            dat_filename: dat_filename.to_string(),
            folder_path: folder_path.to_string(),
            counts: Counts::default(),
            entries: Vec::new(),
        };
        cache.persist()?;
        Ok(cache)
    }

    /// Loads and validates a cache file.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] when the file cannot be read and
    /// [`CacheError::Corrupt`] on a bad signature, header or row.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let text = std::fs::read_to_string(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let corrupt = |message: String| CacheError::Corrupt {
            path: path.to_path_buf(),
            message,
        };

        let mut lines = text.lines();
        let signature = lines.next().unwrap_or_default();
        if signature != SIGNATURE {
            return Err(corrupt(format!("unexpected signature {signature:?}")));
        }

        let header = split_quoted(lines.next().unwrap_or_default());
        if header.len() != 6 {
            return Err(corrupt(format!(
                "header has {} fields, expected 6",
                header.len()
            )));
        }
        let count = |field: &str| {
            field
                .parse::<usize>()
                .map_err(|_| corrupt(format!("bad count {field:?}")))
        };
        let counts = Counts {
            sets_have: count(&header[2])?,
            sets_total: count(&header[3])?,
            roms_have: count(&header[4])?,
            roms_total: count(&header[5])?,
        };

        let mut entries = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_quoted(line);
            if fields.len() != 6 {
                return Err(corrupt(format!(
                    "entry has {} fields, expected 6: {line:?}",
                    fields.len()
                )));
            }
            let status = match fields[5].as_str() {
                "Passed" => EntryStatus::Passed,
                "Missing" => EntryStatus::Missing,
                other => return Err(corrupt(format!("unknown status {other:?}"))),
            };
            let mut it = fields.into_iter();
            entries.push(CacheEntry {
                set_name: it.next().unwrap_or_default(),
                rom_name: it.next().unwrap_or_default(),
                crc32: it.next().unwrap_or_default(),
                md5: it.next().unwrap_or_default(),
                sha1: it.next().unwrap_or_default(),
                status,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            dat_filename: header[0].clone(),
            folder_path: header[1].clone(),
            counts,
            entries,
        })
    }

    /// Cache rows in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    /// Whether the catalog on disk differs from the one this cache was
    /// built against. Only the filename is compared: a content change
    /// inside an identically-named catalog goes unnoticed.
    #[must_use]
    pub fn has_update(&self, dat_path: &Path) -> bool {
        let recorded = Path::new(&self.dat_filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.dat_filename.clone());
        let current = dat_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        recorded != current
    }

    /// Whether any entry with this rom name is already `Passed`.
    #[must_use]
    pub fn rom_passed(&self, rom_name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.rom_name == rom_name && e.status == EntryStatus::Passed)
    }

    /// Whether the (set, rom) identity is recorded as `Passed`.
    #[must_use]
    pub fn is_passed(&self, set_name: &str, rom_name: &str) -> bool {
        self.entries.iter().any(|e| {
            e.set_name == set_name && e.rom_name == rom_name && e.status == EntryStatus::Passed
        })
    }

    /// Whether any entry has the (set, rom) identity.
    #[must_use]
    pub fn contains(&self, set_name: &str, rom_name: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.set_name == set_name && e.rom_name == rom_name)
    }

    /// Drops entries no longer backed by the catalog and records the
    /// new catalog filename. Counts are zeroed until the next scan.
    ///
    /// An entry survives when a catalog entry has the same (set, rom,
    /// crc32), and the same md5/sha1 too, unless both were recorded
    /// as not-checked. Running this twice against the same catalog is
    /// a no-op the second time.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`] when the rewrite fails.
    pub fn update_against_dat(
        &mut self,
        index: &DatIndex,
        dat_filename: &str,
    ) -> Result<(), CacheError> {
        self.entries.retain(|entry| {
            match index.hash_of(&entry.set_name, &entry.rom_name) {
                Some((crc32, md5, sha1, _size)) => {
                    if entry.crc32 != crc32 {
                        return false;
                    }
                    if entry.md5 == HASH_NOT_CHECKED && entry.sha1 == HASH_NOT_CHECKED {
                        true
                    } else {
                        entry.md5 == md5 && entry.sha1 == sha1
                    }
                }
                None => false,
            }
        });
        self.dat_filename = dat_filename.to_string();
        self.counts = Counts::default();
        self.persist()
    }

    /// Inserts entries, replacing any existing row with the same
    /// (set, rom) identity, then commits the rewrite.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`] when the rewrite fails.
    pub fn add_or_replace(&mut self, new_entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        if new_entries.is_empty() {
            return Ok(());
        }
        for incoming in new_entries {
            self.entries
                .retain(|e| !(e.set_name == incoming.set_name && e.rom_name == incoming.rom_name));
            self.entries.push(incoming);
        }
        self.persist()
    }

    /// Stores fresh tallies in the header and commits.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`] when the rewrite fails.
    pub fn update_counts(&mut self, counts: Counts) -> Result<(), CacheError> {
        self.counts = counts;
        self.persist()
    }

    /// Rewrites the whole document to a sibling temp file and renames
    /// it over the cache. The rename is the commit point.
    fn persist(&self) -> Result<(), CacheError> {
        let write_err = |source: std::io::Error| CacheError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;

        writeln!(temp, "{SIGNATURE}").map_err(write_err)?;
        writeln!(
            temp,
            "{}",
            join_quoted(&[
                &self.dat_filename,
                &self.folder_path,
                &self.counts.sets_have.to_string(),
                &self.counts.sets_total.to_string(),
                &self.counts.roms_have.to_string(),
                &self.counts.roms_total.to_string(),
            ])
        )
        .map_err(write_err)?;
        writeln!(temp).map_err(write_err)?;
        for entry in &self.entries {
            writeln!(
                temp,
                "{}",
                join_quoted(&[
                    &entry.set_name,
                    &entry.rom_name,
                    &entry.crc32,
                    &entry.md5,
                    &entry.sha1,
                    &entry.status.to_string(),
                ])
            )
            .map_err(write_err)?;
        }

        temp.persist(&self.path).map_err(|e| CacheError::Write {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }
}

/// Splits a line into whitespace-separated fields, where a field
/// starting with `"` runs to the next `"` and may contain spaces.
/// There is no escape mechanism.
fn split_quoted(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut field = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                field.push(c);
            }
            fields.push(field);
        } else {
            let mut field = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                field.push(c);
                chars.next();
            }
            fields.push(field);
        }
    }
    fields
}

fn join_quoted(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| format!("\"{f}\""))
        .collect::<Vec<_>>()
        .join(" ")
}
