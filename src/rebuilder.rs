//! Rebuilding: harvest loose files from the staging folder into their
//! correct sets in the romset.
//!
//! Where a scan starts from the archives already in the romset, a
//! rebuild starts from whatever the user dropped into the staging
//! folder: loose files, zips, 7z or rar archives, nested arbitrarily.
//! Everything is unpacked flat, each file is matched against the
//! catalog by all three hashes, and matching files are packed into
//! their sets. Files matching nothing are deleted; files whose content
//! is already in the romset are deleted too.
//!
//! A rebuild needs the cache a previous scan created: the cache tells
//! it which catalog entries are still missing.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::{self, ArchiveError};
use crate::cache::{Cache, CacheEntry, CacheError, Counts, EntryStatus};
use crate::config::Config;
use crate::dat::{DatError, DatIndex, HashKind};
use crate::hasher;
use crate::scanner::{count_sets_roms, drain_dir, files_under, move_file, repack_set, ScanError};

/// Errors that abort a rebuild.
#[derive(thiserror::Error, Debug)]
pub enum RebuildError {
    /// The catalog file does not exist.
    #[error("{0} does not exist")]
    CatalogMissing(PathBuf),

    /// The romset path is not a directory.
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    /// No cache exists for this catalog yet.
    #[error("cache does not exist, run a scan first to create it")]
    CacheMissing(PathBuf),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Dat(#[from] DatError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A filesystem operation failed.
    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// The shared folder helpers report scan errors; fold them in.
impl From<ScanError> for RebuildError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::Archive(e) => Self::Archive(e),
            ScanError::Cache(e) => Self::Cache(e),
            ScanError::Dat(e) => Self::Dat(e),
            ScanError::Io { path, source } => Self::Io { path, source },
            other => Self::Io {
                path: PathBuf::new(),
                source: std::io::Error::other(other.to_string()),
            },
        }
    }
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> RebuildError + '_ {
    move |source| RebuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Rebuilds files from the staging folder into the romset at
/// `folder_path`, updating the cache created by a previous scan.
///
/// With `remove_staging` the staging folder is deleted and recreated
/// once everything matching has been placed; without it, staged files
/// are copied rather than moved and left behind.
///
/// Returns the refreshed set/rom tallies.
///
/// # Errors
///
/// Fatal conditions: missing catalog, romset or cache, an unloadable
/// catalog, or a cache rewrite failure. Unreadable staged archives are
/// logged and left in place.
pub fn rebuild(
    config: &Config,
    dat_path: &Path,
    folder_path: &Path,
    remove_staging: bool,
) -> Result<Counts, RebuildError> {
    if !dat_path.exists() {
        return Err(RebuildError::CatalogMissing(dat_path.to_path_buf()));
    }
    if !folder_path.is_dir() {
        return Err(RebuildError::NotADirectory(folder_path.to_path_buf()));
    }
    config.ensure_dirs().map_err(io_err(&config.tmp_dir))?;

    let cache_file = Cache::path_for(dat_path, &config.cache_dir);
    if !cache_file.exists() {
        return Err(RebuildError::CacheMissing(cache_file));
    }

    println!("Rebuilding {}", dat_path.display());

    extract_staged_archives(&config.rebuild_dir)?;
    println!("Extracted all compressed archives (if any)");

    let index = DatIndex::load(dat_path)?;
    let mut cache = Cache::load(&cache_file)?;

    let mut to_zip: BTreeSet<String> = BTreeSet::new();
    let mut merged: HashSet<String> = HashSet::new();
    let mut upserts: Vec<CacheEntry> = Vec::new();

    for file in files_under(&config.rebuild_dir) {
        let hashes = match hasher::hash_file(&file, None) {
            Ok(hashes) => hashes,
            Err(e) => {
                log::warn!("{e}; leaving staged file in place");
                continue;
            }
        };

        // A rebuild checks all three hashes; a file qualifies for every
        // listing that carries exactly this content.
        let listings: Vec<&crate::dat::DatEntry> = index
            .entries()
            .iter()
            .filter(|e| {
                e.crc32 == hashes.crc32 && e.md5 == hashes.md5 && e.sha1 == hashes.sha1
            })
            .collect();

        if listings.is_empty() {
            fs::remove_file(&file).map_err(io_err(&file))?;
            println!("Deleted {} (does not match DAT)", file.display());
            continue;
        }

        // Duplicated content may be needed by several sets, so the
        // staged file can only be moved when one listing wants it.
        let sha1_duped = index.is_duplicate(&hashes.sha1, HashKind::Sha1);
        let mut moved = false;
        let mut all_passed = true;

        for listing in &listings {
            if cache.is_passed(&listing.set_name, &listing.rom_name) {
                continue;
            }
            all_passed = false;

            let scratch_dir = config.tmp_dir.join(&listing.set_name);
            let target = scratch_dir.join(&listing.rom_name);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }

            // Merge the set's existing archive before the first file
            // lands in its scratch subtree.
            let set_zip = folder_path.join(format!("{}.zip", listing.set_name));
            if set_zip.exists() && !merged.contains(&listing.set_name) {
                archive::extract(&set_zip, &scratch_dir)?;
                fs::remove_file(&set_zip).map_err(io_err(&set_zip))?;
                merged.insert(listing.set_name.clone());
            }

            if remove_staging && !sha1_duped {
                move_file(&file, &target)?;
                moved = true;
            } else if !target.exists() {
                fs::copy(&file, &target).map_err(io_err(&file))?;
            }
            println!(
                "Rebuilt {} to {}/{}",
                file.display(),
                listing.set_name,
                listing.rom_name
            );

            to_zip.insert(listing.set_name.clone());
            upserts.push(CacheEntry {
                set_name: listing.set_name.clone(),
                rom_name: listing.rom_name.clone(),
                crc32: listing.crc32.clone(),
                md5: listing.md5.clone(),
                sha1: listing.sha1.clone(),
                status: EntryStatus::Passed,
            });

            if moved {
                break;
            }
        }

        if !moved && all_passed {
            fs::remove_file(&file).map_err(io_err(&file))?;
            println!("Deleted {} (already in romset)", file.display());
        }
    }

    for set in &to_zip {
        repack_set(folder_path, &config.tmp_dir, set)?;
    }
    drain_dir(&config.tmp_dir)?;
    println!("All files that match against DAT moved to romset");

    cache.add_or_replace(upserts)?;

    if remove_staging {
        drain_dir(&config.rebuild_dir)?;
    }

    let counts = count_sets_roms(cache.entries());
    cache.update_counts(counts)?;
    Ok(counts)
}

/// Unpacks archives in the staging folder until none remain. Each
/// archive becomes a sibling directory named by its stem and is
/// removed after extraction; archives nested inside archives are
/// handled by the next round. Unreadable archives are skipped so the
/// loop always terminates.
fn extract_staged_archives(staging_dir: &Path) -> Result<(), RebuildError> {
    let mut failed: HashSet<PathBuf> = HashSet::new();
    loop {
        let archives: Vec<PathBuf> = files_under(staging_dir)
            .into_iter()
            .filter(|p| archive::is_archive(p) && !failed.contains(p))
            .collect();
        if archives.is_empty() {
            return Ok(());
        }
        for archive_path in archives {
            let dest = archive_path.with_extension("");
            match archive::extract(&archive_path, &dest) {
                Ok(()) => {
                    fs::remove_file(&archive_path).map_err(io_err(&archive_path))?;
                }
                Err(e) => {
                    log::warn!("{e}; leaving archive in staging folder");
                    failed.insert(archive_path);
                }
            }
        }
    }
}
