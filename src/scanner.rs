//! Romset scanning: make a folder of per-set zips match the catalog.
//!
//! A scan runs four sequential phases over the romset folder:
//!
//! 1. **CRC sweep**: every archive entry whose CRC32 (and, when the
//!    CRC is duplicated in the catalog, SHA-1) matches nothing in the
//!    catalog is moved to the backup folder.
//! 2. **Name normalisation**: entries not yet covered by a `Passed`
//!    cache row are resolved to their canonical (set, rom) identity
//!    and renamed/moved between archives through the scratch folder,
//!    then the touched sets are repacked.
//! 3. **Missing synthesis**: catalog entries with no `Passed` row are
//!    recorded as `Missing`.
//! 4. **Counting**: set/rom tallies are derived and stored in the
//!    cache header.
//!
//! Identity resolution prefers the cheapest decisive hash: a CRC32
//! unique in the catalog decides on its own; a duplicated CRC32 falls
//! back to SHA-1; a duplicated SHA-1 consumes a claim from the
//! catalog's free pool so that each physical copy of the same content
//! lands on a distinct listing.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::archive::{self, ArchiveError};
use crate::cache::{Cache, CacheEntry, CacheError, Counts, EntryStatus, HASH_NOT_CHECKED};
use crate::config::Config;
use crate::dat::{DatError, DatIndex, HashKind};
use crate::hasher;
use crate::headers::{self, HeaderRule, HeaderRuleError};

/// Errors that abort a scan.
#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    /// The catalog file does not exist.
    #[error("{0} does not exist")]
    CatalogMissing(PathBuf),

    /// The romset path is not a directory.
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Dat(#[from] DatError),

    #[error(transparent)]
    HeaderRule(#[from] HeaderRuleError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// A filesystem operation outside archive handling failed.
    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> ScanError + '_ {
    move |source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Scans `folder_path` against the catalog at `dat_path`, driving the
/// folder's contents to match it and updating the cache.
///
/// `confirm_update` is consulted once when the cache was built against
/// a differently-named catalog; returning `true` refreshes the cache
/// with [`Cache::update_against_dat`] before scanning.
///
/// Returns the set/rom tallies written to the cache header.
///
/// # Errors
///
/// Fatal conditions per the failure policy: missing inputs, an
/// unloadable catalog or cache, or a cache rewrite failure. Unreadable
/// archives are logged and skipped instead.
pub fn scan<F>(
    config: &Config,
    dat_path: &Path,
    folder_path: &Path,
    confirm_update: F,
) -> Result<Counts, ScanError>
where
    F: FnOnce() -> bool,
{
    if !dat_path.exists() {
        return Err(ScanError::CatalogMissing(dat_path.to_path_buf()));
    }
    if !folder_path.is_dir() {
        return Err(ScanError::NotADirectory(folder_path.to_path_buf()));
    }
    config.ensure_dirs().map_err(io_err(&config.tmp_dir))?;

    println!("Scanning {}", dat_path.display());

    let mut index = DatIndex::load(dat_path)?;
    let dat_filename = file_name_string(dat_path);

    let cache_file = Cache::path_for(dat_path, &config.cache_dir);
    let mut cache = if cache_file.exists() {
        let mut cache = Cache::load(&cache_file)?;
        if cache.has_update(dat_path) && confirm_update() {
            cache.update_against_dat(&index, &dat_filename)?;
        }
        cache
    } else {
        Cache::create(
            &cache_file,
            &dat_filename,
            &folder_path.to_string_lossy(),
        )?
    };

    let rule = match headers::locate(dat_path, &config.dats_dir, &config.headers_dir) {
        Some(path) => {
            println!("Using header skipper {}", path.display());
            Some(HeaderRule::load(&path)?)
        }
        None => None,
    };

    crc_sweep(config, folder_path, &index, &cache, rule.as_ref())?;
    println!("All CRC32s (now) match DAT");

    normalise_names(config, folder_path, &mut index, &mut cache, rule.as_ref())?;
    println!("All set and rom names (now) match DAT");

    synthesise_missing(&index, &mut cache)?;

    let counts = count_sets_roms(cache.entries());
    cache.update_counts(counts)?;
    Ok(counts)
}

/// Phase 1: move every entry whose hashes match nothing in the catalog
/// into the backup folder, repacking archives that keep other entries.
fn crc_sweep(
    config: &Config,
    folder_path: &Path,
    index: &DatIndex,
    cache: &Cache,
    rule: Option<&HeaderRule>,
) -> Result<(), ScanError> {
    let mut to_zip: BTreeSet<String> = BTreeSet::new();

    for set in zip_stems(folder_path)? {
        let archive_path = folder_path.join(format!("{set}.zip"));
        let scratch_dir = config.tmp_dir.join(&set);
        let mut extracted = false;

        // With a header rule, stored CRCs are useless (they cover the
        // header); extract and hash. Without one, the zip's central
        // directory is enough. A `None` CRC marks an unreadable entry,
        // which is treated like a non-matching one.
        let entry_crcs: BTreeMap<String, Option<String>> = if let Some(rule) = rule {
            if let Err(e) = archive::extract(&archive_path, &scratch_dir) {
                log::warn!("{e}; skipping archive");
                continue;
            }
            extracted = true;
            let mut crcs = BTreeMap::new();
            for file in files_under(&scratch_dir) {
                let rom_name = relative_name(&file, &scratch_dir);
                match hasher::hash_file(&file, Some(rule)) {
                    Ok(hashes) => {
                        crcs.insert(rom_name, Some(hashes.crc32));
                    }
                    Err(e) => {
                        log::warn!("{e}; treating entry as unidentifiable");
                        crcs.insert(rom_name, None);
                    }
                }
            }
            crcs
        } else {
            match archive::list_with_crc(&archive_path) {
                Ok(info) => info.into_iter().map(|(k, v)| (k, Some(v))).collect(),
                Err(e) => {
                    log::warn!("{e}; skipping archive");
                    continue;
                }
            }
        };

        for (rom_name, crc32) in &entry_crcs {
            if cache.rom_passed(rom_name) {
                continue;
            }

            let matches_catalog = match crc32 {
                None => false,
                Some(crc32) if !index.in_dat(crc32, HashKind::Crc) => false,
                Some(crc32) if index.is_duplicate(crc32, HashKind::Crc) => {
                    // Duplicated CRC: only the SHA-1 can rule the file out.
                    if !extracted {
                        if let Err(e) = archive::extract(&archive_path, &scratch_dir) {
                            log::warn!("{e}; skipping archive");
                            break;
                        }
                        extracted = true;
                    }
                    match hasher::hash_file(&scratch_dir.join(rom_name), rule) {
                        Ok(hashes) => index.in_dat(&hashes.sha1, HashKind::Sha1),
                        Err(e) => {
                            log::warn!("{e}; treating entry as unidentifiable");
                            false
                        }
                    }
                }
                Some(_) => true,
            };

            if matches_catalog {
                continue;
            }

            if !extracted {
                if let Err(e) = archive::extract(&archive_path, &scratch_dir) {
                    log::warn!("{e}; skipping archive");
                    break;
                }
                extracted = true;
            }
            if backup_entry(config, &scratch_dir, &set, rom_name)? {
                println!(
                    "Moved {rom_name} in {} to backup folder",
                    archive_path.display()
                );
                to_zip.insert(set.clone());
            }
        }
    }

    for set in &to_zip {
        repack_set(folder_path, &config.tmp_dir, set)?;
    }
    drain_dir(&config.tmp_dir)?;
    Ok(())
}

/// Moves one extracted entry into `backup/<set>/<rom_name>`, keeping
/// any intra-archive directory structure. Returns `false` when the
/// backup target already exists: the file is left in the scratch tree
/// (and therefore in its archive) rather than clobbering the backup.
fn backup_entry(
    config: &Config,
    scratch_dir: &Path,
    set: &str,
    rom_name: &str,
) -> Result<bool, ScanError> {
    let source = scratch_dir.join(rom_name);
    let target = config.backup_dir.join(set).join(rom_name);
    if target.exists() {
        log::warn!(
            "backup target {} already exists; leaving {rom_name} in the archive",
            target.display()
        );
        return Ok(false);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    move_file(&source, &target)?;
    Ok(true)
}

/// Phase 2: resolve each uncovered entry to its canonical identity,
/// rename and regroup through the scratch folder, repack touched sets
/// and record the upserts.
fn normalise_names(
    config: &Config,
    folder_path: &Path,
    index: &mut DatIndex,
    cache: &mut Cache,
    rule: Option<&HeaderRule>,
) -> Result<(), ScanError> {
    // Archives whose contents are fully covered by Passed cache rows
    // need no work.
    let mut fix_sets: BTreeSet<String> = BTreeSet::new();
    for set in zip_stems(folder_path)? {
        let archive_path = folder_path.join(format!("{set}.zip"));
        let info = match archive::list_with_crc(&archive_path) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("{e}; skipping archive");
                continue;
            }
        };
        if info
            .keys()
            .any(|rom_name| !cache.is_passed(&set, rom_name))
        {
            fix_sets.insert(set);
        }
    }

    let mut to_zip: BTreeSet<String> = BTreeSet::new();
    // Sets whose existing archive was already merged into scratch.
    let mut merged: HashSet<String> = HashSet::new();
    let mut upserts: Vec<CacheEntry> = Vec::new();

    for set in &fix_sets {
        let archive_path = folder_path.join(format!("{set}.zip"));
        let scratch_src = config.tmp_dir.join(set);
        let mut extracted = false;
        let mut archive_removed = false;

        // With a header rule the stored CRCs cover the header, so the
        // archive is extracted up front and each entry hashed; without
        // one the central directory CRCs are used directly. A set whose
        // archive was already merged into scratch by an earlier move is
        // read from its scratch subtree instead.
        let entry_info: Vec<(String, String)> = if !archive_path.exists()
            && scratch_src.exists()
        {
            extracted = true;
            archive_removed = true;
            to_zip.insert(set.clone());
            let mut info = Vec::new();
            for file in files_under(&scratch_src) {
                match hasher::hash_file(&file, rule) {
                    Ok(hashes) => info.push((relative_name(&file, &scratch_src), hashes.crc32)),
                    Err(e) => log::warn!("{e}; skipping entry"),
                }
            }
            info
        } else if let Some(rule) = rule {
            if let Err(e) = archive::extract(&archive_path, &scratch_src) {
                log::warn!("{e}; skipping archive");
                continue;
            }
            extracted = true;
            let mut info = Vec::new();
            for file in files_under(&scratch_src) {
                match hasher::hash_file(&file, Some(rule)) {
                    Ok(hashes) => info.push((relative_name(&file, &scratch_src), hashes.crc32)),
                    Err(e) => log::warn!("{e}; skipping entry"),
                }
            }
            info
        } else {
            match archive::list_with_crc(&archive_path) {
                Ok(info) => info.into_iter().collect(),
                Err(e) => {
                    log::warn!("{e}; skipping archive");
                    continue;
                }
            }
        };

        for (rom_name, crc32) in &entry_info {
            let crc32 = crc32.clone();

            // Identity resolution.
            let mut checked_sha1: Option<String> = None;
            let identity = if !index.is_duplicate(&crc32, HashKind::Crc) {
                index
                    .name_of(&crc32, HashKind::Crc)
                    .map(|(s, r)| (s.to_string(), r.to_string()))
            } else {
                if !extracted {
                    if let Err(e) = archive::extract(&archive_path, &scratch_src) {
                        log::warn!("{e}; skipping archive");
                        break;
                    }
                    extracted = true;
                }
                let sha1 = match hasher::hash_file(&scratch_src.join(rom_name), rule) {
                    Ok(hashes) => hashes.sha1,
                    Err(e) => {
                        log::warn!("{e}; skipping entry");
                        continue;
                    }
                };
                checked_sha1 = Some(sha1.clone());
                if !index.is_duplicate(&sha1, HashKind::Sha1) {
                    index
                        .name_of(&sha1, HashKind::Sha1)
                        .map(|(s, r)| (s.to_string(), r.to_string()))
                } else {
                    index.claim_duplicate(&sha1, rom_name)
                }
            };
            let Some((correct_set, correct_rom)) = identity else {
                log::warn!("{rom_name} in {} no longer resolves against the DAT", archive_path.display());
                continue;
            };

            if *set != correct_set || *rom_name != correct_rom {
                if !extracted {
                    if let Err(e) = archive::extract(&archive_path, &scratch_src) {
                        log::warn!("{e}; skipping archive");
                        break;
                    }
                    extracted = true;
                }
                if !archive_removed {
                    fs::remove_file(&archive_path).map_err(io_err(&archive_path))?;
                    archive_removed = true;
                    to_zip.insert(set.clone());
                }

                let scratch_target = config.tmp_dir.join(&correct_set);
                if correct_set != *set {
                    fs::create_dir_all(&scratch_target).map_err(io_err(&scratch_target))?;
                    // Merge the existing archive of the target set so
                    // its entries survive the repack.
                    let target_zip = folder_path.join(format!("{correct_set}.zip"));
                    if target_zip.exists() && !merged.contains(&correct_set) {
                        archive::extract(&target_zip, &scratch_target)?;
                        fs::remove_file(&target_zip).map_err(io_err(&target_zip))?;
                        merged.insert(correct_set.clone());
                    }
                }

                let target = scratch_target.join(&correct_rom);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(io_err(parent))?;
                }
                move_file(&scratch_src.join(rom_name), &target)?;
                println!("Renamed {rom_name} to {correct_rom}");

                remove_empty_dirs(&scratch_src)?;
                to_zip.insert(correct_set.clone());
            }

            upserts.push(CacheEntry {
                set_name: correct_set,
                rom_name: correct_rom,
                crc32,
                md5: HASH_NOT_CHECKED.to_string(),
                sha1: checked_sha1.unwrap_or_else(|| HASH_NOT_CHECKED.to_string()),
                status: EntryStatus::Passed,
            });
        }
    }

    for set in &to_zip {
        repack_set(folder_path, &config.tmp_dir, set)?;
    }
    drain_dir(&config.tmp_dir)?;

    cache.add_or_replace(upserts)?;
    Ok(())
}

/// Phase 3: every catalog entry without a `Passed` row becomes a
/// `Missing` row carrying the catalog's hashes.
fn synthesise_missing(index: &DatIndex, cache: &mut Cache) -> Result<(), ScanError> {
    let mut missing = Vec::new();
    for entry in index.entries() {
        if !cache.is_passed(&entry.set_name, &entry.rom_name) {
            missing.push(CacheEntry {
                set_name: entry.set_name.clone(),
                rom_name: entry.rom_name.clone(),
                crc32: entry.crc32.clone(),
                md5: entry.md5.clone(),
                sha1: entry.sha1.clone(),
                status: EntryStatus::Missing,
            });
        }
    }
    cache.add_or_replace(missing)?;
    Ok(())
}

/// Phase 4: derive set/rom tallies from the cache rows. A set counts
/// as "have" only when every one of its roms is `Passed`.
#[must_use]
pub fn count_sets_roms(entries: &[CacheEntry]) -> Counts {
    let mut per_set: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    let mut roms_have = 0;
    let mut roms_total = 0;

    for entry in entries {
        let (have, total) = per_set.entry(entry.set_name.as_str()).or_default();
        *total += 1;
        roms_total += 1;
        if entry.status == EntryStatus::Passed {
            *have += 1;
            roms_have += 1;
        }
    }

    Counts {
        sets_have: per_set.values().filter(|(have, total)| have == total).count(),
        sets_total: per_set.len(),
        roms_have,
        roms_total,
    }
}

/// Stems of the `.zip` archives directly inside the romset folder,
/// sorted. One archive per set is the folder layout this tool keeps.
pub(crate) fn zip_stems(folder_path: &Path) -> Result<BTreeSet<String>, ScanError> {
    let mut stems = BTreeSet::new();
    let entries = fs::read_dir(folder_path).map_err(io_err(folder_path))?;
    for entry in entries {
        let entry = entry.map_err(io_err(folder_path))?;
        let path = entry.path();
        let is_zip = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
        if path.is_file() && is_zip {
            if let Some(stem) = path.file_stem() {
                stems.insert(stem.to_string_lossy().into_owned());
            }
        }
    }
    Ok(stems)
}

/// All regular files under `root`, sorted by path for deterministic
/// archive contents.
pub(crate) fn files_under(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

/// Path of `file` relative to `root`, with forward slashes.
pub(crate) fn relative_name(file: &Path, root: &Path) -> String {
    file.strip_prefix(root)
        .unwrap_or(file)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Moves a file, falling back to copy-and-remove when the rename
/// crosses a filesystem boundary.
pub(crate) fn move_file(source: &Path, target: &Path) -> Result<(), ScanError> {
    if fs::rename(source, target).is_ok() {
        return Ok(());
    }
    fs::copy(source, target).map_err(io_err(source))?;
    fs::remove_file(source).map_err(io_err(source))?;
    Ok(())
}

/// Removes empty directories under `root`, deepest first. Zero-byte
/// files are kept: a blank file can be a placeholder rom.
pub(crate) fn remove_empty_dirs(root: &Path) -> Result<(), ScanError> {
    let dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    for dir in dirs {
        let empty = fs::read_dir(&dir)
            .map(|mut it| it.next().is_none())
            .unwrap_or(false);
        if empty {
            fs::remove_dir(&dir).map_err(io_err(&dir))?;
        }
    }
    Ok(())
}

/// Rewrites `<folder>/<set>.zip` from the files staged under
/// `<tmp>/<set>`, then clears that scratch subtree. A set whose
/// scratch is empty gets its archive removed instead of an empty zip.
pub(crate) fn repack_set(folder_path: &Path, tmp_dir: &Path, set: &str) -> Result<(), ScanError> {
    let archive_path = folder_path.join(format!("{set}.zip"));
    let scratch_dir = tmp_dir.join(set);
    let files = files_under(&scratch_dir);

    if archive_path.exists() {
        fs::remove_file(&archive_path).map_err(io_err(&archive_path))?;
    }
    if !files.is_empty() {
        archive::write_zip(&archive_path, &files, &scratch_dir, 2)?;
    }
    if scratch_dir.exists() {
        fs::remove_dir_all(&scratch_dir).map_err(io_err(&scratch_dir))?;
    }
    Ok(())
}

/// Empties and recreates a directory. The scratch folder is exclusive
/// to one run and is left empty between phases.
pub(crate) fn drain_dir(dir: &Path) -> Result<(), ScanError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io_err(dir))?;
    }
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    Ok(())
}

pub(crate) fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::HASH_NOT_CHECKED;
    use std::fs;
    use tempfile::tempdir;

    fn entry(set: &str, rom: &str, status: EntryStatus) -> CacheEntry {
        CacheEntry {
            set_name: set.to_string(),
            rom_name: rom.to_string(),
            crc32: "00000000".to_string(),
            md5: HASH_NOT_CHECKED.to_string(),
            sha1: HASH_NOT_CHECKED.to_string(),
            status,
        }
    }

    #[test]
    fn test_count_sets_roms() {
        let entries = vec![
            entry("A", "a1", EntryStatus::Passed),
            entry("A", "a2", EntryStatus::Passed),
            entry("B", "b1", EntryStatus::Passed),
            entry("B", "b2", EntryStatus::Missing),
            entry("C", "c1", EntryStatus::Missing),
        ];
        let counts = count_sets_roms(&entries);
        assert_eq!(counts.sets_have, 1);
        assert_eq!(counts.sets_total, 3);
        assert_eq!(counts.roms_have, 3);
        assert_eq!(counts.roms_total, 5);
    }

    #[test]
    fn test_count_sets_roms_empty() {
        assert_eq!(count_sets_roms(&[]), Counts::default());
    }

    #[test]
    fn test_zip_stems() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Alpha (USA).zip"), b"").unwrap();
        fs::write(dir.path().join("Beta.ZIP"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        fs::create_dir(dir.path().join("sub.zip")).unwrap();

        let stems = zip_stems(dir.path()).unwrap();
        assert_eq!(
            stems.into_iter().collect::<Vec<_>>(),
            vec!["Alpha (USA)", "Beta"]
        );
    }

    #[test]
    fn test_remove_empty_dirs_keeps_blank_files() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::create_dir_all(dir.path().join("keep")).unwrap();
        fs::write(dir.path().join("keep/blank.bin"), b"").unwrap();

        remove_empty_dirs(dir.path()).unwrap();
        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("keep/blank.bin").exists());
    }

    #[test]
    fn test_relative_name() {
        let root = Path::new("/tmp/scratch/Set");
        assert_eq!(
            relative_name(Path::new("/tmp/scratch/Set/files/a.bin"), root),
            "files/a.bin"
        );
    }

    #[test]
    fn test_move_file_creates_target() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src.bin");
        let target = dir.path().join("dst.bin");
        fs::write(&source, b"content").unwrap();

        move_file(&source, &target).unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read(&target).unwrap(), b"content");
    }
}
