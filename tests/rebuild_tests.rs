mod common;

use common::{make_zip, write_dat, zip_entries};
use romorganizer::cache::Cache;
use romorganizer::config::Config;
use romorganizer::{rebuilder, scanner};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

const ALPHA: &[u8] = b"alpha rom content";
const SHARED: &[u8] = b"content listed in two sets";

/// Scan an empty romset first so the cache exists with everything
/// recorded as Missing, the state a rebuild starts from.
fn scanned_setup(root: &Path, games: &[(&str, &[(&str, &[u8])])]) -> (Config, PathBuf, PathBuf) {
    let config = Config::under_root(root);
    config.ensure_dirs().unwrap();
    let dat = config.dats_dir.join("Test (20240101).dat");
    write_dat(&dat, games);
    let folder = root.join("romset");
    fs::create_dir(&folder).unwrap();
    scanner::scan(&config, &dat, &folder, || false).unwrap();
    (config, dat, folder)
}

#[test]
fn test_rebuild_places_staged_archive_contents() {
    let root = tempdir().unwrap();
    let (config, dat, folder) = scanned_setup(
        root.path(),
        &[("Alpha", &[("files/rom.bin", ALPHA)])],
    );

    // The staged material arrives zipped, under a meaningless name.
    make_zip(
        &config.rebuild_dir.join("inner.zip"),
        &[("rom.bin", ALPHA)],
    );

    let counts = rebuilder::rebuild(&config, &dat, &folder, true).unwrap();

    assert_eq!(
        zip_entries(&folder.join("Alpha.zip")),
        vec!["files/rom.bin"]
    );
    let cache = Cache::load(&Cache::path_for(&dat, &config.cache_dir)).unwrap();
    assert!(cache.is_passed("Alpha", "files/rom.bin"));
    assert_eq!((counts.sets_have, counts.sets_total), (1, 1));
    assert_eq!((counts.roms_have, counts.roms_total), (1, 1));

    // remove_staging drained and recreated the staging folder.
    assert!(config.rebuild_dir.is_dir());
    assert_eq!(fs::read_dir(&config.rebuild_dir).unwrap().count(), 0);
}

#[test]
fn test_rebuild_deletes_files_that_match_nothing() {
    let root = tempdir().unwrap();
    let (config, dat, folder) =
        scanned_setup(root.path(), &[("Alpha", &[("a.bin", ALPHA)])]);

    fs::write(config.rebuild_dir.join("junk.bin"), b"junk data").unwrap();

    rebuilder::rebuild(&config, &dat, &folder, false).unwrap();

    assert!(!config.rebuild_dir.join("junk.bin").exists());
    assert!(!folder.join("Alpha.zip").exists());
}

#[test]
fn test_rebuild_deletes_content_already_in_romset() {
    let root = tempdir().unwrap();
    let config = Config::under_root(root.path());
    config.ensure_dirs().unwrap();
    let dat = config.dats_dir.join("Test (20240101).dat");
    write_dat(&dat, &[("Alpha", &[("a.bin", ALPHA)])]);

    let folder = root.path().join("romset");
    fs::create_dir(&folder).unwrap();
    make_zip(&folder.join("Alpha.zip"), &[("a.bin", ALPHA)]);
    scanner::scan(&config, &dat, &folder, || false).unwrap();

    // The same content shows up again in staging.
    fs::write(config.rebuild_dir.join("a.bin"), ALPHA).unwrap();

    rebuilder::rebuild(&config, &dat, &folder, false).unwrap();

    assert!(!config.rebuild_dir.join("a.bin").exists());
    assert_eq!(zip_entries(&folder.join("Alpha.zip")), vec!["a.bin"]);
}

#[test]
fn test_rebuild_copies_duplicated_content_to_every_set() {
    let root = tempdir().unwrap();
    let (config, dat, folder) = scanned_setup(
        root.path(),
        &[
            ("Alpha", &[("x.bin", SHARED)]),
            ("Beta", &[("y.bin", SHARED)]),
        ],
    );

    fs::write(config.rebuild_dir.join("whatever.bin"), SHARED).unwrap();

    let counts = rebuilder::rebuild(&config, &dat, &folder, true).unwrap();

    // One staged copy satisfies both listings.
    assert_eq!(zip_entries(&folder.join("Alpha.zip")), vec!["x.bin"]);
    assert_eq!(zip_entries(&folder.join("Beta.zip")), vec!["y.bin"]);
    assert_eq!((counts.sets_have, counts.sets_total), (2, 2));
}

#[test]
fn test_rebuild_merges_with_existing_set_archive() {
    let root = tempdir().unwrap();
    let config = Config::under_root(root.path());
    config.ensure_dirs().unwrap();
    let dat = config.dats_dir.join("Test (20240101).dat");
    write_dat(
        &dat,
        &[("Alpha", &[("a.bin", ALPHA), ("b.bin", b"second rom")])],
    );

    let folder = root.path().join("romset");
    fs::create_dir(&folder).unwrap();
    make_zip(&folder.join("Alpha.zip"), &[("a.bin", ALPHA)]);
    scanner::scan(&config, &dat, &folder, || false).unwrap();

    fs::write(config.rebuild_dir.join("b.bin"), b"second rom").unwrap();

    let counts = rebuilder::rebuild(&config, &dat, &folder, true).unwrap();

    assert_eq!(
        zip_entries(&folder.join("Alpha.zip")),
        vec!["a.bin", "b.bin"]
    );
    assert_eq!((counts.roms_have, counts.roms_total), (2, 2));
}

#[test]
fn test_rebuild_without_remove_staging_copies() {
    let root = tempdir().unwrap();
    let (config, dat, folder) =
        scanned_setup(root.path(), &[("Alpha", &[("a.bin", ALPHA)])]);

    fs::write(config.rebuild_dir.join("a.bin"), ALPHA).unwrap();

    rebuilder::rebuild(&config, &dat, &folder, false).unwrap();

    // Placed in the romset, left in staging.
    assert_eq!(zip_entries(&folder.join("Alpha.zip")), vec!["a.bin"]);
    assert!(config.rebuild_dir.join("a.bin").exists());
}

#[test]
fn test_rebuild_requires_cache() {
    let root = tempdir().unwrap();
    let config = Config::under_root(root.path());
    config.ensure_dirs().unwrap();
    let dat = config.dats_dir.join("Test (20240101).dat");
    write_dat(&dat, &[("Alpha", &[("a.bin", ALPHA)])]);
    let folder = root.path().join("romset");
    fs::create_dir(&folder).unwrap();

    let result = rebuilder::rebuild(&config, &dat, &folder, false);
    assert!(matches!(
        result,
        Err(rebuilder::RebuildError::CacheMissing(_))
    ));
}
