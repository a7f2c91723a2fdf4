//! Shared helpers for the integration tests: building zips and DAT
//! files whose hashes really match their contents.
#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use romorganizer::hasher::{self, FileHashes};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Real (size, CRC32, MD5, SHA-1) of a byte string, computed through
/// the crate's own hasher (pinned against known vectors in its unit
/// tests).
pub fn hashes_of(content: &[u8]) -> FileHashes {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content).unwrap();
    file.flush().unwrap();
    hasher::hash_file(file.path(), None).unwrap()
}

/// Writes a zip with the given (entry name, content) pairs.
pub fn make_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(2));
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
}

/// Writes a DAT whose rom hashes are derived from the given contents,
/// so scans against files with those contents verify cleanly.
pub fn write_dat(path: &Path, games: &[(&str, &[(&str, &[u8])])]) {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<datafile>\n");
    xml.push_str("  <header>\n    <name>Test</name>\n  </header>\n");
    for (set_name, roms) in games {
        xml.push_str(&format!("  <game name=\"{set_name}\">\n"));
        for (rom_name, content) in *roms {
            let h = hashes_of(content);
            xml.push_str(&format!(
                "    <rom name=\"{rom_name}\" size=\"{}\" crc=\"{}\" md5=\"{}\" sha1=\"{}\"/>\n",
                content.len(),
                h.crc32,
                h.md5,
                h.sha1
            ));
        }
        xml.push_str("  </game>\n");
    }
    xml.push_str("</datafile>\n");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, xml).unwrap();
}

/// Sorted entry names of a zip.
pub fn zip_entries(path: &Path) -> Vec<String> {
    romorganizer::archive::list_with_crc(path)
        .unwrap()
        .into_keys()
        .collect()
}
