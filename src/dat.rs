//! DAT catalog parsing and the duplicate-aware identity index.
//!
//! A DAT file is the authoritative XML listing of sets and their roms:
//!
//! ```xml
//! <datafile>
//!   <game name="Asteroids (USA)">
//!     <rom name="Asteroids (USA).a52" size="8192" crc="DEADBEEF"
//!          md5="..." sha1="..."/>
//!   </game>
//! </datafile>
//! ```
//!
//! Beyond the flat entry list, [`DatIndex`] precomputes the structures
//! that drive identity resolution during a scan: the sets of CRC32 and
//! SHA-1 values that appear on more than one entry, first-match lookups
//! by hash, a lookup by (set, rom) name, and, for every duplicated
//! SHA-1, a mutable free pool of (set, rom) claims that the scanner
//! consumes so each physical copy of duplicated content is assigned a
//! distinct catalog listing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;

/// Errors raised while loading a catalog.
#[derive(thiserror::Error, Debug)]
pub enum DatError {
    /// The catalog file could not be read.
    #[error("cannot read DAT {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not a DAT: wrong root element or broken XML.
    #[error("{path} is not a valid DAT: {message}")]
    Schema { path: PathBuf, message: String },
}

/// Which hash a lookup refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Crc,
    Sha1,
}

/// One rom listing from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatEntry {
    /// Name of the set (game) this rom belongs to.
    pub set_name: String,
    /// Rom name; any embedded path uses forward slashes after load.
    pub rom_name: String,
    /// Expected file size in bytes.
    pub size: u64,
    /// Uppercase CRC32, or empty for a blank rom.
    pub crc32: String,
    /// Uppercase MD5, or empty for a blank rom.
    pub md5: String,
    /// Uppercase SHA-1, or empty for a blank rom.
    pub sha1: String,
}

/// The parsed catalog plus its duplicate-hash structures.
#[derive(Debug, Clone)]
pub struct DatIndex {
    entries: Vec<DatEntry>,
    crc32_duplicates: HashSet<String>,
    sha1_duplicates: HashSet<String>,
    /// Per duplicated SHA-1, the DAT-ordered (set, rom) claims still
    /// unassigned during the current scan.
    sha1_pool: HashMap<String, Vec<(String, String)>>,
    by_crc: HashMap<String, usize>,
    by_sha1: HashMap<String, usize>,
    by_name: HashMap<(String, String), usize>,
}

impl DatIndex {
    /// Parses a catalog and builds the index.
    ///
    /// Rom names have backslashes normalised to forward slashes.
    /// XML entities in attribute values are decoded.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Schema`] when the root element is not
    /// `datafile` or an attribute cannot be parsed, and
    /// [`DatError::Io`] when the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, DatError> {
        let text = std::fs::read_to_string(path).map_err(|e| DatError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&text).map_err(|message| DatError::Schema {
            path: path.to_path_buf(),
            message,
        })
    }

    fn parse(text: &str) -> Result<Self, String> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut entries = Vec::new();
        let mut saw_root = false;
        let mut current_set: Option<String> = None;
        // Depth inside skipped subtrees such as <header>.
        let mut depth = 0usize;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = e.name().as_ref().to_vec();
                    if !saw_root {
                        if name != b"datafile" {
                            return Err(format!(
                                "root element is <{}>, expected <datafile>",
                                String::from_utf8_lossy(&name)
                            ));
                        }
                        saw_root = true;
                        continue;
                    }
                    match name.as_slice() {
                        b"game" if depth == 0 => {
                            current_set = Some(attribute(&e, b"name")?.unwrap_or_default());
                        }
                        b"rom" if depth == 0 && current_set.is_some() => {
                            if let Some(set) = &current_set {
                                entries.push(rom_entry(&e, set)?);
                            }
                        }
                        _ => depth += 1,
                    }
                }
                Ok(Event::Empty(e)) => {
                    if saw_root && depth == 0 && e.name().as_ref() == b"rom" {
                        if let Some(set) = &current_set {
                            entries.push(rom_entry(&e, set)?);
                        }
                    }
                }
                Ok(Event::End(e)) => {
                    if depth > 0 {
                        depth -= 1;
                    } else if e.name().as_ref() == b"game" {
                        current_set = None;
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }

        if !saw_root {
            return Err("document has no datafile root".to_string());
        }

        Ok(Self::build(entries))
    }

    /// Builds the duplicate structures and lookup maps from the
    /// DAT-ordered entry list.
    fn build(entries: Vec<DatEntry>) -> Self {
        let mut crc_counts: HashMap<&str, usize> = HashMap::new();
        let mut sha1_counts: HashMap<&str, usize> = HashMap::new();
        for entry in &entries {
            *crc_counts.entry(entry.crc32.as_str()).or_insert(0) += 1;
            *sha1_counts.entry(entry.sha1.as_str()).or_insert(0) += 1;
        }

        let crc32_duplicates: HashSet<String> = crc_counts
            .iter()
            .filter(|(_, &n)| n > 1)
            .map(|(&h, _)| h.to_string())
            .collect();
        let sha1_duplicates: HashSet<String> = sha1_counts
            .iter()
            .filter(|(_, &n)| n > 1)
            .map(|(&h, _)| h.to_string())
            .collect();

        let mut sha1_pool: HashMap<String, Vec<(String, String)>> = HashMap::new();
        let mut by_crc = HashMap::new();
        let mut by_sha1 = HashMap::new();
        let mut by_name = HashMap::new();

        for (i, entry) in entries.iter().enumerate() {
            by_crc.entry(entry.crc32.clone()).or_insert(i);
            by_sha1.entry(entry.sha1.clone()).or_insert(i);
            by_name
                .entry((entry.set_name.clone(), entry.rom_name.clone()))
                .or_insert(i);
            if sha1_duplicates.contains(&entry.sha1) {
                sha1_pool
                    .entry(entry.sha1.clone())
                    .or_default()
                    .push((entry.set_name.clone(), entry.rom_name.clone()));
            }
        }

        Self {
            entries,
            crc32_duplicates,
            sha1_duplicates,
            sha1_pool,
            by_crc,
            by_sha1,
            by_name,
        }
    }

    /// Catalog entries in DAT order.
    #[must_use]
    pub fn entries(&self) -> &[DatEntry] {
        &self.entries
    }

    /// Whether `hash` appears anywhere in the catalog. An empty catalog
    /// contains no hashes.
    #[must_use]
    pub fn in_dat(&self, hash: &str, kind: HashKind) -> bool {
        match kind {
            HashKind::Crc => self.by_crc.contains_key(hash),
            HashKind::Sha1 => self.by_sha1.contains_key(hash),
        }
    }

    /// Whether `hash` appears on more than one catalog entry.
    #[must_use]
    pub fn is_duplicate(&self, hash: &str, kind: HashKind) -> bool {
        match kind {
            HashKind::Crc => self.crc32_duplicates.contains(hash),
            HashKind::Sha1 => self.sha1_duplicates.contains(hash),
        }
    }

    /// First (set, rom) in DAT order carrying `hash`.
    #[must_use]
    pub fn name_of(&self, hash: &str, kind: HashKind) -> Option<(&str, &str)> {
        let index = match kind {
            HashKind::Crc => self.by_crc.get(hash),
            HashKind::Sha1 => self.by_sha1.get(hash),
        }?;
        let entry = &self.entries[*index];
        Some((entry.set_name.as_str(), entry.rom_name.as_str()))
    }

    /// Catalog entry with the given (set, rom) identity.
    #[must_use]
    pub fn entry_by_name(&self, set_name: &str, rom_name: &str) -> Option<&DatEntry> {
        let index = self
            .by_name
            .get(&(set_name.to_string(), rom_name.to_string()))?;
        Some(&self.entries[*index])
    }

    /// (crc32, md5, sha1, size) for a (set, rom) identity.
    #[must_use]
    pub fn hash_of(&self, set_name: &str, rom_name: &str) -> Option<(&str, &str, &str, u64)> {
        self.entry_by_name(set_name, rom_name)
            .map(|e| (e.crc32.as_str(), e.md5.as_str(), e.sha1.as_str(), e.size))
    }

    /// Claims a (set, rom) identity from the duplicate-SHA-1 free pool.
    ///
    /// When `file_rom_name` occurs among the remaining claims it is
    /// preferred, so a correctly-named copy keeps its name; otherwise
    /// the first remaining claim in DAT order is taken. The claim is
    /// removed so further copies of the same content receive distinct
    /// identities.
    pub fn claim_duplicate(&mut self, sha1: &str, file_rom_name: &str) -> Option<(String, String)> {
        let pool = self.sha1_pool.get_mut(sha1)?;
        if pool.is_empty() {
            return None;
        }
        let at = pool
            .iter()
            .position(|(_, rom)| rom == file_rom_name)
            .unwrap_or(0);
        Some(pool.remove(at))
    }
}

fn rom_entry(
    e: &quick_xml::events::BytesStart<'_>,
    set_name: &str,
) -> Result<DatEntry, String> {
    let name = attribute(e, b"name")?.unwrap_or_default();
    let size_raw = attribute(e, b"size")?.unwrap_or_default();
    let size = if size_raw.is_empty() {
        0
    } else {
        size_raw
            .parse::<u64>()
            .map_err(|_| format!("bad rom size {size_raw:?}"))?
    };
    Ok(DatEntry {
        set_name: set_name.to_string(),
        // Some catalogs write embedded paths with backslashes.
        rom_name: name.replace('\\', "/"),
        size,
        crc32: attribute(e, b"crc")?.unwrap_or_default(),
        md5: attribute(e, b"md5")?.unwrap_or_default(),
        sha1: attribute(e, b"sha1")?.unwrap_or_default(),
    })
}

fn attribute(
    e: &quick_xml::events::BytesStart<'_>,
    key: &[u8],
) -> Result<Option<String>, String> {
    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|e| e.to_string())?;
        if attr.key.as_ref() == key {
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Catalog stem with the trailing date suffix stripped: a final
/// parenthesised group consisting only of digits (and separators) is
/// removed, so `Atari - 7800 (20240101-123456).dat` and a later dump of
/// the same system share one stem. A parenthesised group with letters
/// (a region or rom-format tag) is part of the name and kept.
#[must_use]
pub fn catalog_stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    if let Some(open) = stem.rfind('(') {
        let inner: &str = stem[open + 1..].trim_end_matches(')');
        let only_digits = !inner.is_empty()
            && inner
                .chars()
                .all(|c| c.is_ascii_digit() || c == '-' || c == '.');
        if only_digits && stem.ends_with(')') {
            return stem[..open].trim_end().to_string();
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const DAT: &str = r#"<?xml version="1.0"?>
<datafile>
  <header>
    <name>Test System</name>
    <description>Test System (test)</description>
  </header>
  <game name="Alpha (USA)">
    <description>Alpha (USA)</description>
    <rom name="Alpha (USA).bin" size="4" crc="11111111" md5="AAAA" sha1="S1"/>
  </game>
  <game name="Beta (Europe)">
    <rom name="files\Beta (Europe).bin" size="4" crc="22222222" md5="BBBB" sha1="S2"/>
    <rom name="Beta Extra.bin" size="4" crc="33333333" md5="CCCC" sha1="S3"/>
  </game>
  <game name="Gamma (Japan)">
    <rom name="Gamma &amp; Delta.bin" size="4" crc="22222222" md5="DDDD" sha1="S2"/>
  </game>
</datafile>"#;

    fn load_test_dat() -> DatIndex {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Test System (20240101).dat");
        fs::write(&path, DAT).unwrap();
        DatIndex::load(&path).unwrap()
    }

    #[test]
    fn test_entries_in_dat_order() {
        let index = load_test_dat();
        let names: Vec<&str> = index.entries().iter().map(|e| e.rom_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Alpha (USA).bin",
                "files/Beta (Europe).bin",
                "Beta Extra.bin",
                "Gamma & Delta.bin",
            ]
        );
    }

    #[test]
    fn test_backslash_normalised() {
        let index = load_test_dat();
        assert!(index.entries().iter().all(|e| !e.rom_name.contains('\\')));
    }

    #[test]
    fn test_entities_decoded() {
        let index = load_test_dat();
        assert_eq!(index.entries()[3].rom_name, "Gamma & Delta.bin");
    }

    #[test]
    fn test_duplicate_membership() {
        let index = load_test_dat();
        assert!(index.is_duplicate("22222222", HashKind::Crc));
        assert!(!index.is_duplicate("11111111", HashKind::Crc));
        assert!(index.is_duplicate("S2", HashKind::Sha1));
        assert!(!index.is_duplicate("S1", HashKind::Sha1));
    }

    #[test]
    fn test_lookups() {
        let index = load_test_dat();
        assert!(index.in_dat("11111111", HashKind::Crc));
        assert!(!index.in_dat("99999999", HashKind::Crc));
        assert_eq!(
            index.name_of("S3", HashKind::Sha1),
            Some(("Beta (Europe)", "Beta Extra.bin"))
        );
        // First match in DAT order for a duplicated hash.
        assert_eq!(
            index.name_of("22222222", HashKind::Crc),
            Some(("Beta (Europe)", "files/Beta (Europe).bin"))
        );
        assert_eq!(
            index.hash_of("Alpha (USA)", "Alpha (USA).bin"),
            Some(("11111111", "AAAA", "S1", 4))
        );
        assert_eq!(index.hash_of("Alpha (USA)", "missing.bin"), None);
    }

    #[test]
    fn test_claim_prefers_own_name_then_dat_order() {
        let mut index = load_test_dat();

        // A copy already named like the Gamma listing keeps that identity.
        let claimed = index.claim_duplicate("S2", "Gamma & Delta.bin").unwrap();
        assert_eq!(claimed, ("Gamma (Japan)".into(), "Gamma & Delta.bin".into()));

        // The next copy gets the first remaining claim.
        let claimed = index.claim_duplicate("S2", "anything.bin").unwrap();
        assert_eq!(
            claimed,
            ("Beta (Europe)".into(), "files/Beta (Europe).bin".into())
        );

        // Pool exhausted.
        assert!(index.claim_duplicate("S2", "anything.bin").is_none());
    }

    #[test]
    fn test_wrong_root_is_schema_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.dat");
        fs::write(&path, "<mame><game name=\"x\"/></mame>").unwrap();

        let err = DatIndex::load(&path).unwrap_err();
        assert!(matches!(err, DatError::Schema { .. }));
    }

    #[test]
    fn test_empty_catalog_contains_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.dat");
        fs::write(&path, "<datafile></datafile>").unwrap();

        let index = DatIndex::load(&path).unwrap();
        assert!(index.entries().is_empty());
        assert!(!index.in_dat("", HashKind::Crc));
        assert!(!index.in_dat("11111111", HashKind::Crc));
    }

    #[test]
    fn test_catalog_stem_strips_date() {
        assert_eq!(
            catalog_stem(Path::new("/dats/Atari - 7800 (20240101-123456).dat")),
            "Atari - 7800"
        );
        assert_eq!(
            catalog_stem(Path::new("Sega - Mega Drive (20240101).dat")),
            "Sega - Mega Drive"
        );
    }

    #[test]
    fn test_catalog_stem_keeps_format_tags() {
        assert_eq!(
            catalog_stem(Path::new("Atari - Jaguar (J64).dat")),
            "Atari - Jaguar (J64)"
        );
        assert_eq!(catalog_stem(Path::new("Plain Name.dat")), "Plain Name");
    }
}
