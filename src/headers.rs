//! Header-skipper rules.
//!
//! Some cartridge formats are dumped with a loader header that the DAT
//! catalog does not include. A detector XML (one per catalog, stored in
//! the headers directory as a mirror of the DAT tree) describes the
//! magic bytes that identify such a header and the offset at which the
//! real rom data starts. When every data check matches, hashing skips
//! the header; otherwise the file is hashed whole.

use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::dat::catalog_stem;

/// Errors raised while reading a detector XML.
#[derive(thiserror::Error, Debug)]
pub enum HeaderRuleError {
    /// The detector file could not be read.
    #[error("cannot read header skipper {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The detector XML is malformed.
    #[error("malformed header skipper {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

/// One `<data>` check: the bytes at `offset` must equal `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderCheck {
    /// Byte offset into the file.
    pub offset: u64,
    /// Expected bytes as lowercase hex.
    pub value: String,
}

/// A parsed detector rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRule {
    /// Offset at which hashing starts when all checks match.
    pub start_offset: u64,
    /// Ordered data checks, all of which must match.
    pub checks: Vec<HeaderCheck>,
}

impl HeaderRule {
    /// Number of leading bytes that must be buffered before the rule
    /// can be decided: the start offset or the end of the furthest
    /// check, whichever is greater.
    #[must_use]
    pub fn prefix_len(&self) -> u64 {
        let checks_end = self
            .checks
            .iter()
            .map(|c| c.offset + (c.value.len() as u64) / 2)
            .max()
            .unwrap_or(0);
        self.start_offset.max(checks_end)
    }

    /// Evaluates every check against the buffered file prefix.
    ///
    /// A check whose range extends past the prefix fails, so truncated
    /// files never match.
    #[must_use]
    pub fn matches(&self, prefix: &[u8]) -> bool {
        self.checks.iter().all(|check| {
            let len = check.value.len() / 2;
            let start = check.offset as usize;
            match prefix.get(start..start + len) {
                Some(bytes) => lower_hex(bytes) == check.value,
                None => false,
            }
        })
    }

    /// Parses a detector XML (`<detector><rule start_offset="..">
    /// <data offset=".." value=".."/>..</rule></detector>`).
    ///
    /// Offsets are hex strings; values are lowercased on load.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderRuleError`] for unreadable or malformed files.
    pub fn load(path: &Path) -> Result<Self, HeaderRuleError> {
        let text = std::fs::read_to_string(path).map_err(|e| HeaderRuleError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let malformed = |message: String| HeaderRuleError::Malformed {
            path: path.to_path_buf(),
            message,
        };

        let mut reader = Reader::from_str(&text);
        reader.config_mut().trim_text(true);

        let mut start_offset: Option<u64> = None;
        let mut checks = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                    b"rule" => {
                        for attr in e.attributes().with_checks(false).flatten() {
                            if attr.key.as_ref() == b"start_offset" {
                                let raw = attr
                                    .unescape_value()
                                    .map_err(|e| malformed(e.to_string()))?;
                                let parsed = u64::from_str_radix(&raw, 16)
                                    .map_err(|_| malformed(format!("bad start_offset {raw:?}")))?;
                                start_offset = Some(parsed);
                            }
                        }
                    }
                    b"data" => {
                        let mut offset: Option<u64> = None;
                        let mut value: Option<String> = None;
                        for attr in e.attributes().with_checks(false).flatten() {
                            let raw = attr
                                .unescape_value()
                                .map_err(|e| malformed(e.to_string()))?;
                            match attr.key.as_ref() {
                                b"offset" => {
                                    offset = Some(u64::from_str_radix(&raw, 16).map_err(
                                        |_| malformed(format!("bad data offset {raw:?}")),
                                    )?);
                                }
                                b"value" => value = Some(raw.to_lowercase()),
                                _ => {}
                            }
                        }
                        match (offset, value) {
                            (Some(offset), Some(value)) => {
                                checks.push(HeaderCheck { offset, value });
                            }
                            _ => return Err(malformed("data element missing offset or value".into())),
                        }
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(malformed(e.to_string())),
            }
        }

        let start_offset =
            start_offset.ok_or_else(|| malformed("detector has no rule/start_offset".into()))?;
        Ok(Self {
            start_offset,
            checks,
        })
    }
}

/// Resolves the detector path for a catalog: the catalog's location
/// mirrored under the headers directory, with the date suffix stripped
/// and an `.xml` extension. Returns `None` when no detector exists,
/// which disables header skipping for the scan.
#[must_use]
pub fn locate(dat_path: &Path, dats_dir: &Path, headers_dir: &Path) -> Option<PathBuf> {
    let relative_parent = dat_path
        .parent()
        .and_then(|parent| parent.strip_prefix(dats_dir).ok())
        .unwrap_or_else(|| Path::new(""));
    let candidate = headers_dir
        .join(relative_parent)
        .join(format!("{}.xml", catalog_stem(dat_path)));
    candidate.is_file().then_some(candidate)
}

fn lower_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
