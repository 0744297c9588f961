//! Fault vocabulary for the RPC boundary.
//!
//! Failures reported to callers are resolved through a catalog loaded
//! from the host's error definitions document, so a caller always sees
//! a stable numeric code it can branch on, never a raw internal error.
//! The document is parsed once at startup into an immutable table.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::Deserialize;

/// Well-known location of the error definitions document.
pub const XML_DEFS: &str = "/usr/share/sm/XE_SR_ERRORCODES.xml";

/// Reserved code reported when a fault key has no catalog entry.
pub const UNKNOWN_CODE: i32 = 1;

/// Fault key for a disk whose front-end is missing or of the wrong class.
pub const KEY_VDI_UNAVAILABLE: &str = "VDIUnavailable";

/// Fault key for any other backend failure.
pub const KEY_GENERAL: &str = "SMGeneral";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("no error definitions document at {path}")]
    Missing { path: PathBuf },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: quick_xml::DeError,
    },
}

/// The numeric code and message that cross the RPC boundary. Only the
/// catalog constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

#[derive(Debug, Deserialize)]
struct Definitions {
    #[serde(rename = "code", default)]
    codes: Vec<Definition>,
}

#[derive(Debug, Deserialize)]
struct Definition {
    name: String,
    value: i32,
    description: String,
}

/// Immutable fault-key table.
#[derive(Debug)]
pub struct Catalog {
    entries: HashMap<String, (i32, String)>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        if !path.exists() {
            return Err(CatalogError::Missing {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let defs: Definitions =
            quick_xml::de::from_str(&text).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let entries = defs
            .codes
            .into_iter()
            .map(|def| (def.name, (def.value, def.description)))
            .collect();
        Ok(Catalog { entries })
    }

    /// Resolve a symbolic fault key. Never fails: an unknown key
    /// degrades to the reserved code so the RPC layer can always
    /// report something.
    pub fn resolve(&self, key: &str, opterr: Option<&str>) -> Fault {
        match self.entries.get(key) {
            Some((code, description)) => {
                let mut message = description.clone();
                if let Some(detail) = opterr {
                    message.push_str(&format!(" [opterr={detail}]"));
                }
                Fault {
                    code: *code,
                    message,
                }
            }
            None => Fault {
                code: UNKNOWN_CODE,
                message: format!("Error reporting error, unknown key {key}"),
            },
        }
    }
}

static CATALOG: OnceCell<Catalog> = OnceCell::new();

/// Load the process-wide catalog. Must run once at startup, before any
/// request is served; a missing document is fatal for the process.
pub fn init(path: &Path) -> Result<(), CatalogError> {
    let catalog = Catalog::load(path)?;
    let _ = CATALOG.set(catalog);
    Ok(())
}

/// Resolve against the process-wide catalog.
pub fn resolve(key: &str, opterr: Option<&str>) -> Fault {
    match CATALOG.get() {
        Some(catalog) => catalog.resolve(key, opterr),
        None => {
            let mut message = format!("Error reporting error, no catalog loaded for key {key}");
            if let Some(detail) = opterr {
                message.push_str(&format!(" [opterr={detail}]"));
            }
            Fault {
                code: UNKNOWN_CODE,
                message,
            }
        }
    }
}
