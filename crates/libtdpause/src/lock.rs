//! Per-disk serialisation of pause and unpause calls.
//!
//! One named lock exists per disk, handed out of a process-wide
//! registry. Entries are created on first use and kept for the life of
//! the process; the guard releases on every exit path, including
//! unwinding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The lock serialising operations on one disk. At most one pause or
/// unpause may hold it per disk across the process.
pub fn named(sr_uuid: &str, vdi_uuid: &str) -> Arc<Mutex<()>> {
    let key = format!("{sr_uuid}/{vdi_uuid}");
    let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
    registry.entry(key).or_default().clone()
}
