//! Seam to the disk's metadata object.
//!
//! The metadata itself lives behind the management API; this crate only
//! consumes the view below on the resume path.

use std::collections::HashMap;
use std::path::PathBuf;

/// Raised by the metadata collaborator, carrying its own description.
#[derive(Debug, thiserror::Error)]
#[error("failed to query disk metadata: {0}")]
pub struct VdiError(pub String);

/// Read-only view of the disk metadata consulted while resuming.
pub trait VdiMetadata {
    /// The disk's persistent configuration map.
    fn sm_config(&self) -> Result<HashMap<String, String>, VdiError>;

    /// Whether block-change tracking is enabled for the disk.
    fn tracking_enabled(&self) -> Result<bool, VdiError>;

    /// Path of the change-tracking log. Only meaningful when tracking
    /// is enabled.
    fn tracking_log(&self) -> Result<PathBuf, VdiError>;
}
