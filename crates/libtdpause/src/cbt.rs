//! Change-tracking attachment for the resume path.

use std::path::PathBuf;

use crate::vdi::{VdiError, VdiMetadata};

/// Resolve the tracking log to re-attach on resume. `None` when
/// tracking is disabled; downstream treats `None` as "omit the
/// attachment", never as an error.
pub fn tracking_log_path(vdi: &dyn VdiMetadata) -> Result<Option<PathBuf>, VdiError> {
    if !vdi.tracking_enabled()? {
        return Ok(None);
    }
    let log = vdi.tracking_log()?;
    tracing::debug!("change tracking enabled, log at {}", log.display());
    Ok(Some(log))
}
