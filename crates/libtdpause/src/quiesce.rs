//! Pause and unpause orchestration.
//!
//! Each call is a fresh Locked → Located → Acted → Unlocked traversal;
//! nothing persists between calls. Pausing or unpausing a disk with no
//! active device succeeds, so callers may retry liberally while a
//! storage operation tears the attachment up and down around them.

use std::path::Path;
use std::sync::PoisonError;

use crate::cbt;
use crate::chain::{self, ChainDiscovery, ChainError, Lvchange, VhdScan, VolumeManager};
use crate::device::{DevFsLocator, DeviceError, DeviceLocator};
use crate::faults::{self, Fault, KEY_GENERAL, KEY_VDI_UNAVAILABLE};
use crate::lock;
use crate::rate::{self, RateError, ServiceManager, Systemctl};
use crate::tapctl::{TapCtl, TapctlError, TapdiskBackend};
use crate::vdi::{VdiError, VdiMetadata};

#[derive(Debug, thiserror::Error)]
pub enum QuiesceError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Backend(#[from] TapctlError),
    #[error(transparent)]
    Rate(#[from] RateError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Vdi(#[from] VdiError),
}

impl QuiesceError {
    fn key(&self) -> &'static str {
        match self {
            QuiesceError::Device(_) => KEY_VDI_UNAVAILABLE,
            _ => KEY_GENERAL,
        }
    }

    /// The fault that crosses the RPC boundary for this failure.
    pub fn fault(&self) -> Fault {
        faults::resolve(self.key(), Some(&self.to_string()))
    }
}

/// Sequences one pause or unpause over the collaborators it owns.
pub struct Quiescer {
    pub locator: Box<dyn DeviceLocator>,
    pub backend: Box<dyn TapdiskBackend>,
    pub services: Box<dyn ServiceManager>,
    pub chain: Box<dyn ChainDiscovery>,
    pub volumes: Box<dyn VolumeManager>,
}

impl Quiescer {
    /// Collaborators wired to the real host tools.
    pub fn host() -> Self {
        Self {
            locator: Box::new(DevFsLocator::default()),
            backend: Box::new(TapCtl::default()),
            services: Box::new(Systemctl::default()),
            chain: Box::new(VhdScan::default()),
            volumes: Box::new(Lvchange::default()),
        }
    }

    /// Quiesce in-flight I/O for a disk. A disk with no active device
    /// is already quiescent: success.
    pub fn pause(
        &self,
        sr_uuid: &str,
        vdi_uuid: &str,
        secondary: Option<&Path>,
    ) -> Result<(), QuiesceError> {
        let serial = lock::named(sr_uuid, vdi_uuid);
        let _held = serial.lock().unwrap_or_else(PoisonError::into_inner);

        let dev = match self.locator.locate(sr_uuid, vdi_uuid)? {
            Some(dev) => dev,
            None => {
                tracing::info!("no active device for {vdi_uuid}, nothing to pause");
                return Ok(());
            }
        };
        tracing::debug!("pausing {vdi_uuid} on minor {}", dev.minor);
        self.backend.pause(dev, secondary)?;
        Ok(())
    }

    /// Resume I/O for a disk, re-attaching its side channels. A disk
    /// with no active device has nothing to resume: success.
    pub fn unpause(
        &self,
        vdi: &dyn VdiMetadata,
        sr_uuid: &str,
        vdi_uuid: &str,
        secondary: Option<&Path>,
        activate_parents: bool,
    ) -> Result<(), QuiesceError> {
        let serial = lock::named(sr_uuid, vdi_uuid);
        let _held = serial.lock().unwrap_or_else(PoisonError::into_inner);

        let dev = match self.locator.locate(sr_uuid, vdi_uuid)? {
            Some(dev) => dev,
            None => {
                tracing::info!("no active device for {vdi_uuid}, nothing to unpause");
                return Ok(());
            }
        };

        let tracking_log = cbt::tracking_log_path(vdi)?;
        let rate_limited = rate::has_rate_limit(&vdi.sm_config()?);
        let socket = if rate_limited {
            Some(rate::socket_path(vdi_uuid))
        } else {
            None
        };

        tracing::debug!("unpausing {vdi_uuid} on minor {}", dev.minor);
        self.backend
            .unpause(dev, secondary, tracking_log.as_deref(), socket.as_deref())?;

        if activate_parents {
            chain::activate_ancestors(self.chain.as_ref(), self.volumes.as_ref(), sr_uuid, vdi_uuid)?;
        }

        // The limiter may only come up once the resume call has wired
        // its socket into the I/O path; a disk that lost its throttle
        // key can still have a stale instance to reap.
        if rate_limited {
            self.services.start(vdi_uuid)?;
        } else {
            self.services.stop(vdi_uuid)?;
        }

        Ok(())
    }
}
