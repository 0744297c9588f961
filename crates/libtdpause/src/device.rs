//! Locating the active block front-end for a disk.
//!
//! An attached disk is published as a per-disk symlink under the
//! backend directory, pointing at its block device node. Absence of
//! the link is a normal state, not an error: the disk simply has no
//! active front-end on this host right now.

use std::fs;
use std::os::linux::fs::MetadataExt;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;

use nix::sys::stat::{major, minor};

/// Directory of per-disk links to the active front-end nodes.
pub const BACKEND_DIR: &str = "/dev/sm/backend";

/// Name under which the block front-end driver registers its major.
pub const FRONTEND_DRIVER: &str = "tapdev";

const PROC_DEVICES: &str = "/proc/devices";

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to read link {path}: {source}")]
    ReadLink {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unexpected device type: {path} is not a block device")]
    NotBlock { path: PathBuf },
    #[error("unexpected device type: {path} has major {found}, expected {expected}")]
    UnexpectedMajor {
        path: PathBuf,
        found: u64,
        expected: u64,
    },
    #[error("failed to read /proc/devices: {source}")]
    ProcDevices { source: std::io::Error },
    #[error("tapdev is not a registered block driver")]
    DriverNotRegistered,
}

/// The active front-end for a disk. Exists only while the disk is
/// attached somewhere on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tapdev {
    pub minor: u32,
}

pub trait DeviceLocator {
    /// Resolve the front-end for a disk, or `None` when the disk has
    /// no active device. Side-effect free and safe to repeat.
    fn locate(&self, sr_uuid: &str, vdi_uuid: &str) -> Result<Option<Tapdev>, DeviceError>;
}

/// Locator over the host `/dev` tree.
#[derive(Debug)]
pub struct DevFsLocator {
    backend_dir: PathBuf,
    proc_devices: PathBuf,
}

impl Default for DevFsLocator {
    fn default() -> Self {
        Self::new(BACKEND_DIR)
    }
}

impl DevFsLocator {
    pub fn new(backend_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend_dir: backend_dir.into(),
            proc_devices: PathBuf::from(PROC_DEVICES),
        }
    }

    #[cfg(test)]
    fn with_proc_devices(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_devices = path.into();
        self
    }

    /// Per-disk link the attach path publishes.
    pub fn link_path(&self, sr_uuid: &str, vdi_uuid: &str) -> PathBuf {
        self.backend_dir.join(sr_uuid).join(vdi_uuid)
    }

    /// Major number the front-end driver registered with the kernel.
    fn frontend_major(&self) -> Result<u64, DeviceError> {
        let devices = fs::read_to_string(&self.proc_devices)
            .map_err(|source| DeviceError::ProcDevices { source })?;
        parse_major(&devices, FRONTEND_DRIVER).ok_or(DeviceError::DriverNotRegistered)
    }
}

impl DeviceLocator for DevFsLocator {
    fn locate(&self, sr_uuid: &str, vdi_uuid: &str) -> Result<Option<Tapdev>, DeviceError> {
        let link = self.link_path(sr_uuid, vdi_uuid);
        if !link.exists() {
            return Ok(None);
        }
        let target = fs::read_link(&link).map_err(|source| DeviceError::ReadLink {
            path: link.clone(),
            source,
        })?;
        let metadata = fs::metadata(&target).map_err(|source| DeviceError::Stat {
            path: target.clone(),
            source,
        })?;
        if !metadata.file_type().is_block_device() {
            return Err(DeviceError::NotBlock { path: target });
        }
        let expected = self.frontend_major()?;
        let rdev = metadata.st_rdev();
        let found = major(rdev);
        if found != expected {
            return Err(DeviceError::UnexpectedMajor {
                path: target,
                found,
                expected,
            });
        }
        Ok(Some(Tapdev {
            minor: minor(rdev) as u32,
        }))
    }
}

/// Find a named driver in the "Block devices:" section of
/// /proc/devices contents.
fn parse_major(devices: &str, name: &str) -> Option<u64> {
    let mut in_block_section = false;
    for line in devices.lines() {
        let line = line.trim();
        if line.ends_with(':') {
            in_block_section = line.starts_with("Block");
            continue;
        }
        if !in_block_section || line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        if let (Some(number), Some(driver)) = (fields.next(), fields.next()) {
            if driver == name {
                return number.parse().ok();
            }
        }
    }
    None
}
