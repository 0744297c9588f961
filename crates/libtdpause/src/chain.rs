//! Bringing a disk's ancestor volumes online before I/O resumes.
//!
//! A resumed disk may read from any volume in its backing chain, so
//! every ancestor has to be visible in the device namespace first.
//! Activation is idempotent; the order is unordered-but-complete.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::exec::{Exec, ExecError, HostExec};

pub const VHD_UTIL: &str = "/usr/bin/vhd-util";
pub const LVCHANGE: &str = "/usr/sbin/lvchange";

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("failed to resolve the backing chain of {vdi_uuid}: {source}")]
    Discovery { vdi_uuid: String, source: ExecError },
    #[error("unexpected scan output: {line}")]
    Scan { line: String },
    #[error("failed to activate {path}: {source}")]
    Activate { path: PathBuf, source: ExecError },
}

pub trait ChainDiscovery {
    /// The full backing chain of a disk, keyed by disk id, including
    /// the disk itself.
    fn parent_chain(
        &self,
        sr_uuid: &str,
        vdi_uuid: &str,
    ) -> Result<HashMap<String, PathBuf>, ChainError>;
}

pub trait VolumeManager {
    /// Make a logical volume visible in the device namespace.
    /// Activating an already-active volume succeeds.
    fn activate(&self, sr_uuid: &str, vdi_uuid: &str, path: &Path) -> Result<(), ChainError>;
}

/// Activate every ancestor of a disk, leaving the disk itself alone
/// (it is already online as the subject of the resume). All ancestors
/// must activate; the first failure fails the whole call. Returns the
/// ids that were activated.
pub fn activate_ancestors(
    chain: &dyn ChainDiscovery,
    volumes: &dyn VolumeManager,
    sr_uuid: &str,
    vdi_uuid: &str,
) -> Result<BTreeSet<String>, ChainError> {
    let mut activated = BTreeSet::new();
    for (uuid, path) in chain.parent_chain(sr_uuid, vdi_uuid)? {
        if uuid == vdi_uuid {
            continue;
        }
        volumes.activate(sr_uuid, &uuid, &path)?;
        activated.insert(uuid);
    }
    tracing::debug!("activated {} ancestors of {vdi_uuid}", activated.len());
    Ok(activated)
}

/// Chain discovery through the VHD scanner.
pub struct VhdScan {
    exec: Box<dyn Exec>,
}

impl VhdScan {
    pub fn new(exec: Box<dyn Exec>) -> Self {
        Self { exec }
    }
}

impl Default for VhdScan {
    fn default() -> Self {
        Self::new(Box::new(HostExec))
    }
}

impl ChainDiscovery for VhdScan {
    fn parent_chain(
        &self,
        sr_uuid: &str,
        vdi_uuid: &str,
    ) -> Result<HashMap<String, PathBuf>, ChainError> {
        let args = vec![
            "scan".to_string(),
            "-f".to_string(),
            "-c".to_string(),
            "-m".to_string(),
            format!("VHD-{vdi_uuid}"),
            "-l".to_string(),
            format!("VG_XenStorage-{sr_uuid}"),
        ];
        let output = self
            .exec
            .run(VHD_UTIL, &args)
            .map_err(|source| ChainError::Discovery {
                vdi_uuid: vdi_uuid.to_string(),
                source,
            })?;
        parse_scan(&output)
    }
}

/// Each scan line starts with `vhd=<path>`; the disk id is the file
/// name with the VHD- prefix stripped.
fn parse_scan(output: &str) -> Result<HashMap<String, PathBuf>, ChainError> {
    let mut chain = HashMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let field = line.split_whitespace().next().unwrap_or_default();
        let path = match field.strip_prefix("vhd=") {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => {
                return Err(ChainError::Scan {
                    line: line.to_string(),
                })
            }
        };
        let name = path.file_name().and_then(|name| name.to_str()).unwrap_or_default();
        let uuid = name.strip_prefix("VHD-").unwrap_or(name);
        chain.insert(uuid.to_string(), path);
    }
    Ok(chain)
}

/// Activation through LVM; re-activating an active volume is a no-op
/// there.
pub struct Lvchange {
    exec: Box<dyn Exec>,
}

impl Lvchange {
    pub fn new(exec: Box<dyn Exec>) -> Self {
        Self { exec }
    }
}

impl Default for Lvchange {
    fn default() -> Self {
        Self::new(Box::new(HostExec))
    }
}

impl VolumeManager for Lvchange {
    fn activate(&self, _sr_uuid: &str, vdi_uuid: &str, path: &Path) -> Result<(), ChainError> {
        tracing::debug!("activating {} for {vdi_uuid}", path.display());
        self.exec
            .run(LVCHANGE, &["-ay".to_string(), path.display().to_string()])
            .map_err(|source| ChainError::Activate {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::Result;

    use super::*;

    struct FakeChain {
        chain: HashMap<String, PathBuf>,
    }

    impl ChainDiscovery for FakeChain {
        fn parent_chain(
            &self,
            _sr_uuid: &str,
            _vdi_uuid: &str,
        ) -> Result<HashMap<String, PathBuf>, ChainError> {
            Ok(self.chain.clone())
        }
    }

    #[derive(Default, Clone)]
    struct RecordingVolumes {
        activated: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl VolumeManager for RecordingVolumes {
        fn activate(&self, _sr_uuid: &str, vdi_uuid: &str, path: &Path) -> Result<(), ChainError> {
            if self.fail {
                return Err(ChainError::Activate {
                    path: path.to_path_buf(),
                    source: ExecError::Failed {
                        program: LVCHANGE.to_string(),
                        status: 5,
                        stderr: "device busy".to_string(),
                    },
                });
            }
            self.activated.lock().unwrap().push(vdi_uuid.to_string());
            Ok(())
        }
    }

    fn chain_of(entries: &[(&str, &str)]) -> HashMap<String, PathBuf> {
        entries
            .iter()
            .map(|(uuid, path)| (uuid.to_string(), PathBuf::from(path)))
            .collect()
    }

    #[test]
    fn ancestors_exclude_the_disk_itself() -> Result<()> {
        let chain = FakeChain {
            chain: chain_of(&[
                ("leaf", "/dev/VG_XenStorage-sr/VHD-leaf"),
                ("parent", "/dev/VG_XenStorage-sr/VHD-parent"),
                ("grandparent", "/dev/VG_XenStorage-sr/VHD-grandparent"),
            ]),
        };
        let volumes = RecordingVolumes::default();
        let activated = activate_ancestors(&chain, &volumes, "sr", "leaf")?;
        assert_eq!(
            activated,
            ["grandparent".to_string(), "parent".to_string()].into()
        );
        assert_eq!(volumes.activated.lock().unwrap().len(), 2);
        Ok(())
    }

    #[test]
    fn empty_chain_activates_nothing() -> Result<()> {
        let chain = FakeChain {
            chain: HashMap::new(),
        };
        let volumes = RecordingVolumes::default();
        let activated = activate_ancestors(&chain, &volumes, "sr", "leaf")?;
        assert!(activated.is_empty());
        assert!(volumes.activated.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn activation_failure_fails_the_call() {
        let chain = FakeChain {
            chain: chain_of(&[("parent", "/dev/VG_XenStorage-sr/VHD-parent")]),
        };
        let volumes = RecordingVolumes {
            fail: true,
            ..Default::default()
        };
        let err = activate_ancestors(&chain, &volumes, "sr", "leaf").unwrap_err();
        assert!(matches!(err, ChainError::Activate { .. }));
    }

    #[test]
    fn scan_lines_parse_to_the_chain() -> Result<()> {
        let output = "\
vhd=/dev/VG_XenStorage-sr/VHD-leaf capacity=10737418240 size=8388608 hidden=0 parent=VHD-parent
vhd=/dev/VG_XenStorage-sr/VHD-parent capacity=10737418240 size=8388608 hidden=1 parent=none

";
        let chain = parse_scan(output)?;
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain.get("leaf"),
            Some(&PathBuf::from("/dev/VG_XenStorage-sr/VHD-leaf"))
        );
        assert_eq!(
            chain.get("parent"),
            Some(&PathBuf::from("/dev/VG_XenStorage-sr/VHD-parent"))
        );
        Ok(())
    }

    #[test]
    fn scan_rejects_garbage() {
        let err = parse_scan("error opening VHD-leaf").unwrap_err();
        assert!(matches!(err, ChainError::Scan { .. }));
    }

    #[test]
    fn discovery_scans_the_volume_group() -> Result<()> {
        #[derive(Clone)]
        struct CannedExec {
            calls: Arc<Mutex<Vec<Vec<String>>>>,
        }

        impl Exec for CannedExec {
            fn run(&self, _program: &str, args: &[String]) -> Result<String, ExecError> {
                self.calls.lock().unwrap().push(args.to_vec());
                Ok("vhd=/dev/VG_XenStorage-sr/VHD-leaf parent=none\n".to_string())
            }

            fn run_status(&self, _program: &str, _args: &[String]) -> Result<bool, ExecError> {
                Ok(true)
            }
        }

        let exec = CannedExec {
            calls: Arc::new(Mutex::new(Vec::new())),
        };
        let calls = exec.calls.clone();
        let chain = VhdScan::new(Box::new(exec)).parent_chain("sr", "leaf")?;
        assert_eq!(chain.len(), 1);
        assert_eq!(
            calls.lock().unwrap()[0],
            vec![
                "scan".to_string(),
                "-f".to_string(),
                "-c".to_string(),
                "-m".to_string(),
                "VHD-leaf".to_string(),
                "-l".to_string(),
                "VG_XenStorage-sr".to_string(),
            ]
        );
        Ok(())
    }
}
