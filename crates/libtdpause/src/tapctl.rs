//! Driving the disk-backing process through the blktap control tool.

use std::path::Path;

use crate::device::Tapdev;
use crate::exec::{Exec, ExecError, HostExec};

pub const TAP_CTL: &str = "/usr/sbin/tap-ctl";

#[derive(Debug, thiserror::Error)]
pub enum TapctlError {
    #[error("no backing process for minor {minor}")]
    NotRunning { minor: u32 },
    #[error("unexpected tap-ctl list output: {line}")]
    List { line: String },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// The device-level quiesce primitive.
pub trait TapdiskBackend {
    /// Halt in-flight I/O. With a secondary path, I/O continues
    /// against that backing file while the primary is manipulated.
    fn pause(&self, dev: Tapdev, secondary: Option<&Path>) -> Result<(), TapctlError>;

    /// Resume I/O, re-attaching the supplied side channels.
    fn unpause(
        &self,
        dev: Tapdev,
        secondary: Option<&Path>,
        tracking_log: Option<&Path>,
        rate_socket: Option<&Path>,
    ) -> Result<(), TapctlError>;
}

/// Backend driven through tap-ctl.
pub struct TapCtl {
    exec: Box<dyn Exec>,
}

impl TapCtl {
    pub fn new(exec: Box<dyn Exec>) -> Self {
        Self { exec }
    }

    /// Pid of the process backing a minor.
    fn find_pid(&self, minor: u32) -> Result<i32, TapctlError> {
        let output = self.exec.run(
            TAP_CTL,
            &["list".to_string(), "-m".to_string(), minor.to_string()],
        )?;
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            for field in line.split_whitespace() {
                if let Some(pid) = field.strip_prefix("pid=") {
                    return pid.parse().map_err(|_| TapctlError::List {
                        line: line.to_string(),
                    });
                }
            }
            return Err(TapctlError::List {
                line: line.to_string(),
            });
        }
        Err(TapctlError::NotRunning { minor })
    }
}

impl Default for TapCtl {
    fn default() -> Self {
        Self::new(Box::new(HostExec))
    }
}

impl TapdiskBackend for TapCtl {
    fn pause(&self, dev: Tapdev, secondary: Option<&Path>) -> Result<(), TapctlError> {
        let pid = self.find_pid(dev.minor)?;
        let mut args = vec![
            "pause".to_string(),
            "-p".to_string(),
            pid.to_string(),
            "-m".to_string(),
            dev.minor.to_string(),
        ];
        if let Some(path) = secondary {
            args.push("-2".to_string());
            args.push(path.display().to_string());
        }
        self.exec.run(TAP_CTL, &args)?;
        Ok(())
    }

    fn unpause(
        &self,
        dev: Tapdev,
        secondary: Option<&Path>,
        tracking_log: Option<&Path>,
        rate_socket: Option<&Path>,
    ) -> Result<(), TapctlError> {
        let pid = self.find_pid(dev.minor)?;
        let mut args = vec![
            "unpause".to_string(),
            "-p".to_string(),
            pid.to_string(),
            "-m".to_string(),
            dev.minor.to_string(),
        ];
        if let Some(path) = secondary {
            args.push("-2".to_string());
            args.push(path.display().to_string());
        }
        if let Some(path) = tracking_log {
            args.push("-c".to_string());
            args.push(path.display().to_string());
        }
        if let Some(path) = rate_socket {
            args.push("-r".to_string());
            args.push(path.display().to_string());
        }
        self.exec.run(TAP_CTL, &args)?;
        Ok(())
    }
}
