//! Per-disk I/O throttling side channel.
//!
//! Rate enforcement runs out of process so it survives independently of
//! this control path; here we only compute the well-known control
//! socket name and supervise the per-disk service instance.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::exec::{Exec, ExecError, HostExec};

/// Directory the rate limiter creates its control sockets in.
pub const SOCKET_DIR: &str = "/run/sm";

/// Configuration key whose presence engages the side channel.
pub const RATE_LIMIT_KEY: &str = "rate-limit";

/// Service template the per-disk instances are stamped from.
pub const SERVICE_TEMPLATE: &str = "td-rated";

pub const SYSTEMCTL: &str = "/usr/bin/systemctl";

#[derive(Debug, thiserror::Error)]
pub enum RateError {
    #[error("failed to start {unit}: {source}")]
    Start { unit: String, source: ExecError },
    #[error("failed to invoke the service manager: {source}")]
    ServiceManager { source: ExecError },
}

/// Control socket path for a disk. Pure: always computable, whether or
/// not the disk is throttled.
pub fn socket_path(vdi_uuid: &str) -> PathBuf {
    PathBuf::from(format!("{SOCKET_DIR}/rated-{vdi_uuid}.sk"))
}

/// True iff the disk's configuration carries the throttle key, for any
/// value including zero.
pub fn has_rate_limit(sm_config: &HashMap<String, String>) -> bool {
    sm_config.contains_key(RATE_LIMIT_KEY)
}

/// systemd swallows '-' in instance names, so the disk id is escaped
/// before stamping the template.
fn instance_name(vdi_uuid: &str) -> String {
    format!("{}@{}", SERVICE_TEMPLATE, vdi_uuid.replace('-', "\\x2d"))
}

pub trait ServiceManager {
    /// Start the per-disk limiter instance. Starting a running
    /// instance succeeds.
    fn start(&self, vdi_uuid: &str) -> Result<(), RateError>;

    /// Stop the per-disk limiter instance. Stopping a stopped instance
    /// succeeds.
    fn stop(&self, vdi_uuid: &str) -> Result<(), RateError>;
}

/// Supervises limiter instances through the host service manager.
pub struct Systemctl {
    exec: Box<dyn Exec>,
}

impl Systemctl {
    pub fn new(exec: Box<dyn Exec>) -> Self {
        Self { exec }
    }
}

impl Default for Systemctl {
    fn default() -> Self {
        Self::new(Box::new(HostExec))
    }
}

impl ServiceManager for Systemctl {
    fn start(&self, vdi_uuid: &str) -> Result<(), RateError> {
        let unit = instance_name(vdi_uuid);
        tracing::info!("starting rate limiter {unit}");
        self.exec
            .run(SYSTEMCTL, &["start".to_string(), unit.clone()])
            .map_err(|source| RateError::Start { unit, source })?;
        Ok(())
    }

    fn stop(&self, vdi_uuid: &str) -> Result<(), RateError> {
        let unit = instance_name(vdi_uuid);
        tracing::info!("stopping rate limiter {unit}");
        let stopped = self
            .exec
            .run_status(SYSTEMCTL, &["stop".to_string(), unit.clone()])
            .map_err(|source| RateError::ServiceManager { source })?;
        if !stopped {
            tracing::debug!("{unit} was not running");
        }
        Ok(())
    }
}
