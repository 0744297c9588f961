//! Narrow seam for invoking external host tools.
//!
//! Everything this crate runs out of process (the service manager, LVM,
//! the blktap control tool) goes through [`Exec`], so the sequencing
//! logic around those tools can be tested against recording fakes.

use std::process::{Command, Output};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} failed with status {status}: {stderr}")]
    Failed {
        program: String,
        status: i32,
        stderr: String,
    },
}

pub trait Exec {
    /// Run a command to completion, treating a non-zero exit as an
    /// error. Returns captured stdout.
    fn run(&self, program: &str, args: &[String]) -> Result<String, ExecError>;

    /// Run a command to completion and report whether it exited zero.
    /// Only failing to invoke the command at all is an error.
    fn run_status(&self, program: &str, args: &[String]) -> Result<bool, ExecError>;
}

/// Runs commands on the host.
#[derive(Debug, Default)]
pub struct HostExec;

impl HostExec {
    fn output(&self, program: &str, args: &[String]) -> Result<Output, ExecError> {
        tracing::debug!("running {} {:?}", program, args);
        Command::new(program)
            .args(args)
            .output()
            .map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            })
    }
}

impl Exec for HostExec {
    fn run(&self, program: &str, args: &[String]) -> Result<String, ExecError> {
        let output = self.output(program, args)?;
        if !output.status.success() {
            return Err(ExecError::Failed {
                program: program.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_status(&self, program: &str, args: &[String]) -> Result<bool, ExecError> {
        let output = self.output(program, args)?;
        Ok(output.status.success())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn run_captures_stdout() -> Result<()> {
        let out = HostExec.run("echo", &["quiesced".to_string()])?;
        assert_eq!(out.trim(), "quiesced");
        Ok(())
    }

    #[test]
    fn run_fails_on_nonzero_exit() {
        let err = HostExec.run("false", &[]).unwrap_err();
        assert!(matches!(err, ExecError::Failed { status: 1, .. }));
    }

    #[test]
    fn run_status_reports_nonzero_exit() -> Result<()> {
        assert!(!HostExec.run_status("false", &[])?);
        assert!(HostExec.run_status("true", &[])?);
        Ok(())
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = HostExec.run("/nonexistent/tool", &[]).unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
