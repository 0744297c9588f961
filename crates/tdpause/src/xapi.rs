//! Thin client for the local management API.
//!
//! The API speaks XML-RPC over HTTP/1.0 on a unix socket; plugin calls
//! arrive with an already-authenticated session reference, while the
//! operator CLI opens a local superuser session of its own.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use libtdpause::rpc::{self, Value};
use libtdpause::vdi::{VdiError, VdiMetadata};

/// Local management API socket.
pub const XAPI_SOCKET: &str = "/var/lib/xcp/xapi";

pub struct XapiSession {
    socket: PathBuf,
    session_ref: String,
    owned: bool,
}

impl XapiSession {
    /// Adopt the authenticated session a plugin call carries.
    pub fn plugin(socket: PathBuf, session_ref: String) -> Self {
        Self {
            socket,
            session_ref,
            owned: false,
        }
    }

    /// Open a local superuser session.
    pub fn login(socket: PathBuf) -> Result<Self> {
        let value = call(
            &socket,
            "session.login_with_password",
            &[
                Value::Str("root".to_string()),
                Value::Str(String::new()),
                Value::Str(String::new()),
                Value::Str("tdpause".to_string()),
            ],
        )?;
        let session_ref = value
            .as_str()
            .ok_or_else(|| anyhow!("login returned no session reference"))?
            .to_string();
        Ok(Self {
            socket,
            session_ref,
            owned: true,
        })
    }

    /// Close a session opened by [`XapiSession::login`]. Adopted plugin
    /// sessions belong to the caller and are left alone.
    pub fn logout(&self) {
        if self.owned {
            if let Err(e) = self.call("session.logout", vec![]) {
                tracing::debug!("logout failed: {e:#}");
            }
        }
    }

    fn call(&self, method: &str, mut params: Vec<Value>) -> Result<Value> {
        params.insert(0, Value::Str(self.session_ref.clone()));
        call(&self.socket, method, &params)
    }
}

/// One XML-RPC call over the local socket.
fn call(socket: &Path, method: &str, params: &[Value]) -> Result<Value> {
    let body = rpc::encode_call(method, params);
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("failed to reach the API socket {}", socket.display()))?;
    let request = format!(
        "POST / HTTP/1.0\r\nHost: localhost\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream
        .write_all(request.as_bytes())
        .context("failed to send the API request")?;
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .context("failed to read the API response")?;
    let payload = response
        .split("\r\n\r\n")
        .nth(1)
        .ok_or_else(|| anyhow!("API response carries no body"))?;
    unwrap_result(rpc::parse_response(payload)?)
}

/// The API wraps every result in a {Status, Value} envelope.
fn unwrap_result(value: Value) -> Result<Value> {
    let envelope = value
        .as_struct()
        .ok_or_else(|| anyhow!("API response is not an envelope"))?;
    match envelope.get("Status").and_then(Value::as_str) {
        Some("Success") => envelope
            .get("Value")
            .cloned()
            .ok_or_else(|| anyhow!("success envelope carries no value")),
        Some("Failure") => bail!(
            "the API call failed: {}",
            describe(envelope.get("ErrorDescription"))
        ),
        _ => bail!("API response carries no status"),
    }
}

fn describe(error: Option<&Value>) -> String {
    match error {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        _ => "unknown error".to_string(),
    }
}

/// Metadata view of one disk, resolved through a session.
pub struct XapiVdi<'a> {
    session: &'a XapiSession,
    sr_uuid: String,
    vdi_uuid: String,
    vdi_ref: OnceCell<String>,
}

impl<'a> XapiVdi<'a> {
    pub fn new(session: &'a XapiSession, sr_uuid: &str, vdi_uuid: &str) -> Self {
        Self {
            session,
            sr_uuid: sr_uuid.to_string(),
            vdi_uuid: vdi_uuid.to_string(),
            vdi_ref: OnceCell::new(),
        }
    }

    fn vdi_ref(&self) -> Result<String> {
        if let Some(reference) = self.vdi_ref.get() {
            return Ok(reference.clone());
        }
        let value = self
            .session
            .call("VDI.get_by_uuid", vec![Value::Str(self.vdi_uuid.clone())])?;
        let reference = value
            .as_str()
            .ok_or_else(|| anyhow!("VDI.get_by_uuid returned no reference"))?
            .to_string();
        let _ = self.vdi_ref.set(reference.clone());
        Ok(reference)
    }

    fn try_sm_config(&self) -> Result<HashMap<String, String>> {
        let vdi_ref = self.vdi_ref()?;
        let value = self
            .session
            .call("VDI.get_sm_config", vec![Value::Str(vdi_ref)])?;
        let members = value
            .as_struct()
            .ok_or_else(|| anyhow!("sm_config is not a struct"))?;
        Ok(members
            .iter()
            .filter_map(|(key, value)| value.as_str().map(|s| (key.clone(), s.to_string())))
            .collect())
    }

    fn try_tracking_enabled(&self) -> Result<bool> {
        let vdi_ref = self.vdi_ref()?;
        let value = self
            .session
            .call("VDI.get_cbt_enabled", vec![Value::Str(vdi_ref)])?;
        value
            .as_bool()
            .ok_or_else(|| anyhow!("cbt_enabled is not a boolean"))
    }
}

impl VdiMetadata for XapiVdi<'_> {
    fn sm_config(&self) -> Result<HashMap<String, String>, VdiError> {
        self.try_sm_config().map_err(|e| VdiError(format!("{e:#}")))
    }

    fn tracking_enabled(&self) -> Result<bool, VdiError> {
        self.try_tracking_enabled()
            .map_err(|e| VdiError(format!("{e:#}")))
    }

    fn tracking_log(&self) -> Result<PathBuf, VdiError> {
        let vg_dir = PathBuf::from(format!("/dev/VG_XenStorage-{}", self.sr_uuid));
        let sr_mount = PathBuf::from(format!("/run/sr-mount/{}", self.sr_uuid));
        Ok(tracking_log_location(&vg_dir, &sr_mount, &self.vdi_uuid))
    }
}

/// The tracking log lives next to the data: as a volume on LVM-backed
/// repositories, as a file on mounted ones.
fn tracking_log_location(vg_dir: &Path, sr_mount: &Path, vdi_uuid: &str) -> PathBuf {
    if vg_dir.is_dir() {
        vg_dir.join(format!("{vdi_uuid}.cbtlog"))
    } else {
        sr_mount.join(format!("{vdi_uuid}.cbtlog"))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    fn envelope(members: &[(&str, Value)]) -> Value {
        Value::Struct(
            members
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )
    }

    #[test]
    fn success_envelopes_unwrap_to_their_value() -> Result<()> {
        let value = unwrap_result(envelope(&[
            ("Status", Value::Str("Success".to_string())),
            ("Value", Value::Str("OpaqueRef:d00d".to_string())),
        ]))?;
        assert_eq!(value.as_str(), Some("OpaqueRef:d00d"));
        Ok(())
    }

    #[test]
    fn failure_envelopes_surface_their_description() {
        let err = unwrap_result(envelope(&[
            ("Status", Value::Str("Failure".to_string())),
            (
                "ErrorDescription",
                Value::Array(vec![
                    Value::Str("HANDLE_INVALID".to_string()),
                    Value::Str("VDI".to_string()),
                ]),
            ),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("HANDLE_INVALID VDI"));
    }

    #[test]
    fn statusless_responses_are_rejected() {
        assert!(unwrap_result(Value::Str("True".to_string())).is_err());
        assert!(unwrap_result(envelope(&[("Value", Value::Bool(true))])).is_err());
    }

    #[test]
    fn tracking_log_follows_the_repository_layout() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let vg_dir = dir.path().join("VG_XenStorage-sr");
        let sr_mount = Path::new("/run/sr-mount/sr");

        assert_eq!(
            tracking_log_location(&vg_dir, sr_mount, "vdi-1"),
            Path::new("/run/sr-mount/sr/vdi-1.cbtlog")
        );

        std::fs::create_dir(&vg_dir)?;
        assert_eq!(
            tracking_log_location(&vg_dir, sr_mount, "vdi-1"),
            vg_dir.join("vdi-1.cbtlog")
        );
        Ok(())
    }
}
