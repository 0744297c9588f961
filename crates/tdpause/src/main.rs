//! Host-side entry point for the disk quiesce plugin.
//!
//! The default mode reads one XML-RPC call from stdin and replies on
//! stdout, the way the management daemon invokes storage plugins. The
//! pause/unpause subcommands drive the same orchestration directly for
//! operators.

mod logger;
mod xapi;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use libtdpause::faults::{self, Fault};
use libtdpause::quiesce::Quiescer;
use libtdpause::rpc::{self, PluginCall};

use crate::xapi::{XapiSession, XapiVdi};

#[derive(Parser, Debug)]
#[clap(version, about = "pause/unpause control for tapdisk-backed disks")]
struct Opts {
    /// change log level to debug
    #[clap(long, global = true)]
    debug: bool,

    /// write log to a file instead of stderr
    #[clap(long, global = true)]
    log: Option<PathBuf>,

    /// set the log format: text (default) or json
    #[clap(long, global = true)]
    log_format: Option<String>,

    /// location of the error definitions document
    #[clap(long, global = true, default_value = faults::XML_DEFS)]
    error_defs: PathBuf,

    /// location of the local management API socket
    #[clap(long, global = true, default_value = xapi::XAPI_SOCKET)]
    xapi_socket: PathBuf,

    #[clap(subcommand)]
    subcmd: Option<SubCommand>,
}

#[derive(Parser, Debug)]
enum SubCommand {
    /// serve one plugin call from stdin, replying on stdout (the default)
    Serve,
    /// quiesce in-flight I/O for a disk
    Pause(DiskArgs),
    /// resume I/O for a disk, re-attaching its side channels
    Unpause(UnpauseArgs),
}

#[derive(Parser, Debug)]
struct DiskArgs {
    /// storage repository the disk belongs to
    #[clap(long)]
    sr_uuid: String,

    /// the disk to operate on
    #[clap(long)]
    vdi_uuid: String,

    /// secondary backing path to serve I/O from meanwhile
    #[clap(long)]
    secondary: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct UnpauseArgs {
    #[clap(flatten)]
    disk: DiskArgs,

    /// bring the whole ancestor chain online before reporting success
    #[clap(long)]
    activate_parents: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Err(e) = logger::init(opts.debug, opts.log.clone(), opts.log_format.as_deref()) {
        eprintln!("log init failed: {e:?}");
    }

    // Without the catalog no fault can be reported; refuse to serve.
    faults::init(&opts.error_defs).context("failed to load the error definitions document")?;

    match opts.subcmd {
        None | Some(SubCommand::Serve) => serve(&opts.xapi_socket),
        Some(SubCommand::Pause(args)) => pause_command(args),
        Some(SubCommand::Unpause(args)) => unpause_command(&opts.xapi_socket, args),
    }
}

fn serve(xapi_socket: &Path) -> Result<()> {
    let mut request = String::new();
    std::io::stdin()
        .read_to_string(&mut request)
        .context("failed to read the call from stdin")?;
    println!("{}", dispatch(xapi_socket, &request));
    Ok(())
}

/// Route one plugin call; every failure leaves as a catalog fault.
fn dispatch(xapi_socket: &Path, request: &str) -> String {
    let call = match rpc::parse_plugin_call(request) {
        Ok(call) => call,
        Err(e) => {
            tracing::error!("unparseable plugin call: {e}");
            return rpc::fault_response(&faults::resolve(
                faults::KEY_GENERAL,
                Some(&e.to_string()),
            ));
        }
    };
    match run_call(xapi_socket, &call) {
        Ok(()) => rpc::success_response("True"),
        Err(fault) => rpc::fault_response(&fault),
    }
}

fn run_call(xapi_socket: &Path, call: &PluginCall) -> Result<(), Fault> {
    let sr_uuid = require(call, "sr_uuid")?;
    let vdi_uuid = require(call, "vdi_uuid")?;
    let secondary = call.args.get("secondary").map(PathBuf::from);
    let quiescer = Quiescer::host();

    let result = match call.method.as_str() {
        "pause" => quiescer.pause(sr_uuid, vdi_uuid, secondary.as_deref()),
        "unpause" => {
            let activate_parents =
                call.args.get("activate_parents").map(String::as_str) == Some("true");
            let session = XapiSession::plugin(xapi_socket.to_path_buf(), call.session.clone());
            let vdi = XapiVdi::new(&session, sr_uuid, vdi_uuid);
            quiescer.unpause(&vdi, sr_uuid, vdi_uuid, secondary.as_deref(), activate_parents)
        }
        other => {
            return Err(faults::resolve(
                faults::KEY_GENERAL,
                Some(&format!("unknown method {other}")),
            ));
        }
    };

    result.map_err(|e| {
        tracing::error!("{} failed for {vdi_uuid}: {e}", call.method);
        e.fault()
    })
}

fn require<'a>(call: &'a PluginCall, key: &str) -> Result<&'a str, Fault> {
    call.args.get(key).map(String::as_str).ok_or_else(|| {
        faults::resolve(faults::KEY_GENERAL, Some(&format!("missing argument {key}")))
    })
}

fn pause_command(args: DiskArgs) -> Result<()> {
    let quiescer = Quiescer::host();
    quiescer
        .pause(&args.sr_uuid, &args.vdi_uuid, args.secondary.as_deref())
        .with_context(|| format!("failed to pause {}", args.vdi_uuid))?;
    println!("True");
    Ok(())
}

fn unpause_command(xapi_socket: &Path, args: UnpauseArgs) -> Result<()> {
    let session = XapiSession::login(xapi_socket.to_path_buf())
        .context("failed to open a local API session")?;
    let vdi = XapiVdi::new(&session, &args.disk.sr_uuid, &args.disk.vdi_uuid);
    let quiescer = Quiescer::host();
    let result = quiescer
        .unpause(
            &vdi,
            &args.disk.sr_uuid,
            &args.disk.vdi_uuid,
            args.disk.secondary.as_deref(),
            args.activate_parents,
        )
        .with_context(|| format!("failed to unpause {}", args.disk.vdi_uuid));
    session.logout();
    result?;
    println!("True");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin_call(method: &str, sr_uuid: &str, vdi_uuid: &str) -> String {
        format!(
            "<?xml version='1.0'?>\n<methodCall>\n<methodName>{method}</methodName>\n<params>\n\
             <param><value><string>OpaqueRef:f1b2</string></value></param>\n\
             <param><value><struct>\
             <member><name>sr_uuid</name><value><string>{sr_uuid}</string></value></member>\
             <member><name>vdi_uuid</name><value><string>{vdi_uuid}</string></value></member>\
             </struct></value></param>\n\
             </params>\n</methodCall>\n"
        )
    }

    #[test]
    fn garbage_requests_fault() {
        let response = dispatch(Path::new("/nonexistent/socket"), "not a call");
        assert!(response.contains("<fault>"));
        assert!(response.contains("faultCode"));
    }

    #[test]
    fn unknown_methods_fault() {
        let request = plugin_call("resize", "sr-main-1", "vdi-main-1");
        let response = dispatch(Path::new("/nonexistent/socket"), &request);
        assert!(response.contains("<fault>"));
        assert!(response.contains("unknown method resize"));
    }

    #[test]
    fn pausing_an_absent_disk_succeeds() {
        // No backend link exists for a made-up disk, so the pause is a
        // no-op and must still report success.
        let request = plugin_call(
            "pause",
            "7f1b8b1c-0000-4000-8000-2c964e2b01aa",
            "9c2d4e3f-0000-4000-8000-5a8e6f7c02bb",
        );
        let response = dispatch(Path::new("/nonexistent/socket"), &request);
        assert!(response.contains("<string>True</string>"), "{response}");
    }
}
