//! Remote plugin adapter: a `ResourcePlugin` served by another process.
//!
//! Wire format: each message is a little-endian `u32` length followed by a
//! JSON payload. The controller sends one [`Request`] and reads exactly one
//! [`Response`] per call; `init` performs a `Hello` version handshake.
//! [`RemotePlugin::spawn`] runs the plugin as a child process and talks over
//! its stdin/stdout, but any `Read + Write` transport works.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stride_state::WorkloadRef;

use crate::error::{PluginError, PluginResult};
use crate::plugin::{ResourcePlugin, WorkloadStatus};

pub const PROTOCOL_VERSION: u32 = 1;

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Hello { version: u32 },
    GetStatus { workload: WorkloadRef },
    SetWeight { workload: WorkloadRef, weight: u32 },
    VerifyWeight { workload: WorkloadRef, weight: u32 },
    Promote { workload: WorkloadRef },
    Abort { workload: WorkloadRef },
    Restart { workload: WorkloadRef },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    HelloOk { version: u32 },
    Status { status: WorkloadStatus },
    Verified { verified: bool },
    Ok,
    Err { message: String },
}

pub fn write_frame<W: Write, T: Serialize>(mut w: W, msg: &T) -> PluginResult<()> {
    let payload = serde_json::to_vec(msg)?;
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(mut r: R) -> PluginResult<T> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large").into());
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Bidirectional byte stream to a plugin.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

/// A child process's stdin/stdout joined into one transport.
struct ChildIo {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl Read for ChildIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Write for ChildIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdin.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdin.flush()
    }
}

/// Adapter forwarding every capability call to an out-of-process plugin.
///
/// Calls are serialized over the single transport.
pub struct RemotePlugin {
    name: String,
    transport: Mutex<Box<dyn Transport>>,
    child: Mutex<Option<Child>>,
}

impl RemotePlugin {
    /// Wrap an already-connected transport.
    pub fn new(name: &str, transport: impl Transport + 'static) -> Self {
        Self {
            name: name.to_string(),
            transport: Mutex::new(Box::new(transport)),
            child: Mutex::new(None),
        }
    }

    /// Start `program` and speak the protocol over its stdin/stdout.
    pub fn spawn(name: &str, program: &str, args: &[String]) -> PluginResult<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Protocol("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Protocol("child stdout unavailable".to_string()))?;
        debug!(plugin = %name, %program, pid = child.id(), "remote plugin spawned");
        Ok(Self {
            name: name.to_string(),
            transport: Mutex::new(Box::new(ChildIo { stdin, stdout })),
            child: Mutex::new(Some(child)),
        })
    }

    fn call(&self, request: &Request) -> PluginResult<Response> {
        let mut transport = self.transport.lock().map_err(|_| PluginError::Poisoned)?;
        write_frame(&mut *transport, request)?;
        match read_frame(&mut *transport)? {
            Response::Err { message } => Err(PluginError::Remote(message)),
            response => Ok(response),
        }
    }

    fn call_ok(&self, request: &Request) -> PluginResult<()> {
        match self.call(request)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> PluginError {
    PluginError::Protocol(format!("unexpected response: {response:?}"))
}

impl ResourcePlugin for RemotePlugin {
    fn init(&self) -> PluginResult<()> {
        match self.call(&Request::Hello {
            version: PROTOCOL_VERSION,
        })? {
            Response::HelloOk { version } if version == PROTOCOL_VERSION => {
                debug!(plugin = %self.name, version, "remote plugin handshake complete");
                Ok(())
            }
            Response::HelloOk { version } => Err(PluginError::Protocol(format!(
                "plugin {} speaks protocol {version}, expected {PROTOCOL_VERSION}",
                self.name
            ))),
            other => Err(unexpected(&other)),
        }
    }

    fn get_status(&self, workload: &WorkloadRef) -> PluginResult<WorkloadStatus> {
        match self.call(&Request::GetStatus {
            workload: workload.clone(),
        })? {
            Response::Status { status } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    fn set_weight(&self, workload: &WorkloadRef, weight: u32) -> PluginResult<()> {
        self.call_ok(&Request::SetWeight {
            workload: workload.clone(),
            weight,
        })
    }

    fn verify_weight(&self, workload: &WorkloadRef, weight: u32) -> PluginResult<bool> {
        match self.call(&Request::VerifyWeight {
            workload: workload.clone(),
            weight,
        })? {
            Response::Verified { verified } => Ok(verified),
            other => Err(unexpected(&other)),
        }
    }

    fn promote(&self, workload: &WorkloadRef) -> PluginResult<()> {
        self.call_ok(&Request::Promote {
            workload: workload.clone(),
        })
    }

    fn abort(&self, workload: &WorkloadRef) -> PluginResult<()> {
        self.call_ok(&Request::Abort {
            workload: workload.clone(),
        })
    }

    fn restart(&self, workload: &WorkloadRef) -> PluginResult<()> {
        self.call_ok(&Request::Restart {
            workload: workload.clone(),
        })
    }
}

impl Drop for RemotePlugin {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            if let Some(mut child) = child.take() {
                if let Err(e) = child.kill() {
                    warn!(plugin = %self.name, error = %e, "failed to stop remote plugin");
                }
                let _ = child.wait();
            }
        }
    }
}
