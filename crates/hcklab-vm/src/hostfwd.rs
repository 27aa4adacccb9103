//! Forwarded host ports leased from the user-mode network helper.
//!
//! The helper listens on a Unix socket; every request is one JSON line on a
//! fresh connection, answered by one JSON line.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::scope::Resource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    #[default]
    Tcp,
    Udp,
}

/// One guest port to expose. `host_port` 0 lets the helper pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    #[serde(default)]
    pub proto: Proto,
    pub guest_port: u16,
    #[serde(default)]
    pub host_port: u16,
}

#[derive(Debug, Clone)]
pub struct PortForward {
    pub backend_id: Value,
    pub host_port: u16,
    pub spec: ForwardSpec,
}

#[derive(Serialize)]
struct Request<'a> {
    method: &'a str,
    args: Vec<Value>,
}

#[derive(Deserialize)]
struct Reply {
    #[serde(rename = "return")]
    ret: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct HostFwdClient {
    socket: PathBuf,
    timeout: Duration,
}

impl HostFwdClient {
    pub fn new(socket: &Path, timeout: Duration) -> Self {
        Self {
            socket: socket.to_path_buf(),
            timeout,
        }
    }

    fn request(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let stream = UnixStream::connect(&self.socket)
            .with_context(|| format!("connect port-forward helper: {}", self.socket.display()))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut line = serde_json::to_vec(&Request { method, args })?;
        line.push(b'\n');
        (&stream)
            .write_all(&line)
            .with_context(|| format!("send {method}"))?;

        let mut raw = String::new();
        BufReader::new(&stream)
            .read_line(&mut raw)
            .with_context(|| format!("read {method} reply"))?;
        if raw.trim().is_empty() {
            anyhow::bail!("port-forward helper closed the connection during {method}");
        }

        let reply: Reply = serde_json::from_str(raw.trim())
            .with_context(|| format!("parse {method} reply: {}", raw.trim()))?;
        if let Some(err) = reply.error {
            anyhow::bail!("port-forward helper rejected {method}: {err}");
        }
        Ok(reply.ret.unwrap_or(Value::Null))
    }

    pub fn add(&self, spec: &ForwardSpec) -> Result<PortForward> {
        let ret = self.request(
            "add_hostfwd",
            vec![
                json!(spec.proto),
                json!("127.0.0.1"),
                json!(spec.host_port),
                json!(spec.guest_port),
            ],
        )?;
        let Some(backend_id) = ret.get("id").filter(|id| !id.is_null()).cloned() else {
            anyhow::bail!("add_hostfwd return carries no id: {ret}");
        };
        // Helpers that only echo the id bound the port that was asked for.
        let host_port = ret
            .get("host_port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .filter(|&p| p != 0)
            .unwrap_or(spec.host_port);

        let fwd = PortForward {
            backend_id,
            host_port,
            spec: spec.clone(),
        };
        if fwd.host_port == 0 {
            if let Err(err) = self.remove(&fwd) {
                warn!(id = %fwd.backend_id, error = format!("{err:#}"), "remove unusable port forward failed");
            }
            anyhow::bail!(
                "add_hostfwd for guest port {} reported no host port and none was requested",
                spec.guest_port
            );
        }
        Ok(fwd)
    }

    pub fn remove(&self, fwd: &PortForward) -> Result<()> {
        self.request("remove_hostfwd", vec![fwd.backend_id.clone()])?;
        Ok(())
    }
}

/// A batch of forwards held for one VM and removed together.
pub struct PortForwardLease {
    vm: String,
    client: HostFwdClient,
    forwards: Vec<PortForward>,
    released: Mutex<bool>,
}

impl PortForwardLease {
    /// Leases every spec or none: a failure partway removes what this call
    /// already added, newest first.
    pub fn acquire(client: &HostFwdClient, vm: &str, specs: &[ForwardSpec]) -> Result<Self> {
        let mut forwards: Vec<PortForward> = Vec::with_capacity(specs.len());
        for spec in specs {
            match client.add(spec) {
                Ok(fwd) => {
                    debug!(vm, guest_port = spec.guest_port, host_port = fwd.host_port, "port forward added");
                    forwards.push(fwd);
                }
                Err(err) => {
                    remove_all(client, vm, &mut forwards);
                    return Err(err).with_context(|| {
                        format!("vm {vm}: forward guest port {}", spec.guest_port)
                    });
                }
            }
        }
        if !forwards.is_empty() {
            info!(vm, ports = ?forwards.iter().map(|f| f.host_port).collect::<Vec<_>>(), "port forwards leased");
        }
        Ok(Self {
            vm: vm.to_string(),
            client: client.clone(),
            forwards,
            released: Mutex::new(false),
        })
    }

    pub fn host_ports(&self) -> Vec<u16> {
        self.forwards.iter().map(|f| f.host_port).collect()
    }

    pub fn forwards(&self) -> &[PortForward] {
        &self.forwards
    }

    fn shutdown(&self) {
        let mut released = self
            .released
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *released {
            return;
        }
        *released = true;
        let mut forwards = self.forwards.clone();
        remove_all(&self.client, &self.vm, &mut forwards);
    }
}

fn remove_all(client: &HostFwdClient, vm: &str, forwards: &mut Vec<PortForward>) {
    while let Some(fwd) = forwards.pop() {
        if let Err(err) = client.remove(&fwd) {
            warn!(vm, host_port = fwd.host_port, error = format!("{err:#}"), "remove port forward failed");
        }
    }
}

impl Resource for PortForwardLease {
    fn describe(&self) -> String {
        format!("port forwards for {} {:?}", self.vm, self.host_ports())
    }

    fn release(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for PortForwardLease {
    fn drop(&mut self) {
        self.shutdown();
    }
}
