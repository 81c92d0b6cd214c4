//! Subagent transports: direct (in-process), stdio-rpc (line-framed
//! JSON-RPC over a child process), http (POST), and socket (length-prefixed
//! JSON over a Unix domain socket).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use p3394_domain::error::{Error, Result};
use p3394_domain::umf::{self, Umf};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Direct,
    StdioRpc,
    Http,
    Socket,
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::StdioRpc => "stdio-rpc",
            TransportKind::Http => "http",
            TransportKind::Socket => "socket",
        }
    }
}

/// How to reach a subagent, in the subagent manifest's preference order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSpec {
    /// In-process call into a registered [`Subagent`] object.
    Direct,
    StdioRpc {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Http {
        endpoint: String,
    },
    Socket {
        path: PathBuf,
    },
}

impl TransportSpec {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportSpec::Direct => TransportKind::Direct,
            TransportSpec::StdioRpc { .. } => TransportKind::StdioRpc,
            TransportSpec::Http { .. } => TransportKind::Http,
            TransportSpec::Socket { .. } => TransportKind::Socket,
        }
    }
}

/// An in-process subagent addressable over the direct transport.
#[async_trait]
pub trait Subagent: Send + Sync {
    fn agent_id(&self) -> &str;
    async fn handle(&self, msg: Umf) -> Result<Umf>;
}

#[async_trait]
pub trait SubagentTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Deliver one message and wait for the reply within `deadline`.
    async fn send(&self, msg: &Umf, deadline: Duration) -> Result<Umf>;

    /// Liveness probe; `true` when the peer answered within `timeout`.
    async fn probe(&self, timeout: Duration) -> bool;

    async fn close(&self);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Direct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DirectTransport {
    subagent: Arc<dyn Subagent>,
    open: AtomicBool,
}

impl DirectTransport {
    pub fn new(subagent: Arc<dyn Subagent>) -> Self {
        Self {
            subagent,
            open: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl SubagentTransport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn send(&self, msg: &Umf, deadline: Duration) -> Result<Umf> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Http("direct transport closed".into()));
        }
        tokio::time::timeout(deadline, self.subagent.handle(msg.clone()))
            .await
            .map_err(|_| Error::Timeout(format!("direct call to {}", self.subagent.agent_id())))?
    }

    async fn probe(&self, _timeout: Duration) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio-RPC
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Non-JSON lines tolerated on stdout before the peer is declared broken.
const MAX_SKIP_LINES: usize = 1000;

/// Line-framed JSON-RPC 2.0 over a child process's stdin/stdout.
///
/// The `request_lock` serializes full request/response cycles so concurrent
/// callers cannot read each other's responses.
pub struct StdioRpcTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioRpcTransport {
    pub fn spawn(command: &str, args: &[String]) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Http("stdio-rpc peer has exited".into()));
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read one JSON line, skipping anything that does not look like JSON
    /// (a misbehaving peer logging to stdout).
    async fn read_json_line(&self) -> Result<String> {
        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let n = stdout.read_line(&mut line).await?;
            if n == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(Error::Http("stdio-rpc peer closed stdout".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(Error::Http(
                    "stdio-rpc peer produced too many non-JSON lines".into(),
                ));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON line from stdio-rpc peer");
        }
    }

    async fn request(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let _guard = self.request_lock.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.write_line(&req.to_string()).await?;

        let reply = tokio::time::timeout(deadline, async {
            loop {
                let line = self.read_json_line().await?;
                let value: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                // Notifications (no id) are skipped; responses for other
                // ids would indicate a protocol bug but are skipped too.
                if value.get("id").and_then(Value::as_u64) == Some(id) {
                    return Ok::<Value, Error>(value);
                }
                tracing::debug!(line = %line, "skipping non-matching stdio-rpc message");
            }
        })
        .await
        .map_err(|_| Error::Timeout(format!("stdio-rpc {method}")))??;

        if let Some(error) = reply.get("error") {
            return Err(Error::Http(format!("stdio-rpc error: {error}")));
        }
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| Error::Http("stdio-rpc response without result".into()))
    }
}

#[async_trait]
impl SubagentTransport for StdioRpcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StdioRpc
    }

    async fn send(&self, msg: &Umf, deadline: Duration) -> Result<Umf> {
        let params = serde_json::to_value(msg)?;
        let result = self.request("p3394/send", params, deadline).await?;
        umf::decode(&serde_json::to_vec(&result)?)
    }

    async fn probe(&self, timeout: Duration) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        self.request("p3394/ping", Value::Null, timeout).await.is_ok()
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        // Grace period, then hard kill.
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "stdio-rpc peer exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "error waiting for stdio-rpc peer"),
            Err(_) => {
                tracing::warn!("stdio-rpc peer did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
    open: AtomicBool,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder()
                .build()
                .map_err(|e| Error::Http(e.to_string()))?,
            open: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl SubagentTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(&self, msg: &Umf, deadline: Duration) -> Result<Umf> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Http("http transport closed".into()));
        }
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(deadline)
            .json(msg)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("http send to {}", self.endpoint))
                } else {
                    Error::Http(e.to_string())
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http(format!("{} returned {status}", self.endpoint)));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        umf::decode(&bytes)
    }

    async fn probe(&self, timeout: Duration) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        // Connection-level liveness: any HTTP response counts.
        self.client
            .get(&self.endpoint)
            .timeout(timeout)
            .send()
            .await
            .is_ok()
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unix socket (length-prefixed JSON)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frames are a 4-byte big-endian length followed by the JSON payload.
pub struct SocketTransport {
    path: PathBuf,
    open: AtomicBool,
}

/// Largest accepted socket frame (16 MiB).
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

impl SocketTransport {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            open: AtomicBool::new(true),
        }
    }

    async fn round_trip(&self, payload: &[u8], deadline: Duration) -> Result<Vec<u8>> {
        let io = async {
            let mut stream = tokio::net::UnixStream::connect(&self.path).await?;
            stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
            stream.write_all(payload).await?;
            stream.flush().await?;

            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf);
            if len > MAX_FRAME_BYTES {
                return Err(Error::Http(format!("socket frame too large: {len} bytes")));
            }
            let mut buf = vec![0u8; len as usize];
            stream.read_exact(&mut buf).await?;
            Ok::<Vec<u8>, Error>(buf)
        };
        tokio::time::timeout(deadline, io)
            .await
            .map_err(|_| Error::Timeout(format!("socket send to {}", self.path.display())))?
    }
}

#[async_trait]
impl SubagentTransport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn send(&self, msg: &Umf, deadline: Duration) -> Result<Umf> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Http("socket transport closed".into()));
        }
        let payload = umf::encode(msg)?;
        let reply = self.round_trip(&payload, deadline).await?;
        umf::decode(&reply)
    }

    async fn probe(&self, timeout: Duration) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        tokio::time::timeout(timeout, tokio::net::UnixStream::connect(&self.path))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
