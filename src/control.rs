//! Local control socket of the running primary loop.
//!
//! `run` listens on an ephemeral loopback port and records it in
//! `control.json`. Foreground commands send one [`ControlMessage`] per line
//! and get one [`ControlReply`] back; accepted messages go onto the loop's
//! [`ControlBus`]. When nothing is listening the caller applies the change
//! directly through the shared preferences instead.

use crate::bus::{ControlBus, ControlMessage};
use crate::survival::PrimaryLock;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEndpoint {
    pub pid: u32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    fn accepted() -> Self {
        Self { ok: true, error: None }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

pub struct ControlServer {
    endpoint_path: PathBuf,
    port: u16,
    listener: Mutex<Option<TcpListener>>,
    running: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ControlServer {
    /// Binds a loopback port and publishes it at `endpoint_path`.
    pub async fn bind(endpoint_path: PathBuf) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind control socket")?;
        let port = listener.local_addr()?.port();
        let endpoint = ControlEndpoint {
            pid: std::process::id(),
            port,
        };
        if let Some(parent) = endpoint_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&endpoint_path, serde_json::to_string_pretty(&endpoint)?)
            .await
            .with_context(|| format!("failed to write {}", endpoint_path.display()))?;
        info!("Control socket listening on 127.0.0.1:{port}");
        Ok(Self {
            endpoint_path,
            port,
            listener: Mutex::new(Some(listener)),
            running: Arc::new(AtomicBool::new(false)),
            task: Arc::new(Mutex::new(None)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn start(&self, bus: Arc<ControlBus>) {
        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };
        self.running.store(true, Ordering::Relaxed);
        let running = self.running.clone();

        let acceptor = tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Control connection from {peer}");
                        let bus = bus.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, bus).await {
                                warn!("Control connection failed: {err:#}");
                            }
                        });
                    }
                    Err(err) => warn!("Control accept failed: {err}"),
                }
            }
        });

        *self.task.lock().await = Some(acceptor);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        if let Err(err) = tokio::fs::remove_file(&self.endpoint_path).await {
            debug!("Control endpoint not removed: {err}");
        }
    }
}

async fn handle_connection(stream: TcpStream, bus: Arc<ControlBus>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<ControlMessage>(&line) {
            Ok(msg) => match bus.publish(msg).await {
                Ok(()) => ControlReply::accepted(),
                Err(err) => ControlReply::rejected(format!("{err:#}")),
            },
            Err(err) => ControlReply::rejected(format!("invalid control message: {err}")),
        };
        let mut out = serde_json::to_string(&reply)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

/// Sends `msg` to the running loop.
///
/// `Ok(None)` means no loop is listening and the caller should apply the
/// change itself.
pub async fn send(
    endpoint_path: &Path,
    msg: &ControlMessage,
    timeout: Duration,
) -> Result<Option<ControlReply>> {
    let raw = match tokio::fs::read_to_string(endpoint_path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", endpoint_path.display()));
        }
    };
    let endpoint: ControlEndpoint = match serde_json::from_str(&raw) {
        Ok(endpoint) => endpoint,
        Err(err) => {
            warn!("Ignoring unreadable {}: {err}", endpoint_path.display());
            return Ok(None);
        }
    };

    let stream = match tokio::time::timeout(
        timeout,
        TcpStream::connect(("127.0.0.1", endpoint.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!("No control socket on port {}: {err}", endpoint.port);
            return Ok(None);
        }
        Err(_) => {
            debug!("Control socket on port {} did not accept in time", endpoint.port);
            return Ok(None);
        }
    };

    let exchange = async {
        let (reader, mut writer) = stream.into_split();
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        let reply = BufReader::new(reader)
            .lines()
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("control socket closed without a reply"))?;
        Ok::<_, anyhow::Error>(serde_json::from_str::<ControlReply>(&reply)?)
    };
    let reply = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| anyhow!("control socket did not reply within {timeout:?}"))??;
    Ok(Some(reply))
}

/// Hands `msg` to the primary loop when one holds the lock at `lock_path`.
///
/// Returns `false` when the caller should apply the change itself: no
/// primary is running, or it could not be reached.
pub async fn deliver(
    lock_path: &Path,
    endpoint_path: &Path,
    msg: &ControlMessage,
    timeout: Duration,
) -> Result<bool> {
    if !PrimaryLock::is_held(lock_path)? {
        return Ok(false);
    }
    match send(endpoint_path, msg, timeout).await {
        Ok(Some(reply)) if reply.ok => Ok(true),
        Ok(Some(reply)) => Err(anyhow!(
            "primary loop rejected the change: {}",
            reply.error.unwrap_or_default()
        )),
        Ok(None) => Ok(false),
        Err(err) => {
            warn!("Primary loop unreachable, applying directly: {err:#}");
            Ok(false)
        }
    }
}
