//! Control socket for the running host.
//!
//! A Unix-domain socket speaking newline-delimited JSON. Operator
//! subcommands (`stop`, `status`, `select-model`, …) connect, send one
//! request line, and read one response line:
//!
//! **Request:**
//! ```json
//! {"op": "select-model", "arg": "llama3.2"}
//! ```
//!
//! **Response:**
//! ```json
//! {"ok": true, "result": "llama3.2"}
//! ```
//! or on error:
//! ```json
//! {"ok": false, "error": "unknown op: foo"}
//! ```
//!
//! The socket doubles as the single-instance lock: `start` probes it first
//! and refuses to run when a live host answers.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use tether_core::{Relay, Topic};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Maximum line length accepted from a control client.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Timeout for reading a single request line. An idle control client is
/// disconnected.
const LINE_READ_TIMEOUT: Duration = Duration::from_secs(30);

// ── Protocol ──────────────────────────────────────────────────────────────────

/// Incoming control command.
#[derive(Debug, Deserialize)]
struct ControlRequest {
    /// Operation: `"status"`, `"server-id"`, `"select-model"`,
    /// `"toggle-debug"`, or `"stop"`.
    op: String,
    /// Operation-specific argument (the model name for `select-model`).
    #[serde(default)]
    arg: Option<String>,
}

/// Control response envelope written back to the client.
#[derive(Debug, Serialize)]
struct ControlResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok(result: serde_json::Value) -> ControlResponse {
    ControlResponse {
        ok: true,
        result: Some(result),
        error: None,
    }
}

fn err(message: impl Into<String>) -> ControlResponse {
    ControlResponse {
        ok: false,
        result: None,
        error: Some(message.into()),
    }
}

// ── Runtime log-level toggle ──────────────────────────────────────────────────

type FilterHandle =
    tracing_subscriber::reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>;

/// Flips the process between its configured log filter and `debug`.
pub struct DebugToggle {
    handle: FilterHandle,
    base: String,
    debug: AtomicBool,
}

impl DebugToggle {
    pub fn new(handle: FilterHandle, base: String) -> Self {
        Self {
            handle,
            base,
            debug: AtomicBool::new(false),
        }
    }

    /// Toggle and return the new state (`true` = debug).
    pub fn toggle(&self) -> bool {
        let is_debug = !self.debug.load(Ordering::SeqCst);
        let directive = if is_debug { "debug" } else { self.base.as_str() };
        match tracing_subscriber::EnvFilter::try_new(directive) {
            Ok(filter) => {
                if let Err(e) = self.handle.reload(filter) {
                    warn!(error = %e, "failed to reload log filter");
                }
                info!(debug_enabled = is_debug, "log level toggled");
            }
            Err(e) => warn!(error = %e, directive, "invalid log filter directive"),
        }
        self.debug.store(is_debug, Ordering::SeqCst);
        is_debug
    }
}

/// Everything the control server needs from the running host.
pub struct ControlContext {
    pub relay: Relay,
    pub topic: Topic,
    pub debug: DebugToggle,
    pub stop_tx: watch::Sender<bool>,
}

// ── Entry-point ───────────────────────────────────────────────────────────────

/// Start the control listener and handle connections indefinitely.
pub async fn serve(socket_path: String, ctx: ControlContext) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        serve_unix(socket_path, std::sync::Arc::new(ctx)).await
    }
    #[cfg(windows)]
    {
        let _ = (socket_path, ctx);
        warn!("control socket is not supported on Windows; control commands disabled");
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Whether a live host currently answers on the control socket.
pub async fn instance_alive(socket_path: &str) -> bool {
    #[cfg(unix)]
    {
        tokio::net::UnixStream::connect(socket_path).await.is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = socket_path;
        false
    }
}

/// Remove a stale socket file only if it is confirmed to be a socket.
///
/// Never touches a regular file or directory that happens to sit at the
/// configured path.
pub fn remove_stale_socket(path: &str) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        match std::fs::metadata(path) {
            Err(_) => {} // nothing there
            Ok(meta) if meta.file_type().is_socket() => {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path, error = %e, "failed to remove stale control socket");
                }
            }
            Ok(_) => {
                warn!(path = %path, "path exists but is not a socket; refusing to remove it");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

// ── Unix implementation ───────────────────────────────────────────────────────

#[cfg(unix)]
async fn serve_unix(
    socket_path: String,
    ctx: std::sync::Arc<ControlContext>,
) -> anyhow::Result<()> {
    use tokio::net::UnixListener;

    remove_stale_socket(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    info!(socket_path = %socket_path, "control socket listening");

    loop {
        match listener.accept().await {
            Err(e) => warn!(error = %e, "control accept error"),
            Ok((stream, _addr)) => {
                let ctx = std::sync::Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle_connection(stream, ctx).await;
                });
            }
        }
    }
}

#[cfg(unix)]
async fn handle_connection(stream: tokio::net::UnixStream, ctx: std::sync::Arc<ControlContext>) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match tokio::time::timeout(LINE_READ_TIMEOUT, lines.next_line()).await {
            Err(_elapsed) => {
                debug!("control client idle; closing connection");
                break;
            }
            Ok(Err(e)) => {
                debug!(error = %e, "control read error; closing connection");
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(line))) => line,
        };

        if line.len() > MAX_LINE_BYTES {
            let _ = write_response(&mut writer, &err("request too large")).await;
            break;
        }

        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Err(e) => err(format!("invalid JSON: {e}")),
            Ok(request) => {
                debug!(op = %request.op, "control request");
                dispatch(&ctx, request)
            }
        };

        if write_response(&mut writer, &response).await.is_err() {
            break;
        }
    }
}

#[cfg(unix)]
async fn write_response<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    response: &ControlResponse,
) -> Result<(), std::io::Error> {
    use tokio::io::AsyncWriteExt;

    let mut line = serde_json::to_string(response).unwrap_or_default();
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

fn dispatch(ctx: &ControlContext, request: ControlRequest) -> ControlResponse {
    match request.op.as_str() {
        "status" => {
            let status = ctx.relay.current_status();
            ok(json!({
                "version": env!("CARGO_PKG_VERSION"),
                "busy": status.busy,
                "active_request_id": status.active_request_id,
                "peers": status.peers,
                "provider_reachable": status.provider_reachable,
                "model": ctx.relay.model(),
            }))
        }
        "server-id" => ok(json!(ctx.topic.to_string())),
        "select-model" => match request.arg.as_deref().map(str::trim) {
            Some(model) if !model.is_empty() => {
                ctx.relay.set_model(model);
                ok(json!(ctx.relay.model()))
            }
            _ => err("select-model requires a model name"),
        },
        "toggle-debug" => ok(json!({ "debug": ctx.debug.toggle() })),
        "stop" => {
            ctx.stop_tx.send_replace(true);
            ok(json!("stopping"))
        }
        unknown => err(format!("unknown op: {unknown}")),
    }
}

// ── Client side ───────────────────────────────────────────────────────────────

/// Send one control request to the running host and return its result.
pub async fn request(
    socket_path: &str,
    op: &str,
    arg: Option<String>,
) -> anyhow::Result<serde_json::Value> {
    #[cfg(unix)]
    {
        use anyhow::Context;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let stream = tokio::net::UnixStream::connect(socket_path)
            .await
            .context("no running tether host (control socket unavailable)")?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(&json!({ "op": op, "arg": arg }))?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;

        let mut lines = BufReader::new(reader).lines();
        let response = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .context("control request timed out")??
            .context("host closed the control connection")?;

        let value: serde_json::Value = serde_json::from_str(&response)?;
        if value["ok"].as_bool() == Some(true) {
            Ok(value["result"].clone())
        } else {
            anyhow::bail!(
                "{}",
                value["error"].as_str().unwrap_or("unknown control error")
            )
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (socket_path, op, arg);
        anyhow::bail!("control commands require a Unix-domain socket")
    }
}

/// Best-effort removal of the control socket on shutdown.
pub fn cleanup_socket(path: &str) {
    let _ = std::fs::remove_file(path);
}
