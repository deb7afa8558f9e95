//! Command channel gateway.
//!
//! JSON-lines control surface on a Unix domain socket: one request object
//! per line, one response object back. Marshals host-UI commands onto the
//! privilege gate and the engine handle. No command failure is fatal; the
//! connection loop and the daemon stay up after any error.

use crate::engine::EngineHandle;
use crate::privilege::{PrivilegeError, PrivilegeGate};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Errors that can occur setting up the command channel.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Socket bind failed: {0}")]
    BindFailed(String),
}

/// Incoming command. `timeoutMs` is kept raw so any numeric representation
/// can be normalized after parsing.
#[derive(Debug, Deserialize)]
struct Request {
    method: String,

    #[serde(rename = "timeoutMs", default)]
    timeout_ms: Option<serde_json::Value>,
}

/// Outgoing response: either a result value or an error object.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl Response {
    fn ok(result: bool) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    fn error(code: &'static str, message: String) -> Self {
        Self {
            result: None,
            error: Some(ErrorBody { code, message }),
        }
    }
}

/// Command dispatcher bound to the gate and the engine.
pub struct Gateway {
    gate: Arc<dyn PrivilegeGate>,
    engine: EngineHandle,
    default_timeout: Duration,
}

impl Gateway {
    pub fn new(gate: Arc<dyn PrivilegeGate>, engine: EngineHandle, default_timeout: Duration) -> Self {
        Self {
            gate,
            engine,
            default_timeout,
        }
    }

    /// Accept connections until shutdown.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!("Command channel shutting down");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let gateway = self.clone();
                        tokio::spawn(gateway.handle_connection(stream));
                    }
                    Err(e) => warn!("Failed to accept command connection: {}", e),
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => return, // EOF
                Ok(_) => {
                    if line.trim().is_empty() {
                        continue;
                    }

                    let response = self.handle_line(&line).await;
                    let mut out = match serde_json::to_string(&response) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!("Failed to encode response: {}", e);
                            continue;
                        }
                    };
                    out.push('\n');

                    if let Err(e) = write.write_all(out.as_bytes()).await {
                        debug!("Command connection write failed: {}", e);
                        return;
                    }
                }
                Err(e) => {
                    debug!("Command connection read failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn handle_line(&self, line: &str) -> Response {
        trace!("Command line: {}", line.trim());
        match serde_json::from_str::<Request>(line.trim()) {
            Ok(request) => self.dispatch(&request).await,
            Err(e) => Response::error("BAD_REQUEST", e.to_string()),
        }
    }

    async fn dispatch(&self, request: &Request) -> Response {
        debug!("Dispatching command: {}", request.method);
        match request.method.as_str() {
            "requestAdmin" => match self.gate.request_activation().await {
                Ok(granted) => Response::ok(granted),
                Err(e) => Response::error("PLATFORM", e.to_string()),
            },
            "isAdminActive" => Response::ok(self.gate.is_active().await),
            "isServiceRunning" => Response::ok(self.engine.is_running()),
            "startService" => {
                self.engine.start(self.timeout_from(request));
                Response::ok(true)
            }
            "stopService" => {
                self.engine.stop();
                Response::ok(true)
            }
            "updateTimeout" => {
                self.engine.set_timeout(self.timeout_from(request));
                Response::ok(true)
            }
            "lockNow" => match self.gate.lock_now().await {
                Ok(()) => Response::ok(true),
                Err(PrivilegeError::NotPrivileged) => {
                    Response::error("NOT_ADMIN", "admin privilege not active".to_string())
                }
                Err(e) => Response::error("PLATFORM", e.to_string()),
            },
            "removeAdmin" => {
                self.gate.revoke().await;
                Response::ok(true)
            }
            other => Response::error("NOT_IMPLEMENTED", format!("unknown method: {other}")),
        }
    }

    fn timeout_from(&self, request: &Request) -> Duration {
        normalize_timeout(request.timeout_ms.as_ref(), self.default_timeout)
    }
}

/// Normalize a raw `timeoutMs` value to a millisecond duration.
///
/// Accepts any JSON number (floats are truncated). Absent, malformed, or
/// non-positive values fall back to the default rather than failing.
#[allow(clippy::cast_possible_truncation)]
fn normalize_timeout(value: Option<&serde_json::Value>, default: Duration) -> Duration {
    let Some(value) = value else {
        return default;
    };

    let ms = if let Some(n) = value.as_i64() {
        n
    } else if let Some(f) = value.as_f64() {
        f as i64
    } else {
        warn!("Malformed timeoutMs {:?}, using default", value);
        return default;
    };

    if ms > 0 {
        Duration::from_millis(ms.unsigned_abs())
    } else {
        warn!("Non-positive timeoutMs {}, using default", ms);
        default
    }
}

/// Resolve the command socket path: explicit override, else
/// `$XDG_RUNTIME_DIR/autolockd.sock`.
pub fn socket_path(configured: Option<&Path>) -> Result<PathBuf, GatewayError> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }

    let runtime_dir = env::var("XDG_RUNTIME_DIR")
        .map_err(|_| GatewayError::EnvVarNotSet("XDG_RUNTIME_DIR".to_string()))?;

    Ok(PathBuf::from(runtime_dir).join("autolockd.sock"))
}

/// Bind the listener, replacing a stale socket file from a previous run.
pub fn bind(path: &Path) -> Result<UnixListener, GatewayError> {
    if path.exists() {
        debug!("Removing stale socket file: {}", path.display());
        let _ = std::fs::remove_file(path);
    }

    UnixListener::bind(path)
        .map_err(|e| GatewayError::BindFailed(format!("{}: {}", path.display(), e)))
}
