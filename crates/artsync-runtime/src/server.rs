//! UDS JSON-RPC server: minimal hand-rolled implementation.
//! Connection-per-request, newline-delimited JSON.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use artsync_core::event_log::EVENT_LOG_CAPACITY;
use artsync_daemon::{ControlError, PairController, PairRegistry};

pub type SharedRegistry = Arc<RwLock<PairRegistry>>;

// ---- JSON-RPC error codes ----

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;
const RATE_LIMITED: i64 = -32001;
const SHUT_DOWN: i64 = -32002;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ControlError> for RpcError {
    fn from(e: ControlError) -> Self {
        let code = match e {
            ControlError::RateLimited { .. } => RATE_LIMITED,
            ControlError::ShutDown => SHUT_DOWN,
            ControlError::Config(_) => INVALID_PARAMS,
        };
        Self::new(code, e.to_string())
    }
}

/// Create the socket directory (0700), clear a stale socket, bind (0600).
pub async fn bind(socket_path: &str) -> anyhow::Result<UnixListener> {
    let socket_dir = std::path::Path::new(socket_path)
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid socket path"))?;

    std::fs::create_dir_all(socket_dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    if std::path::Path::new(socket_path).exists() {
        if UnixStream::connect(socket_path).await.is_err() {
            std::fs::remove_file(socket_path)?;
            tracing::info!("removed stale socket at {socket_path}");
        } else {
            anyhow::bail!("another daemon is already running at {socket_path}");
        }
    }

    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!("control socket listening on {socket_path}");
    Ok(listener)
}

/// Accept connections until cancelled.
pub async fn serve(
    listener: UnixListener,
    registry: SharedRegistry,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, registry).await {
                tracing::debug!("connection error: {e}");
            }
        });
    }
    tracing::debug!("control socket closed");
    Ok(())
}

async fn handle_connection(stream: UnixStream, registry: SharedRegistry) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response = match serde_json::from_str::<Value>(line.trim()) {
        Ok(request) => {
            let method = request["method"].as_str().unwrap_or("");
            let id = request["id"].clone();
            tracing::debug!(method, "rpc request");
            match dispatch(&registry, method, &request["params"]).await {
                Ok(result) => json!({ "jsonrpc": "2.0", "result": result, "id": id }),
                Err(e) => error_response(&e, id),
            }
        }
        Err(e) => error_response(&RpcError::new(PARSE_ERROR, format!("parse error: {e}")), Value::Null),
    };

    let mut resp = serde_json::to_string(&response)?;
    resp.push('\n');
    writer.write_all(resp.as_bytes()).await?;
    Ok(())
}

fn error_response(e: &RpcError, id: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": e.code, "message": e.message },
        "id": id,
    })
}

fn to_json<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))
}

/// The named pair, or the only pair when none is named.
async fn resolve(registry: &SharedRegistry, params: &Value) -> Result<PairController, RpcError> {
    let reg = registry.read().await;
    match params["pair"].as_str() {
        Some(id) => reg
            .get(id)
            .cloned()
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("unknown pair: {id}"))),
        None if reg.len() == 1 => reg
            .iter()
            .next()
            .cloned()
            .ok_or_else(|| RpcError::new(INTERNAL_ERROR, "registry changed")),
        None => Err(RpcError::new(
            INVALID_PARAMS,
            format!("`pair` is required ({} pairs running)", reg.len()),
        )),
    }
}

pub(crate) async fn dispatch(
    registry: &SharedRegistry,
    method: &str,
    params: &Value,
) -> Result<Value, RpcError> {
    match method {
        "list_pairs" => {
            let reg = registry.read().await;
            let pairs: Vec<Value> = reg
                .iter()
                .map(|p| {
                    let s = p.status();
                    json!({
                        "pair": p.id(),
                        "display": p.display_address(),
                        "phase": s.phase,
                        "health": s.health,
                        "desired": s.desired,
                    })
                })
                .collect();
            Ok(Value::Array(pairs))
        }
        "status" => {
            if params["pair"].is_string() {
                return to_json(resolve(registry, params).await?.status());
            }
            let reg = registry.read().await;
            to_json(reg.iter().map(PairController::status).collect::<Vec<_>>())
        }
        "events" => {
            let ctl = resolve(registry, params).await?;
            let limit = params["limit"]
                .as_u64()
                .map_or(EVENT_LOG_CAPACITY, |n| n as usize);
            to_json(ctl.events(limit))
        }
        "force_art" => to_json(resolve(registry, params).await?.force_art().await?),
        "force_source" => to_json(resolve(registry, params).await?.force_source().await?),
        "force_off" => to_json(resolve(registry, params).await?.force_off().await?),
        "resync" => to_json(resolve(registry, params).await?.resync_now().await?),
        "clear_override" => to_json(resolve(registry, params).await?.clear_override().await?),
        "clear_breaker" => {
            let was_open = resolve(registry, params).await?.clear_breaker().await?;
            Ok(json!({ "was_open": was_open }))
        }
        "repair_source" => {
            let requested = resolve(registry, params).await?.repair_source().await?;
            Ok(json!({ "requested": requested }))
        }
        _ => Err(RpcError::new(METHOD_NOT_FOUND, "method not found")),
    }
}
