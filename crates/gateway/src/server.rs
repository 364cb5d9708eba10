//! The gateway's own MCP server role.
//!
//! Callers see the union of every connected backend's tools, renamed
//! `{backend}-{tool}`. Each `tools/call` is looked up in the [`Catalog`] and
//! relayed through the tool's forwarding handler; the backend's result goes
//! back to the caller untouched.
//!
//! Framing is newline-delimited JSON-RPC over stdio or over TCP (one
//! session per connection).

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use sb_domain::config::{ServerConfig, ServerTransport};
use sb_mcp_client::protocol::{
    codes, Implementation, InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcResponse, McpToolDef,
    RequestId, ToolCallResult, ToolsListResult, PROTOCOL_VERSION,
};

use crate::catalog::Catalog;

const OUTBOUND_QUEUE: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Method handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Params of `tools/call`.
#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

pub struct GatewayServer {
    catalog: Arc<Catalog>,
}

impl GatewayServer {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn handle_initialize(&self, id: RequestId, params: Option<&Value>) -> JsonRpcResponse {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        if let Some(requested) = requested {
            if requested != PROTOCOL_VERSION {
                tracing::debug!(
                    requested,
                    supported = PROTOCOL_VERSION,
                    "client asked for another protocol version"
                );
            }
        }

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: json!({ "tools": { "listChanged": true } }),
            server_info: Implementation::switchboard(),
            instructions: None,
        };
        respond(id, &result)
    }

    pub fn handle_tools_list(&self, id: RequestId) -> JsonRpcResponse {
        let tools: Vec<McpToolDef> = self.catalog.list().iter().map(|c| c.to_tool_def()).collect();
        respond(
            id,
            &ToolsListResult {
                tools,
                next_cursor: None,
            },
        )
    }

    /// Route one call by qualified name.
    ///
    /// An unknown name is a protocol error. A backend failure is reported
    /// inside a successful response as an `isError` result, so the caller's
    /// model can see it.
    pub async fn handle_tools_call(&self, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        let params: CallParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(p)) => p,
            Ok(None) => {
                return JsonRpcResponse::failure(
                    Some(id),
                    JsonRpcError::new(codes::INVALID_PARAMS, "tools/call needs params"),
                )
            }
            Err(e) => {
                return JsonRpcResponse::failure(
                    Some(id),
                    JsonRpcError::new(codes::INVALID_PARAMS, format!("invalid tools/call params: {e}")),
                )
            }
        };

        let Some(capability) = self.catalog.get(&params.name) else {
            return JsonRpcResponse::failure(
                Some(id),
                JsonRpcError::new(codes::INVALID_PARAMS, format!("unknown tool: {}", params.name)),
            );
        };

        let arguments = params.arguments.unwrap_or_else(|| json!({}));
        let started = std::time::Instant::now();
        match capability.handler.invoke(arguments).await {
            Ok(result) => {
                tracing::debug!(
                    tool = %params.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool call forwarded"
                );
                JsonRpcResponse::success(id, result)
            }
            Err(e) => {
                tracing::warn!(
                    tool = %params.name,
                    backend = %capability.backend(),
                    error = %e,
                    "tool call failed"
                );
                respond(id, &ToolCallResult::error_text(e.to_string()))
            }
        }
    }

    /// Answer one request. `tools/call` is awaited inline here; the
    /// connection loop runs it on its own task instead.
    pub async fn handle_request(&self, id: RequestId, method: &str, params: Option<Value>) -> JsonRpcResponse {
        match method {
            "initialize" => self.handle_initialize(id, params.as_ref()),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => self.handle_tools_list(id),
            "tools/call" => self.handle_tools_call(id, params).await,
            other => JsonRpcResponse::failure(
                Some(id),
                JsonRpcError::new(codes::METHOD_NOT_FOUND, format!("method not found: {other}")),
            ),
        }
    }
}

fn respond<T: serde::Serialize>(id: RequestId, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::failure(Some(id), JsonRpcError::new(codes::INTERNAL_ERROR, e.to_string())),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Any inbound message before it is classified.
#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

/// Per-connection state shared with the call tasks.
struct Connection {
    out: mpsc::Sender<String>,
    in_flight: Arc<Mutex<HashMap<RequestId, AbortHandle>>>,
    initialized: bool,
}

impl Connection {
    async fn send<T: serde::Serialize>(&self, message: &T) {
        send_line(&self.out, message).await;
    }
}

async fn send_line<T: serde::Serialize>(out: &mpsc::Sender<String>, message: &T) {
    match serde_json::to_string(message) {
        // A closed channel means the writer is gone; nothing left to tell.
        Ok(line) => {
            let _ = out.send(line).await;
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize outbound message"),
    }
}

/// Serve one MCP session over a byte stream until EOF or `shutdown`.
///
/// Requests other than `tools/call` are answered in order. Each
/// `tools/call` runs on its own task so a slow backend does not hold up the
/// session, and `notifications/cancelled` aborts it.
pub async fn serve_connection<R, W>(
    server: Arc<GatewayServer>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = out_rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, io::Error>(())
    });

    let mut conn = Connection {
        out: out_tx,
        in_flight: Arc::new(Mutex::new(HashMap::new())),
        initialized: false,
    };
    let mut changes = server.catalog.subscribe();
    let mut changes_open = true;
    let mut lines = BufReader::new(reader).lines();

    let result = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break Ok(()),
            line = lines.next_line() => match line {
                Ok(Some(line)) => dispatch(&server, &mut conn, &line).await,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
            change = changes.recv(), if changes_open => match change {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if conn.initialized {
                        conn.send(&JsonRpcNotification::new("notifications/tools/list_changed")).await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => changes_open = false,
            },
        }
    };

    for (_, task) in conn.in_flight.lock().drain() {
        task.abort();
    }
    drop(conn);
    match writer_task.await {
        Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => {
            tracing::debug!(error = %e, "connection writer failed");
        }
        _ => {}
    }
    result
}

async fn dispatch(server: &Arc<GatewayServer>, conn: &mut Connection, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let message: Incoming = match serde_json::from_str(line) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "unparsable message");
            conn.send(&JsonRpcResponse::failure(
                None,
                JsonRpcError::new(codes::PARSE_ERROR, format!("parse error: {e}")),
            ))
            .await;
            return;
        }
    };

    match (message.id, message.method) {
        (Some(id), Some(method)) => handle_request(server, conn, id, method, message.params).await,
        (None, Some(method)) => handle_notification(conn, &method, message.params),
        (Some(id), None) => {
            // Responses to requests we never send, or a malformed request.
            tracing::trace!(%id, "ignoring message without a method");
        }
        (None, None) => {
            conn.send(&JsonRpcResponse::failure(
                None,
                JsonRpcError::new(codes::INVALID_REQUEST, "message has neither id nor method"),
            ))
            .await;
        }
    }
}

async fn handle_request(
    server: &Arc<GatewayServer>,
    conn: &mut Connection,
    id: RequestId,
    method: String,
    params: Option<Value>,
) {
    if method != "tools/call" {
        let response = server.handle_request(id, &method, params).await;
        if method == "initialize" && !response.is_error() {
            conn.initialized = true;
        }
        conn.send(&response).await;
        return;
    }

    let server = server.clone();
    let out = conn.out.clone();
    let in_flight = conn.in_flight.clone();
    let task_id = id.clone();

    // Hold the map while spawning so the task cannot finish and remove its
    // entry before the entry exists.
    let mut tasks = conn.in_flight.lock();
    let handle = tokio::spawn(async move {
        let response = server.handle_tools_call(task_id.clone(), params).await;
        in_flight.lock().remove(&task_id);
        send_line(&out, &response).await;
    });
    tasks.insert(id, handle.abort_handle());
}

fn handle_notification(conn: &mut Connection, method: &str, params: Option<Value>) {
    match method {
        "notifications/cancelled" => {
            let request_id = params
                .and_then(|p| p.get("requestId").cloned())
                .and_then(|v| serde_json::from_value::<RequestId>(v).ok());
            let Some(request_id) = request_id else {
                tracing::debug!("cancel notification without a usable requestId");
                return;
            };
            if let Some(task) = conn.in_flight.lock().remove(&request_id) {
                task.abort();
                tracing::debug!(request = %request_id, "tool call cancelled by client");
            }
        }
        "notifications/initialized" => {}
        other => tracing::trace!(method = other, "ignoring notification"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transports
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serve a single session on the process's stdin/stdout.
pub async fn serve_stdio(server: Arc<GatewayServer>, shutdown: CancellationToken) -> io::Result<()> {
    tracing::info!("serving MCP on stdio");
    serve_connection(server, tokio::io::stdin(), tokio::io::stdout(), shutdown).await
}

/// Accept TCP connections until `shutdown`, one session each.
pub async fn serve_tcp(server: Arc<GatewayServer>, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "serving MCP on tcp");
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tracing::debug!(%peer, "client connected");
                let (reader, writer) = stream.into_split();
                let server = server.clone();
                let token = shutdown.child_token();
                sessions.spawn(async move {
                    if let Err(e) = serve_connection(server, reader, writer, token).await {
                        tracing::debug!(%peer, error = %e, "client session ended with error");
                    }
                    tracing::debug!(%peer, "client disconnected");
                });
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    while sessions.join_next().await.is_some() {}
    Ok(())
}

/// Serve on whichever transport `config` selects.
pub async fn serve(server: Arc<GatewayServer>, config: &ServerConfig, shutdown: CancellationToken) -> io::Result<()> {
    match config.transport {
        ServerTransport::Stdio => serve_stdio(server, shutdown).await,
        ServerTransport::Tcp => {
            let listener = TcpListener::bind(&config.listen).await?;
            serve_tcp(server, listener, shutdown).await
        }
    }
}
