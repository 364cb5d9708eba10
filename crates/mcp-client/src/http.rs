//! Streamable HTTP transport.
//!
//! Every JSON-RPC message is POSTed to the backend URL. The backend answers
//! either with a plain JSON body or with an SSE stream carrying the
//! response as one of its `data:` events. The `Mcp-Session-Id` header
//! handed out during `initialize` is echoed on every later request.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::transport::{McpTransport, TransportError};
use sb_domain::BackendDescriptor;

const SESSION_HEADER: &str = "mcp-session-id";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

pub struct HttpTransport {
    backend: String,
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(descriptor: &BackendDescriptor) -> Result<Self, TransportError> {
        let url = descriptor
            .url
            .clone()
            .ok_or_else(|| TransportError::Http("http backend has no url".into()))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &descriptor.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| TransportError::Http(format!("invalid header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Http(format!("invalid value for header '{key}': {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(descriptor.timeout_secs))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self {
            backend: descriptor.name.clone(),
            client,
            url,
            headers,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_BOTH));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(sid) = self.session_id.lock().as_deref() {
            if let Ok(v) = HeaderValue::from_str(sid) {
                headers.insert(SESSION_HEADER, v);
            }
        }
        headers
    }

    async fn post(&self, body: String) -> Result<reqwest::Response, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let resp = self
            .client
            .post(&self.url)
            .headers(self.request_headers())
            .body(body)
            .send()
            .await
            .map_err(map_reqwest)?;

        if let Some(sid) = resp.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut current = self.session_id.lock();
            if current.as_deref() != Some(sid) {
                tracing::debug!(backend = %self.backend, session_id = %sid, "MCP session id assigned");
                *current = Some(sid.to_string());
            }
        }

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND && self.session_id.lock().is_some() {
            // The backend forgot our session; a fresh connect is needed.
            self.alive.store(false, Ordering::SeqCst);
            return Err(TransportError::Http("MCP session expired (404)".into()));
        }
        if !status.is_success() {
            return Err(TransportError::Http(format!("{} returned {status}", self.url)));
        }
        Ok(resp)
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(e.to_string())
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let expected = RequestId::from(id);
        let req = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_string(&req)?;

        tracing::debug!(backend = %self.backend, id, method, "sending MCP request");
        let resp = self.post(body).await?;

        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if !is_sse {
            let bytes = resp.bytes().await.map_err(map_reqwest)?;
            return Ok(serde_json::from_slice::<JsonRpcResponse>(&bytes)?);
        }

        let mut stream = resp.bytes_stream();
        let mut parser = SseParser::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest)?;
            for data in parser.push(&chunk) {
                if let Some(found) = match_response(&data, &expected) {
                    return Ok(found);
                }
            }
        }
        for data in parser.finish() {
            if let Some(found) = match_response(&data, &expected) {
                return Ok(found);
            }
        }
        Err(TransportError::Http(format!(
            "event stream ended without a response to request {id}"
        )))
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let body = serde_json::to_string(&JsonRpcNotification::new(method))?;
        tracing::debug!(backend = %self.backend, method, "sending MCP notification");
        self.post(body).await.map(|_| ())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let sid = self.session_id.lock().take();
        let Some(sid) = sid else { return };
        let result = self
            .client
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, sid)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(backend = %self.backend, error = %e, "MCP session delete failed");
        }
    }
}

/// Parse one SSE `data` payload and return it if it answers `expected`.
fn match_response(data: &str, expected: &RequestId) -> Option<JsonRpcResponse> {
    let resp = serde_json::from_str::<JsonRpcResponse>(data).ok()?;
    (resp.id.as_ref() == Some(expected)).then_some(resp)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE framing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Incremental `text/event-stream` decoder yielding each event's data.
///
/// Bytes are buffered until a full line is available, so a UTF-8 sequence
/// split across network chunks is decoded intact.
#[derive(Default)]
pub(crate) struct SseParser {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed raw bytes; returns the data of every event completed by them.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.take_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    fn take_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                events.push(self.data.join("\n"));
                self.data.clear();
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // `event:`, `id:`, `retry:` and comments carry nothing we need.
    }

    /// Flush a trailing event not terminated by a blank line.
    pub(crate) fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buf.is_empty() {
            let raw = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&raw);
            self.take_line(line.trim_end_matches('\r'), &mut events);
        }
        if !self.data.is_empty() {
            events.push(std::mem::take(&mut self.data).join("\n"));
        }
        events
    }
}
