//! Backend transports.
//!
//! - [`StdioTransport`]: the backend is a child process speaking
//!   newline-delimited JSON-RPC on stdin/stdout.
//! - [`HttpTransport`](crate::http::HttpTransport): streamable HTTP.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use sb_domain::BackendDescriptor;

/// One JSON-RPC channel to a backend.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for the response carrying the same id.
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, TransportError>;

    /// Send a notification; nothing comes back.
    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    /// Release the connection. Safe to call more than once.
    async fn shutdown(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("backend process has exited")]
    ProcessExited,

    #[error("transport is closed")]
    Closed,

    #[error("timeout waiting for response")]
    Timeout,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Non-JSON stdout lines tolerated before the backend is declared broken.
const MAX_NOISE_LINES: usize = 1000;

/// How long a backend gets to exit after its stdin is closed.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// The child's pipes. Holding this lock for a whole request/response cycle
/// keeps concurrent callers from reading each other's responses.
struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub struct StdioTransport {
    backend: String,
    pipes: Mutex<Pipes>,
    child: Mutex<Child>,
    next_id: AtomicU64,
    alive: AtomicBool,
    timeout: Duration,
}

impl StdioTransport {
    /// Start the backend process described by `descriptor`.
    ///
    /// The child is killed if the transport is dropped without a
    /// [`shutdown`](McpTransport::shutdown).
    pub fn spawn(descriptor: &BackendDescriptor) -> Result<Self, TransportError> {
        let mut child = tokio::process::Command::new(&descriptor.command)
            .args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "child pipes were not captured",
            )));
        };

        // Drained so a chatty backend cannot block on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let backend = descriptor.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(backend = %backend, line = %line, "backend stderr");
                }
            });
        }

        tracing::debug!(backend = %descriptor.name, pid = ?child.id(), "backend process started");

        Ok(Self {
            backend: descriptor.name.clone(),
            pipes: Mutex::new(Pipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            timeout: Duration::from_secs(descriptor.timeout_secs),
        })
    }

    fn check_alive(&self) -> Result<(), TransportError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::ProcessExited)
        }
    }

    /// Read messages until the one answering `expected` shows up.
    /// Notifications and stray responses in between are dropped.
    async fn await_response(&self, pipes: &mut Pipes, expected: &RequestId) -> Result<JsonRpcResponse, TransportError> {
        loop {
            let Some(line) = read_message(&mut pipes.stdout, &self.backend).await? else {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::ProcessExited);
            };
            match serde_json::from_str::<JsonRpcResponse>(&line) {
                Ok(resp) if resp.id.as_ref() == Some(expected) => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(backend = %self.backend, %expected, got = ?resp.id, "skipping unrelated message");
                }
                Err(_) => {
                    tracing::trace!(backend = %self.backend, line = %line, "skipping non-response message");
                }
            }
        }
    }
}

/// Write one message followed by a newline.
async fn write_message(stdin: &mut ChildStdin, json: &str) -> std::io::Result<()> {
    stdin.write_all(json.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Next line that looks like a JSON object, or `None` at EOF.
///
/// Backends sometimes log to stdout; such lines are skipped, up to
/// [`MAX_NOISE_LINES`].
async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R, backend: &str) -> Result<Option<String>, TransportError> {
    let mut noise = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            return Ok(Some(trimmed.to_string()));
        }
        if trimmed.is_empty() {
            continue;
        }
        noise += 1;
        if noise >= MAX_NOISE_LINES {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "backend writes too much non-JSON output on stdout",
            )));
        }
        tracing::debug!(backend = %backend, line = %trimmed, "ignoring non-JSON stdout line");
    }
}

/// Close stdin, give the child [`EXIT_GRACE`] to exit, then kill it.
async fn stop_child(backend: &str, child: &mut Child, stdin: &mut ChildStdin) {
    if let Err(e) = stdin.shutdown().await {
        tracing::debug!(backend = %backend, error = %e, "closing backend stdin failed");
    }
    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(backend = %backend, ?status, "backend process exited"),
        Ok(Err(e)) => tracing::warn!(backend = %backend, error = %e, "waiting for backend process failed"),
        Err(_) => {
            tracing::warn!(backend = %backend, "backend process ignored stdin close, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(backend = %backend, error = %e, "failed to kill backend process");
            }
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, TransportError> {
        self.check_alive()?;
        let mut pipes = self.pipes.lock().await;

        let id = RequestId::from(self.next_id.fetch_add(1, Ordering::Relaxed));
        let json = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))?;
        tracing::debug!(backend = %self.backend, %id, method, "sending MCP request");

        write_message(&mut pipes.stdin, &json).await?;
        match tokio::time::timeout(self.timeout, self.await_response(&mut pipes, &id)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(backend = %self.backend, %id, method, "request timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        self.check_alive()?;
        let json = serde_json::to_string(&JsonRpcNotification::new(method))?;
        let mut pipes = self.pipes.lock().await;
        write_message(&mut pipes.stdin, &json).await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            // Already stopped, or the process died on its own; make sure.
            let _ = self.child.lock().await.start_kill();
            return;
        }
        let mut child = self.child.lock().await;
        // A request in flight holds the pipes until it answers or times
        // out; do not wait for it.
        match self.pipes.try_lock() {
            Ok(mut pipes) => stop_child(&self.backend, &mut child, &mut pipes.stdin).await,
            Err(_) => {
                tracing::debug!(backend = %self.backend, "request in flight, killing backend process");
                if let Err(e) = child.kill().await {
                    tracing::warn!(backend = %self.backend, error = %e, "failed to kill backend process");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_message_skips_log_noise() {
        let input = b"starting up...\n\n{\"jsonrpc\":\"2.0\",\"id\":1}\n";
        let mut reader = BufReader::new(&input[..]);
        let msg = read_message(&mut reader, "t").await.unwrap();
        assert_eq!(msg.as_deref(), Some("{\"jsonrpc\":\"2.0\",\"id\":1}"));
        assert_eq!(read_message(&mut reader, "t").await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_message_gives_up_on_endless_noise() {
        let input = "log line\n".repeat(MAX_NOISE_LINES + 1);
        let mut reader = BufReader::new(input.as_bytes());
        assert!(matches!(
            read_message(&mut reader, "t").await,
            Err(TransportError::Io(_))
        ));
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        /// A shell one-liner that answers every request line with a canned
        /// `tools/list` result carrying the request's id.
        fn echo_backend() -> BackendDescriptor {
            let mut d = BackendDescriptor::stdio("echo", "sh");
            d.args = vec![
                "-c".into(),
                r#"echo "booting"; while read line; do id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p'); if [ -n "$id" ]; then echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[]}}"; fi; done"#.into(),
            ];
            d.timeout_secs = 5;
            d
        }

        #[tokio::test]
        async fn request_round_trip_skips_noise() {
            let transport = StdioTransport::spawn(&echo_backend()).unwrap();
            let resp = transport.send_request("tools/list", None).await.unwrap();
            assert_eq!(resp.id, Some(RequestId::Number(1)));
            assert!(resp.into_result().unwrap()["tools"].is_array());

            let resp = transport.send_request("tools/list", None).await.unwrap();
            assert_eq!(resp.id, Some(RequestId::Number(2)));
            transport.shutdown().await;
            assert!(!transport.is_alive());
            assert!(matches!(
                transport.send_request("ping", None).await,
                Err(TransportError::ProcessExited)
            ));
        }

        #[tokio::test]
        async fn exited_process_reports_process_exited() {
            let mut d = BackendDescriptor::stdio("gone", "true");
            d.timeout_secs = 5;
            let transport = StdioTransport::spawn(&d).unwrap();
            let err = transport.send_request("ping", None).await.unwrap_err();
            assert!(matches!(err, TransportError::ProcessExited | TransportError::Io(_)));
        }

        #[tokio::test]
        async fn shutdown_does_not_wait_for_a_busy_backend() {
            let mut d = BackendDescriptor::stdio("mute", "sh");
            d.args = vec!["-c".into(), "cat > /dev/null".into()];
            d.timeout_secs = 60;
            let transport = std::sync::Arc::new(StdioTransport::spawn(&d).unwrap());

            let request = {
                let transport = transport.clone();
                tokio::spawn(async move { transport.send_request("tools/call", None).await })
            };
            while transport.pipes.try_lock().is_ok() {
                tokio::task::yield_now().await;
            }

            tokio::time::timeout(Duration::from_secs(5), transport.shutdown())
                .await
                .expect("shutdown waited for the in-flight request");
            let result = tokio::time::timeout(Duration::from_secs(5), request).await.unwrap().unwrap();
            assert!(matches!(result, Err(TransportError::ProcessExited | TransportError::Io(_))));
        }

        #[tokio::test]
        async fn spawn_missing_command_fails() {
            let d = BackendDescriptor::stdio("missing", "/definitely/not/a/binary");
            assert!(matches!(StdioTransport::spawn(&d), Err(TransportError::Io(_))));
        }
    }
}
