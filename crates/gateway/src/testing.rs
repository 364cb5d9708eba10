//! In-memory backends for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use sb_domain::BackendDescriptor;
use sb_mcp_client::protocol::McpToolDef;
use sb_mcp_client::{BackendSession, Connector, McpError, TransportError};

pub(crate) fn tool(name: &str) -> McpToolDef {
    McpToolDef {
        name: name.to_string(),
        description: format!("{name} tool"),
        input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        annotations: None,
    }
}

/// A backend session that echoes calls back and records them.
pub(crate) struct FakeBackend {
    name: String,
    tools: Vec<McpToolDef>,
    fail_list: bool,
    call_delay: Option<Duration>,
    list_delay: Option<Duration>,
    close_delay: Option<Duration>,
    calls: Mutex<Vec<(String, Value)>>,
    closed: AtomicBool,
}

impl FakeBackend {
    pub(crate) fn new(name: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: tools.iter().map(|t| tool(t)).collect(),
            fail_list: false,
            call_delay: None,
            list_delay: None,
            close_delay: None,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// What [`FakeBackend::call_tool`] returns for a call.
    pub(crate) fn result_for(backend: &str, local: &str, args: &Value) -> Value {
        serde_json::json!({
            "content": [{ "type": "text", "text": format!("{backend}:{local}") }],
            "structuredContent": { "echo": args },
        })
    }
}

#[async_trait]
impl BackendSession for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_list {
            return Err(McpError::Protocol("tools/list exploded".into()));
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, local_name: &str, arguments: Value) -> Result<Value, McpError> {
        if self.is_closed() {
            return Err(McpError::SessionClosed(self.name.clone()));
        }
        self.calls.lock().push((local_name.to_string(), arguments.clone()));
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Self::result_for(&self.name, local_name, &arguments))
    }

    fn is_alive(&self) -> bool {
        !self.is_closed()
    }

    async fn close(&self) {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
enum Behaviour {
    Tools(Vec<String>),
    FailConnect,
    FailList,
}

/// A connector that hands out [`FakeBackend`]s by descriptor name.
/// Names it was not told about fail to connect.
#[derive(Default)]
pub(crate) struct FakeConnector {
    behaviours: Mutex<HashMap<String, Behaviour>>,
    opened: Mutex<Vec<Arc<FakeBackend>>>,
    attempts: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    call_delay: Mutex<Option<Duration>>,
    list_delay: Mutex<Option<Duration>>,
    close_delay: Mutex<Option<Duration>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_backend(self, name: &str, tools: &[&str]) -> Self {
        self.set_backend(name, tools);
        self
    }

    pub(crate) fn set_backend(&self, name: &str, tools: &[&str]) {
        self.behaviours.lock().insert(
            name.to_string(),
            Behaviour::Tools(tools.iter().map(|t| t.to_string()).collect()),
        );
    }

    pub(crate) fn failing_connect(self, name: &str) -> Self {
        self.behaviours.lock().insert(name.to_string(), Behaviour::FailConnect);
        self
    }

    pub(crate) fn failing_list(self, name: &str) -> Self {
        self.behaviours.lock().insert(name.to_string(), Behaviour::FailList);
        self
    }

    pub(crate) fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    /// Make every tool call on sessions opened from now on take `delay`.
    pub(crate) fn with_call_delay(self, delay: Duration) -> Self {
        *self.call_delay.lock() = Some(delay);
        self
    }

    /// Make `tools/list` on sessions opened from now on take `delay`.
    pub(crate) fn with_list_delay(self, delay: Duration) -> Self {
        *self.list_delay.lock() = Some(delay);
        self
    }

    /// Make `close` on sessions opened from now on take `delay`.
    pub(crate) fn with_close_delay(self, delay: Duration) -> Self {
        *self.close_delay.lock() = Some(delay);
        self
    }

    /// Connect attempts made so far.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Every session handed out so far, oldest first.
    pub(crate) fn opened(&self) -> Vec<Arc<FakeBackend>> {
        self.opened.lock().clone()
    }

    pub(crate) fn opened_named(&self, name: &str) -> Vec<Arc<FakeBackend>> {
        self.opened().into_iter().filter(|b| b.name == name).collect()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, descriptor: &BackendDescriptor) -> Result<Arc<dyn BackendSession>, McpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let behaviour = self.behaviours.lock().get(&descriptor.name).cloned();
        let backend = match behaviour {
            Some(Behaviour::Tools(tools)) => {
                let names: Vec<&str> = tools.iter().map(String::as_str).collect();
                FakeBackend::new(&descriptor.name, &names)
            }
            Some(Behaviour::FailList) => {
                let mut b = FakeBackend::new(&descriptor.name, &[]);
                b.fail_list = true;
                b
            }
            Some(Behaviour::FailConnect) | None => {
                return Err(McpError::Transport(TransportError::ProcessExited));
            }
        };

        let mut backend = backend;
        backend.call_delay = *self.call_delay.lock();
        backend.list_delay = *self.list_delay.lock();
        backend.close_delay = *self.close_delay.lock();
        let backend = Arc::new(backend);
        self.opened.lock().push(backend.clone());
        Ok(backend)
    }
}

pub(crate) fn descriptor(name: &str) -> BackendDescriptor {
    BackendDescriptor::http(name, format!("http://{name}.test/mcp"))
}
