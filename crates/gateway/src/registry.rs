//! The backend registry: which backends are live, and the only place that
//! adds or withdraws tools from the [`Catalog`].
//!
//! Locking: one `parking_lot::Mutex` guards the backend map and every
//! catalog mutation it triggers, but it is never held across network I/O.
//! `connect_server` opens the session and lists tools outside the lock and
//! then publishes both under a short critical section, so a slow backend
//! cannot stall other registry operations. A per-name "connecting" marker
//! keeps a second concurrent connect of the same backend a no-op.
//! `reconcile` calls are serialized by an async gate so two reloads never
//! interleave.
//!
//! A session that is open but not in the map (listed but not yet
//! published, or withdrawn but not yet closed) is tracked as unsettled
//! until its owner finishes with it. If the owning future is dropped
//! midway, the session is closed in the background, and `shutdown` closes
//! whatever is still unsettled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;

use sb_domain::BackendDescriptor;
use sb_mcp_client::{BackendSession, Connector, McpError};

use crate::backend::describe_backend;
use crate::catalog::Catalog;

/// A live backend.
struct BackendEntry {
    descriptor: BackendDescriptor,
    session: Arc<dyn BackendSession>,
    tool_names: Vec<String>,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    backends: HashMap<String, BackendEntry>,
    connecting: HashSet<String>,
    unsettled: HashMap<u64, Arc<dyn BackendSession>>,
    next_ticket: u64,
    shutting_down: bool,
}

impl RegistryState {
    fn track(&mut self, session: Arc<dyn BackendSession>) -> u64 {
        self.next_ticket += 1;
        self.unsettled.insert(self.next_ticket, session);
        self.next_ticket
    }
}

/// Result of a successful [`Registry::connect_server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new session was opened and its tools published.
    Connected { tools: usize },
    /// The name was already registered; nothing was done.
    AlreadyConnected,
    /// Another connect for this name is in flight; nothing was done.
    InProgress,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("backend '{name}' failed to connect: {source}")]
    Connect {
        name: String,
        #[source]
        source: McpError,
    },

    #[error("registry is shutting down")]
    ShuttingDown,
}

/// Summary info returned by [`Registry::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub endpoint: String,
    pub tools: Vec<String>,
    pub alive: bool,
    pub connected_at: DateTime<Utc>,
}

/// What a [`Registry::reconcile`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Retained names whose endpoint changed and were reconnected.
    pub restarted: Vec<String>,
    /// `(name, error)` for every connect that failed.
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.restarted.is_empty() && self.failed.is_empty()
    }
}

/// Clears the connecting marker for a name on every exit path, including
/// the connect future being dropped.
struct ConnectingGuard<'a> {
    state: &'a Mutex<RegistryState>,
    name: String,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().connecting.remove(&self.name);
    }
}

/// Owns an unsettled ticket. Dropped while still armed, it closes the
/// session on a background task and then forgets the ticket.
struct Unsettled {
    state: Arc<Mutex<RegistryState>>,
    ticket: u64,
    armed: bool,
}

impl Unsettled {
    fn new(state: &Arc<Mutex<RegistryState>>, ticket: u64) -> Self {
        Self {
            state: state.clone(),
            ticket,
            armed: true,
        }
    }

    /// The session has been closed or published; forget the ticket.
    fn settle(mut self) {
        self.armed = false;
        self.state.lock().unsettled.remove(&self.ticket);
    }

    /// Like [`settle`](Self::settle), for callers already holding the lock.
    fn settle_locked(&mut self, state: &mut RegistryState) {
        self.armed = false;
        state.unsettled.remove(&self.ticket);
    }
}

impl Drop for Unsettled {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(session) = self.state.lock().unsettled.get(&self.ticket).cloned() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        tracing::debug!(backend = %session.name(), "closing session abandoned mid-operation");
        let state = self.state.clone();
        let ticket = self.ticket;
        runtime.spawn(async move {
            session.close().await;
            state.lock().unsettled.remove(&ticket);
        });
    }
}

pub struct Registry {
    connector: Arc<dyn Connector>,
    catalog: Arc<Catalog>,
    state: Arc<Mutex<RegistryState>>,
    reconcile_gate: tokio::sync::Mutex<()>,
}

impl Registry {
    pub fn new(connector: Arc<dyn Connector>, catalog: Arc<Catalog>) -> Self {
        Self {
            connector,
            catalog,
            state: Arc::new(Mutex::new(RegistryState::default())),
            reconcile_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Connect a backend and expose its tools under `{name}-{tool}`.
    ///
    /// Idempotent: a name that is already registered (or being connected)
    /// is left alone. On failure nothing is registered and any session that
    /// was opened has been closed.
    pub async fn connect_server(&self, descriptor: &BackendDescriptor) -> Result<ConnectOutcome, RegistryError> {
        let name = descriptor.name.clone();

        let _guard = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return Err(RegistryError::ShuttingDown);
            }
            if state.backends.contains_key(&name) {
                return Ok(ConnectOutcome::AlreadyConnected);
            }
            if !state.connecting.insert(name.clone()) {
                return Ok(ConnectOutcome::InProgress);
            }
            ConnectingGuard {
                state: &self.state,
                name: name.clone(),
            }
        };

        let connect_error = |source| RegistryError::Connect {
            name: name.clone(),
            source,
        };
        let session = self.connector.connect(descriptor).await.map_err(connect_error)?;
        let ticket = self.state.lock().track(session.clone());
        let mut unsettled = Unsettled::new(&self.state, ticket);

        let capabilities = match describe_backend(descriptor, &session).await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                session.close().await;
                unsettled.settle();
                return Err(connect_error(e));
            }
        };

        let published = {
            let mut state = self.state.lock();
            if state.shutting_down {
                Err(RegistryError::ShuttingDown)
            } else if state.backends.contains_key(&name) {
                Ok(None)
            } else {
                unsettled.settle_locked(&mut state);
                let tool_names = self.catalog.insert_all(capabilities);
                let count = tool_names.len();
                state.backends.insert(
                    name.clone(),
                    BackendEntry {
                        descriptor: descriptor.clone(),
                        session: session.clone(),
                        tool_names,
                        connected_at: Utc::now(),
                    },
                );
                Ok(Some(count))
            }
        };

        let tool_count = match published {
            Ok(Some(count)) => count,
            Ok(None) => {
                session.close().await;
                unsettled.settle();
                return Ok(ConnectOutcome::AlreadyConnected);
            }
            Err(e) => {
                session.close().await;
                unsettled.settle();
                return Err(e);
            }
        };

        tracing::info!(backend = %name, tools = tool_count, "backend connected");
        Ok(ConnectOutcome::Connected { tools: tool_count })
    }

    /// Withdraw a backend's tools, then close its session. Returns `false`
    /// if the name was not registered.
    ///
    /// Calls already dispatched to the backend may still race with the
    /// close and fail; new calls can no longer be routed to it.
    pub async fn disconnect_server(&self, name: &str) -> bool {
        let (entry, unsettled) = {
            let mut state = self.state.lock();
            let Some(entry) = state.backends.remove(name) else {
                return false;
            };
            self.catalog.remove_backend(name);
            let ticket = state.track(entry.session.clone());
            (entry, Unsettled::new(&self.state, ticket))
        };

        entry.session.close().await;
        unsettled.settle();
        tracing::info!(
            backend = %name,
            tools = entry.tool_names.len(),
            "backend disconnected"
        );
        true
    }

    /// Converge the live backend set on `descriptors`.
    ///
    /// Names no longer listed are disconnected; new names are connected.
    /// A retained name whose endpoint changed is reconnected. Connect
    /// failures are logged and reported, never returned as an error.
    pub async fn reconcile(&self, descriptors: Vec<BackendDescriptor>) -> ReconcileReport {
        let _gate = self.reconcile_gate.lock().await;

        let mut wanted: Vec<BackendDescriptor> = Vec::with_capacity(descriptors.len());
        for d in descriptors {
            if wanted.iter().any(|w| w.name == d.name) {
                tracing::warn!(backend = %d.name, "duplicate backend name in reconcile, keeping the first");
                continue;
            }
            wanted.push(d);
        }

        let (to_remove, to_restart, to_add) = {
            let state = self.state.lock();
            let wanted_names: HashSet<&str> = wanted.iter().map(|d| d.name.as_str()).collect();

            let mut to_remove: Vec<String> = state
                .backends
                .keys()
                .filter(|name| !wanted_names.contains(name.as_str()))
                .cloned()
                .collect();
            to_remove.sort();

            let mut to_restart = Vec::new();
            let mut to_add = Vec::new();
            for d in &wanted {
                match state.backends.get(&d.name) {
                    None => to_add.push(d.clone()),
                    Some(entry) if !entry.descriptor.same_endpoint(d) => {
                        to_restart.push(d.name.clone());
                        to_add.push(d.clone());
                    }
                    Some(_) => {}
                }
            }
            (to_remove, to_restart, to_add)
        };

        let mut report = ReconcileReport::default();

        for name in to_remove {
            if self.disconnect_server(&name).await {
                report.removed.push(name);
            }
        }
        for name in &to_restart {
            tracing::info!(backend = %name, "endpoint changed, reconnecting");
            self.disconnect_server(name).await;
        }

        let results = join_all(to_add.iter().map(|d| self.connect_server(d))).await;
        for (d, result) in to_add.iter().zip(results) {
            match result {
                Ok(ConnectOutcome::Connected { .. }) if to_restart.contains(&d.name) => {
                    report.restarted.push(d.name.clone());
                }
                Ok(ConnectOutcome::Connected { .. }) => report.added.push(d.name.clone()),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(backend = %d.name, error = %e, "backend failed to connect during reconcile, skipping");
                    report.failed.push((d.name.clone(), e.to_string()));
                }
            }
        }

        if report.is_noop() {
            tracing::debug!("reconcile: backends unchanged");
        } else {
            tracing::info!(
                added = report.added.len(),
                removed = report.removed.len(),
                restarted = report.restarted.len(),
                failed = report.failed.len(),
                backends = self.len(),
                tools = self.catalog.len(),
                "reconcile complete"
            );
            for status in self.snapshot() {
                tracing::debug!(
                    backend = %status.name,
                    endpoint = %status.endpoint,
                    tools = status.tools.len(),
                    alive = status.alive,
                    connected_at = %status.connected_at,
                    "backend status"
                );
            }
        }
        report
    }

    /// Close every live session, including any left unsettled by an
    /// abandoned connect or disconnect. Further connects are refused.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<dyn BackendSession>> = {
            let mut state = self.state.lock();
            state.shutting_down = true;
            let names: Vec<String> = state.backends.keys().cloned().collect();
            for name in &names {
                self.catalog.remove_backend(name);
            }
            let mut sessions: Vec<Arc<dyn BackendSession>> = state.backends.drain().map(|(_, e)| e.session).collect();
            sessions.extend(state.unsettled.drain().map(|(_, s)| s));
            sessions
        };

        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "closing backend sessions");
        join_all(sessions.iter().map(|s| s.close())).await;
    }

    /// Live backends, ordered by name.
    pub fn snapshot(&self) -> Vec<BackendStatus> {
        let state = self.state.lock();
        let mut out: Vec<BackendStatus> = state
            .backends
            .iter()
            .map(|(name, e)| BackendStatus {
                name: name.clone(),
                endpoint: e.descriptor.endpoint().to_string(),
                tools: e.tool_names.clone(),
                alive: e.session.is_alive(),
                connected_at: e.connected_at,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Names of the live backends, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().backends.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().backends.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.state.lock().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().backends.is_empty()
    }
}
