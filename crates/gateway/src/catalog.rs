//! The gateway's exposed tool set.
//!
//! Readers (the MCP server) and writers (the registry) share one
//! [`Catalog`]. Lookups hand out `Arc`s so a call keeps its handler even if
//! the tool is removed while the call is running.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::backend::CapabilityDescriptor;

/// Thread-safe map of qualified tool name → capability.
pub struct Catalog {
    tools: RwLock<BTreeMap<String, Arc<CapabilityDescriptor>>>,
    changes: broadcast::Sender<()>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            tools: RwLock::new(BTreeMap::new()),
            changes,
        }
    }

    /// Expose `capabilities`. A qualified name already owned by another
    /// backend is left alone and the newcomer skipped. Returns the names
    /// that were inserted.
    pub fn insert_all(&self, capabilities: Vec<CapabilityDescriptor>) -> Vec<String> {
        let mut inserted = Vec::with_capacity(capabilities.len());
        {
            let mut tools = self.tools.write();
            for cap in capabilities {
                if let Some(existing) = tools.get(&cap.qualified_name) {
                    if existing.backend() != cap.backend() {
                        tracing::warn!(
                            tool = %cap.qualified_name,
                            owner = %existing.backend(),
                            backend = %cap.backend(),
                            "qualified tool name already taken, skipping"
                        );
                        continue;
                    }
                }
                inserted.push(cap.qualified_name.clone());
                tools.insert(cap.qualified_name.clone(), Arc::new(cap));
            }
        }
        if !inserted.is_empty() {
            self.notify();
        }
        inserted
    }

    /// Hide every tool owned by `backend`. Returns how many were removed.
    pub fn remove_backend(&self, backend: &str) -> usize {
        let removed = {
            let mut tools = self.tools.write();
            let before = tools.len();
            tools.retain(|_, cap| cap.backend() != backend);
            before - tools.len()
        };
        if removed > 0 {
            tracing::debug!(backend = %backend, removed, "tools withdrawn");
            self.notify();
        }
        removed
    }

    pub fn get(&self, qualified_name: &str) -> Option<Arc<CapabilityDescriptor>> {
        self.tools.read().get(qualified_name).cloned()
    }

    /// All exposed tools, ordered by qualified name.
    pub fn list(&self) -> Vec<Arc<CapabilityDescriptor>> {
        self.tools.read().values().cloned().collect()
    }

    /// Qualified names of the tools `backend` contributed.
    pub fn names_for(&self, backend: &str) -> Vec<String> {
        self.tools
            .read()
            .values()
            .filter(|cap| cap.backend() == backend)
            .map(|cap| cap.qualified_name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    /// Receive a `()` after every change to the exposed set.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        // No subscribers is fine.
        let _ = self.changes.send(());
    }
}
