//! Registry of open package sessions.
//!
//! Each session is one open package handle, keyed by the caller-chosen
//! correlation id. The registry enforces at most one live handle per id:
//! installing a handle for an id that already has one closes the previous
//! handle first, and closing is always idempotent.

use std::collections::HashMap;

use tracing::debug;

use crate::package::Package;
use crate::protocol::CorrelationId;

/// The worker's map of open package handles.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<CorrelationId, Box<dyn Package>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a handle for `id`, fully releasing any previous handle for
    /// the same id before the new one becomes visible.
    pub fn install(&mut self, id: impl Into<CorrelationId>, package: Box<dyn Package>) {
        let id = id.into();
        if let Some(mut previous) = self.sessions.remove(&id) {
            debug!(id = %id, "Closing previous handle before re-open");
            previous.close();
        }
        self.sessions.insert(id, package);
    }

    /// The open handle for `id`, if any.
    pub fn get(&self, id: &str) -> Option<&dyn Package> {
        self.sessions.get(id).map(|p| p.as_ref())
    }

    /// Mutable access to the open handle for `id`, if any.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Box<dyn Package>> {
        self.sessions.get_mut(id)
    }

    /// Closes and removes the handle for `id`. Closing an unopened or
    /// already-closed id is a no-op, not an error.
    pub fn close(&mut self, id: &str) {
        if let Some(mut package) = self.sessions.remove(id) {
            debug!(id = %id, "Closing session");
            package.close();
        }
    }

    /// Closes every open handle. Used when the worker shuts down.
    pub fn close_all(&mut self) {
        for (id, mut package) in self.sessions.drain() {
            debug!(id = %id, "Closing session on shutdown");
            package.close();
        }
    }

    /// True when a handle is open for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no sessions are open.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
