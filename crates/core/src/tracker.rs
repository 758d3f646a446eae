use std::collections::HashSet;
use tracing::debug;

/// Reference count of in-flight function calls, keyed by call id.
#[derive(Debug, Default, Clone)]
pub struct FunctionCallTracker {
    active: HashSet<String>,
}

impl FunctionCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the id was already in flight.
    pub fn start(&mut self, id: &str) -> bool {
        let inserted = self.active.insert(id.to_string());
        if !inserted {
            debug!(call_id = id, "duplicate function call start ignored");
        }
        inserted
    }

    /// Completing an id that is not in flight is a no-op and returns `false`.
    pub fn complete(&mut self, id: &str) -> bool {
        let removed = self.active.remove(id);
        if !removed {
            debug!(call_id = id, "completion for unknown function call ignored");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains(id)
    }

    /// Drops every in-flight call and returns their ids, sorted.
    pub fn abandon_all(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.drain().collect();
        ids.sort();
        ids
    }
}
