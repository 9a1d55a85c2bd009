// Copyright 2025 Gauntlet Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Child-to-parent bookkeeping for multi-run tests.
//!
//! Dimensions like cross-run consistency cannot be scored per child: the
//! judge has to see all outputs together. The aggregator counts finished
//! children and reports readiness exactly once, when the last expected child
//! lands, regardless of completion order. A parent never completes from
//! execution alone; only its evaluation outcome can finish it.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Outcome of reporting a finished child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentReadiness {
    /// Some expected children have not finished yet.
    Pending,
    /// The last expected child just finished; evaluate the parent now.
    ReadyForEvaluation,
    /// Readiness was already reported for this parent.
    AlreadyDispatched,
}

struct ParentEntry {
    /// Expected run count, trusted from the first registered child.
    expected_total: usize,
    child_ids: Vec<String>,
    finished: HashSet<String>,
    dispatched: bool,
}

/// Maps child runs to their parent and decides evaluation readiness.
#[derive(Default)]
pub struct ParentAggregator {
    entries: Mutex<HashMap<String, ParentEntry>>,
}

impl ParentAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a child run under its parent.
    ///
    /// The first child's declared total is trusted; later declarations are
    /// ignored and children beyond the expected total are treated as extra
    /// evidence without raising the bar.
    pub fn register_child(&self, parent_id: &str, child_id: &str, declared_total: Option<usize>) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(parent_id.to_string()).or_insert_with(|| ParentEntry {
            expected_total: declared_total.unwrap_or(1),
            child_ids: Vec::new(),
            finished: HashSet::new(),
            dispatched: false,
        });
        if entry.child_ids.iter().any(|id| id == child_id) {
            return;
        }
        if entry.child_ids.len() >= entry.expected_total {
            warn!(
                parent_id,
                child_id,
                expected = entry.expected_total,
                "unexpected extra child run, keeping expected total"
            );
        }
        entry.child_ids.push(child_id.to_string());
    }

    /// Record that a child reached completed/failed.
    pub fn on_child_finished(&self, parent_id: &str, child_id: &str) -> ParentReadiness {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(parent_id) else {
            warn!(parent_id, child_id, "finished child for unknown parent");
            return ParentReadiness::Pending;
        };

        entry.finished.insert(child_id.to_string());
        if entry.dispatched {
            return ParentReadiness::AlreadyDispatched;
        }
        if entry.finished.len() >= entry.expected_total {
            entry.dispatched = true;
            debug!(
                parent_id,
                finished = entry.finished.len(),
                "all expected children finished, parent ready for evaluation"
            );
            ParentReadiness::ReadyForEvaluation
        } else {
            ParentReadiness::Pending
        }
    }

    /// Child ids registered under a parent, in registration order.
    pub fn child_ids(&self, parent_id: &str) -> Vec<String> {
        self.entries
            .lock()
            .get(parent_id)
            .map(|e| e.child_ids.clone())
            .unwrap_or_default()
    }

    pub fn expected_total(&self, parent_id: &str) -> Option<usize> {
        self.entries.lock().get(parent_id).map(|e| e.expected_total)
    }
}
