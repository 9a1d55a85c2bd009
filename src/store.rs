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

//! In-memory state store for test records and aggregate metrics.
//!
//! The store is the single shared mutable resource of the engine: every
//! mutation funnels through [`StateStore::update`], records are never deleted
//! except by [`StateStore::reset`], and observers receive synchronous
//! notifications in registration order. A panicking listener is isolated from
//! the others and from the store itself.

use crate::types::{Dimension, EvalCriterion, TestSpec, TestStatus, UsageTotals};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Separator between a parent id and a child's run index.
pub const RUN_SUFFIX: &str = "-run-";

/// Split `id` into `(parent_id, run_index)` if it carries a run suffix.
pub fn split_run_suffix(id: &str) -> Option<(&str, usize)> {
    let pos = id.rfind(RUN_SUFFIX)?;
    let run = id[pos + RUN_SUFFIX.len()..].parse().ok()?;
    Some((&id[..pos], run))
}

/// One tracked test, single or multi-run.
///
/// A record with `run_index` set is a child run; its id is the parent id plus
/// a run suffix. The parent itself may have no backing record until the
/// moment evaluation requires one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: String,
    pub owner: String,
    pub dimension: Dimension,
    pub input_index: usize,
    pub run_index: Option<usize>,
    pub input: serde_json::Value,
    pub status: TestStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub evaluation_started_at: Option<DateTime<Utc>>,
    pub evaluation_ended_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub score: Option<f64>,
    pub passed: Option<bool>,
    pub explanation: Option<String>,
    pub first_unmet_criterion: Option<String>,
    pub usage: UsageTotals,
    pub api_calls: u64,
    pub cache_hits: u64,
    pub llm_calls: u64,
    pub criteria: Vec<EvalCriterion>,
    pub is_multi_run: bool,
    pub total_runs: Option<usize>,
    pub is_parent: bool,
    pub visible_in_queue: bool,
    pub from_cache: bool,
}

impl TestRecord {
    fn new(
        id: String,
        owner: String,
        dimension: Dimension,
        input_index: usize,
        input: serde_json::Value,
        run_index: Option<usize>,
    ) -> Self {
        Self {
            id,
            owner,
            dimension,
            input_index,
            run_index,
            input,
            status: TestStatus::Queued,
            started_at: None,
            ended_at: None,
            evaluation_started_at: None,
            evaluation_ended_at: None,
            latency_ms: None,
            output: None,
            error: None,
            score: None,
            passed: None,
            explanation: None,
            first_unmet_criterion: None,
            usage: UsageTotals::default(),
            api_calls: 0,
            cache_hits: 0,
            llm_calls: 0,
            criteria: Vec::new(),
            is_multi_run: run_index.is_some(),
            total_runs: None,
            is_parent: false,
            visible_in_queue: true,
            from_cache: false,
        }
    }

    /// Whether this record is a child run, i.e. excluded from metric totals.
    pub fn is_child(&self) -> bool {
        self.run_index.is_some()
    }
}

/// Partial update merged into a record by [`StateStore::update`].
///
/// `Some` fields overwrite, counters and usage accumulate, `None` leaves the
/// record untouched. Timestamps and latency are derived by the store, never
/// set directly.
#[derive(Debug, Clone, Default)]
pub struct TestUpdate {
    pub status: Option<TestStatus>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub score: Option<f64>,
    pub passed: Option<bool>,
    pub explanation: Option<String>,
    pub first_unmet_criterion: Option<String>,
    pub latency_ms: Option<u64>,
    pub usage: Option<UsageTotals>,
    pub api_calls: u64,
    pub cache_hits: u64,
    pub llm_calls: u64,
    pub from_cache: Option<bool>,
    pub visible_in_queue: Option<bool>,
}

impl TestUpdate {
    pub fn status(status: TestStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Aggregate counters derived from records without a run suffix.
///
/// Child runs are excluded so a multi-run parent and its children count once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_tests: u64,
    pub queued: u64,
    pub running: u64,
    pub evaluating: u64,
    pub completed: u64,
    pub failed: u64,
    pub api_calls: u64,
    pub cache_hits: u64,
    pub llm_calls: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Notification pushed to subscribers.
#[derive(Debug, Clone)]
pub enum StateEvent {
    Created(TestRecord),
    Updated(TestRecord),
    Reset,
}

/// Handle returned by [`StateStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&StateEvent) + Send + Sync>;

struct StoreInner {
    records: HashMap<String, TestRecord>,
    /// Insertion order, for stable iteration.
    order: Vec<String>,
    metrics: Metrics,
}

/// Owns all test records and aggregate metrics.
pub struct StateStore {
    inner: RwLock<StoreInner>,
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_subscription: RwLock<u64>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                records: HashMap::new(),
                order: Vec::new(),
                metrics: Metrics::default(),
            }),
            listeners: RwLock::new(Vec::new()),
            next_subscription: RwLock::new(0),
        }
    }

    /// Insert a queued record and return its id.
    pub fn create(
        &self,
        owner: &str,
        dimension: &Dimension,
        input_index: usize,
        input: serde_json::Value,
        run_index: Option<usize>,
    ) -> String {
        let record = {
            let mut inner = self.inner.write();
            let id = Self::allocate_id(&inner, owner, dimension, input_index, run_index);
            let record = TestRecord::new(
                id.clone(),
                owner.to_string(),
                dimension.clone(),
                input_index,
                input,
                run_index,
            );
            inner.records.insert(id.clone(), record.clone());
            inner.order.push(id);
            let metrics = Self::compute_metrics(&inner);
            inner.metrics = metrics;
            record
        };
        let id = record.id.clone();
        self.notify(&StateEvent::Created(record));
        id
    }

    /// Insert a queued record carrying the spec's criteria and run flags.
    pub fn create_for_spec(&self, spec: &TestSpec) -> String {
        let id = self.create(
            &spec.owner,
            &spec.dimension,
            spec.input_index,
            spec.input.clone(),
            spec.run_index,
        );
        {
            let mut inner = self.inner.write();
            if let Some(record) = inner.records.get_mut(&id) {
                record.criteria = spec.criteria.clone();
                record.total_runs = spec.total_runs;
            }
        }
        id
    }

    /// Merge a partial update into the record with `id`.
    ///
    /// Derives `started_at` on first entry into running, `ended_at` and
    /// latency on first entry into completed/failed, and the evaluation
    /// timestamps symmetrically. Metrics are recomputed only when the status
    /// or an aggregate counter actually changed. An unknown id is logged and
    /// ignored; the UI keeps rendering whatever state it has.
    pub fn update(&self, id: &str, update: TestUpdate) {
        let snapshot = {
            let mut inner = self.inner.write();
            let Some(record) = inner.records.get_mut(id) else {
                warn!(id, "update for unknown test record, ignoring");
                return;
            };

            let mut status_changed = false;
            if let Some(next) = update.status {
                if next.rank() < record.status.rank() {
                    warn!(
                        id,
                        from = %record.status,
                        to = %next,
                        "dropping status regression"
                    );
                } else if next != record.status {
                    if record.status.is_terminal() {
                        warn!(id, from = %record.status, to = %next,
                            "record already terminal, keeping first outcome");
                    } else {
                        Self::derive_on_transition(record, next, update.latency_ms);
                        record.status = next;
                        status_changed = true;
                    }
                }
            }

            if let Some(output) = update.output {
                record.output = Some(output);
            }
            if let Some(error) = update.error {
                record.error = Some(error);
            }
            if let Some(score) = update.score {
                record.score = Some(score);
            }
            if let Some(passed) = update.passed {
                record.passed = Some(passed);
            }
            if let Some(explanation) = update.explanation {
                record.explanation = Some(explanation);
            }
            if let Some(criterion) = update.first_unmet_criterion {
                record.first_unmet_criterion = Some(criterion);
            }
            if let Some(usage) = update.usage {
                record.usage.add(&usage);
            }
            if let Some(from_cache) = update.from_cache {
                record.from_cache = from_cache;
            }
            if let Some(visible) = update.visible_in_queue {
                record.visible_in_queue = visible;
            }
            // Latency is fixed by whichever update supplies it first.
            if record.latency_ms.is_none() {
                if let Some(latency) = update.latency_ms {
                    record.latency_ms = Some(latency);
                }
            }
            let counters_changed =
                update.api_calls != 0 || update.cache_hits != 0 || update.llm_calls != 0;
            record.api_calls += update.api_calls;
            record.cache_hits += update.cache_hits;
            record.llm_calls += update.llm_calls;

            let snapshot = record.clone();
            if status_changed || counters_changed || update.usage.is_some() {
                let metrics = Self::compute_metrics(&inner);
                inner.metrics = metrics;
            }
            snapshot
        };

        self.notify(&StateEvent::Updated(snapshot));
    }

    /// Register a listener; notifications arrive synchronously, in
    /// registration order. Listener code must be non-blocking: a slow
    /// listener delays delivery to everyone after it. A listener may
    /// subscribe or unsubscribe from inside a notification; the change
    /// takes effect from the next event.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        let mut next = self.next_subscription.write();
        let id = *next;
        *next += 1;
        self.listeners.write().push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.listeners.write().retain(|(id, _)| *id != subscription.0);
    }

    pub fn get(&self, id: &str) -> Option<TestRecord> {
        self.inner.read().records.get(id).cloned()
    }

    /// All records in insertion order.
    pub fn all(&self) -> Vec<TestRecord> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    pub fn metrics(&self) -> Metrics {
        self.inner.read().metrics
    }

    /// Aggregate view over multi-run parents, materialized or not.
    ///
    /// For a parent without a backing record the status is synthesized from
    /// its children: evaluating if any child is evaluating, else running if
    /// any child is running, else completed/failed once all expected children
    /// finished (ties favor completed), else queued. A materialized parent
    /// that reached evaluating speaks for itself.
    pub fn parent_tests(&self) -> Vec<TestRecord> {
        let inner = self.inner.read();
        let mut groups: Vec<(String, Vec<&TestRecord>)> = Vec::new();
        for id in &inner.order {
            let Some(record) = inner.records.get(id) else {
                continue;
            };
            if !record.is_child() {
                continue;
            }
            let Some((parent_id, _)) = split_run_suffix(&record.id) else {
                continue;
            };
            match groups.iter_mut().find(|(p, _)| p == parent_id) {
                Some((_, children)) => children.push(record),
                None => groups.push((parent_id.to_string(), vec![record])),
            }
        }

        let mut parents = Vec::with_capacity(groups.len());
        for (parent_id, mut children) in groups {
            children.sort_by_key(|c| c.run_index);
            if let Some(parent) = inner.records.get(&parent_id) {
                if parent.status.rank() >= TestStatus::Evaluating.rank() {
                    parents.push(parent.clone());
                    continue;
                }
            }
            parents.push(Self::synthesize_parent(&parent_id, &children));
        }
        parents
    }

    /// Materialize the parent record from its children if it does not exist
    /// yet. Returns the materialized record.
    pub fn create_or_update_parent(&self, parent_id: &str) -> Option<TestRecord> {
        let (record, created) = {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.records.get(parent_id) {
                (existing.clone(), false)
            } else {
                let children: Vec<&TestRecord> = inner
                    .order
                    .iter()
                    .filter_map(|id| inner.records.get(id))
                    .filter(|r| {
                        r.is_child()
                            && split_run_suffix(&r.id).map(|(p, _)| p) == Some(parent_id)
                    })
                    .collect();
                if children.is_empty() {
                    warn!(parent_id, "cannot materialize parent without children");
                    return None;
                }
                let mut record = Self::synthesize_parent(parent_id, &children);
                if record.status.is_terminal() {
                    // A materialized parent only goes terminal through the
                    // verdict, even when every child already finished.
                    record.status = TestStatus::Running;
                }
                inner.records.insert(parent_id.to_string(), record.clone());
                inner.order.push(parent_id.to_string());
                let metrics = Self::compute_metrics(&inner);
                inner.metrics = metrics;
                (record, true)
            }
        };
        if created {
            self.notify(&StateEvent::Created(record.clone()));
        }
        Some(record)
    }

    /// Move a materialized parent into evaluating and make it visible.
    pub fn transition_parent_to_evaluating(&self, parent_id: &str) {
        if self.create_or_update_parent(parent_id).is_none() {
            return;
        }
        self.update(
            parent_id,
            TestUpdate {
                status: Some(TestStatus::Evaluating),
                visible_in_queue: Some(true),
                ..Default::default()
            },
        );
    }

    /// Record the judge's outcome on a materialized parent.
    pub fn complete_parent_evaluation(&self, parent_id: &str, update: TestUpdate) {
        debug_assert!(update.status.is_some_and(TestStatus::is_terminal));
        self.update(parent_id, update);
    }

    /// Drop all records and zero the metrics.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.write();
            inner.records.clear();
            inner.order.clear();
            inner.metrics = Metrics::default();
        }
        self.notify(&StateEvent::Reset);
    }

    fn allocate_id(
        inner: &StoreInner,
        owner: &str,
        dimension: &Dimension,
        input_index: usize,
        run_index: Option<usize>,
    ) -> String {
        let base = format!("{owner}-{dimension}-{input_index}");
        let id = match run_index {
            Some(run) => format!("{base}{RUN_SUFFIX}{run}"),
            None => base,
        };
        if !inner.records.contains_key(&id) {
            return id;
        }
        let mut n = 2u32;
        loop {
            let candidate = format!("{id}-{n}");
            if !inner.records.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn derive_on_transition(record: &mut TestRecord, next: TestStatus, latency_ms: Option<u64>) {
        let now = Utc::now();
        match next {
            TestStatus::Running => {
                if record.started_at.is_none() {
                    record.started_at = Some(now);
                }
            }
            TestStatus::Evaluating => {
                if record.evaluation_started_at.is_none() {
                    record.evaluation_started_at = Some(now);
                }
            }
            TestStatus::Completed | TestStatus::Failed => {
                if record.ended_at.is_none() {
                    record.ended_at = Some(now);
                }
                // Latency is fixed at the first terminal transition.
                if record.latency_ms.is_none() {
                    record.latency_ms = latency_ms.or_else(|| {
                        record
                            .started_at
                            .map(|s| (now - s).num_milliseconds().max(0) as u64)
                    });
                }
                if record.evaluation_started_at.is_some()
                    && record.evaluation_ended_at.is_none()
                {
                    record.evaluation_ended_at = Some(now);
                }
            }
            TestStatus::Queued => {}
        }
    }

    fn synthesize_parent(parent_id: &str, children: &[&TestRecord]) -> TestRecord {
        let first = children[0];
        let expected = children
            .iter()
            .filter_map(|c| c.total_runs)
            .next()
            .unwrap_or(children.len());

        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut any_running = false;
        let mut any_evaluating = false;
        for child in children {
            match child.status {
                TestStatus::Completed => completed += 1,
                TestStatus::Failed => failed += 1,
                TestStatus::Running => any_running = true,
                TestStatus::Evaluating => any_evaluating = true,
                TestStatus::Queued => {}
            }
        }

        let status = if any_evaluating {
            TestStatus::Evaluating
        } else if any_running {
            TestStatus::Running
        } else if completed + failed >= expected && expected > 0 {
            // Tie-break favors completed.
            if completed >= failed {
                TestStatus::Completed
            } else {
                TestStatus::Failed
            }
        } else {
            TestStatus::Queued
        };

        let mut record = TestRecord::new(
            parent_id.to_string(),
            first.owner.clone(),
            first.dimension.clone(),
            first.input_index,
            serde_json::Value::Null,
            None,
        );
        record.status = status;
        record.is_parent = true;
        record.is_multi_run = true;
        record.total_runs = Some(expected);
        record.criteria = first.criteria.clone();
        record.visible_in_queue = false;
        record.started_at = children.iter().filter_map(|c| c.started_at).min();
        record
    }

    fn compute_metrics(inner: &StoreInner) -> Metrics {
        let mut metrics = Metrics::default();
        for record in inner.records.values() {
            if record.is_child() {
                continue;
            }
            metrics.total_tests += 1;
            match record.status {
                TestStatus::Queued => metrics.queued += 1,
                TestStatus::Running => metrics.running += 1,
                TestStatus::Evaluating => metrics.evaluating += 1,
                TestStatus::Completed => metrics.completed += 1,
                TestStatus::Failed => metrics.failed += 1,
            }
            metrics.api_calls += record.api_calls;
            metrics.cache_hits += record.cache_hits;
            metrics.llm_calls += record.llm_calls;
            metrics.total_tokens += record.usage.total_tokens();
            metrics.total_cost_usd += record.usage.cost_usd;
        }
        metrics
    }

    fn notify(&self, event: &StateEvent) {
        // Deliver from a snapshot so a listener can subscribe or
        // unsubscribe without deadlocking on the listener lock.
        let snapshot: Vec<(u64, Listener)> = self.listeners.read().clone();
        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(subscription = id, "state listener panicked, continuing");
            }
        }
    }
}
