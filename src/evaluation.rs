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

//! Bounded-concurrency judge pool.
//!
//! Evaluations are submitted through an [`EvalQueue`] while executions are
//! still in flight, so judging overlaps with execution. The queue's worker
//! holds its own concurrency budget M, independent of the execution pool's N:
//! a slow judge backs up the eval queue without ever blocking an execution
//! slot, and vice versa.

use crate::judge::{Judge, JudgeRequest, JudgeVerdict};
use crate::settings::DimensionSettingsProvider;
use crate::store::{StateStore, TestRecord, TestUpdate};
use crate::types::{TestSpec, TestStatus};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One unit of judge work.
///
/// A multi-run parent is judged exactly once, jointly over all of its child
/// runs; the children themselves are never submitted as singles.
#[derive(Debug, Clone)]
pub enum EvalUnit {
    Single {
        record_id: String,
        spec: TestSpec,
    },
    Parent {
        parent_id: String,
        spec: TestSpec,
        /// Child records in run order, all terminal.
        children: Vec<TestRecord>,
    },
}

/// Judges evaluation units, at most M at a time.
pub struct EvaluationScheduler {
    judge: Arc<dyn Judge>,
    store: Arc<StateStore>,
    settings: Arc<dyn DimensionSettingsProvider>,
    max_concurrency: usize,
}

impl EvaluationScheduler {
    pub fn new(
        judge: Arc<dyn Judge>,
        store: Arc<StateStore>,
        settings: Arc<dyn DimensionSettingsProvider>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            judge,
            store,
            settings,
            max_concurrency,
        }
    }

    async fn evaluate_unit(&self, unit: EvalUnit) {
        match unit {
            EvalUnit::Single { record_id, spec } => self.evaluate_single(&record_id, &spec).await,
            EvalUnit::Parent {
                parent_id,
                spec,
                children,
            } => self.evaluate_parent(&parent_id, &spec, &children).await,
        }
    }

    async fn evaluate_single(&self, record_id: &str, spec: &TestSpec) {
        if spec.criteria.is_empty() {
            self.fail_configuration(record_id, spec);
            return;
        }

        self.store
            .update(record_id, TestUpdate::status(TestStatus::Evaluating));

        let output = self
            .store
            .get(record_id)
            .and_then(|r| r.output)
            .unwrap_or(serde_json::Value::Null);
        let request = self.build_request(spec, vec![spec.input.clone()], vec![output]);

        match self.judge.evaluate(request).await {
            Ok(verdict) => {
                debug!(record_id, passed = verdict.passed, score = verdict.score, "verdict applied");
                self.store.update(record_id, Self::verdict_update(verdict));
            }
            Err(err) => {
                self.store.update(record_id, Self::judge_failure_update(&err.to_string()));
            }
        }
    }

    /// Joint evaluation over every child run of a multi-run parent.
    ///
    /// The parent record is already materialized and evaluating by the time
    /// the unit reaches the pool; this only produces its terminal update.
    async fn evaluate_parent(&self, parent_id: &str, spec: &TestSpec, children: &[TestRecord]) {
        if spec.criteria.is_empty() {
            self.fail_configuration(parent_id, spec);
            return;
        }

        let inputs = children.iter().map(|c| c.input.clone()).collect();
        let outputs = children
            .iter()
            .map(|c| c.output.clone().unwrap_or(serde_json::Value::Null))
            .collect();
        let request = self.build_request(spec, inputs, outputs);

        match self.judge.evaluate(request).await {
            Ok(verdict) => {
                debug!(parent_id, passed = verdict.passed, "parent verdict applied");
                self.store
                    .complete_parent_evaluation(parent_id, Self::verdict_update(verdict));
            }
            Err(err) => {
                self.store
                    .complete_parent_evaluation(parent_id, Self::judge_failure_update(&err.to_string()));
            }
        }
    }

    fn build_request(
        &self,
        spec: &TestSpec,
        inputs: Vec<serde_json::Value>,
        outputs: Vec<serde_json::Value>,
    ) -> JudgeRequest {
        JudgeRequest {
            inputs,
            outputs,
            dimension: spec.dimension.clone(),
            criteria: spec.criteria.clone(),
            contract: spec.contract.clone(),
            settings: self.settings.dimension_settings(spec.dimension.as_str()),
            threshold_override: spec.threshold_override,
        }
    }

    /// A test with no criteria is a configuration defect, never a pass.
    fn fail_configuration(&self, record_id: &str, spec: &TestSpec) {
        warn!(record_id, dimension = %spec.dimension, "no evaluation criteria configured");
        self.store.update(
            record_id,
            TestUpdate {
                status: Some(TestStatus::Failed),
                passed: Some(false),
                error: Some(format!(
                    "configuration defect: no evaluation criteria for dimension '{}'",
                    spec.dimension
                )),
                ..Default::default()
            },
        );
    }

    fn verdict_update(verdict: JudgeVerdict) -> TestUpdate {
        let first_unmet = verdict.first_unmet_criterion();
        TestUpdate {
            status: Some(if verdict.passed {
                TestStatus::Completed
            } else {
                TestStatus::Failed
            }),
            score: Some(verdict.score),
            passed: Some(verdict.passed),
            explanation: verdict.explanation.or(Some(verdict.reasoning)),
            first_unmet_criterion: first_unmet,
            usage: Some(verdict.usage),
            llm_calls: 1,
            ..Default::default()
        }
    }

    fn judge_failure_update(reason: &str) -> TestUpdate {
        TestUpdate {
            status: Some(TestStatus::Failed),
            passed: Some(false),
            error: Some(format!("evaluation failed: {reason}")),
            llm_calls: 1,
            ..Default::default()
        }
    }
}

/// Push handle feeding the evaluation pool.
///
/// Submissions are accepted at any time; [`EvalQueue::drain`] closes the
/// queue and waits for the backlog and every in-flight evaluation to finish.
pub struct EvalQueue {
    tx: mpsc::UnboundedSender<EvalUnit>,
    worker: tokio::task::JoinHandle<()>,
}

impl EvalQueue {
    pub fn spawn(scheduler: Arc<EvaluationScheduler>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EvalUnit>();
        let worker = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(scheduler.max_concurrency.max(1)));
            let mut join_set = JoinSet::new();

            while let Some(unit) = rx.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let scheduler = Arc::clone(&scheduler);
                join_set.spawn(async move {
                    let _permit = permit;
                    scheduler.evaluate_unit(unit).await;
                });
                // Reap whatever already finished so the set stays small.
                while let Some(result) = join_set.try_join_next() {
                    if let Err(err) = result {
                        warn!(%err, "evaluation task panicked");
                    }
                }
            }

            while let Some(result) = join_set.join_next().await {
                if let Err(err) = result {
                    warn!(%err, "evaluation task panicked");
                }
            }
        });

        Self { tx, worker }
    }

    pub fn submit(&self, unit: EvalUnit) {
        self.sender().submit(unit);
    }

    /// Cheap handle for submitting from completion callbacks.
    ///
    /// The queue only closes once every sender is gone, so handles must not
    /// outlive the producing phase or [`EvalQueue::drain`] will hang.
    pub fn sender(&self) -> EvalSender {
        EvalSender {
            tx: self.tx.clone(),
        }
    }

    /// Close the queue and wait for all pending evaluations.
    pub async fn drain(self) {
        drop(self.tx);
        if let Err(err) = self.worker.await {
            warn!(%err, "evaluation worker panicked");
        }
    }
}

/// Clonable submit handle onto an [`EvalQueue`].
#[derive(Clone)]
pub struct EvalSender {
    tx: mpsc::UnboundedSender<EvalUnit>,
}

impl EvalSender {
    pub fn submit(&self, unit: EvalUnit) {
        if self.tx.send(unit).is_err() {
            warn!("evaluation queue closed, dropping unit");
        }
    }
}
