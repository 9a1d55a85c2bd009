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

//! Top-level wiring of the execution and evaluation pools.
//!
//! The orchestrator owns the batch lifecycle: team specs are expanded into
//! executable specs, parent placeholders are filtered out, records are created
//! up front, and the execution pool's completion callback feeds the parent
//! aggregator and the evaluation queue. One awaitable [`Orchestrator::run_all`]
//! covers a whole batch.

use crate::adapter::{Adapter, ExecutionContext};
use crate::cache::ResultCache;
use crate::evaluation::{EvalQueue, EvalUnit, EvaluationScheduler};
use crate::execution::{CompletedExecution, CompletionHook, ExecutionScheduler};
use crate::judge::Judge;
use crate::parent::{ParentAggregator, ParentReadiness};
use crate::settings::{DimensionSettingsProvider, StaticDimensionSettings};
use crate::store::{split_run_suffix, Metrics, StateStore, TestRecord};
use crate::types::{TeamSpec, TestSpec};
use crate::{EngineConfig, EngineError};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one [`Orchestrator::run_all`] batch.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub metrics: Metrics,
    pub duration_ms: u64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Run {}: {}/{} passed, ${:.4} cost, {} tokens, {}ms total",
            self.run_id,
            self.metrics.completed,
            self.metrics.total_tests,
            self.metrics.total_cost_usd,
            self.metrics.total_tokens,
            self.duration_ms
        )
    }
}

/// Drives a batch of tests through execution and evaluation.
pub struct Orchestrator {
    store: Arc<StateStore>,
    adapter: Arc<dyn Adapter>,
    judge: Arc<dyn Judge>,
    cache: Option<Arc<dyn ResultCache>>,
    settings: Arc<dyn DimensionSettingsProvider>,
    config: EngineConfig,
    parents: Arc<ParentAggregator>,
    stopped: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(adapter: Arc<dyn Adapter>, judge: Arc<dyn Judge>, config: EngineConfig) -> Self {
        Self {
            store: Arc::new(StateStore::new()),
            adapter,
            judge,
            cache: None,
            settings: Arc::new(StaticDimensionSettings::new()),
            config,
            parents: Arc::new(ParentAggregator::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_settings(mut self, settings: Arc<dyn DimensionSettingsProvider>) -> Self {
        self.settings = settings;
        self
    }

    /// The store backing this orchestrator, for subscriptions and queries.
    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    /// Suppress new submissions.
    ///
    /// A batch entered after this is rejected, and completions from a batch
    /// already in flight stop feeding the evaluation queue. In-flight
    /// executions and evaluations run to completion or to their own timeout;
    /// nothing is cancelled mid-flight.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        info!("orchestrator stopped, suppressing new submissions");
    }

    /// Run a whole batch: plain tests first-class, team tests expanded into
    /// one executable spec per generated input. Resolves once every
    /// execution and every triggered evaluation has finished.
    pub async fn run_all(
        &self,
        tests: Vec<TestSpec>,
        teams: Vec<TeamSpec>,
    ) -> Result<RunSummary, EngineError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Scheduler("orchestrator is stopped".to_string()));
        }

        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let mut specs = tests;
        for team in teams {
            specs.extend(Self::expand_team(team)?);
        }

        let mut work: Vec<(String, TestSpec)> = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.is_parent_placeholder {
                debug!(owner = %spec.owner, "filtering parent placeholder spec");
                continue;
            }
            let id = self.store.create_for_spec(&spec);
            if spec.is_multi_run_child() {
                let parent_id = Self::parent_id_for(&spec, &id);
                self.parents.register_child(&parent_id, &id, spec.total_runs);
            }
            work.push((id, spec));
        }
        info!(run_id = %run_id, tests = work.len(), "starting batch");

        let eval_scheduler = Arc::new(EvaluationScheduler::new(
            Arc::clone(&self.judge),
            Arc::clone(&self.store),
            Arc::clone(&self.settings),
            self.config.evaluation_concurrency,
        ));
        let queue = EvalQueue::spawn(eval_scheduler);
        let hook = self.completion_hook(queue.sender());

        let ctx = ExecutionContext {
            project_path: self.config.project_path.clone(),
            timeout_ms: self.config.timeout_ms,
        };
        let mut execution = ExecutionScheduler::new(
            Arc::clone(&self.adapter),
            Arc::clone(&self.store),
            ctx,
            self.config.execution_concurrency,
        )
        .with_cache_hit_latency(self.config.cache_hit_latency_ms);
        if let Some(cache) = &self.cache {
            execution = execution.with_cache(Arc::clone(cache));
        }

        execution.run(work, Some(hook)).await?;
        queue.drain().await;

        let summary = RunSummary {
            run_id,
            metrics: self.store.metrics(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(%summary, "batch finished");
        Ok(summary)
    }

    /// One executable spec per generated input.
    ///
    /// Absent inputs are a hard error; the structural fallback stands in
    /// with a single labeled input only when generation demonstrably failed
    /// and the team opted in.
    fn expand_team(team: TeamSpec) -> Result<Vec<TestSpec>, EngineError> {
        let inputs = match team.generated_inputs {
            Some(inputs) if !inputs.is_empty() => inputs,
            _ => {
                if !team.structural_fallback {
                    return Err(EngineError::MissingGeneratedInputs(team.team_name));
                }
                warn!(
                    team = %team.team_name,
                    "input generation failed, using structural fallback"
                );
                vec![json!({
                    "structural": true,
                    "team": team.team_name,
                })]
            }
        };

        Ok(inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                let mut spec = TestSpec::new(
                    team.team_name.clone(),
                    team.dimension.clone(),
                    index,
                    input,
                )
                .with_criteria(team.criteria.clone());
                spec.contract = team.contract.clone();
                spec
            })
            .collect())
    }

    /// Parent id of a child run.
    ///
    /// Normally the record id minus its run suffix; a collision-bumped child
    /// id no longer parses, so the base id is rebuilt from the spec.
    fn parent_id_for(spec: &TestSpec, record_id: &str) -> String {
        split_run_suffix(record_id)
            .map(|(parent, _)| parent.to_string())
            .unwrap_or_else(|| {
                format!("{}-{}-{}", spec.owner, spec.dimension, spec.input_index)
            })
    }

    /// Wiring between the pools: singles go straight to the judge, child
    /// runs feed the parent aggregator, and a parent whose last child just
    /// finished is materialized, marked evaluating, and judged jointly.
    fn completion_hook(&self, sender: crate::evaluation::EvalSender) -> CompletionHook {
        let store = Arc::clone(&self.store);
        let parents = Arc::clone(&self.parents);
        let stopped = Arc::clone(&self.stopped);

        Arc::new(move |done: CompletedExecution| {
            if stopped.load(Ordering::SeqCst) {
                debug!(record_id = %done.record_id, "stopped, dropping evaluation");
                return;
            }

            // Routing follows the spec, never the id: a dimension name ending
            // in a run-like tail must not turn a single test into a child.
            if done.spec.is_multi_run_child() {
                let parent_id = Self::parent_id_for(&done.spec, &done.record_id);
                match parents.on_child_finished(&parent_id, &done.record_id) {
                    ParentReadiness::ReadyForEvaluation => {
                        store.transition_parent_to_evaluating(&parent_id);
                        let mut children: Vec<TestRecord> = parents
                            .child_ids(&parent_id)
                            .iter()
                            .filter_map(|id| store.get(id))
                            .collect();
                        children.sort_by_key(|c| c.run_index);

                        let mut spec = done.spec.clone();
                        spec.run_index = None;
                        sender.submit(EvalUnit::Parent {
                            parent_id,
                            spec,
                            children,
                        });
                    }
                    ParentReadiness::Pending | ParentReadiness::AlreadyDispatched => {}
                }
            } else if done.succeeded {
                sender.submit(EvalUnit::Single {
                    record_id: done.record_id,
                    spec: done.spec,
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, AdapterResponse};
    use crate::judge::{JudgeError, JudgeRequest, JudgeVerdict};
    use crate::types::{EvalCriterion, TestStatus, UsageTotals};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct EchoAdapter {
        fail_owner: Option<String>,
    }

    #[async_trait]
    impl Adapter for EchoAdapter {
        async fn execute(
            &self,
            spec: &TestSpec,
            _ctx: &ExecutionContext,
        ) -> Result<AdapterResponse, AdapterError> {
            if self.fail_owner.as_deref() == Some(spec.owner.as_str()) {
                return Err(AdapterError::Timeout(5));
            }
            Ok(AdapterResponse {
                output: json!({"echo": spec.input, "run": spec.run_index}),
                latency_ms: 3,
            })
        }
    }

    struct CountingJudge {
        calls: AtomicUsize,
        output_counts: parking_lot::Mutex<Vec<usize>>,
        pass: bool,
    }

    impl CountingJudge {
        fn passing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                output_counts: parking_lot::Mutex::new(Vec::new()),
                pass: true,
            }
        }

        fn failing() -> Self {
            Self {
                pass: false,
                ..Self::passing()
            }
        }
    }

    #[async_trait]
    impl Judge for CountingJudge {
        async fn evaluate(&self, request: JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.output_counts.lock().push(request.outputs.len());
            Ok(JudgeVerdict {
                passed: self.pass,
                score: if self.pass { 1.0 } else { 0.0 },
                reasoning: "counted".to_string(),
                issues: if self.pass {
                    vec![]
                } else {
                    vec!["criterion unmet".to_string()]
                },
                explanation: Some("because".to_string()),
                criteria: vec![],
                usage: UsageTotals {
                    prompt_tokens: 100,
                    completion_tokens: 20,
                    cost_usd: 0.002,
                },
            })
        }
    }

    fn criteria() -> Vec<EvalCriterion> {
        vec![EvalCriterion::new("works", "the output is sensible")]
    }

    fn orchestrator(judge: Arc<CountingJudge>) -> Orchestrator {
        Orchestrator::new(
            Arc::new(EchoAdapter { fail_owner: None }),
            judge,
            EngineConfig::default(),
        )
    }

    fn assert_metrics_partition(metrics: &Metrics) {
        assert_eq!(
            metrics.queued + metrics.running + metrics.evaluating + metrics.completed + metrics.failed,
            metrics.total_tests
        );
    }

    #[tokio::test]
    async fn test_run_all_singles_pass_end_to_end() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = orchestrator(judge.clone());

        let tests = (0..3)
            .map(|i| TestSpec::new("agent-a", "accuracy", i, json!(i)).with_criteria(criteria()))
            .collect();
        let summary = orchestrator.run_all(tests, vec![]).await.unwrap();

        assert_eq!(summary.metrics.total_tests, 3);
        assert_eq!(summary.metrics.completed, 3);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 3);
        assert_metrics_partition(&summary.metrics);

        for record in orchestrator.store().all() {
            assert_eq!(record.status, TestStatus::Completed);
            assert_eq!(record.passed, Some(true));
            assert!(record.latency_ms.is_some());
        }
    }

    #[tokio::test]
    async fn test_failing_verdict_populates_failure_fields() {
        let judge = Arc::new(CountingJudge::failing());
        let orchestrator = orchestrator(judge);

        let tests = vec![TestSpec::new("agent-a", "accuracy", 0, json!("q")).with_criteria(criteria())];
        let summary = orchestrator.run_all(tests, vec![]).await.unwrap();

        assert_eq!(summary.metrics.failed, 1);
        let records = orchestrator.store().all();
        let record = &records[0];
        assert_eq!(record.status, TestStatus::Failed);
        assert_eq!(record.passed, Some(false));
        assert_eq!(record.explanation.as_deref(), Some("because"));
        assert_eq!(record.first_unmet_criterion.as_deref(), Some("criterion unmet"));
    }

    #[tokio::test]
    async fn test_multi_run_parent_judged_once_over_all_children() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = orchestrator(judge.clone());

        let tests = (0..3)
            .map(|run| {
                TestSpec::new("team-x", "consistency", 0, json!("same"))
                    .as_run(run, 3)
                    .with_criteria(criteria())
            })
            .collect();
        let summary = orchestrator.run_all(tests, vec![]).await.unwrap();

        // One joint verdict over all three outputs.
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(judge.output_counts.lock().as_slice(), &[3]);

        let store = orchestrator.store();
        let parent = store.get("team-x-consistency-0").unwrap();
        assert_eq!(parent.status, TestStatus::Completed);
        assert_eq!(parent.passed, Some(true));

        // Children are excluded from totals; the parent counts once.
        assert_eq!(summary.metrics.total_tests, 1);
        assert_eq!(summary.metrics.completed, 1);
        assert_metrics_partition(&summary.metrics);
    }

    #[tokio::test]
    async fn test_team_expansion_one_spec_per_input() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = orchestrator(judge);

        let team = TeamSpec {
            team_name: "billing-team".to_string(),
            dimension: "collaboration".into(),
            criteria: criteria(),
            contract: Some("resolve billing disputes".to_string()),
            generated_inputs: Some(vec![json!("case 1"), json!("case 2")]),
            structural_fallback: false,
        };
        let summary = orchestrator.run_all(vec![], vec![team]).await.unwrap();

        assert_eq!(summary.metrics.total_tests, 2);
        assert_eq!(summary.metrics.completed, 2);
    }

    #[tokio::test]
    async fn test_missing_generated_inputs_is_a_hard_error() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = orchestrator(judge);

        let team = TeamSpec {
            team_name: "billing-team".to_string(),
            dimension: "collaboration".into(),
            criteria: criteria(),
            contract: None,
            generated_inputs: None,
            structural_fallback: false,
        };
        let err = orchestrator.run_all(vec![], vec![team]).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingGeneratedInputs(team) if team == "billing-team"));
    }

    #[tokio::test]
    async fn test_structural_fallback_labels_its_input() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = orchestrator(judge);

        let team = TeamSpec {
            team_name: "billing-team".to_string(),
            dimension: "collaboration".into(),
            criteria: criteria(),
            contract: None,
            generated_inputs: Some(vec![]),
            structural_fallback: true,
        };
        orchestrator.run_all(vec![], vec![team]).await.unwrap();

        let records = orchestrator.store().all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].input["structural"], json!(true));
    }

    #[tokio::test]
    async fn test_parent_placeholder_specs_create_no_records() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = orchestrator(judge.clone());

        let mut placeholder = TestSpec::new("team-x", "consistency", 0, json!(null));
        placeholder.is_parent_placeholder = true;
        let summary = orchestrator.run_all(vec![placeholder], vec![]).await.unwrap();

        assert_eq!(summary.metrics.total_tests, 0);
        assert!(orchestrator.store().all().is_empty());
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_execution_skips_the_judge() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = Orchestrator::new(
            Arc::new(EchoAdapter {
                fail_owner: Some("agent-bad".to_string()),
            }),
            judge.clone(),
            EngineConfig::default(),
        );

        let tests = vec![
            TestSpec::new("agent-bad", "accuracy", 0, json!("q")).with_criteria(criteria()),
            TestSpec::new("agent-good", "accuracy", 0, json!("q")).with_criteria(criteria()),
        ];
        let summary = orchestrator.run_all(tests, vec![]).await.unwrap();

        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.metrics.failed, 1);
        assert_eq!(summary.metrics.completed, 1);

        let failed = orchestrator.store().get("agent-bad-accuracy-0").unwrap();
        assert_eq!(failed.status, TestStatus::Failed);
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_run_all_after_stop_is_rejected() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = orchestrator(judge.clone());
        orchestrator.stop();

        let tests = vec![TestSpec::new("agent-a", "accuracy", 0, json!("q")).with_criteria(criteria())];
        let err = orchestrator.run_all(tests, vec![]).await.unwrap_err();

        assert!(matches!(err, EngineError::Scheduler(_)));
        assert!(orchestrator.store().all().is_empty());
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_mid_run_suppresses_pending_evaluations() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = orchestrator(judge.clone());
        let store = orchestrator.store();

        let spec = TestSpec::new("agent-a", "accuracy", 0, json!("q")).with_criteria(criteria());
        let id = store.create_for_spec(&spec);
        store.update(&id, crate::store::TestUpdate::status(TestStatus::Running));

        let scheduler = Arc::new(EvaluationScheduler::new(
            judge.clone(),
            store.clone(),
            Arc::new(StaticDimensionSettings::new()),
            1,
        ));
        let queue = EvalQueue::spawn(scheduler);
        let hook = orchestrator.completion_hook(queue.sender());

        orchestrator.stop();
        hook(CompletedExecution {
            record_id: id.clone(),
            spec,
            succeeded: true,
        });
        // The hook holds an EvalSender; drop it so drain can close the queue.
        drop(hook);
        queue.drain().await;

        // The verdict was never requested for the completion after stop.
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
        assert_ne!(store.get(&id).unwrap().status, TestStatus::Completed);
    }

    #[tokio::test]
    async fn test_dimension_with_run_like_name_is_still_evaluated() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = orchestrator(judge.clone());

        // Id comes out as "agent-a-dry-run-0": the tail parses like a run
        // suffix, but the spec carries no run index.
        let tests = vec![TestSpec::new("agent-a", "dry-run", 0, json!("q")).with_criteria(criteria())];
        let summary = orchestrator.run_all(tests, vec![]).await.unwrap();

        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.metrics.completed, 1);
        let record = orchestrator.store().get("agent-a-dry-run-0").unwrap();
        assert_eq!(record.status, TestStatus::Completed);
        assert_eq!(record.passed, Some(true));
    }

    #[tokio::test]
    async fn test_collision_bumped_child_id_still_reaches_its_parent() {
        let judge = Arc::new(CountingJudge::passing());
        let orchestrator = orchestrator(judge.clone());

        // Two children claim run 0 of the same parent: the second record id
        // is bumped to "...-run-0-2", which no longer parses as a run suffix.
        let child = || {
            TestSpec::new("team-x", "consistency", 0, json!("same"))
                .as_run(0, 2)
                .with_criteria(criteria())
        };
        orchestrator.run_all(vec![child(), child()], vec![]).await.unwrap();

        // Both completions landed on the parent and triggered one verdict.
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        assert_eq!(judge.output_counts.lock().as_slice(), &[2]);
        let parent = orchestrator.store().get("team-x-consistency-0").unwrap();
        assert_eq!(parent.status, TestStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_summary_display() {
        let summary = RunSummary {
            run_id: "abc".to_string(),
            metrics: Metrics {
                total_tests: 4,
                completed: 3,
                failed: 1,
                total_tokens: 360,
                total_cost_usd: 0.006,
                ..Default::default()
            },
            duration_ms: 120,
        };
        let rendered = summary.to_string();
        assert!(rendered.contains("3/4 passed"));
        assert!(rendered.contains("$0.0060"));
    }
}
