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

//! # Gauntlet
//!
//! Test orchestration engine for evaluating AI agents and teams.
//!
//! Given a batch of test specs, each bound to an evaluation dimension
//! (consistency, safety, performance, ...), Gauntlet executes them against a
//! target system through an [`Adapter`](adapter::Adapter), tracks per-test
//! lifecycle state in a [`StateStore`](store::StateStore), and dispatches
//! completed outputs to a semantic [`Judge`](judge::Judge) that decides
//! pass/fail. Execution and evaluation run in two independently bounded
//! concurrency pools so that a judging backlog never stalls new executions.
//!
//! Multi-run dimensions produce several child runs per logical test; the
//! children execute independently but are judged together, exactly once,
//! after the last child finishes.
//!
//! ## Example
//!
//! ```rust,ignore
//! use gauntlet::{EngineConfig, Orchestrator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gauntlet::EngineError> {
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(my_adapter),
//!         Arc::new(my_judge),
//!         EngineConfig::default(),
//!     );
//!     let summary = orchestrator.run_all(test_specs, team_specs).await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```
//!
//! State is in-memory only; nothing persists across process restarts.

use thiserror::Error;

pub mod adapter;
pub mod backoff;
pub mod cache;
pub mod evaluation;
pub mod execution;
pub mod judge;
pub mod orchestrator;
pub mod parent;
pub mod settings;
pub mod store;
pub mod types;

pub use adapter::{Adapter, AdapterError, AdapterResponse, ExecutionContext};
pub use backoff::Backoff;
pub use cache::{CacheKey, CacheStats, CachedExecution, MokaResultCache, ResultCache};
pub use evaluation::{EvalQueue, EvalSender, EvalUnit, EvaluationScheduler};
pub use execution::{CompletedExecution, ExecutionScheduler};
pub use judge::{CriterionVerdict, HttpJudge, Judge, JudgeError, JudgeRequest, JudgeVerdict};
pub use orchestrator::{Orchestrator, RunSummary};
pub use parent::{ParentAggregator, ParentReadiness};
pub use settings::{DimensionSettings, DimensionSettingsProvider, StaticDimensionSettings};
pub use store::{Metrics, StateEvent, StateStore, TestRecord, TestUpdate};
pub use types::{Dimension, EvalCriterion, TeamSpec, TestSpec, TestStatus, UsageTotals};

/// Errors surfaced by the orchestration engine.
///
/// Failures stay local to the owning test record wherever possible; these
/// variants cover the cases where a whole batch cannot proceed or where a
/// configuration problem must fail fast instead of producing an ambiguous
/// pass.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The adapter threw or timed out. Recorded on the owning test; only
    /// surfaced as an error when the scheduler itself cannot run.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The judge exhausted retries or returned an unusable verdict.
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// A test was configured in a way that can never evaluate meaningfully,
    /// e.g. an empty criteria list.
    #[error("configuration defect: {0}")]
    ConfigurationDefect(String),

    /// A team test arrived without generated inputs and no structural
    /// fallback was requested.
    #[error("no generated inputs for team '{0}'")]
    MissingGeneratedInputs(String),

    /// Internal scheduling failure (closed semaphore or channel).
    #[error("scheduler failure: {0}")]
    Scheduler(String),
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Execution pool size (budget N). Never merged with the evaluation
    /// budget.
    pub execution_concurrency: usize,

    /// Evaluation pool size (budget M), independent of execution.
    pub evaluation_concurrency: usize,

    /// Project path handed to the adapter.
    pub project_path: String,

    /// Per-execution timeout handed to the adapter, in milliseconds.
    pub timeout_ms: u64,

    /// Nominal latency recorded for cache hits, in milliseconds.
    pub cache_hit_latency_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_concurrency: 4,
            evaluation_concurrency: 2,
            project_path: ".".to_string(),
            timeout_ms: 120_000,
            cache_hit_latency_ms: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.execution_concurrency, 4);
        assert_eq!(config.evaluation_concurrency, 2);
        assert_eq!(config.timeout_ms, 120_000);
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::ConfigurationDefect("no criteria".to_string());
        assert_eq!(err.to_string(), "configuration defect: no criteria");

        let err = EngineError::MissingGeneratedInputs("billing-team".to_string());
        assert!(err.to_string().contains("billing-team"));
    }
}
