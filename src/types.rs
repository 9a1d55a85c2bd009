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

//! Core contract types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named evaluation aspect (consistency, safety, performance, ...).
///
/// Dimensions are an open set: which criteria and judge prompts apply to a
/// dimension is decided by the caller, not by this engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dimension(String);

impl Dimension {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Dimension {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Lifecycle status of a test record.
///
/// Status only moves forward along
/// `queued -> running -> evaluating -> completed | failed`; the store drops
/// any update that would regress it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Queued,
    Running,
    Evaluating,
    Completed,
    Failed,
}

impl TestStatus {
    /// Position along the lifecycle. Terminal states share a rank so neither
    /// can overwrite the other.
    pub fn rank(self) -> u8 {
        match self {
            TestStatus::Queued => 0,
            TestStatus::Running => 1,
            TestStatus::Evaluating => 2,
            TestStatus::Completed | TestStatus::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TestStatus::Completed | TestStatus::Failed)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Queued => "queued",
            TestStatus::Running => "running",
            TestStatus::Evaluating => "evaluating",
            TestStatus::Completed => "completed",
            TestStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One evaluation criterion handed to the judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCriterion {
    pub name: String,
    pub description: String,
    /// Relative importance when the judge weighs criteria.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl EvalCriterion {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            weight: 1.0,
        }
    }
}

/// An executable test specification.
///
/// A spec with `run_index` set is one child run of a multi-run test; the
/// first child's `total_runs` declares how many siblings the parent expects.
/// A spec flagged `is_parent_placeholder` is never executed directly, it only
/// reserves the logical parent in a submitted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    /// Agent or team the test targets.
    pub owner: String,
    pub dimension: Dimension,
    pub input_index: usize,
    pub input: serde_json::Value,
    #[serde(default)]
    pub run_index: Option<usize>,
    #[serde(default)]
    pub total_runs: Option<usize>,
    #[serde(default)]
    pub is_parent_placeholder: bool,
    pub criteria: Vec<EvalCriterion>,
    /// Entity contract text handed to the judge alongside the criteria.
    #[serde(default)]
    pub contract: Option<String>,
    /// Per-test override of the dimension's passing threshold, in percent.
    #[serde(default)]
    pub threshold_override: Option<f64>,
}

impl TestSpec {
    pub fn new(
        owner: impl Into<String>,
        dimension: impl Into<Dimension>,
        input_index: usize,
        input: serde_json::Value,
    ) -> Self {
        Self {
            owner: owner.into(),
            dimension: dimension.into(),
            input_index,
            input,
            run_index: None,
            total_runs: None,
            is_parent_placeholder: false,
            criteria: Vec::new(),
            contract: None,
            threshold_override: None,
        }
    }

    pub fn with_criteria(mut self, criteria: Vec<EvalCriterion>) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn as_run(mut self, run_index: usize, total_runs: usize) -> Self {
        self.run_index = Some(run_index);
        self.total_runs = Some(total_runs);
        self
    }

    /// Whether this spec is a child run of a multi-run test.
    pub fn is_multi_run_child(&self) -> bool {
        self.run_index.is_some()
    }
}

impl From<String> for Dimension {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A team test before expansion.
///
/// Team tests are expanded by the orchestrator into one executable spec per
/// generated input. Inputs come from an external LLM-backed generation step;
/// their absence is a hard error unless `structural_fallback` marks that
/// generation demonstrably failed and a single structural input should stand
/// in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamSpec {
    pub team_name: String,
    pub dimension: Dimension,
    pub criteria: Vec<EvalCriterion>,
    #[serde(default)]
    pub contract: Option<String>,
    #[serde(default)]
    pub generated_inputs: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub structural_fallback: bool,
}

/// Token and cost usage accumulated on a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: &UsageTotals) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_usd += other.cost_usd;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_rank_is_monotonic() {
        assert!(TestStatus::Queued.rank() < TestStatus::Running.rank());
        assert!(TestStatus::Running.rank() < TestStatus::Evaluating.rank());
        assert!(TestStatus::Evaluating.rank() < TestStatus::Completed.rank());
        assert_eq!(TestStatus::Completed.rank(), TestStatus::Failed.rank());
    }

    #[test]
    fn test_status_terminal() {
        assert!(TestStatus::Completed.is_terminal());
        assert!(TestStatus::Failed.is_terminal());
        assert!(!TestStatus::Evaluating.is_terminal());
    }

    #[test]
    fn test_spec_run_flags() {
        let spec = TestSpec::new("agent-a", "consistency", 0, serde_json::json!("hi"))
            .as_run(2, 3);
        assert!(spec.is_multi_run_child());
        assert_eq!(spec.total_runs, Some(3));
    }

    #[test]
    fn test_usage_totals_add() {
        let mut usage = UsageTotals {
            prompt_tokens: 100,
            completion_tokens: 50,
            cost_usd: 0.001,
        };
        usage.add(&UsageTotals {
            prompt_tokens: 10,
            completion_tokens: 5,
            cost_usd: 0.0001,
        });
        assert_eq!(usage.total_tokens(), 165);
        assert!((usage.cost_usd - 0.0011).abs() < 1e-9);
    }

    #[test]
    fn test_dimension_serde_is_transparent() {
        let d = Dimension::new("safety");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "\"safety\"");
    }
}
