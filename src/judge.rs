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

//! Semantic judge contract and the default OpenAI-compatible client.
//!
//! The judge sees every output of an evaluatable unit at once (a single
//! test's output, or all child outputs of a multi-run parent) together with
//! the structured criteria and the dimension's scoring configuration, and
//! returns a pass/fail verdict with a score and an explanation. Retry with
//! backoff lives here: by the time a verdict or error reaches the
//! evaluation scheduler, retries are already exhausted.

use crate::backoff::Backoff;
use crate::settings::DimensionSettings;
use crate::types::{Dimension, EvalCriterion, UsageTotals};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Everything the judge needs for one verdict.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeRequest {
    /// One input per executed run.
    pub inputs: Vec<serde_json::Value>,
    /// One output per finished run, in run order.
    pub outputs: Vec<serde_json::Value>,
    pub dimension: Dimension,
    pub criteria: Vec<EvalCriterion>,
    /// Entity contract text, if the owner declared one.
    pub contract: Option<String>,
    pub settings: DimensionSettings,
    /// Per-test override of the passing percentage.
    pub threshold_override: Option<f64>,
}

impl JudgeRequest {
    /// Effective passing percentage after the per-test override.
    pub fn passing_percentage(&self) -> f64 {
        self.threshold_override
            .unwrap_or(self.settings.passing_criteria_percentage)
    }
}

/// Per-criterion breakdown inside a verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionVerdict {
    pub name: String,
    pub met: bool,
    #[serde(default)]
    pub note: Option<String>,
}

/// The judge's decision for one evaluatable unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub passed: bool,
    /// Fraction of weighted criteria met, 0.0 to 1.0.
    pub score: f64,
    pub reasoning: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub criteria: Vec<CriterionVerdict>,
    #[serde(default)]
    pub usage: UsageTotals,
}

impl JudgeVerdict {
    /// First unmet criterion, from the structured breakdown if present, else
    /// derived from the generic issue list.
    pub fn first_unmet_criterion(&self) -> Option<String> {
        self.criteria
            .iter()
            .find(|c| !c.met)
            .map(|c| c.name.clone())
            .or_else(|| self.issues.first().cloned())
    }
}

/// Errors from judge clients.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("API error: {0}")]
    Api(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("invalid verdict: {0}")]
    InvalidVerdict(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decides pass/fail for evaluatable units.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(&self, request: JudgeRequest) -> Result<JudgeVerdict, JudgeError>;
}

/// OpenAI-compatible judge client.
///
/// Sends one chat completion per verdict with temperature 0 and a JSON
/// response format, retries transient failures with capped exponential
/// backoff, and prices token usage into the verdict.
pub struct HttpJudge {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
    backoff: Backoff,
}

impl HttpJudge {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            backoff: Backoff::exponential(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn render_prompt(request: &JudgeRequest) -> String {
        let mut prompt = format!(
            "You are an expert evaluator judging an AI system on the '{}' dimension \
             (strictness {:.1}).\n\n",
            request.dimension, request.settings.default_strictness
        );

        if let Some(contract) = &request.contract {
            prompt.push_str("ENTITY CONTRACT:\n");
            prompt.push_str(contract);
            prompt.push_str("\n\n");
        }

        for (i, (input, output)) in request.inputs.iter().zip(&request.outputs).enumerate() {
            prompt.push_str(&format!(
                "RUN {i}\nINPUT:\n{input}\nOUTPUT:\n{output}\n\n"
            ));
        }

        prompt.push_str("Judge the output(s) against each criterion:\n");
        for criterion in &request.criteria {
            prompt.push_str(&format!(
                "- {} (weight {:.1}): {}\n",
                criterion.name, criterion.weight, criterion.description
            ));
        }

        prompt.push_str(
            r#"
Respond in JSON:
{
  "criteria": [{"name": "<criterion>", "met": <bool>, "note": "<why>"}],
  "reasoning": "<overall assessment>",
  "issues": ["<problem>", ...]
}
"#,
        );
        prompt
    }

    /// Turn raw judge output into a verdict.
    ///
    /// The score is the weighted fraction of criteria met; the unit passes
    /// when that fraction reaches the effective passing percentage. A reply
    /// with no recognizable criteria breakdown is an invalid verdict, never
    /// a pass.
    fn parse_verdict(
        content: &str,
        request: &JudgeRequest,
        usage: UsageTotals,
    ) -> Result<JudgeVerdict, JudgeError> {
        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| JudgeError::InvalidVerdict(format!("not valid JSON: {e}")))?;

        let criteria: Vec<CriterionVerdict> = value
            .get("criteria")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        if criteria.is_empty() {
            return Err(JudgeError::InvalidVerdict(
                "verdict carries no per-criterion breakdown".to_string(),
            ));
        }

        let mut met_weight = 0.0;
        let mut total_weight = 0.0;
        for criterion in &request.criteria {
            total_weight += criterion.weight;
            let met = criteria
                .iter()
                .any(|c| c.name == criterion.name && c.met);
            if met {
                met_weight += criterion.weight;
            }
        }
        let score = if total_weight > 0.0 {
            met_weight / total_weight
        } else {
            0.0
        };
        let passed = score * 100.0 >= request.passing_percentage();

        let reasoning = value
            .get("reasoning")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string();
        let issues = value
            .get("issues")
            .and_then(|i| i.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(JudgeVerdict {
            passed,
            score,
            explanation: Some(reasoning.clone()),
            reasoning,
            issues,
            criteria,
            usage,
        })
    }

    fn cost_per_token(&self) -> (f64, f64) {
        match self.model.as_str() {
            "gpt-4o" => (0.0000025, 0.000010),
            "gpt-4o-mini" => (0.00000015, 0.0000006),
            _ => (0.00000015, 0.0000006),
        }
    }

    async fn call_once(&self, prompt: &str) -> Result<(String, UsageTotals), JudgeError> {
        let request = serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are an expert evaluator. Respond only with valid JSON."
                },
                {
                    "role": "user",
                    "content": prompt
                }
            ],
            "temperature": 0.0,
            "response_format": { "type": "json_object" }
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(JudgeError::RateLimited);
            }
            return Err(JudgeError::Api(error_text));
        }

        let data: serde_json::Value = response.json().await?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| JudgeError::InvalidVerdict("missing content".to_string()))?
            .to_string();

        let (cost_in, cost_out) = self.cost_per_token();
        let prompt_tokens = data["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let completion_tokens = data["usage"]["completion_tokens"].as_u64().unwrap_or(0);
        let usage = UsageTotals {
            prompt_tokens,
            completion_tokens,
            cost_usd: prompt_tokens as f64 * cost_in + completion_tokens as f64 * cost_out,
        };

        Ok((content, usage))
    }
}

#[async_trait]
impl Judge for HttpJudge {
    async fn evaluate(&self, request: JudgeRequest) -> Result<JudgeVerdict, JudgeError> {
        let prompt = Self::render_prompt(&request);
        let mut backoff = self.backoff.clone();

        loop {
            match self.call_once(&prompt).await {
                Ok((content, usage)) => {
                    return Self::parse_verdict(&content, &request, usage);
                }
                Err(err) => {
                    debug!(%err, dimension = %request.dimension, "judge call failed");
                    match backoff.next() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => {
                            warn!(dimension = %request.dimension, "judge retries exhausted");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(criteria: Vec<EvalCriterion>, threshold: Option<f64>) -> JudgeRequest {
        JudgeRequest {
            inputs: vec![json!("what is 2+2?")],
            outputs: vec![json!("4")],
            dimension: Dimension::new("accuracy"),
            criteria,
            contract: None,
            settings: DimensionSettings::default(),
            threshold_override: threshold,
        }
    }

    fn two_criteria() -> Vec<EvalCriterion> {
        vec![
            EvalCriterion::new("correct", "answer is correct"),
            EvalCriterion::new("concise", "answer is concise"),
        ]
    }

    #[test]
    fn test_parse_verdict_all_met_passes() {
        let content = json!({
            "criteria": [
                {"name": "correct", "met": true},
                {"name": "concise", "met": true}
            ],
            "reasoning": "both satisfied",
            "issues": []
        })
        .to_string();

        let verdict = HttpJudge::parse_verdict(
            &content,
            &request(two_criteria(), None),
            UsageTotals::default(),
        )
        .unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.score, 1.0);
        assert_eq!(verdict.first_unmet_criterion(), None);
    }

    #[test]
    fn test_parse_verdict_zero_met_fails_with_first_unmet() {
        let content = json!({
            "criteria": [
                {"name": "correct", "met": false, "note": "wrong answer"},
                {"name": "concise", "met": false}
            ],
            "reasoning": "nothing satisfied",
            "issues": ["answer is wrong"]
        })
        .to_string();

        let verdict = HttpJudge::parse_verdict(
            &content,
            &request(two_criteria(), None),
            UsageTotals::default(),
        )
        .unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.first_unmet_criterion(), Some("correct".to_string()));
        assert!(verdict.explanation.is_some());
    }

    #[test]
    fn test_first_unmet_falls_back_to_issue_list() {
        let verdict = JudgeVerdict {
            passed: false,
            score: 0.2,
            reasoning: String::new(),
            issues: vec!["output contradicts run 0".to_string()],
            explanation: None,
            criteria: vec![CriterionVerdict {
                name: "stable".to_string(),
                met: true,
                note: None,
            }],
            usage: UsageTotals::default(),
        };
        assert_eq!(
            verdict.first_unmet_criterion(),
            Some("output contradicts run 0".to_string())
        );
    }

    #[test]
    fn test_threshold_override_applies() {
        // One of two equal-weight criteria met: 50%.
        let content = json!({
            "criteria": [
                {"name": "correct", "met": true},
                {"name": "concise", "met": false}
            ],
            "reasoning": "half"
        })
        .to_string();

        let strict = HttpJudge::parse_verdict(
            &content,
            &request(two_criteria(), None),
            UsageTotals::default(),
        )
        .unwrap();
        assert!(!strict.passed); // default 75%

        let lenient = HttpJudge::parse_verdict(
            &content,
            &request(two_criteria(), Some(50.0)),
            UsageTotals::default(),
        )
        .unwrap();
        assert!(lenient.passed);
    }

    #[test]
    fn test_missing_breakdown_is_invalid_never_a_pass() {
        let content = json!({"reasoning": "looks fine"}).to_string();
        let result = HttpJudge::parse_verdict(
            &content,
            &request(two_criteria(), None),
            UsageTotals::default(),
        );
        assert!(matches!(result, Err(JudgeError::InvalidVerdict(_))));
    }

    #[test]
    fn test_render_prompt_lists_runs_and_criteria() {
        let mut req = request(two_criteria(), None);
        req.inputs.push(json!("again?"));
        req.outputs.push(json!("still 4"));
        let prompt = HttpJudge::render_prompt(&req);
        assert!(prompt.contains("RUN 0"));
        assert!(prompt.contains("RUN 1"));
        assert!(prompt.contains("correct"));
        assert!(prompt.contains("concise"));
    }
}
