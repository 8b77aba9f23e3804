//! Answer generation for one form page: prompt construction, the completion
//! call, reply parsing and the deterministic fallback that guarantees every
//! requested index gets an answer.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::{AnswerMap, Question};

pub mod backend;
pub mod fallback;
pub mod parse;
pub mod prompt;

use self::backend::CompletionBackend;
use self::fallback::{fallback_answer, FallbackPolicy};

/// Generation-time failures. All of them are absorbed into the fallback
/// path; none ever surfaces as an HTTP error.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("upstream completion call failed: {0}")]
    Upstream(String),
    #[error("completion response could not be parsed: {0}")]
    Parse(String),
}

/// Result of generating a page of answers, with enough detail for metrics
/// and the request log.
#[derive(Debug, Default)]
pub struct GenerateOutcome {
    pub answers: AnswerMap,
    pub from_model: usize,
    pub from_fallback: usize,
    pub upstream_error: bool,
    pub parse_error: bool,
}

impl GenerateOutcome {
    pub fn source_label(&self) -> &'static str {
        match (self.from_model, self.from_fallback) {
            (0, 0) => "empty",
            (_, 0) => "model",
            (0, _) => "fallback",
            _ => "mixed",
        }
    }
}

pub struct AnswerGenerator {
    /// `None` when no credential is configured; every request then takes the
    /// fallback path without attempting a call.
    backend: Option<Arc<dyn CompletionBackend>>,
    base_facts: serde_json::Map<String, Value>,
    policy: FallbackPolicy,
}

impl AnswerGenerator {
    pub fn new(
        backend: Option<Arc<dyn CompletionBackend>>,
        base_facts: serde_json::Map<String, Value>,
        policy: FallbackPolicy,
    ) -> Self {
        Self {
            backend,
            base_facts,
            policy,
        }
    }

    /// Baseline facts merged under the per-request facts; request entries
    /// override baseline entries with the same key.
    fn merged_facts(
        &self,
        request_facts: &serde_json::Map<String, Value>,
    ) -> serde_json::Map<String, Value> {
        let mut merged = self.base_facts.clone();
        for (k, v) in request_facts {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    pub async fn generate(
        &self,
        facts: &serde_json::Map<String, Value>,
        questions: &[Question],
        page_notes: &[String],
    ) -> GenerateOutcome {
        let mut outcome = GenerateOutcome::default();
        if questions.is_empty() {
            return outcome;
        }

        let merged = self.merged_facts(facts);
        let mut resolved: HashMap<i64, crate::AnswerValue> = HashMap::new();

        match &self.backend {
            None => {
                tracing::debug!("no completion credential configured; using fallback answers");
            }
            Some(backend) => {
                let parts = prompt::build_prompt(&merged, questions, page_notes);
                match backend.complete(&parts.system, &parts.user).await {
                    Ok(raw) => match parse::parse_answers(&raw, questions) {
                        Ok(map) => resolved = map,
                        Err(err) => {
                            tracing::warn!(error=%err, "completion reply unparseable; falling back");
                            outcome.parse_error = true;
                        }
                    },
                    Err(err) => {
                        tracing::warn!(error=%err, "completion request failed; falling back");
                        outcome.upstream_error = true;
                    }
                }
            }
        }

        for q in questions {
            let answer = match resolved.remove(&q.index) {
                Some(value) => {
                    outcome.from_model += 1;
                    value
                }
                None => {
                    outcome.from_fallback += 1;
                    fallback_answer(q, &merged, self.policy)
                }
            };
            outcome.answers.insert(q.index.to_string(), answer);
        }
        outcome
    }
}
