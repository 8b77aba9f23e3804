//! Deterministic fallback answers. Used for every question the model call
//! could not resolve: missing credential, upstream failure, unparseable
//! reply, or a per-question gap in an otherwise valid reply.
//!
//! Resolution order: a fact whose key occurs in the question text supplies
//! the answer (validated against the options when present), otherwise the
//! configured policy default applies. The output type always matches the
//! question type: checkbox questions get a list, everything else a string.

use std::str::FromStr;

use serde_json::Value;

use super::parse::validate_options;
use crate::util::ac_for;
use crate::{AnswerValue, Question};

/// Default value policy for questions no fact matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Empty string, or empty list for checkbox questions.
    #[default]
    Empty,
    /// Pick the first option for required choice questions; empty otherwise.
    FirstOption,
}

impl FromStr for FallbackPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "empty" => Ok(FallbackPolicy::Empty),
            "first-option" | "first_option" => Ok(FallbackPolicy::FirstOption),
            _ => Err(()),
        }
    }
}

const SINGLE_CHOICE_TYPES: &[&str] = &["radio", "dropdown", "scale"];

pub fn fallback_answer(
    question: &Question,
    facts: &serde_json::Map<String, Value>,
    policy: FallbackPolicy,
) -> AnswerValue {
    if let Some(hint) = fact_hint(question, facts) {
        return hint;
    }
    policy_default(question, policy)
}

/// Look for a fact whose key (underscores read as spaces) appears in the
/// question text. The longest matching key wins, so `class_year` beats a
/// hypothetical `year` fact for "What is your class year?".
fn fact_hint(question: &Question, facts: &serde_json::Map<String, Value>) -> Option<AnswerValue> {
    if facts.is_empty() || question.qtext.is_empty() {
        return None;
    }

    let keys: Vec<&String> = facts.keys().collect();
    let patterns: Vec<String> = keys.iter().map(|k| k.replace('_', " ")).collect();
    let ac = ac_for(&patterns);
    let qtext_lower = question.qtext.to_lowercase();

    let mut best: Option<(usize, usize)> = None; // (pattern idx, match len)
    for m in ac.find_overlapping_iter(&qtext_lower) {
        let len = m.end() - m.start();
        if best.map(|(_, best_len)| len > best_len).unwrap_or(true) {
            best = Some((m.pattern().as_usize(), len));
        }
    }
    let (pattern_idx, _) = best?;
    let value = facts.get(keys[pattern_idx].as_str())?;

    let candidates = candidate_strings(value)?;
    let is_checkbox = question.qtype == "checkbox";

    if question.options.is_empty() {
        return if is_checkbox {
            Some(AnswerValue::Selections(candidates))
        } else {
            candidates.into_iter().next().map(AnswerValue::Text)
        };
    }

    let validated = validate_options(&candidates, &question.options, is_checkbox);
    if validated.is_empty() {
        return None;
    }
    if is_checkbox {
        Some(AnswerValue::Selections(validated))
    } else {
        validated.into_iter().next().map(AnswerValue::Text)
    }
}

fn candidate_strings(value: &Value) -> Option<Vec<String>> {
    let candidates: Vec<String> = match value {
        Value::String(s) if !s.trim().is_empty() => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.to_string())
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    };
    if candidates.is_empty() {
        None
    } else {
        Some(candidates)
    }
}

fn policy_default(question: &Question, policy: FallbackPolicy) -> AnswerValue {
    let is_checkbox = question.qtype == "checkbox";
    let has_options = !question.options.is_empty();

    if policy == FallbackPolicy::FirstOption && question.required && has_options {
        if is_checkbox {
            return AnswerValue::Selections(vec![question.options[0].clone()]);
        }
        if SINGLE_CHOICE_TYPES.contains(&question.qtype.as_str()) {
            return AnswerValue::Text(question.options[0].clone());
        }
    }

    if is_checkbox {
        AnswerValue::Selections(Vec::new())
    } else {
        AnswerValue::Text(String::new())
    }
}
