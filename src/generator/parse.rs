//! Parsing of the model reply into per-index answers. The reply is expected
//! to be the JSON schema requested in the prompt, but models occasionally
//! wrap it in prose or mix up `answer`/`answers`; parsing tolerates those
//! deviations. A malformed item drops that item only; an unparseable reply
//! is an error and the caller falls back for every question.

use std::collections::HashMap;

use serde_json::Value;

use super::GenerateError;
use crate::{AnswerValue, Question};

/// Slice out the outermost JSON object from surrounding prose.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

pub fn parse_answers(
    raw: &str,
    questions: &[Question],
) -> Result<HashMap<i64, AnswerValue>, GenerateError> {
    let cleaned = extract_json_object(raw.trim())
        .ok_or_else(|| GenerateError::Parse("no JSON object in completion text".into()))?;
    let payload: Value = serde_json::from_str(cleaned)
        .map_err(|e| GenerateError::Parse(format!("invalid JSON in completion text: {}", e)))?;

    let by_index: HashMap<i64, &Question> = questions.iter().map(|q| (q.index, q)).collect();

    let mut answers = HashMap::new();
    let Some(items) = payload.get("answers").and_then(Value::as_array) else {
        return Ok(answers);
    };

    for item in items {
        let Some(idx) = item_index(item) else {
            continue;
        };
        let Some(question) = by_index.get(&idx) else {
            // Hallucinated index; ignore.
            continue;
        };

        if question.qtype == "checkbox" {
            let raw_answers = item.get("answers").or_else(|| item.get("answer"));
            let candidates = match raw_answers {
                Some(Value::String(s)) => vec![s.clone()],
                Some(Value::Array(list)) => list
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_string())
                    .collect(),
                _ => continue,
            };
            let candidates: Vec<String> = candidates
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            let validated = validate_options(&candidates, &question.options, true);
            if !validated.is_empty() {
                answers.insert(idx, AnswerValue::Selections(validated));
            }
            continue;
        }

        let ans = match item.get("answer") {
            Some(Value::String(s)) => s.clone(),
            // A list for a scalar question: take the first entry.
            Some(Value::Array(list)) => match list.first().and_then(Value::as_str) {
                Some(s) => s.to_string(),
                None => continue,
            },
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        let ans = ans.trim().to_string();
        if ans.is_empty() {
            continue;
        }
        if question.options.is_empty() {
            answers.insert(idx, AnswerValue::Text(ans));
        } else {
            let validated = validate_options(std::slice::from_ref(&ans), &question.options, false);
            if let Some(choice) = validated.into_iter().next() {
                answers.insert(idx, AnswerValue::Text(choice));
            }
        }
    }

    Ok(answers)
}

fn item_index(item: &Value) -> Option<i64> {
    match item.get("index")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Match free-text answers against the question's option labels. Matching is
/// case-insensitive; an exact match wins, otherwise substring containment in
/// either direction picks the first option in declaration order. Returned
/// strings are always canonical option labels. With no options the answers
/// pass through unchanged.
pub fn validate_options(answers: &[String], options: &[String], allow_multiple: bool) -> Vec<String> {
    if options.is_empty() {
        return answers.to_vec();
    }

    let normalized: Vec<(String, &String)> = options
        .iter()
        .map(|opt| (opt.to_lowercase().trim().to_string(), opt))
        .collect();

    let mut selected: Vec<String> = Vec::new();
    for ans in answers {
        let key = ans.to_lowercase().trim().to_string();
        let exact = normalized.iter().find(|(norm, _)| *norm == key);
        let matched = exact.or_else(|| {
            normalized
                .iter()
                .find(|(norm, _)| norm.contains(&key) || key.contains(norm.as_str()))
        });
        if let Some((_, original)) = matched {
            if !selected.contains(*original) {
                selected.push((*original).clone());
            }
        }
        if !allow_multiple && !selected.is_empty() {
            break;
        }
    }
    selected
}
