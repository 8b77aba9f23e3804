//! Prompt assembly for a single form page. The completion model receives the
//! known facts, page-level notes and every question descriptor in one shot,
//! plus the JSON schema the reply must follow.

use serde_json::Value;

use crate::util::title_case_key;
use crate::Question;

/// Upper bounds on prompt context to keep token usage predictable.
const MAX_PAGE_NOTES: usize = 12;
const MAX_OPTIONS: usize = 20;
const MAX_QUESTION_NOTES: usize = 4;

pub const SYSTEM_PROMPT: &str = "You answer web form pages using the provided personal facts. \
Return a JSON mapping of answers for all questions. When options are provided, \
choose from them. For checkbox questions you may pick multiple options. \
Keep answers concise and consistent.";

const RESPONSE_SCHEMA: &str = r#"Respond ONLY in JSON with this schema:
{
  "answers": [
    {"index": number, "answer": string},
    {"index": number, "answers": [string, ...]}
  ]
}
Do not include explanations."#;

pub struct PromptParts {
    pub system: String,
    pub user: String,
}

pub fn build_prompt(
    facts: &serde_json::Map<String, Value>,
    questions: &[Question],
    page_notes: &[String],
) -> PromptParts {
    let mut user = String::new();

    user.push_str("Facts about me:\n");
    user.push_str(&format_facts(facts));
    user.push_str("\n\n");

    if !page_notes.is_empty() {
        user.push_str("Page notes:\n");
        for note in page_notes.iter().take(MAX_PAGE_NOTES) {
            user.push_str("- ");
            user.push_str(note);
            user.push('\n');
        }
        user.push('\n');
    }

    user.push_str("Questions on this page:\n");
    for q in questions {
        user.push_str(&format!(
            "- index: {}, type: {}, text: {}\n",
            q.index, q.qtype, q.qtext
        ));
        if !q.options.is_empty() {
            let opts: Vec<&str> = q
                .options
                .iter()
                .take(MAX_OPTIONS)
                .map(|o| o.as_str())
                .collect();
            user.push_str("  options: ");
            user.push_str(&opts.join("; "));
            user.push('\n');
        }
        if q.required {
            user.push_str("  required: true\n");
        }
        if !q.question_notes.is_empty() {
            let notes: Vec<&str> = q
                .question_notes
                .iter()
                .take(MAX_QUESTION_NOTES)
                .map(|n| n.as_str())
                .collect();
            user.push_str("  notes: ");
            user.push_str(&notes.join(" | "));
            user.push('\n');
        }
    }

    user.push('\n');
    user.push_str(RESPONSE_SCHEMA);

    PromptParts {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

fn format_facts(facts: &serde_json::Map<String, Value>) -> String {
    let mut lines: Vec<String> = Vec::with_capacity(facts.len());
    for (key, value) in facts {
        let Some(pretty) = format_fact_value(value) else {
            continue;
        };
        lines.push(format!("- {}: {}", title_case_key(key), pretty));
    }
    lines.join("\n")
}

/// Render a fact value for prompt text. Nulls and nested objects carry no
/// useful answer material and are skipped.
pub(crate) fn format_fact_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                })
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
