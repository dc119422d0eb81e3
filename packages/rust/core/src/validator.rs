//! Structured-output validation of AI replies.
//!
//! Validation is a pure function of the raw reply and the schema config:
//! identical input always yields the identical outcome. Values are never
//! coerced or clamped; a mistyped or out-of-range field is a violation.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use intelhub_shared::{SchemaConfig, SchemaViolations, StructuredResult};

const OPTIONAL_TEXT_FIELDS: [&str; 3] = ["title", "impact", "tips"];
const OPTIONAL_LIST_FIELDS: [&str; 4] = ["times", "locations", "people", "organizations"];

/// Validates raw replies against the configured schema.
#[derive(Debug, Clone)]
pub struct ResultValidator {
    schema: SchemaConfig,
}

impl ResultValidator {
    pub fn new(schema: SchemaConfig) -> Self {
        Self { schema }
    }

    /// Parse and validate a raw reply.
    ///
    /// On failure, every offending field is reported, sorted by field name.
    pub fn validate(&self, raw: &str) -> Result<StructuredResult, SchemaViolations> {
        let cleaned = clean_response(raw);
        let mut violations = SchemaViolations::default();

        let value: Value = match serde_json::from_str(&cleaned) {
            Ok(v) => v,
            Err(e) => {
                violations.push("$", format!("not valid JSON: {e}"));
                return Err(violations);
            }
        };
        let Value::Object(obj) = value else {
            violations.push("$", format!("expected a JSON object, got {}", type_name(&value)));
            return Err(violations);
        };

        let score = self.check_score(&obj, &mut violations);
        let classification = self.check_classification(&obj, &mut violations);
        let summary = self.check_summary(&obj, &mut violations);

        let mut texts: [Option<String>; 3] = Default::default();
        for (slot, field) in texts.iter_mut().zip(OPTIONAL_TEXT_FIELDS) {
            *slot = optional_text(&obj, field, &mut violations);
        }
        let mut lists: [Vec<String>; 4] = Default::default();
        for (slot, field) in lists.iter_mut().zip(OPTIONAL_LIST_FIELDS) {
            *slot = optional_list(&obj, field, &mut violations);
        }

        match (score, classification, summary) {
            (Some(score), Some(classification), Some(summary)) if violations.is_empty() => {
                let [title, impact, tips] = texts;
                let [times, locations, people, organizations] = lists;
                Ok(StructuredResult {
                    score,
                    classification,
                    summary,
                    title,
                    times,
                    locations,
                    people,
                    organizations,
                    impact,
                    tips,
                })
            }
            _ => {
                violations.0.sort_by(|a, b| a.field.cmp(&b.field));
                Err(violations)
            }
        }
    }

    fn check_score(&self, obj: &Map<String, Value>, violations: &mut SchemaViolations) -> Option<f64> {
        match obj.get("score") {
            None | Some(Value::Null) => {
                violations.push("score", "missing");
                None
            }
            Some(Value::Number(n)) => match n.as_f64().filter(|v| v.is_finite()) {
                Some(v) if v >= self.schema.score_min && v <= self.schema.score_max => Some(v),
                Some(v) => {
                    violations.push(
                        "score",
                        format!(
                            "{v} is outside [{}, {}]",
                            self.schema.score_min, self.schema.score_max
                        ),
                    );
                    None
                }
                None => {
                    violations.push("score", "not a finite number");
                    None
                }
            },
            Some(other) => {
                violations.push("score", format!("expected a number, got {}", type_name(other)));
                None
            }
        }
    }

    fn check_classification(
        &self,
        obj: &Map<String, Value>,
        violations: &mut SchemaViolations,
    ) -> Option<String> {
        match obj.get("classification") {
            None | Some(Value::Null) => {
                violations.push("classification", "missing");
                None
            }
            Some(Value::String(s)) if self.schema.classifications.iter().any(|c| c == s) => {
                Some(s.clone())
            }
            Some(Value::String(s)) => {
                violations.push(
                    "classification",
                    format!("'{s}' is not one of: {}", self.schema.classifications.join(", ")),
                );
                None
            }
            Some(other) => {
                violations.push(
                    "classification",
                    format!("expected a string, got {}", type_name(other)),
                );
                None
            }
        }
    }

    fn check_summary(&self, obj: &Map<String, Value>, violations: &mut SchemaViolations) -> Option<String> {
        match obj.get("summary") {
            None | Some(Value::Null) => {
                violations.push("summary", "missing");
                None
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                violations.push("summary", "empty");
                None
            }
            Some(Value::String(s)) => {
                let len = s.chars().count();
                if len > self.schema.summary_max_chars {
                    violations.push(
                        "summary",
                        format!("{len} chars exceeds limit of {}", self.schema.summary_max_chars),
                    );
                    None
                } else {
                    Some(s.clone())
                }
            }
            Some(other) => {
                violations.push("summary", format!("expected a string, got {}", type_name(other)));
                None
            }
        }
    }
}

fn optional_text(obj: &Map<String, Value>, field: &str, violations: &mut SchemaViolations) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            violations.push(field, format!("expected a string, got {}", type_name(other)));
            None
        }
    }
}

fn optional_list(obj: &Map<String, Value>, field: &str, violations: &mut SchemaViolations) -> Vec<String> {
    match obj.get(field) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    other => {
                        violations.push(
                            field,
                            format!("element {i}: expected a string, got {}", type_name(other)),
                        );
                        return Vec::new();
                    }
                }
            }
            out
        }
        Some(other) => {
            violations.push(field, format!("expected a list of strings, got {}", type_name(other)));
            Vec::new()
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Strip reasoning blocks, answer tags and Markdown fences around the JSON payload.
pub fn clean_response(raw: &str) -> String {
    static THINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
    static ANSWER_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"</?answer>").expect("valid regex"));
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("valid regex"));

    let text = THINK_RE.replace_all(raw, "");
    let text = ANSWER_RE.replace_all(&text, "");
    let text = match FENCE_RE.captures(&text) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or_default().to_string(),
        None => text.to_string(),
    };
    let text = text.trim();

    // Tolerate prose around a single object
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start > 0 || end + 1 < text.len() => {
            if start < end {
                text[start..=end].to_string()
            } else {
                text.to_string()
            }
        }
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ResultValidator {
        ResultValidator::new(SchemaConfig {
            score_min: 0.0,
            score_max: 10.0,
            classifications: vec!["X".into(), "politics".into()],
            summary_max_chars: 40,
        })
    }

    #[test]
    fn accepts_minimal_result() {
        let r = validator()
            .validate(r#"{"score": 7, "classification": "X", "summary": "..."}"#)
            .unwrap();
        assert_eq!(r.score, 7.0);
        assert_eq!(r.classification, "X");
        assert!(r.people.is_empty());
    }

    #[test]
    fn accepts_full_result_inside_fence_and_think() {
        let raw = "<think>weighing sources</think>\n```json\n{\"score\": 8.5, \"classification\": \"politics\", \
                   \"summary\": \"Vote delayed\", \"title\": \"Delay\", \"people\": [\"A. Smith\"], \
                   \"locations\": [\"Lyon\"], \"impact\": null}\n```";
        let r = validator().validate(raw).unwrap();
        assert_eq!(r.score, 8.5);
        assert_eq!(r.title.as_deref(), Some("Delay"));
        assert_eq!(r.people, vec!["A. Smith".to_string()]);
        assert_eq!(r.impact, None);
    }

    #[test]
    fn string_score_is_not_coerced() {
        let err = validator()
            .validate(r#"{"score": "7", "classification": "X", "summary": "s"}"#)
            .unwrap_err();
        assert_eq!(err.fields(), vec!["score"]);
        assert!(err.to_string().contains("expected a number, got string"));
    }

    #[test]
    fn out_of_range_is_not_clamped() {
        let err = validator()
            .validate(r#"{"score": 11, "classification": "X", "summary": "s"}"#)
            .unwrap_err();
        assert_eq!(err.fields(), vec!["score"]);
    }

    #[test]
    fn reports_every_offending_field_sorted() {
        let err = validator()
            .validate(r#"{"classification": "Y", "summary": "", "people": "Bob", "score": -1}"#)
            .unwrap_err();
        assert_eq!(err.fields(), vec!["classification", "people", "score", "summary"]);
    }

    #[test]
    fn summary_length_bound() {
        let long = "a".repeat(41);
        let raw = format!(r#"{{"score": 1, "classification": "X", "summary": "{long}"}}"#);
        let err = validator().validate(&raw).unwrap_err();
        assert_eq!(err.fields(), vec!["summary"]);
    }

    #[test]
    fn non_json_and_non_object() {
        let err = validator().validate("I cannot help with that").unwrap_err();
        assert_eq!(err.fields(), vec!["$"]);
        let err = validator().validate("[1, 2]").unwrap_err();
        assert!(err.to_string().contains("expected a JSON object, got array"));
    }

    #[test]
    fn list_elements_must_be_strings() {
        let err = validator()
            .validate(r#"{"score": 1, "classification": "X", "summary": "s", "times": ["today", 5]}"#)
            .unwrap_err();
        assert_eq!(err.fields(), vec!["times"]);
    }

    #[test]
    fn validation_is_deterministic() {
        let raw = r#"<answer>{"score": 3, "classification": "nope", "summary": "s"}</answer>"#;
        let a = validator().validate(raw);
        let b = validator().validate(raw);
        assert_eq!(a, b);
    }

    #[test]
    fn clean_response_strips_wrappers() {
        assert_eq!(clean_response("<answer>{\"a\":1}</answer>"), "{\"a\":1}");
        assert_eq!(clean_response("Here you go: {\"a\":1} thanks"), "{\"a\":1}");
        assert_eq!(clean_response("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
