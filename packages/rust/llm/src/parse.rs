//! Tolerant parsing of model responses.
//!
//! Model output is untrusted: it arrives wrapped in markdown fences, padded
//! with prose, sometimes truncated mid-object. Everything here degrades
//! instead of panicking. Scalar fields coerce to documented defaults and
//! only items missing a usable name are dropped.

use serde_json::Value;

use conceptforge_shared::{
    Category, ConceptForgeError, ConceptIndexEntry, Difficulty, ExtractedConcept, MergeSuggestion,
    Result, SimilarityMatch,
};

/// Pull a JSON value out of a raw model response.
///
/// Tries, in order: a ```json fence, a generic ``` fence, then the widest
/// `{..}` / `[..]` slice. If parsing fails, attempts a bounded repair of
/// truncated output by closing open strings, arrays, and objects.
pub fn extract_json(raw: &str) -> Result<Value> {
    let candidate = strip_fences(raw);
    let candidate = widest_json_slice(candidate).unwrap_or(candidate);

    if let Ok(value) = serde_json::from_str(candidate) {
        return Ok(value);
    }

    let repaired = repair_truncated(candidate);
    serde_json::from_str(&repaired).map_err(|e| {
        ConceptForgeError::llm("parse", format!("response is not valid JSON: {e}"))
    })
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find("```json") {
        let body = &trimmed[start + 7..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
        // Unterminated fence: truncated response, take the rest
        return body.trim();
    }

    if let Some(start) = trimmed.find("```") {
        let body = &trimmed[start + 3..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
        return body.trim();
    }

    trimmed
}

/// Widest slice from the first opening bracket to the last closing one.
/// Returns `None` when the closers are missing (truncated output); the
/// caller then repairs from the opener onward.
fn widest_json_slice(s: &str) -> Option<&str> {
    let obj_start = s.find('{');
    let arr_start = s.find('[');

    let (start, closer) = match (obj_start, arr_start) {
        (Some(o), Some(a)) if a < o => (a, ']'),
        (Some(o), _) => (o, '}'),
        (None, Some(a)) => (a, ']'),
        (None, None) => return None,
    };

    let end = s.rfind(closer)?;
    if end > start {
        Some(&s[start..=end])
    } else {
        Some(&s[start..])
    }
}

/// Close whatever the truncation left open. Gives up past a nesting depth
/// of 64 and returns the input unchanged.
fn repair_truncated(s: &str) -> String {
    let start = match s.find(|c| c == '{' || c == '[') {
        Some(i) => i,
        None => return s.to_string(),
    };
    let body = &s[start..];

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in body.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
        if stack.len() > 64 {
            return s.to_string();
        }
    }

    let mut repaired = body.trim_end().to_string();
    if in_string {
        repaired.push('"');
    }
    // A trailing comma or key-colon before the cut leaves invalid syntax
    while repaired.ends_with(',') || repaired.ends_with(':') {
        repaired.pop();
        repaired = repaired.trim_end().to_string();
    }
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    repaired
}

/// Confidence from an untrusted field: number or numeric string, clamped
/// to [0, 1], defaulting to 0.5.
pub fn coerce_confidence(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => 0.5,
    }
}

fn string_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn string_list(item: &Value, key: &str) -> Vec<String> {
    item.get(key)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse an extraction response into candidate concepts.
///
/// Accepts a bare array or a `{"concepts": [...]}` wrapper. Items without
/// a name are dropped; every other field coerces to a default.
pub fn parse_extracted_concepts(raw: &str) -> Result<Vec<ExtractedConcept>> {
    let value = extract_json(raw)?;
    let items = value
        .as_array()
        .or_else(|| value.get("concepts").and_then(Value::as_array))
        .ok_or_else(|| ConceptForgeError::llm("parse", "expected a concept array"))?;

    let mut concepts = Vec::new();
    for item in items {
        let name = string_field(item, "name");
        if name.is_empty() {
            tracing::debug!("dropping extracted item without a name");
            continue;
        }
        let difficulty = item
            .get("suggested_difficulty")
            .or_else(|| item.get("difficulty"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let tags = {
            let t = string_list(item, "suggested_tags");
            if t.is_empty() { string_list(item, "tags") } else { t }
        };

        concepts.push(ExtractedConcept {
            name,
            category: Category::coerce(&string_field(item, "category")),
            description: string_field(item, "description"),
            examples: string_list(item, "examples"),
            source_excerpt: string_field(item, "source_excerpt"),
            confidence: coerce_confidence(item.get("confidence")),
            suggested_difficulty: Difficulty::coerce(difficulty),
            suggested_tags: tags,
        });
    }
    Ok(concepts)
}

/// Parse a similarity response against the index subset it was scored over.
///
/// The model answers with `{"matches": [{"concept_id", "similarity",
/// "merge_score", "merge_suggestion"?}, ...]}` (or a bare array). Items
/// referencing an id outside the subset are dropped; match metadata comes
/// from the stored index entry, never from the model.
pub fn parse_similarity_matches(
    raw: &str,
    index: &[ConceptIndexEntry],
) -> Result<Vec<SimilarityMatch>> {
    let value = extract_json(raw)?;
    let items = value
        .as_array()
        .or_else(|| value.get("matches").and_then(Value::as_array))
        .ok_or_else(|| ConceptForgeError::llm("parse", "expected a match array"))?;

    let mut matches = Vec::new();
    for item in items {
        let id = string_field(item, "concept_id");
        let Some(entry) = index.iter().find(|e| e.id.to_string() == id) else {
            tracing::debug!(concept_id = %id, "dropping match for unknown concept");
            continue;
        };

        let merge_suggestion = item.get("merge_suggestion").and_then(|ms| {
            let reason = string_field(ms, "reason");
            if reason.is_empty() {
                return None;
            }
            Some(MergeSuggestion {
                reason,
                conflicting_fields: string_list(ms, "conflicting_fields"),
                suggested_description: ms
                    .get("suggested_description")
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_string()),
            })
        });

        matches.push(SimilarityMatch {
            concept_id: entry.id.clone(),
            concept_name: entry.name.clone(),
            category: entry.category,
            description: entry.description.clone(),
            examples: Vec::new(),
            similarity: coerce_confidence(item.get("similarity")),
            merge_score: coerce_confidence(item.get("merge_score")),
            merge_suggestion,
        });
    }
    Ok(matches)
}
