//! Semantic gate prompt construction and verdict parsing.
//!
//! The gate asks a generation model whether each pair in a batch names the
//! same real-world entity. The model must answer with a JSON array holding
//! one verdict per input index:
//!
//! ```json
//! [{"index": 0, "decision": "DISTINCT", "confidence": 0.92, "reason": "different products"}]
//! ```
//!
//! Parsing is lenient about the wrapper (code fences, prose around the array)
//! and strict about the contents: anything missing or malformed becomes the
//! fail-safe verdict for that index.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use concord_core::defaults::GATE_FAIL_SAFE_CONFIDENCE;
use concord_core::CanonicalConcept;

/// Reason attached to verdicts the model did not (validly) give.
pub const FAIL_SAFE_REASON: &str = "fail_safe";

/// System prompt for the gate model.
pub const GATE_SYSTEM_PROMPT: &str = "You are an entity resolution judge for a knowledge base. \
For each numbered pair decide whether both records name the same real-world entity. \
Versions, editions, successors, products of the same vendor and parent/child organizations \
are DISTINCT. Abbreviations, translations and alternate spellings of one entity are MERGE. \
Respond with only a JSON array, one object per pair: \
{\"index\": <number>, \"decision\": \"MERGE\" or \"DISTINCT\", \"confidence\": <0..1>, \"reason\": <short text>}.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateDecision {
    Merge,
    Distinct,
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateDecision::Merge => write!(f, "MERGE"),
            GateDecision::Distinct => write!(f, "DISTINCT"),
        }
    }
}

/// One verdict from the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub index: usize,
    pub decision: GateDecision,
    pub confidence: f32,
    pub reason: String,
}

impl GateVerdict {
    /// MERGE at low confidence: never blocks, never confirms.
    pub fn fail_safe(index: usize) -> Self {
        Self {
            index,
            decision: GateDecision::Merge,
            confidence: GATE_FAIL_SAFE_CONFIDENCE,
            reason: FAIL_SAFE_REASON.to_string(),
        }
    }

    pub fn is_fail_safe(&self) -> bool {
        self.reason == FAIL_SAFE_REASON
    }
}

/// The parts of a concept the gate model sees.
#[derive(Debug, Clone, PartialEq)]
pub struct GateConcept {
    pub name: String,
    pub concept_type: String,
    pub aliases: Vec<String>,
    pub definition: Option<String>,
}

impl From<&CanonicalConcept> for GateConcept {
    fn from(c: &CanonicalConcept) -> Self {
        Self {
            name: c.canonical_name.clone(),
            concept_type: c.concept_type.to_string(),
            aliases: c.aliases.clone(),
            definition: c.definition.clone(),
        }
    }
}

/// One pair submitted to the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GatePair {
    pub a: GateConcept,
    pub b: GateConcept,
}

impl GatePair {
    pub fn new(a: &CanonicalConcept, b: &CanonicalConcept) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
        }
    }
}

fn describe(c: &GateConcept) -> String {
    let mut out = format!("\"{}\" (type: {})", c.name, c.concept_type);
    if !c.aliases.is_empty() {
        out.push_str(&format!("; aliases: {}", c.aliases.join(", ")));
    }
    if let Some(def) = c.definition.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        out.push_str(&format!("; definition: {}", def));
    }
    out
}

/// User prompt listing every pair by its batch index.
pub fn build_gate_prompt(pairs: &[GatePair]) -> String {
    let mut prompt = String::from("Pairs:\n");
    for (i, pair) in pairs.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. A = {}\n   B = {}\n",
            i,
            describe(&pair.a),
            describe(&pair.b)
        ));
    }
    prompt.push_str(&format!(
        "\nReturn exactly {} verdicts as a JSON array, indices 0 to {}.",
        pairs.len(),
        pairs.len().saturating_sub(1)
    ));
    prompt
}

/// Slice out the first balanced JSON array in `raw`, skipping brackets that
/// appear inside strings.
fn first_json_array(raw: &str) -> Option<&str> {
    let start = raw.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn verdict_from_value(value: &Value) -> Option<GateVerdict> {
    let index = value.get("index")?.as_u64()? as usize;
    let decision = match value.get("decision")?.as_str()?.trim().to_ascii_uppercase().as_str() {
        "MERGE" | "SAME" => GateDecision::Merge,
        "DISTINCT" | "DIFFERENT" => GateDecision::Distinct,
        _ => return None,
    };
    let confidence = value.get("confidence")?.as_f64()?;
    if !(0.0..=1.0).contains(&confidence) {
        return None;
    }
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(GateVerdict {
        index,
        decision,
        confidence: confidence as f32,
        reason,
    })
}

/// Parse a gate response into exactly `expected` verdicts, ordered by index.
///
/// The first valid verdict per index wins; indices the model skipped or
/// answered invalidly get [`GateVerdict::fail_safe`].
pub fn parse_verdicts(raw: &str, expected: usize) -> Vec<GateVerdict> {
    let mut found: HashMap<usize, GateVerdict> = HashMap::new();
    if let Some(array) = first_json_array(raw) {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(array) {
            for verdict in items.iter().filter_map(verdict_from_value) {
                if verdict.index < expected {
                    found.entry(verdict.index).or_insert(verdict);
                }
            }
        }
    }
    (0..expected)
        .map(|i| found.remove(&i).unwrap_or_else(|| GateVerdict::fail_safe(i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::ConceptType;

    #[test]
    fn test_parse_plain_array() {
        let raw = r#"[{"index": 0, "decision": "DISTINCT", "confidence": 0.92, "reason": "different products"},
                      {"index": 1, "decision": "merge", "confidence": 0.8, "reason": "acronym"}]"#;
        let verdicts = parse_verdicts(raw, 2);
        assert_eq!(verdicts[0].decision, GateDecision::Distinct);
        assert!((verdicts[0].confidence - 0.92).abs() < 1e-6);
        assert_eq!(verdicts[1].decision, GateDecision::Merge);
        assert_eq!(verdicts[1].reason, "acronym");
    }

    #[test]
    fn test_parse_tolerates_fences_and_prose() {
        let raw = "Here you go:\n```json\n[{\"index\": 0, \"decision\": \"MERGE\", \"confidence\": 0.9, \"reason\": \"same [entity]\"}]\n```\nDone.";
        let verdicts = parse_verdicts(raw, 1);
        assert_eq!(verdicts[0].decision, GateDecision::Merge);
        assert_eq!(verdicts[0].reason, "same [entity]");
        assert!(!verdicts[0].is_fail_safe());
    }

    #[test]
    fn test_missing_and_invalid_entries_fail_safe() {
        let raw = r#"[{"index": 1, "decision": "MAYBE", "confidence": 0.9},
                      {"index": 2, "decision": "DISTINCT", "confidence": 1.7}]"#;
        let verdicts = parse_verdicts(raw, 3);
        assert_eq!(verdicts.len(), 3);
        assert!(verdicts.iter().all(GateVerdict::is_fail_safe));
        assert!(verdicts
            .iter()
            .all(|v| v.decision == GateDecision::Merge && v.confidence == 0.5));
    }

    #[test]
    fn test_garbage_response_fail_safe() {
        let verdicts = parse_verdicts("the model is overloaded", 2);
        assert_eq!(verdicts, vec![GateVerdict::fail_safe(0), GateVerdict::fail_safe(1)]);
    }

    #[test]
    fn test_out_of_range_index_ignored() {
        let raw = r#"[{"index": 5, "decision": "DISTINCT", "confidence": 0.99, "reason": "x"}]"#;
        let verdicts = parse_verdicts(raw, 1);
        assert!(verdicts[0].is_fail_safe());
    }

    #[test]
    fn test_prompt_lists_pairs_by_index() {
        let a = CanonicalConcept::new("t", "SAP S/4HANA", ConceptType::Product)
            .with_definition("ERP suite");
        let b = CanonicalConcept::new("t", "SAP HANA", ConceptType::Product).with_aliases(["HANA"]);
        let prompt = build_gate_prompt(&[GatePair::new(&a, &b)]);
        assert!(prompt.contains("0. A = \"SAP S/4HANA\" (type: product); definition: ERP suite"));
        assert!(prompt.contains("B = \"SAP HANA\" (type: product); aliases: HANA"));
        assert!(prompt.contains("exactly 1 verdicts"));
    }
}
