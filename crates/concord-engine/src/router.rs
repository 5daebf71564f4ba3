//! Per-type decision routing for incremental resolution.
//!
//! [`route`] maps an aggregate score and a concept type to AUTO, DEFER or
//! REJECT. It performs no I/O: everything it needs about the pair arrives in a
//! [`SafetyContext`], so the same inputs always give the same decision.
//!
//! ```text
//! score >= auto   -> AUTO if semantic signals were available and every
//!                    safety condition holds, else DEFER
//! score >= defer  -> DEFER
//! otherwise       -> REJECT
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use concord_core::{ConceptType, Decision, EvidenceCounters, Error, Result};

/// Extra requirement an AUTO decision must meet before it is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SafetyCondition {
    /// Canonical names must be equal after normalization.
    RequireExactNormalizedMatch,
    /// Both concepts must carry a definition with the same fingerprint.
    RequireDefinitionFingerprintMatch,
    /// Documents mentioning either concept must reach this count.
    MinCombinedDocuments(i64),
    /// Documents mentioning both concepts must reach this count.
    MinSharedDocuments(i64),
    /// The score must include a semantic signal. Checked for every type.
    RequireSemanticSignal,
}

impl SafetyCondition {
    pub fn is_satisfied(&self, ctx: &SafetyContext) -> bool {
        match self {
            SafetyCondition::RequireExactNormalizedMatch => ctx.exact_normalized_match,
            SafetyCondition::RequireDefinitionFingerprintMatch => {
                match (&ctx.definition_fingerprint_a, &ctx.definition_fingerprint_b) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            SafetyCondition::MinCombinedDocuments(n) => ctx.evidence.combined() >= *n,
            SafetyCondition::MinSharedDocuments(n) => ctx.evidence.shared_doc_count >= *n,
            SafetyCondition::RequireSemanticSignal => !ctx.degraded,
        }
    }
}

impl fmt::Display for SafetyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyCondition::RequireExactNormalizedMatch => write!(f, "require_exact_normalized_match"),
            SafetyCondition::RequireDefinitionFingerprintMatch => {
                write!(f, "require_definition_fingerprint_match")
            }
            SafetyCondition::MinCombinedDocuments(n) => write!(f, "min_combined_documents({})", n),
            SafetyCondition::MinSharedDocuments(n) => write!(f, "min_shared_documents({})", n),
            SafetyCondition::RequireSemanticSignal => write!(f, "require_semantic_signal"),
        }
    }
}

/// Facts about a pair that safety conditions are checked against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafetyContext {
    pub exact_normalized_match: bool,
    pub definition_fingerprint_a: Option<String>,
    pub definition_fingerprint_b: Option<String>,
    pub evidence: EvidenceCounters,
    /// The score was computed lexical-only.
    pub degraded: bool,
}

/// Thresholds for one concept type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeThresholds {
    pub threshold_auto: f32,
    pub threshold_defer: f32,
    #[serde(default)]
    pub safety: Vec<SafetyCondition>,
}

impl TypeThresholds {
    pub fn new(threshold_auto: f32, threshold_defer: f32) -> Self {
        Self {
            threshold_auto,
            threshold_defer,
            safety: Vec::new(),
        }
    }

    /// Builder: add a safety condition.
    pub fn with_safety(mut self, condition: SafetyCondition) -> Self {
        self.safety.push(condition);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |t: f32| (0.0..=1.0).contains(&t);
        if !in_range(self.threshold_auto) || !in_range(self.threshold_defer) {
            return Err(Error::Config(format!(
                "thresholds must be in [0, 1] (auto={}, defer={})",
                self.threshold_auto, self.threshold_defer
            )));
        }
        if self.threshold_defer > self.threshold_auto {
            return Err(Error::Config(format!(
                "threshold_defer {} exceeds threshold_auto {}",
                self.threshold_defer, self.threshold_auto
            )));
        }
        Ok(())
    }
}

/// Per-type thresholds with a fallback for types not listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTable {
    types: BTreeMap<ConceptType, TypeThresholds>,
    fallback: TypeThresholds,
}

impl Default for ThresholdTable {
    /// Calibrated against the combined-score weights in `concord_core::defaults`.
    ///
    /// | Type | Auto | Defer | Safety |
    /// |------|------|-------|--------|
    /// | regulation, standard, technology | 0.90 | 0.80 | |
    /// | organization | 0.92 | 0.80 | combined documents >= 3 |
    /// | person | 0.95 | 0.85 | |
    /// | product | 0.93 | 0.82 | |
    /// | anything else | 0.95 | 0.85 | combined documents >= 2 |
    fn default() -> Self {
        let mut types = BTreeMap::new();
        for t in [ConceptType::Regulation, ConceptType::Standard, ConceptType::Technology] {
            types.insert(t, TypeThresholds::new(0.90, 0.80));
        }
        types.insert(
            ConceptType::Organization,
            TypeThresholds::new(0.92, 0.80).with_safety(SafetyCondition::MinCombinedDocuments(3)),
        );
        types.insert(ConceptType::Person, TypeThresholds::new(0.95, 0.85));
        types.insert(ConceptType::Product, TypeThresholds::new(0.93, 0.82));
        Self {
            types,
            fallback: TypeThresholds::new(0.95, 0.85)
                .with_safety(SafetyCondition::MinCombinedDocuments(2)),
        }
    }
}

impl ThresholdTable {
    /// Builder: replace the thresholds of one type.
    pub fn with_type(mut self, concept_type: ConceptType, thresholds: TypeThresholds) -> Self {
        self.types.insert(concept_type, thresholds);
        self
    }

    /// Builder: replace the fallback used for unlisted types.
    pub fn with_fallback(mut self, thresholds: TypeThresholds) -> Self {
        self.fallback = thresholds;
        self
    }

    pub fn get(&self, concept_type: ConceptType) -> &TypeThresholds {
        self.types.get(&concept_type).unwrap_or(&self.fallback)
    }

    pub fn validate(&self) -> Result<()> {
        self.fallback.validate()?;
        for thresholds in self.types.values() {
            thresholds.validate()?;
        }
        Ok(())
    }
}

/// Decision plus the safety condition that downgraded it, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub decision: Decision,
    pub downgraded_by: Option<SafetyCondition>,
}

/// Route a scored pair. Never returns [`Decision::Propose`].
pub fn route(
    score: f32,
    concept_type: ConceptType,
    table: &ThresholdTable,
    ctx: &SafetyContext,
) -> RouteDecision {
    let thresholds = table.get(concept_type);
    if score >= thresholds.threshold_auto {
        let unmet = std::iter::once(&SafetyCondition::RequireSemanticSignal)
            .chain(thresholds.safety.iter())
            .find(|c| !c.is_satisfied(ctx))
            .copied();
        return RouteDecision {
            decision: if unmet.is_some() {
                Decision::Defer
            } else {
                Decision::Auto
            },
            downgraded_by: unmet,
        };
    }
    let decision = if score >= thresholds.threshold_defer {
        Decision::Defer
    } else {
        Decision::Reject
    };
    RouteDecision {
        decision,
        downgraded_by: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(a: i64, b: i64, shared: i64) -> SafetyContext {
        SafetyContext {
            evidence: EvidenceCounters {
                doc_count_a: a,
                doc_count_b: b,
                shared_doc_count: shared,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_bands() {
        let table = ThresholdTable::default();
        let ctx = SafetyContext::default();
        assert_eq!(route(0.91, ConceptType::Regulation, &table, &ctx).decision, Decision::Auto);
        assert_eq!(route(0.90, ConceptType::Regulation, &table, &ctx).decision, Decision::Auto);
        assert_eq!(route(0.83, ConceptType::Regulation, &table, &ctx).decision, Decision::Defer);
        assert_eq!(route(0.80, ConceptType::Regulation, &table, &ctx).decision, Decision::Defer);
        assert_eq!(route(0.79, ConceptType::Regulation, &table, &ctx).decision, Decision::Reject);
    }

    #[test]
    fn test_unmet_safety_downgrades_to_defer() {
        let table = ThresholdTable::default();
        let routed = route(0.99, ConceptType::Organization, &table, &docs(1, 1, 0));
        assert_eq!(routed.decision, Decision::Defer);
        assert_eq!(routed.downgraded_by, Some(SafetyCondition::MinCombinedDocuments(3)));

        let routed = route(0.99, ConceptType::Organization, &table, &docs(2, 2, 1));
        assert_eq!(routed.decision, Decision::Auto);
        assert_eq!(routed.downgraded_by, None);
    }

    #[test]
    fn test_unlisted_type_uses_fallback() {
        let table = ThresholdTable::default();
        let ctx = docs(5, 5, 0);
        assert_eq!(route(0.94, ConceptType::Event, &table, &ctx).decision, Decision::Defer);
        assert_eq!(route(0.95, ConceptType::Other, &table, &ctx).decision, Decision::Auto);
    }

    #[test]
    fn test_definition_fingerprint_condition() {
        let table = ThresholdTable::default().with_type(
            ConceptType::Person,
            TypeThresholds::new(0.9, 0.8)
                .with_safety(SafetyCondition::RequireDefinitionFingerprintMatch),
        );
        let mut ctx = SafetyContext::default();
        assert_eq!(route(0.95, ConceptType::Person, &table, &ctx).decision, Decision::Defer);
        ctx.definition_fingerprint_a = Some("f".to_string());
        ctx.definition_fingerprint_b = Some("f".to_string());
        assert_eq!(route(0.95, ConceptType::Person, &table, &ctx).decision, Decision::Auto);
    }

    #[test]
    fn test_shared_and_exact_conditions() {
        let table = ThresholdTable::default().with_type(
            ConceptType::Metric,
            TypeThresholds::new(0.9, 0.8)
                .with_safety(SafetyCondition::RequireExactNormalizedMatch)
                .with_safety(SafetyCondition::MinSharedDocuments(1)),
        );
        let mut ctx = docs(3, 3, 1);
        let routed = route(0.97, ConceptType::Metric, &table, &ctx);
        assert_eq!(routed.downgraded_by, Some(SafetyCondition::RequireExactNormalizedMatch));
        ctx.exact_normalized_match = true;
        assert_eq!(route(0.97, ConceptType::Metric, &table, &ctx).decision, Decision::Auto);
    }

    #[test]
    fn test_degraded_score_never_routes_auto() {
        let table = ThresholdTable::default();
        let ctx = SafetyContext {
            degraded: true,
            exact_normalized_match: true,
            ..docs(10, 10, 5)
        };
        for t in ConceptType::ALL {
            let routed = route(1.0, t, &table, &ctx);
            assert_eq!(routed.decision, Decision::Defer);
            assert_eq!(routed.downgraded_by, Some(SafetyCondition::RequireSemanticSignal));
        }
        assert_eq!(route(0.81, ConceptType::Standard, &table, &ctx).decision, Decision::Defer);
        assert_eq!(route(0.50, ConceptType::Standard, &table, &ctx).decision, Decision::Reject);
    }

    #[test]
    fn test_route_is_deterministic() {
        let table = ThresholdTable::default();
        let ctx = docs(2, 0, 0);
        for t in ConceptType::ALL {
            for score in [0.0, 0.5, 0.8, 0.85, 0.9, 0.93, 0.95, 1.0] {
                assert_eq!(route(score, t, &table, &ctx), route(score, t, &table, &ctx));
            }
        }
    }

    #[test]
    fn test_validation_rejects_inverted_thresholds() {
        assert!(ThresholdTable::default().validate().is_ok());
        let bad = ThresholdTable::default().with_type(ConceptType::Event, TypeThresholds::new(0.7, 0.8));
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
        let bad = ThresholdTable::default().with_fallback(TypeThresholds::new(1.2, 0.8));
        assert!(bad.validate().is_err());
    }
}
