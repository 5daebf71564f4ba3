//! Canonical concepts, their graph edges and claims.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults::{DEFAULT_TYPE_COMPATIBILITY, OTHER_TYPE_COMPATIBILITY};
use crate::lexical::{lexical_key, normalize};

// =============================================================================
// CONCEPT TYPE
// =============================================================================

/// Closed set of concept types.
///
/// Unknown tags parse to [`ConceptType::Other`] instead of failing, so an
/// upstream extractor emitting a new tag never blocks resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptType {
    Regulation,
    Standard,
    Organization,
    Person,
    Product,
    Technology,
    Process,
    Location,
    Event,
    Metric,
    Other,
}

impl ConceptType {
    /// All types, in declaration order.
    pub const ALL: [ConceptType; 11] = [
        ConceptType::Regulation,
        ConceptType::Standard,
        ConceptType::Organization,
        ConceptType::Person,
        ConceptType::Product,
        ConceptType::Technology,
        ConceptType::Process,
        ConceptType::Location,
        ConceptType::Event,
        ConceptType::Metric,
        ConceptType::Other,
    ];

    /// Returns the string representation of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConceptType::Regulation => "regulation",
            ConceptType::Standard => "standard",
            ConceptType::Organization => "organization",
            ConceptType::Person => "person",
            ConceptType::Product => "product",
            ConceptType::Technology => "technology",
            ConceptType::Process => "process",
            ConceptType::Location => "location",
            ConceptType::Event => "event",
            ConceptType::Metric => "metric",
            ConceptType::Other => "other",
        }
    }

    /// Parse a free-form type tag, mapping anything unknown to `Other`.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "regulation" | "law" | "directive" => ConceptType::Regulation,
            "standard" | "specification" => ConceptType::Standard,
            "organization" | "organisation" | "company" => ConceptType::Organization,
            "person" => ConceptType::Person,
            "product" => ConceptType::Product,
            "technology" | "tool" => ConceptType::Technology,
            "process" | "method" => ConceptType::Process,
            "location" | "place" => ConceptType::Location,
            "event" => ConceptType::Event,
            "metric" | "measure" => ConceptType::Metric,
            _ => ConceptType::Other,
        }
    }

    /// Types that blocking may pair with this one.
    pub fn compatible_types(&self, min_compatibility: f32) -> Vec<ConceptType> {
        ConceptType::ALL
            .iter()
            .copied()
            .filter(|t| type_compatibility(*self, *t) >= min_compatibility)
            .collect()
    }
}

impl fmt::Display for ConceptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConceptType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_tag(s))
    }
}

/// Related type pairs and their compatibility. Symmetric; identical types are
/// always 1.0 and `other` is handled separately.
const COMPATIBILITY_TABLE: &[(ConceptType, ConceptType, f32)] = &[
    (ConceptType::Regulation, ConceptType::Standard, 0.7),
    (ConceptType::Product, ConceptType::Technology, 0.8),
    (ConceptType::Process, ConceptType::Technology, 0.5),
    (ConceptType::Standard, ConceptType::Technology, 0.5),
    (ConceptType::Organization, ConceptType::Product, 0.4),
    (ConceptType::Organization, ConceptType::Location, 0.2),
    (ConceptType::Event, ConceptType::Process, 0.3),
    (ConceptType::Metric, ConceptType::Standard, 0.3),
];

/// Compatibility of two concept types in [0, 1].
pub fn type_compatibility(a: ConceptType, b: ConceptType) -> f32 {
    if a == b {
        return 1.0;
    }
    if a == ConceptType::Other || b == ConceptType::Other {
        return OTHER_TYPE_COMPATIBILITY;
    }
    COMPATIBILITY_TABLE
        .iter()
        .find(|(x, y, _)| (*x == a && *y == b) || (*x == b && *y == a))
        .map(|(_, _, score)| *score)
        .unwrap_or(DEFAULT_TYPE_COMPATIBILITY)
}

// =============================================================================
// CANONICAL CONCEPT
// =============================================================================

/// Lifecycle status of a canonical concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptStatus {
    /// Authoritative and eligible for resolution.
    #[default]
    Active,
    /// Absorbed by a survivor; `merged_into` points at it.
    Merged,
    /// Retired without a successor.
    Deprecated,
}

impl ConceptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConceptStatus::Active => "active",
            ConceptStatus::Merged => "merged",
            ConceptStatus::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for ConceptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConceptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ConceptStatus::Active),
            "merged" => Ok(ConceptStatus::Merged),
            "deprecated" => Ok(ConceptStatus::Deprecated),
            other => Err(format!("unknown concept status: {}", other)),
        }
    }
}

/// Authoritative deduplicated entity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalConcept {
    pub id: Uuid,
    pub tenant_id: String,
    pub canonical_name: String,
    pub concept_type: ConceptType,
    /// Ordered, duplicate-free (by normalized form).
    pub aliases: Vec<String>,
    pub definition: Option<String>,
    pub lexical_key: String,
    pub status: ConceptStatus,
    pub merged_into: Option<Uuid>,
    pub merged_at: Option<DateTime<Utc>>,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalConcept {
    /// Create a new active concept with a derived lexical key.
    pub fn new(
        tenant_id: impl Into<String>,
        canonical_name: impl Into<String>,
        concept_type: ConceptType,
    ) -> Self {
        let canonical_name = canonical_name.into();
        let now = Utc::now();
        Self {
            id: crate::ids::new_v7(),
            tenant_id: tenant_id.into(),
            lexical_key: lexical_key(&canonical_name),
            canonical_name,
            concept_type,
            aliases: Vec::new(),
            definition: None,
            status: ConceptStatus::Active,
            merged_into: None,
            merged_at: None,
            confidence: 1.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set aliases (deduplicated, canonical name excluded).
    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let aliases: Vec<String> = aliases.into_iter().map(Into::into).collect();
        self.aliases = merge_aliases(&self.canonical_name, &[], &aliases);
        self
    }

    /// Builder: set the definition.
    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = Some(definition.into());
        self
    }

    /// Builder: set the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ConceptStatus::Active
    }

    /// Canonical name followed by aliases.
    pub fn all_names(&self) -> Vec<&str> {
        std::iter::once(self.canonical_name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect()
    }

    /// Hash over identity-relevant fields; changes whenever the name, type,
    /// aliases or definition change.
    pub fn fingerprint(&self) -> String {
        concept_fingerprint(
            &self.canonical_name,
            self.concept_type,
            &self.aliases,
            self.definition.as_deref(),
        )
    }

    /// Hash over the normalized definition, if there is one.
    pub fn definition_fingerprint(&self) -> Option<String> {
        self.definition.as_deref().and_then(definition_fingerprint)
    }

    /// Text used for embeddings and cross-encoder input.
    pub fn embedding_text(&self) -> String {
        match &self.definition {
            Some(def) if !def.trim().is_empty() => {
                format!("{} ({}): {}", self.canonical_name, self.concept_type, def.trim())
            }
            _ => format!("{} ({})", self.canonical_name, self.concept_type),
        }
    }
}

/// Fingerprint over a concept's identity-relevant fields (hex, 32 chars).
pub fn concept_fingerprint(
    name: &str,
    concept_type: ConceptType,
    aliases: &[String],
    definition: Option<&str>,
) -> String {
    let mut normalized_aliases: Vec<String> = aliases.iter().map(|a| normalize(a)).collect();
    normalized_aliases.sort();
    normalized_aliases.dedup();

    let mut hasher = blake3::Hasher::new();
    hasher.update(normalize(name).as_bytes());
    hasher.update(b"\x1f");
    hasher.update(concept_type.as_str().as_bytes());
    hasher.update(b"\x1f");
    for alias in &normalized_aliases {
        hasher.update(alias.as_bytes());
        hasher.update(b"\x1e");
    }
    hasher.update(b"\x1f");
    if let Some(def) = definition {
        hasher.update(normalize(def).as_bytes());
    }
    hasher.finalize().to_hex()[..32].to_string()
}

/// Fingerprint over a normalized definition; `None` for blank definitions.
pub fn definition_fingerprint(definition: &str) -> Option<String> {
    let normalized = normalize(definition);
    if normalized.is_empty() {
        return None;
    }
    Some(blake3::hash(normalized.as_bytes()).to_hex()[..32].to_string())
}

/// Merge alias lists: existing aliases first, then additions, skipping
/// anything equal (after normalization) to the canonical name or to an alias
/// already present. Order of first appearance is kept.
pub fn merge_aliases(canonical_name: &str, existing: &[String], additions: &[String]) -> Vec<String> {
    let mut seen = vec![normalize(canonical_name)];
    let mut out = Vec::with_capacity(existing.len() + additions.len());
    for alias in existing.iter().chain(additions.iter()) {
        let key = normalize(alias);
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(alias.trim().to_string());
    }
    out
}

// =============================================================================
// RELATIONS AND CLAIMS
// =============================================================================

/// Provenance tag pushed onto an edge or claim each time a merge redirects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTag {
    pub merge_id: Uuid,
    /// The concept whose references were rewritten.
    pub merged_id: Uuid,
    pub original_source: Uuid,
    pub original_target: Uuid,
    pub redirected_at: DateTime<Utc>,
}

/// Typed directed edge between two canonical concepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: Uuid,
    pub tenant_id: String,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relation_type: String,
    pub weight: f32,
    /// Redirect history, most recent last.
    pub provenance: Vec<RedirectTag>,
    pub created_at: DateTime<Utc>,
}

impl Relation {
    pub fn new(
        tenant_id: impl Into<String>,
        source_id: Uuid,
        target_id: Uuid,
        relation_type: impl Into<String>,
    ) -> Self {
        Self {
            id: crate::ids::new_v7(),
            tenant_id: tenant_id.into(),
            source_id,
            target_id,
            relation_type: relation_type.into(),
            weight: 1.0,
            provenance: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Endpoints after replacing `from` with `to` on either side.
    pub fn redirected_endpoints(&self, from: Uuid, to: Uuid) -> (Uuid, Uuid) {
        let source = if self.source_id == from { to } else { self.source_id };
        let target = if self.target_id == from { to } else { self.target_id };
        (source, target)
    }

    /// Whether redirecting `from` to `to` would turn this edge into a self-loop.
    pub fn becomes_self_loop(&self, from: Uuid, to: Uuid) -> bool {
        let (source, target) = self.redirected_endpoints(from, to);
        source == target
    }

    /// Rewrite `from` to `to` and push a provenance tag for the merge.
    pub fn apply_redirect(&mut self, from: Uuid, to: Uuid, merge_id: Uuid, at: DateTime<Utc>) {
        self.provenance.push(RedirectTag {
            merge_id,
            merged_id: from,
            original_source: self.source_id,
            original_target: self.target_id,
            redirected_at: at,
        });
        let (source, target) = self.redirected_endpoints(from, to);
        self.source_id = source;
        self.target_id = target;
    }

    /// Undo the redirect recorded for `merge_id`, restoring only the sides
    /// that merge rewrote. Returns false when the edge carries no such tag.
    pub fn undo_redirect(&mut self, merge_id: Uuid) -> bool {
        let Some(pos) = self.provenance.iter().rposition(|t| t.merge_id == merge_id) else {
            return false;
        };
        let tag = self.provenance.remove(pos);
        if tag.original_source == tag.merged_id {
            self.source_id = tag.merged_id;
        }
        if tag.original_target == tag.merged_id {
            self.target_id = tag.merged_id;
        }
        true
    }
}

/// Assertion extracted from a document, referencing concepts as subject
/// and optionally as object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub tenant_id: String,
    pub subject_id: Uuid,
    pub predicate: String,
    pub object_id: Option<Uuid>,
    pub object_literal: Option<String>,
    pub document_id: Option<Uuid>,
    pub provenance: Vec<RedirectTag>,
    pub created_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(
        tenant_id: impl Into<String>,
        subject_id: Uuid,
        predicate: impl Into<String>,
        object_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: crate::ids::new_v7(),
            tenant_id: tenant_id.into(),
            subject_id,
            predicate: predicate.into(),
            object_id,
            object_literal: None,
            document_id: None,
            provenance: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Whether the claim mentions the concept as subject or object.
    pub fn references(&self, concept_id: Uuid) -> bool {
        self.subject_id == concept_id || self.object_id == Some(concept_id)
    }

    /// Rewrite `from` to `to` in subject and object, pushing a provenance tag.
    /// The tag's target slot carries the original object (or the subject for
    /// literal-valued claims).
    pub fn apply_redirect(&mut self, from: Uuid, to: Uuid, merge_id: Uuid, at: DateTime<Utc>) {
        self.provenance.push(RedirectTag {
            merge_id,
            merged_id: from,
            original_source: self.subject_id,
            original_target: self.object_id.unwrap_or(self.subject_id),
            redirected_at: at,
        });
        if self.subject_id == from {
            self.subject_id = to;
        }
        if self.object_id == Some(from) {
            self.object_id = Some(to);
        }
    }

    /// Undo the redirect recorded for `merge_id`.
    pub fn undo_redirect(&mut self, merge_id: Uuid) -> bool {
        let Some(pos) = self.provenance.iter().rposition(|t| t.merge_id == merge_id) else {
            return false;
        };
        let tag = self.provenance.remove(pos);
        if tag.original_source == tag.merged_id {
            self.subject_id = tag.merged_id;
        }
        if self.object_id.is_some() && tag.original_target == tag.merged_id {
            self.object_id = Some(tag.merged_id);
        }
        true
    }
}

/// Aggregate concept counts for operational reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptStats {
    pub total: i64,
    pub active: i64,
    pub merged: i64,
    pub deprecated: i64,
    /// Active concepts that never absorbed another concept.
    pub standalone: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_type_roundtrip_and_fallback() {
        for t in ConceptType::ALL {
            assert_eq!(ConceptType::from_tag(t.as_str()), t);
        }
        assert_eq!(ConceptType::from_tag("Company"), ConceptType::Organization);
        assert_eq!(ConceptType::from_tag("spaceship"), ConceptType::Other);
        assert_eq!("LAW".parse::<ConceptType>().unwrap(), ConceptType::Regulation);
    }

    #[test]
    fn test_type_compatibility_is_symmetric() {
        for a in ConceptType::ALL {
            for b in ConceptType::ALL {
                assert_eq!(type_compatibility(a, b), type_compatibility(b, a));
            }
        }
    }

    #[test]
    fn test_type_compatibility_values() {
        assert_eq!(type_compatibility(ConceptType::Person, ConceptType::Person), 1.0);
        assert_eq!(
            type_compatibility(ConceptType::Regulation, ConceptType::Standard),
            0.7
        );
        assert_eq!(
            type_compatibility(ConceptType::Other, ConceptType::Person),
            OTHER_TYPE_COMPATIBILITY
        );
        assert_eq!(
            type_compatibility(ConceptType::Person, ConceptType::Metric),
            DEFAULT_TYPE_COMPATIBILITY
        );
    }

    #[test]
    fn test_compatible_types() {
        let types = ConceptType::Product.compatible_types(0.5);
        assert!(types.contains(&ConceptType::Product));
        assert!(types.contains(&ConceptType::Technology));
        assert!(types.contains(&ConceptType::Other));
        assert!(!types.contains(&ConceptType::Organization));
    }

    #[test]
    fn test_with_aliases_deduplicates() {
        let c = CanonicalConcept::new("t", "Kubernetes", ConceptType::Technology)
            .with_aliases(["k8s", "K8S", "kubernetes", "Kube"]);
        assert_eq!(c.aliases, vec!["k8s".to_string(), "Kube".to_string()]);
        assert_eq!(c.lexical_key, "kubernetes");
    }

    #[test]
    fn test_merge_aliases_is_idempotent() {
        let once = merge_aliases("GDPR Act", &["EU GDPR".into()], &["GDPR".into()]);
        let twice = merge_aliases("GDPR Act", &once, &["GDPR".into()]);
        assert_eq!(once, twice);
        assert_eq!(once, vec!["EU GDPR".to_string(), "GDPR".to_string()]);
    }

    #[test]
    fn test_fingerprint_tracks_identity_fields() {
        let base = CanonicalConcept::new("t", "Apache Kafka", ConceptType::Technology);
        let same = base.clone();
        assert_eq!(base.fingerprint(), same.fingerprint());
        assert_eq!(base.fingerprint().len(), 32);

        let aliased = base.clone().with_aliases(["Kafka"]);
        assert_ne!(base.fingerprint(), aliased.fingerprint());

        let defined = base.clone().with_definition("A distributed log.");
        assert_ne!(base.fingerprint(), defined.fingerprint());

        let mut retyped = base.clone();
        retyped.concept_type = ConceptType::Product;
        assert_ne!(base.fingerprint(), retyped.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_alias_order_and_case() {
        let a = CanonicalConcept::new("t", "Kafka", ConceptType::Technology)
            .with_aliases(["Apache Kafka", "kafka streams"]);
        let mut b = a.clone();
        b.aliases = vec!["Kafka Streams".into(), "apache kafka".into()];
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_definition_fingerprint() {
        assert_eq!(
            definition_fingerprint("A log."),
            definition_fingerprint("a  LOG")
        );
        assert!(definition_fingerprint("   ").is_none());
    }

    #[test]
    fn test_relation_redirected_endpoints() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let s = Uuid::new_v4();
        let rel = Relation::new("t", a, b, "depends_on");
        assert_eq!(rel.redirected_endpoints(a, s), (s, b));
        assert_eq!(rel.redirected_endpoints(b, s), (a, s));
        assert_eq!(rel.redirected_endpoints(s, a), (a, b));
    }

    #[test]
    fn test_relation_redirect_and_undo() {
        let merged = Uuid::new_v4();
        let survivor = Uuid::new_v4();
        let other = Uuid::new_v4();
        let merge_id = Uuid::new_v4();
        let mut rel = Relation::new("t", merged, other, "cites");
        rel.apply_redirect(merged, survivor, merge_id, Utc::now());
        assert_eq!((rel.source_id, rel.target_id), (survivor, other));
        assert_eq!(rel.provenance.len(), 1);

        assert!(rel.undo_redirect(merge_id));
        assert_eq!((rel.source_id, rel.target_id), (merged, other));
        assert!(rel.provenance.is_empty());
        assert!(!rel.undo_redirect(merge_id));
    }

    #[test]
    fn test_undo_keeps_later_redirect_of_other_side() {
        let b = Uuid::new_v4();
        let a = Uuid::new_v4();
        let y = Uuid::new_v4();
        let z = Uuid::new_v4();
        let m1 = Uuid::new_v4();
        let m2 = Uuid::new_v4();
        let mut rel = Relation::new("t", b, y, "cites");
        rel.apply_redirect(b, a, m1, Utc::now());
        rel.apply_redirect(y, z, m2, Utc::now());
        assert_eq!((rel.source_id, rel.target_id), (a, z));

        assert!(rel.undo_redirect(m1));
        assert_eq!((rel.source_id, rel.target_id), (b, z));
        assert_eq!(rel.provenance.len(), 1);
    }

    #[test]
    fn test_becomes_self_loop() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let rel = Relation::new("t", a, b, "related");
        assert!(rel.becomes_self_loop(b, a));
        assert!(!rel.becomes_self_loop(Uuid::new_v4(), a));
    }

    #[test]
    fn test_claim_redirect_and_undo() {
        let merged = Uuid::new_v4();
        let survivor = Uuid::new_v4();
        let subject = Uuid::new_v4();
        let merge_id = Uuid::new_v4();
        let mut claim = Claim::new("t", subject, "regulates", Some(merged));
        claim.apply_redirect(merged, survivor, merge_id, Utc::now());
        assert_eq!(claim.object_id, Some(survivor));
        assert_eq!(claim.subject_id, subject);

        assert!(claim.undo_redirect(merge_id));
        assert_eq!(claim.object_id, Some(merged));
        assert_eq!(claim.subject_id, subject);
    }

    #[test]
    fn test_claim_references() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let claim = Claim::new("t", a, "regulates", Some(b));
        assert!(claim.references(a));
        assert!(claim.references(b));
        assert!(!claim.references(Uuid::new_v4()));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("merged".parse::<ConceptStatus>().unwrap(), ConceptStatus::Merged);
        assert!("gone".parse::<ConceptStatus>().is_err());
    }
}
