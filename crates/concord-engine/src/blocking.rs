//! Candidate generation (blocking).
//!
//! Turns a population of concepts into a bounded set of plausible duplicate
//! pairs without comparing every concept with every other one. Four lexical
//! indices are built in memory:
//!
//! - exact lexical key (never capped)
//! - single-deletion variants of the lexical key, which pairs keys within one
//!   edit of each other
//! - lexical-key prefix
//! - acronym forms, so "GDPR" meets "General Data Protection Regulation"
//!
//! and the vector index contributes up to a type-specific Top-K of nearest
//! neighbours per concept above a similarity floor. Only pairs whose types are compatible
//! survive. Buckets larger than `max_bucket_size` carry no discriminating
//! signal and are skipped, which keeps the work at O(N·K).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use concord_core::defaults::{
    BLOCKING_MAX_BUCKET_SIZE, BLOCKING_MIN_TYPE_COMPATIBILITY, BLOCKING_MIN_VECTOR_SIMILARITY,
    BLOCKING_PREFIX_LEN, BLOCKING_TOP_K, BLOCKING_TYPE_TOP_K, SCORING_CONCURRENCY,
};
use concord_core::lexical::{acronym_forms, deletion_variants, lexical_key, prefix_key};
use concord_core::{
    type_compatibility, CanonicalConcept, ConceptType, Error, PairId, Result, VectorIndex,
};

use crate::config::{env_flag, env_or};

/// Blocking configuration.
#[derive(Debug, Clone)]
pub struct BlockingConfig {
    /// Nearest neighbours requested per concept of a type without its own
    /// entry in `type_top_k`.
    pub top_k: usize,
    /// Per-type neighbour counts.
    pub type_top_k: BTreeMap<ConceptType, usize>,
    /// Minimum cosine similarity for a vector neighbour.
    pub min_vector_similarity: f32,
    /// Characters of the lexical key used by the prefix index.
    pub prefix_len: usize,
    /// Lexical buckets above this size are skipped.
    pub max_bucket_size: usize,
    /// Minimum type compatibility for a pair to be emitted.
    pub min_type_compatibility: f32,
    /// Query the vector index for neighbours.
    pub vector_enabled: bool,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            top_k: BLOCKING_TOP_K,
            type_top_k: BLOCKING_TYPE_TOP_K.into_iter().collect(),
            min_vector_similarity: BLOCKING_MIN_VECTOR_SIMILARITY,
            prefix_len: BLOCKING_PREFIX_LEN,
            max_bucket_size: BLOCKING_MAX_BUCKET_SIZE,
            min_type_compatibility: BLOCKING_MIN_TYPE_COMPATIBILITY,
            vector_enabled: true,
        }
    }
}

impl BlockingConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CONCORD_BLOCKING_TOP_K` | `10` | Vector neighbours per concept |
    /// | `CONCORD_BLOCKING_TYPE_TOP_K` | see defaults | Per-type overrides, e.g. `person=5,product=20` |
    /// | `CONCORD_BLOCKING_MIN_SIMILARITY` | `0.75` | Vector similarity floor |
    /// | `CONCORD_BLOCKING_PREFIX_LEN` | `5` | Prefix index key length |
    /// | `CONCORD_BLOCKING_MAX_BUCKET` | `50` | Largest lexical bucket paired |
    /// | `CONCORD_BLOCKING_VECTORS` | `true` | Use the vector index |
    pub fn from_env() -> Self {
        let mut type_top_k: BTreeMap<ConceptType, usize> = BLOCKING_TYPE_TOP_K.into_iter().collect();
        if let Ok(raw) = std::env::var("CONCORD_BLOCKING_TYPE_TOP_K") {
            type_top_k.extend(parse_type_top_k(&raw));
        }
        Self {
            top_k: env_or("CONCORD_BLOCKING_TOP_K", BLOCKING_TOP_K).max(1),
            type_top_k,
            min_vector_similarity: env_or(
                "CONCORD_BLOCKING_MIN_SIMILARITY",
                BLOCKING_MIN_VECTOR_SIMILARITY,
            ),
            prefix_len: env_or("CONCORD_BLOCKING_PREFIX_LEN", BLOCKING_PREFIX_LEN).max(1),
            max_bucket_size: env_or("CONCORD_BLOCKING_MAX_BUCKET", BLOCKING_MAX_BUCKET_SIZE).max(2),
            min_type_compatibility: BLOCKING_MIN_TYPE_COMPATIBILITY,
            vector_enabled: env_flag("CONCORD_BLOCKING_VECTORS", true),
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_type_top_k(mut self, concept_type: ConceptType, top_k: usize) -> Self {
        self.type_top_k.insert(concept_type, top_k);
        self
    }

    /// Neighbour count for concepts of `concept_type`.
    pub fn top_k_for(&self, concept_type: ConceptType) -> usize {
        self.type_top_k
            .get(&concept_type)
            .copied()
            .unwrap_or(self.top_k)
    }

    pub fn with_min_vector_similarity(mut self, min: f32) -> Self {
        self.min_vector_similarity = min;
        self
    }

    pub fn with_max_bucket_size(mut self, max: usize) -> Self {
        self.max_bucket_size = max;
        self
    }

    pub fn with_vectors(mut self, enabled: bool) -> Self {
        self.vector_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0
            || self.type_top_k.values().any(|k| *k == 0)
            || self.max_bucket_size < 2
            || self.prefix_len == 0
        {
            return Err(Error::Config(
                "blocking top_k, prefix_len must be >= 1 and max_bucket_size >= 2".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_vector_similarity)
            || !(0.0..=1.0).contains(&self.min_type_compatibility)
        {
            return Err(Error::Config(
                "blocking similarity floors must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse `type=k` pairs separated by commas. Malformed entries are skipped.
fn parse_type_top_k(raw: &str) -> Vec<(ConceptType, usize)> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, k) = entry.split_once('=')?;
            let concept_type = name.trim().parse::<ConceptType>().ok()?;
            let k = k.trim().parse::<usize>().ok().filter(|k| *k > 0)?;
            Some((concept_type, k))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BlockKey {
    Exact(String),
    Edit(String),
    Prefix(String),
    Acronym(String),
}

impl BlockKey {
    fn capped(&self) -> bool {
        !matches!(self, BlockKey::Exact(_))
    }
}

/// Every bucket key a concept lands in, over its canonical name and aliases.
fn block_keys(concept: &CanonicalConcept, prefix_len: usize) -> HashSet<BlockKey> {
    let mut keys = HashSet::new();
    for name in concept.all_names() {
        let key = lexical_key(name);
        if key.is_empty() {
            continue;
        }
        for variant in deletion_variants(&key) {
            keys.insert(BlockKey::Edit(variant));
        }
        if let Some(prefix) = prefix_key(&key, prefix_len) {
            keys.insert(BlockKey::Prefix(prefix));
        }
        for form in acronym_forms(name) {
            keys.insert(BlockKey::Acronym(form));
        }
        keys.insert(BlockKey::Exact(key));
    }
    keys
}

/// In-memory lexical index over one population.
struct LexicalIndex {
    buckets: HashMap<BlockKey, Vec<usize>>,
}

impl LexicalIndex {
    fn build<'a>(concepts: impl Iterator<Item = (usize, &'a CanonicalConcept)>, prefix_len: usize) -> Self {
        let mut buckets: HashMap<BlockKey, Vec<usize>> = HashMap::new();
        for (i, concept) in concepts {
            for key in block_keys(concept, prefix_len) {
                buckets.entry(key).or_default().push(i);
            }
        }
        Self { buckets }
    }
}

/// Candidate pairs from one blocking pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockingOutput {
    /// Deduplicated pairs, sorted.
    pub pairs: Vec<PairId>,
    /// Pairs contributed by the lexical indices.
    pub lexical_pairs: usize,
    /// Pairs contributed by the vector index (before deduplication).
    pub vector_pairs: usize,
    /// Oversized lexical buckets that were skipped.
    pub skipped_buckets: usize,
}

fn compatible(a: ConceptType, b: ConceptType, min: f32) -> bool {
    type_compatibility(a, b) >= min
}

/// Blocking over lexical indices and an optional vector index.
pub struct CandidateFinder {
    vectors: Option<Arc<dyn VectorIndex>>,
    config: BlockingConfig,
    call_timeout: Duration,
}

impl CandidateFinder {
    pub fn new(
        vectors: Option<Arc<dyn VectorIndex>>,
        config: BlockingConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            vectors,
            config,
            call_timeout,
        }
    }

    pub fn config(&self) -> &BlockingConfig {
        &self.config
    }

    /// Pairs within a whole population (batch mode).
    #[instrument(skip(self, concepts), fields(subsystem = "engine", component = "blocking", op = "find_all", tenant_id = %tenant_id, population = concepts.len()))]
    pub async fn find_all(
        &self,
        tenant_id: &str,
        concepts: &[CanonicalConcept],
    ) -> Result<BlockingOutput> {
        let index = LexicalIndex::build(concepts.iter().enumerate(), self.config.prefix_len);
        let mut pairs: HashSet<PairId> = HashSet::new();
        let mut skipped_buckets = 0;

        for (key, members) in &index.buckets {
            if members.len() < 2 {
                continue;
            }
            if key.capped() && members.len() > self.config.max_bucket_size {
                trace!(bucket = ?key, size = members.len(), "Skipping oversized bucket");
                skipped_buckets += 1;
                continue;
            }
            for (n, &i) in members.iter().enumerate() {
                for &j in &members[n + 1..] {
                    let (a, b) = (&concepts[i], &concepts[j]);
                    if compatible(a.concept_type, b.concept_type, self.config.min_type_compatibility) {
                        pairs.insert(PairId::new(a.id, b.id));
                    }
                }
            }
        }
        let lexical_pairs = pairs.len();

        let types: HashMap<Uuid, ConceptType> =
            concepts.iter().map(|c| (c.id, c.concept_type)).collect();
        let sources: Vec<&CanonicalConcept> = concepts.iter().collect();
        let vector = self.vector_pairs(tenant_id, &sources, &types).await?;
        let vector_pairs = vector.len();
        pairs.extend(vector);

        let output = finish(pairs, lexical_pairs, vector_pairs, skipped_buckets);
        debug!(
            candidate_count = output.pairs.len(),
            lexical_pairs, vector_pairs, skipped_buckets, "Blocking complete"
        );
        Ok(output)
    }

    /// Pairs between one target concept and a population (incremental mode).
    #[instrument(skip(self, target, population), fields(subsystem = "engine", component = "blocking", op = "find_for", tenant_id = %tenant_id, concept_id = %target.id, population = population.len()))]
    pub async fn find_for(
        &self,
        tenant_id: &str,
        target: &CanonicalConcept,
        population: &[CanonicalConcept],
    ) -> Result<BlockingOutput> {
        let others = population.iter().enumerate().filter(|(_, c)| c.id != target.id);
        let index = LexicalIndex::build(others, self.config.prefix_len);
        let mut pairs: HashSet<PairId> = HashSet::new();
        let mut skipped_buckets = 0;

        for key in block_keys(target, self.config.prefix_len) {
            let Some(members) = index.buckets.get(&key) else {
                continue;
            };
            // The target joins the bucket, so the cap counts it too.
            if key.capped() && members.len() + 1 > self.config.max_bucket_size {
                trace!(bucket = ?key, size = members.len() + 1, "Skipping oversized bucket");
                skipped_buckets += 1;
                continue;
            }
            for &i in members {
                let other = &population[i];
                if compatible(
                    target.concept_type,
                    other.concept_type,
                    self.config.min_type_compatibility,
                ) {
                    pairs.insert(PairId::new(target.id, other.id));
                }
            }
        }
        let lexical_pairs = pairs.len();

        let types: HashMap<Uuid, ConceptType> = population
            .iter()
            .filter(|c| c.id != target.id)
            .map(|c| (c.id, c.concept_type))
            .collect();
        let vector = self.vector_pairs(tenant_id, &[target], &types).await?;
        let vector_pairs = vector.len();
        pairs.extend(vector);

        Ok(finish(pairs, lexical_pairs, vector_pairs, skipped_buckets))
    }

    /// Nearest-neighbour pairs for each source concept, restricted to the
    /// population in `types`. Index failures surface as [`Error::Blocking`].
    async fn vector_pairs(
        &self,
        tenant_id: &str,
        sources: &[&CanonicalConcept],
        types: &HashMap<Uuid, ConceptType>,
    ) -> Result<Vec<PairId>> {
        let Some(vectors) = self.vectors.as_ref().filter(|_| self.config.vector_enabled) else {
            return Ok(Vec::new());
        };

        let per_source: Vec<Vec<PairId>> = stream::iter(sources.iter().copied())
            .map(|source| self.neighbours(&**vectors, tenant_id, source, types))
            .buffer_unordered(SCORING_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(per_source.into_iter().flatten().collect())
    }

    async fn neighbours(
        &self,
        vectors: &dyn VectorIndex,
        tenant_id: &str,
        source: &CanonicalConcept,
        types: &HashMap<Uuid, ConceptType>,
    ) -> Result<Vec<PairId>> {
        let blocking_error = |e: Error| Error::Blocking(format!("vector index: {}", e));
        let elapsed = |_| Error::Blocking("vector index timed out".to_string());

        let vector = timeout(self.call_timeout, vectors.get_vector(tenant_id, source.id))
            .await
            .map_err(elapsed)?
            .map_err(blocking_error)?;
        let Some(vector) = vector else {
            return Ok(Vec::new());
        };

        let top_k = self.config.top_k_for(source.concept_type);
        let compatible_types = source
            .concept_type
            .compatible_types(self.config.min_type_compatibility);
        let hits = timeout(
            self.call_timeout,
            vectors.search(tenant_id, &vector, &compatible_types, top_k + 1),
        )
        .await
        .map_err(elapsed)?
        .map_err(blocking_error)?;

        Ok(hits
            .into_iter()
            .filter(|hit| hit.concept_id != source.id)
            .filter(|hit| hit.similarity >= self.config.min_vector_similarity)
            .filter(|hit| match types.get(&hit.concept_id) {
                Some(t) => compatible(source.concept_type, *t, self.config.min_type_compatibility),
                None => false,
            })
            .take(top_k)
            .map(|hit| PairId::new(source.id, hit.concept_id))
            .collect())
    }
}

fn finish(
    pairs: HashSet<PairId>,
    lexical_pairs: usize,
    vector_pairs: usize,
    skipped_buckets: usize,
) -> BlockingOutput {
    let mut pairs: Vec<PairId> = pairs.into_iter().collect();
    pairs.sort();
    BlockingOutput {
        pairs,
        lexical_pairs,
        vector_pairs,
        skipped_buckets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use concord_core::VectorHit;
    use std::sync::Mutex;

    fn concept(name: &str, t: ConceptType) -> CanonicalConcept {
        CanonicalConcept::new("t", name, t)
    }

    fn finder(vectors: Option<Arc<dyn VectorIndex>>) -> CandidateFinder {
        CandidateFinder::new(vectors, BlockingConfig::default(), Duration::from_secs(1))
    }

    fn has(output: &BlockingOutput, a: &CanonicalConcept, b: &CanonicalConcept) -> bool {
        output.pairs.contains(&PairId::new(a.id, b.id))
    }

    /// Vector index with fixed vectors and brute-force search.
    #[derive(Default)]
    struct FixedVectors {
        vectors: Mutex<Vec<(Uuid, ConceptType, Vec<f32>)>>,
        failing: bool,
    }

    impl FixedVectors {
        fn add(&self, c: &CanonicalConcept, v: Vec<f32>) {
            self.vectors.lock().unwrap().push((c.id, c.concept_type, v));
        }
    }

    #[async_trait]
    impl VectorIndex for FixedVectors {
        async fn upsert(&self, _: &str, _: Uuid, _: ConceptType, _: &[f32]) -> Result<()> {
            Ok(())
        }

        async fn get_vector(&self, _: &str, id: Uuid) -> Result<Option<Vec<f32>>> {
            if self.failing {
                return Err(Error::Embedding("down".to_string()));
            }
            Ok(self
                .vectors
                .lock()
                .unwrap()
                .iter()
                .find(|(i, _, _)| *i == id)
                .map(|(_, _, v)| v.clone()))
        }

        async fn search(
            &self,
            _: &str,
            vector: &[f32],
            types: &[ConceptType],
            top_k: usize,
        ) -> Result<Vec<VectorHit>> {
            let mut hits: Vec<VectorHit> = self
                .vectors
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, t, _)| types.is_empty() || types.contains(t))
                .map(|(id, t, v)| VectorHit {
                    concept_id: *id,
                    concept_type: *t,
                    similarity: concord_core::lexical::cosine_similarity(vector, v),
                })
                .collect();
            hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
            hits.truncate(top_k);
            Ok(hits)
        }

        async fn remove(&self, _: &str, _: Uuid) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_acronym_and_expansion_are_paired() {
        let gdpr = concept("GDPR", ConceptType::Regulation);
        let long = concept("General Data Protection Regulation (GDPR)", ConceptType::Regulation);
        let iso = concept("ISO 27001", ConceptType::Standard);
        let out = finder(None)
            .find_all("t", &[gdpr.clone(), long.clone(), iso.clone()])
            .await
            .unwrap();
        assert!(has(&out, &gdpr, &long));
        assert!(!has(&out, &gdpr, &iso));
    }

    #[tokio::test]
    async fn test_single_edit_and_prefix_buckets() {
        let a = concept("Kubernetes", ConceptType::Technology);
        let typo = concept("Kubernetis", ConceptType::Technology);
        let longer = concept("Kubernetes Engine", ConceptType::Technology);
        let out = finder(None)
            .find_all("t", &[a.clone(), typo.clone(), longer.clone()])
            .await
            .unwrap();
        assert!(has(&out, &a, &typo));
        assert!(has(&out, &a, &longer));
    }

    #[tokio::test]
    async fn test_incompatible_types_are_never_paired() {
        let person = concept("Jordan", ConceptType::Person);
        let place = concept("Jordan", ConceptType::Location);
        let out = finder(None)
            .find_all("t", &[person, place])
            .await
            .unwrap();
        assert!(out.pairs.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_prefix_bucket_is_skipped() {
        let concepts: Vec<CanonicalConcept> = (0..60)
            .map(|i| concept(&format!("Alpha{}", i * 7919), ConceptType::Product))
            .collect();
        let out = CandidateFinder::new(
            None,
            BlockingConfig::default().with_max_bucket_size(50),
            Duration::from_secs(1),
        )
        .find_all("t", &concepts)
        .await
        .unwrap();
        assert!(out.skipped_buckets >= 1);
        // Far fewer than the 1770 all-pairs comparisons.
        assert!(out.pairs.len() < 100, "got {} pairs", out.pairs.len());
    }

    #[tokio::test]
    async fn test_find_for_only_emits_target_pairs() {
        let target = concept("ISO/IEC 27001", ConceptType::Standard);
        let same = concept("ISO IEC 27001", ConceptType::Standard);
        let x = concept("SOC 2", ConceptType::Standard);
        let y = concept("SOC 2 Type II", ConceptType::Standard);
        let population = vec![target.clone(), same.clone(), x.clone(), y.clone()];
        let out = finder(None).find_for("t", &target, &population).await.unwrap();
        assert!(has(&out, &target, &same));
        assert!(out.pairs.iter().all(|p| p.contains(target.id)));
    }

    #[tokio::test]
    async fn test_vector_neighbours_above_floor() {
        let a = concept("Customer churn", ConceptType::Metric);
        let b = concept("Attrition rate", ConceptType::Metric);
        let c = concept("Net promoter score", ConceptType::Metric);
        let index = Arc::new(FixedVectors::default());
        index.add(&a, vec![1.0, 0.0, 0.0]);
        index.add(&b, vec![0.95, 0.05, 0.0]);
        index.add(&c, vec![0.0, 1.0, 0.0]);
        let out = finder(Some(index))
            .find_all("t", &[a.clone(), b.clone(), c.clone()])
            .await
            .unwrap();
        assert!(has(&out, &a, &b));
        assert!(!has(&out, &a, &c));
        assert!(out.vector_pairs >= 1);
    }

    #[tokio::test]
    async fn test_vector_neighbours_capped_per_type() {
        // Names share no lexical key, so every pair comes from the vector index.
        let people: Vec<CanonicalConcept> = ["Avery", "Blake", "Casey", "Devon"]
            .into_iter()
            .map(|n| concept(n, ConceptType::Person))
            .collect();
        let products: Vec<CanonicalConcept> = ["Quartz", "Nimbus", "Vertex", "Harbor"]
            .into_iter()
            .map(|n| concept(n, ConceptType::Product))
            .collect();
        let index = Arc::new(FixedVectors::default());
        for (i, c) in people.iter().enumerate() {
            index.add(c, vec![1.0, 0.01 * i as f32, 0.0]);
        }
        for (i, c) in products.iter().enumerate() {
            index.add(c, vec![0.0, 0.01 * i as f32, 1.0]);
        }
        let config = BlockingConfig::default()
            .with_top_k(3)
            .with_type_top_k(ConceptType::Person, 1);
        assert_eq!(config.top_k_for(ConceptType::Person), 1);
        assert_eq!(config.top_k_for(ConceptType::Metric), 3);

        let finder = CandidateFinder::new(Some(index), config, Duration::from_secs(1));
        let person = finder.find_for("t", &people[0], &people).await.unwrap();
        assert_eq!(person.vector_pairs, 1);
        assert_eq!(person.pairs.len(), 1);

        let product = finder.find_for("t", &products[0], &products).await.unwrap();
        assert_eq!(product.pairs.len(), 3);
    }

    #[test]
    fn test_type_top_k_overrides_parse() {
        let parsed = parse_type_top_k("person=2, product = 20,bogus,metric=0,standard=x");
        assert_eq!(parsed, vec![(ConceptType::Person, 2), (ConceptType::Product, 20)]);
        let err = BlockingConfig::default()
            .with_type_top_k(ConceptType::Event, 0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_vector_failure_is_blocking_error() {
        let a = concept("Customer churn", ConceptType::Metric);
        let index = Arc::new(FixedVectors {
            failing: true,
            ..Default::default()
        });
        let err = finder(Some(index)).find_all("t", &[a]).await.unwrap_err();
        assert!(matches!(err, Error::Blocking(_)));
    }

    #[tokio::test]
    async fn test_pairs_are_deduplicated_and_sorted() {
        let a = concept("Data Processing Agreement", ConceptType::Regulation);
        let b = concept("Data Processing Agreement (DPA)", ConceptType::Regulation);
        let out = finder(None).find_all("t", &[a, b]).await.unwrap();
        assert_eq!(out.pairs.len(), 1);
        let mut sorted = out.pairs.clone();
        sorted.sort();
        assert_eq!(sorted, out.pairs);
    }
}
