//! Pipeline context and the unified resolution engine.
//!
//! One [`ResolutionEngine`] serves both modes. Incremental resolution blocks
//! a single concept against the population and routes by per-type
//! thresholds; corpus runs block the whole population, prune to mutual-best
//! neighbours and classify with decision v2. Scoring, the reject filter, the
//! gate and merge execution are shared.
//!
//! Pairs are scored concurrently; decisions are then executed one pair at a
//! time, and cancellation is only observed between pairs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use concord_core::{
    CanonicalConcept, CrossEncoder, Decision, DeferredMergeCandidate, DeferredRepository,
    EmbeddingBackend, Error, EvidenceCounters, GenerationBackend, GraphStore, KeyValueCache,
    MergeAuditRepository, MergeCandidate, MergeProposal, MergeResult, MergeTrigger, PairId,
    ProposalRepository, RejectEntry, ResolutionStats, Result, RollbackRecord, VectorIndex,
};

use crate::blocking::{BlockingOutput, CandidateFinder};
use crate::cancel::CancelSignal;
use crate::config::{EngineConfig, EngineMode};
use crate::corpus::{apply_budget, decide_v2, prune};
use crate::deferred::{DeferredStore, REASON_DEFER_EXPIRED, REASON_QUEUE_OVERFLOW};
use crate::gate::{GateEffect, LlmGate};
use crate::locks::MergeLocks;
use crate::merge_store::MergeStore;
use crate::reject_store::{reject_entry, RejectStore};
use crate::report::RunReport;
use crate::resolver::{IdentityResolver, MergeRequest};
use crate::router::{route, SafetyContext};
use crate::score_cache::ScoreCache;
use crate::scorer::{PairScorer, ScoreOptions};

/// Texts embedded per backend call when indexing.
const EMBED_BATCH: usize = 32;

/// Reject reason when the gate is confident a pair is distinct.
pub const REASON_GATE_DISTINCT: &str = "gate_distinct";

/// Decision reason when the gate did not confirm an AUTO pair.
pub const REASON_GATE_DOWNGRADED: &str = "gate_downgraded";

/// The collaborators one engine instance works against.
#[derive(Clone)]
pub struct PipelineContext {
    pub graph: Arc<dyn GraphStore>,
    pub deferred: Arc<dyn DeferredRepository>,
    pub proposals: Arc<dyn ProposalRepository>,
    pub audit: Arc<dyn MergeAuditRepository>,
    pub vectors: Option<Arc<dyn VectorIndex>>,
    pub cache: Option<Arc<dyn KeyValueCache>>,
    pub embedder: Option<Arc<dyn EmbeddingBackend>>,
    pub cross_encoder: Option<Arc<dyn CrossEncoder>>,
    pub generation: Option<Arc<dyn GenerationBackend>>,
}

impl PipelineContext {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        deferred: Arc<dyn DeferredRepository>,
        proposals: Arc<dyn ProposalRepository>,
        audit: Arc<dyn MergeAuditRepository>,
    ) -> Self {
        Self {
            graph,
            deferred,
            proposals,
            audit,
            vectors: None,
            cache: None,
            embedder: None,
            cross_encoder: None,
            generation: None,
        }
    }

    pub fn with_vectors(mut self, vectors: Arc<dyn VectorIndex>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn KeyValueCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingBackend>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_cross_encoder(mut self, cross_encoder: Arc<dyn CrossEncoder>) -> Self {
        self.cross_encoder = Some(cross_encoder);
        self
    }

    pub fn with_generation(mut self, generation: Arc<dyn GenerationBackend>) -> Self {
        self.generation = Some(generation);
        self
    }
}

/// Options for a deferred-queue reevaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReevaluateOptions {
    /// Only entries whose combined document count reaches this.
    pub min_docs: Option<i64>,
    /// Entries to process; the configured batch limit when `None`.
    pub limit: Option<usize>,
}

/// A candidate with its decision.
#[derive(Debug, Clone)]
struct Routed {
    candidate: MergeCandidate,
    decision: Decision,
    reason: String,
    evidence: EvidenceCounters,
}

/// Where the routed pairs came from.
enum Origin<'a> {
    Blocking,
    Deferred(&'a HashMap<PairId, DeferredMergeCandidate>),
}

enum ScoreOutcome {
    Scored(crate::scorer::ScoredPair),
    Rejected,
    Cancelled,
}

type ConceptMap = HashMap<Uuid, CanonicalConcept>;

/// Entity resolution engine for one tenant.
pub struct ResolutionEngine {
    config: EngineConfig,
    ctx: PipelineContext,
    finder: CandidateFinder,
    scorer: PairScorer,
    rejects: RejectStore,
    deferred: Arc<DeferredStore>,
    gate: Option<LlmGate>,
    resolver: IdentityResolver,
    merge_store: MergeStore,
}

impl ResolutionEngine {
    pub fn new(ctx: PipelineContext, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let tenant = config.tenant_id.clone();
        let call_timeout = config.external_timeout();

        let score_cache = ScoreCache::new(ctx.cache.clone(), tenant.clone(), config.score_ttl_secs);
        let rejects = RejectStore::new(ctx.cache.clone(), tenant.clone(), config.reject_ttl_secs);
        let finder = CandidateFinder::new(ctx.vectors.clone(), config.blocking.clone(), call_timeout);
        let scorer = PairScorer::new(tenant.clone(), score_cache.clone(), call_timeout)
            .with_embedder(ctx.embedder.clone())
            .with_cross_encoder(ctx.cross_encoder.clone())
            .with_vectors(ctx.vectors.clone());
        let deferred = Arc::new(DeferredStore::new(
            ctx.deferred.clone(),
            tenant.clone(),
            config.deferred.clone(),
        ));
        let gate = match (&ctx.generation, config.gate.enabled) {
            (Some(backend), true) => Some(LlmGate::new(backend.clone(), config.gate.clone())),
            (None, true) => {
                warn!(tenant_id = %tenant, "Gate enabled without a generation backend, running ungated");
                None
            }
            _ => None,
        };
        let resolver = IdentityResolver::new(
            tenant.clone(),
            ctx.graph.clone(),
            ctx.audit.clone(),
            score_cache,
            rejects.clone(),
            Arc::new(MergeLocks::new()),
        )
        .with_deferred(deferred.clone())
        .with_vectors(ctx.vectors.clone());
        let merge_store = MergeStore::new(tenant, ctx.proposals.clone());

        Ok(Self {
            config,
            ctx,
            finder,
            scorer,
            rejects,
            deferred,
            gate,
            resolver,
            merge_store,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tenant_id(&self) -> &str {
        &self.config.tenant_id
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn reject_store(&self) -> &RejectStore {
        &self.rejects
    }

    pub fn deferred_store(&self) -> &DeferredStore {
        &self.deferred
    }

    pub fn merge_store(&self) -> &MergeStore {
        &self.merge_store
    }

    // =========================================================================
    // INDEXING
    // =========================================================================

    /// Store concepts and index their embeddings. Returns how many vectors
    /// were written; embedding failures only log.
    #[instrument(skip(self, concepts), fields(subsystem = "engine", component = "pipeline", op = "index_concepts", tenant_id = %self.config.tenant_id, result_count = concepts.len()))]
    pub async fn index_concepts(&self, concepts: &[CanonicalConcept]) -> Result<usize> {
        for concept in concepts {
            if concept.tenant_id != self.config.tenant_id {
                return Err(Error::InvalidInput(format!(
                    "concept {} belongs to tenant {}",
                    concept.id, concept.tenant_id
                )));
            }
            self.ctx.graph.upsert_concept(concept).await?;
        }
        Ok(self.index_vectors(concepts).await)
    }

    /// Embed and store vectors for concepts that have none yet.
    async fn index_vectors(&self, concepts: &[CanonicalConcept]) -> usize {
        let (Some(vectors), Some(embedder)) = (&self.ctx.vectors, &self.ctx.embedder) else {
            return 0;
        };
        let tenant = self.config.tenant_id.as_str();
        let call_timeout = self.config.external_timeout();

        let mut missing: Vec<&CanonicalConcept> = Vec::new();
        for concept in concepts {
            match timeout(call_timeout, vectors.get_vector(tenant, concept.id)).await {
                Ok(Ok(Some(_))) => {}
                Ok(Ok(None)) => missing.push(concept),
                Ok(Err(e)) => {
                    warn!(concept_id = %concept.id, error = %e, "Vector lookup failed, skipping indexing");
                    return 0;
                }
                Err(_) => {
                    warn!(concept_id = %concept.id, "Vector lookup timed out, skipping indexing");
                    return 0;
                }
            }
        }

        let mut written = 0;
        for chunk in missing.chunks(EMBED_BATCH) {
            let texts: Vec<String> = chunk.iter().map(|c| c.embedding_text()).collect();
            let embedded = match timeout(call_timeout, embedder.embed_texts(&texts)).await {
                Ok(Ok(v)) if v.len() == chunk.len() => v,
                Ok(Ok(v)) => {
                    warn!(expected = chunk.len(), got = v.len(), "Embedding count mismatch, skipping batch");
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Embedding failed, concepts stay unindexed");
                    continue;
                }
                Err(_) => {
                    warn!("Embedding timed out, concepts stay unindexed");
                    continue;
                }
            };
            for (concept, vector) in chunk.iter().zip(embedded) {
                match vectors.upsert(tenant, concept.id, concept.concept_type, &vector).await {
                    Ok(()) => written += 1,
                    Err(e) => warn!(concept_id = %concept.id, error = %e, "Vector upsert failed"),
                }
            }
        }
        debug!(written, "Vectors indexed");
        written
    }

    // =========================================================================
    // RUNS
    // =========================================================================

    /// Resolve one concept against the active population.
    #[instrument(skip(self, cancel), fields(subsystem = "engine", component = "pipeline", op = "resolve_concept", tenant_id = %self.config.tenant_id, concept_id = %concept_id))]
    pub async fn resolve_concept(&self, concept_id: Uuid, cancel: &CancelSignal) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::new(self.tenant_id(), "resolve", EngineMode::Incremental);
        let target = self
            .ctx
            .graph
            .get_concept(self.tenant_id(), concept_id)
            .await?
            .ok_or(Error::ConceptNotFound(concept_id))?;
        if !target.is_active() {
            report.skipped_inactive += 1;
            report.finish();
            return Ok(report);
        }

        let types = target
            .concept_type
            .compatible_types(self.config.blocking.min_type_compatibility);
        let population = self
            .ctx
            .graph
            .list_active_concepts(self.tenant_id(), &types)
            .await?;
        self.index_vectors(std::slice::from_ref(&target)).await;

        let blocking = self.finder.find_for(self.tenant_id(), &target, &population).await;
        let Some(blocking) = self.blocking_or_abort(blocking, &mut report)? else {
            return Ok(report);
        };

        let mut concepts: ConceptMap = population.into_iter().map(|c| (c.id, c)).collect();
        concepts.insert(target.id, target);
        let pairs = pairs_for(&blocking.pairs, &concepts);

        let candidates = self
            .score_pairs(pairs, ScoreOptions::default(), true, cancel, &mut report)
            .await;
        let mut routed = self.route_incremental(candidates, &concepts, &mut report).await?;
        self.apply_gate(&mut routed, &concepts, EngineMode::Incremental, &mut report).await;
        self.execute(
            routed,
            &concepts,
            MergeTrigger::Incremental,
            Origin::Blocking,
            false,
            cancel,
            &mut report,
        )
        .await?;

        report.finish();
        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            candidate_count = report.candidates,
            merged = report.merged,
            deferred = report.deferred,
            rejected = report.rejected,
            "Concept resolved"
        );
        Ok(report)
    }

    /// Resolve the whole active corpus with pruning and decision v2.
    #[instrument(skip(self, cancel), fields(subsystem = "engine", component = "pipeline", op = "run_corpus", tenant_id = %self.config.tenant_id))]
    pub async fn run_corpus(&self, dry_run: bool, cancel: &CancelSignal) -> Result<RunReport> {
        let started = Instant::now();
        let mut report =
            RunReport::new(self.tenant_id(), "corpus", EngineMode::Batch).with_dry_run(dry_run);
        let population = self.ctx.graph.list_active_concepts(self.tenant_id(), &[]).await?;

        let blocking = self.finder.find_all(self.tenant_id(), &population).await;
        let Some(blocking) = self.blocking_or_abort(blocking, &mut report)? else {
            return Ok(report);
        };

        let concepts: ConceptMap = population.into_iter().map(|c| (c.id, c)).collect();
        let pairs = pairs_for(&blocking.pairs, &concepts);
        let candidates = self
            .score_pairs(pairs, ScoreOptions::default(), true, cancel, &mut report)
            .await;

        let (kept, stats) = prune(candidates, &self.config.corpus);
        report.record_prune(&stats);
        debug!(?stats, "Corpus pruned");

        let mut routed: Vec<Routed> = kept
            .into_iter()
            .map(|candidate| {
                let (decision, reason) =
                    decide_v2(&candidate.signals, self.config.corpus.min_type_compatibility);
                Routed {
                    candidate,
                    decision,
                    reason: reason.to_string(),
                    evidence: EvidenceCounters::default(),
                }
            })
            .collect();
        self.apply_gate(&mut routed, &concepts, EngineMode::Batch, &mut report).await;

        let (proposals, others): (Vec<Routed>, Vec<Routed>) = routed
            .into_iter()
            .partition(|r| r.decision == Decision::Propose);
        let (proposals, dropped) = apply_budget(proposals, self.config.corpus.proposal_budget, |r| {
            (r.candidate.score, r.candidate.pair_id)
        });
        report.budget_dropped = dropped;
        if dropped > 0 {
            info!(dropped, budget = self.config.corpus.proposal_budget, "Proposal budget reached");
        }

        let mut routed = others;
        routed.extend(proposals);
        self.execute(
            routed,
            &concepts,
            MergeTrigger::Corpus,
            Origin::Blocking,
            dry_run,
            cancel,
            &mut report,
        )
        .await?;

        report.finish();
        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            candidate_count = report.candidates,
            merged = report.merged,
            proposed = report.proposed,
            rejected = report.rejected,
            budget_dropped = report.budget_dropped,
            dry_run,
            cancelled = report.cancelled,
            "Corpus run complete"
        );
        Ok(report)
    }

    /// Rescore pending deferred candidates with fresh evidence.
    #[instrument(skip(self, cancel), fields(subsystem = "engine", component = "reevaluator", op = "reevaluate", tenant_id = %self.config.tenant_id))]
    pub async fn reevaluate_deferred(
        &self,
        options: ReevaluateOptions,
        cancel: &CancelSignal,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let now = Utc::now();
        let mut report = RunReport::new(self.tenant_id(), "reevaluate", EngineMode::Incremental);

        let expired = self.deferred.purge_expired(now).await?;
        report.expired = expired.len();
        let mut concepts = ConceptMap::new();
        let expired_rejects = self
            .rejects_for_deferred(&expired, REASON_DEFER_EXPIRED, &mut concepts, &mut report)
            .await?;

        let limit = options.limit.unwrap_or(self.config.deferred.batch_limit);
        let pending = self.deferred.pending(now, options.min_docs, limit).await?;
        report.candidates = pending.len();

        let ids: Vec<Uuid> = pending
            .iter()
            .flat_map(|e| [e.id_a, e.id_b])
            .filter(|id| !concepts.contains_key(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for concept in self.ctx.graph.get_concepts(self.tenant_id(), &ids).await? {
            concepts.insert(concept.id, concept);
        }

        let mut entries: HashMap<PairId, DeferredMergeCandidate> = HashMap::new();
        let mut pairs = Vec::with_capacity(pending.len());
        for entry in pending {
            let live = match (concepts.get(&entry.id_a), concepts.get(&entry.id_b)) {
                (Some(a), Some(b)) if a.is_active() && b.is_active() => Some((a.clone(), b.clone())),
                _ => None,
            };
            match live {
                Some(pair) => {
                    pairs.push(pair);
                    entries.insert(entry.pair_id, entry);
                }
                None => {
                    report.skipped_inactive += 1;
                    self.soft(self.deferred.remove(&entry.pair_id).await, &mut report, "remove deferred entry")?;
                }
            }
        }

        let candidates = self
            .score_pairs(pairs, ScoreOptions::fresh(), false, cancel, &mut report)
            .await;
        let mut routed = self.route_incremental(candidates, &concepts, &mut report).await?;
        self.apply_gate(&mut routed, &concepts, EngineMode::Incremental, &mut report).await;
        self.execute(
            routed,
            &concepts,
            MergeTrigger::Reevaluation,
            Origin::Deferred(&entries),
            false,
            cancel,
            &mut report,
        )
        .await?;

        if !expired_rejects.is_empty() {
            let written = self.rejects.insert_many(&expired_rejects).await;
            debug!(written, "Expired deferred entries recorded as rejects");
        }
        report.finish();
        info!(
            duration_ms = started.elapsed().as_millis() as u64,
            result_count = report.candidates,
            merged = report.merged,
            deferred = report.deferred,
            rejected = report.rejected,
            expired = report.expired,
            "Deferred reevaluation complete"
        );
        Ok(report)
    }

    /// Count newly ingested documents; reevaluates the deferred queue once
    /// the configured interval is reached.
    pub async fn on_documents_ingested(&self, documents: u64) -> Result<Option<RunReport>> {
        if !self.deferred.record_documents(documents) {
            return Ok(None);
        }
        debug!(tenant_id = %self.config.tenant_id, "Document interval reached, reevaluating deferred queue");
        let report = self
            .reevaluate_deferred(ReevaluateOptions::default(), &CancelSignal::never())
            .await?;
        Ok(Some(report))
    }

    // =========================================================================
    // OPERATOR ACTIONS
    // =========================================================================

    pub async fn apply_proposal(&self, proposal_id: Uuid, applied_by: &str) -> Result<MergeResult> {
        self.merge_store.apply(proposal_id, applied_by, &self.resolver).await
    }

    /// Undo a merge and re-index the restored concept's vector.
    pub async fn rollback_merge(&self, merge_id: Uuid, rolled_back_by: Option<&str>) -> Result<RollbackRecord> {
        let record = self.resolver.rollback(merge_id, rolled_back_by).await?;
        match self.ctx.graph.get_concept(self.tenant_id(), record.merged_id).await {
            Ok(Some(restored)) => {
                self.index_vectors(std::slice::from_ref(&restored)).await;
            }
            Ok(None) => {}
            Err(e) => warn!(concept_id = %record.merged_id, error = %e, "Could not reload restored concept for indexing"),
        }
        Ok(record)
    }

    pub async fn resolve_root(&self, concept_id: Uuid) -> Result<CanonicalConcept> {
        self.resolver.resolve_root(concept_id).await
    }

    pub async fn merge_history(&self, concept_id: Uuid) -> Result<Vec<MergeResult>> {
        self.resolver.merge_history(concept_id).await
    }

    pub async fn pending_proposals(&self, limit: usize) -> Result<Vec<MergeProposal>> {
        self.merge_store.pending(limit).await
    }

    /// Concept, proposal, merge and queue counters.
    pub async fn stats(&self) -> Result<ResolutionStats> {
        let tenant = self.tenant_id();
        let (concepts, proposals, merges, deferred_pending) = tokio::try_join!(
            self.ctx.graph.concept_stats(tenant),
            self.merge_store.counts(),
            self.ctx.audit.counts(tenant),
            self.deferred.count_pending()
        )?;
        Ok(ResolutionStats {
            tenant_id: tenant.to_string(),
            concepts,
            proposals,
            merges,
            deferred_pending,
        })
    }

    // =========================================================================
    // STAGES
    // =========================================================================

    /// Blocking failures abort the run but not the caller, unless the store
    /// itself is unreachable.
    fn blocking_or_abort(
        &self,
        blocking: Result<BlockingOutput>,
        report: &mut RunReport,
    ) -> Result<Option<BlockingOutput>> {
        match blocking {
            Ok(output) => {
                report.record_blocking(&output);
                Ok(Some(output))
            }
            Err(e) if e.is_store_unreachable() => {
                error!(error = %e, "Store unreachable during blocking, aborting run");
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Blocking failed, aborting run");
                report.errors.push(format!("blocking: {}", e));
                report.finish();
                Ok(None)
            }
        }
    }

    /// Score pairs concurrently, skipping pairs the reject store holds when
    /// `check_rejects` is set.
    async fn score_pairs(
        &self,
        pairs: Vec<(CanonicalConcept, CanonicalConcept)>,
        options: ScoreOptions,
        check_rejects: bool,
        cancel: &CancelSignal,
        report: &mut RunReport,
    ) -> Vec<MergeCandidate> {
        let concurrency = self.config.scoring_concurrency.max(1);
        let outcomes: Vec<ScoreOutcome> = stream::iter(pairs)
            .map(move |(a, b)| async move {
                if cancel.is_cancelled() {
                    return ScoreOutcome::Cancelled;
                }
                if check_rejects && self.rejects.is_rejected_pair(&a, &b).await {
                    return ScoreOutcome::Rejected;
                }
                ScoreOutcome::Scored(self.scorer.score(&a, &b, options).await)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut candidates = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                ScoreOutcome::Scored(scored) => {
                    report.scored += 1;
                    if scored.from_cache {
                        report.cache_hits += 1;
                    }
                    if scored.candidate.signals.degraded {
                        report.degraded += 1;
                    }
                    candidates.push(scored.candidate);
                }
                ScoreOutcome::Rejected => report.filtered_rejected += 1,
                ScoreOutcome::Cancelled => report.cancelled = true,
            }
        }
        if report.degraded > 0 {
            warn!(degraded = report.degraded, "Pairs scored lexical-only");
        }
        candidates.sort_by(|a, b| a.pair_id.cmp(&b.pair_id));
        candidates
    }

    async fn evidence(&self, a: Uuid, b: Uuid) -> Result<EvidenceCounters> {
        let tenant = self.tenant_id();
        let graph = &self.ctx.graph;
        let (doc_count_a, doc_count_b, shared_doc_count) = tokio::try_join!(
            graph.document_count(tenant, a),
            graph.document_count(tenant, b),
            graph.shared_document_count(tenant, a, b)
        )?;
        Ok(EvidenceCounters {
            doc_count_a,
            doc_count_b,
            shared_doc_count,
        })
    }

    /// Threshold routing. Document evidence is only fetched for pairs that
    /// can reach DEFER or AUTO.
    async fn route_incremental(
        &self,
        candidates: Vec<MergeCandidate>,
        concepts: &ConceptMap,
        report: &mut RunReport,
    ) -> Result<Vec<Routed>> {
        let table = &self.config.thresholds;
        let mut routed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let thresholds = table.get(candidate.concept_type);
            let evidence = if candidate.score >= thresholds.threshold_defer {
                self.soft(
                    self.evidence(candidate.id_a, candidate.id_b).await,
                    report,
                    "document evidence",
                )?
                .unwrap_or_default()
            } else {
                EvidenceCounters::default()
            };
            let ctx = SafetyContext {
                exact_normalized_match: candidate.signals.exact_match >= 1.0,
                definition_fingerprint_a: concepts
                    .get(&candidate.id_a)
                    .and_then(|c| c.definition_fingerprint()),
                definition_fingerprint_b: concepts
                    .get(&candidate.id_b)
                    .and_then(|c| c.definition_fingerprint()),
                evidence,
                degraded: candidate.signals.degraded,
            };
            let decision = route(candidate.score, candidate.concept_type, table, &ctx);
            let reason = match (decision.decision, decision.downgraded_by) {
                (Decision::Defer, Some(condition)) => format!("safety:{}", condition),
                (Decision::Auto, _) => "auto_threshold".to_string(),
                (Decision::Defer, None) => "defer_threshold".to_string(),
                _ => "below_threshold".to_string(),
            };
            debug!(
                pair_id = %candidate.pair_id,
                score = candidate.score,
                decision = decision.decision.as_str(),
                reason = %reason,
                "Pair routed"
            );
            routed.push(Routed {
                candidate,
                decision: decision.decision,
                reason,
                evidence,
            });
        }
        Ok(routed)
    }

    /// Run AUTO pairs through the gate and apply its effects.
    async fn apply_gate(
        &self,
        routed: &mut [Routed],
        concepts: &ConceptMap,
        mode: EngineMode,
        report: &mut RunReport,
    ) {
        let Some(gate) = &self.gate else {
            return;
        };
        let mut indices = Vec::new();
        let mut pairs = Vec::new();
        for (i, r) in routed.iter().enumerate() {
            if r.decision != Decision::Auto {
                continue;
            }
            if let (Some(a), Some(b)) = (concepts.get(&r.candidate.id_a), concepts.get(&r.candidate.id_b)) {
                indices.push(i);
                pairs.push((a, b));
            }
        }
        if pairs.is_empty() {
            return;
        }

        let verdicts = gate.evaluate(&pairs).await;
        report.gate_evaluated += verdicts.len();
        for (i, verdict) in indices.into_iter().zip(verdicts.iter()) {
            let r = &mut routed[i];
            match gate.effect(verdict) {
                GateEffect::Pass => {}
                GateEffect::Blocked => {
                    report.gate_blocked += 1;
                    r.decision = Decision::Reject;
                    r.reason = REASON_GATE_DISTINCT.to_string();
                }
                GateEffect::Downgraded => {
                    report.gate_downgraded += 1;
                    r.decision = match mode {
                        EngineMode::Incremental => Decision::Defer,
                        EngineMode::Batch => Decision::Propose,
                    };
                    r.reason = REASON_GATE_DOWNGRADED.to_string();
                }
            }
            debug!(
                pair_id = %r.candidate.pair_id,
                verdict = %verdict.decision,
                confidence = verdict.confidence,
                decision = r.decision.as_str(),
                "Gate applied"
            );
        }
    }

    /// Execute routed decisions one pair at a time, highest score first.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        mut routed: Vec<Routed>,
        concepts: &ConceptMap,
        trigger: MergeTrigger,
        origin: Origin<'_>,
        dry_run: bool,
        cancel: &CancelSignal,
        report: &mut RunReport,
    ) -> Result<()> {
        routed.sort_by(|a, b| {
            b.candidate
                .score
                .total_cmp(&a.candidate.score)
                .then_with(|| a.candidate.pair_id.cmp(&b.candidate.pair_id))
        });
        let now = Utc::now();
        let mut consumed: HashSet<Uuid> = HashSet::new();
        let mut rejects: Vec<RejectEntry> = Vec::new();

        for r in routed {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!("Run cancelled, remaining pairs left unprocessed");
                break;
            }
            let c = &r.candidate;
            if consumed.contains(&c.id_a) || consumed.contains(&c.id_b) {
                report.skipped_inactive += 1;
                continue;
            }
            report.record_decision(r.decision);
            if dry_run {
                continue;
            }

            match r.decision {
                Decision::Auto => {
                    let request = MergeRequest::from_candidate(c, trigger, r.reason.clone());
                    match self.resolver.merge(request).await {
                        Ok(result) if result.success => {
                            report.merged += 1;
                            consumed.insert(result.merged_id);
                            if let Origin::Deferred(_) = origin {
                                self.soft(self.deferred.remove(&c.pair_id).await, report, "remove deferred entry")?;
                            }
                        }
                        Ok(result) => {
                            report.merge_failed += 1;
                            report.errors.push(format!(
                                "merge {}: {}",
                                c.pair_id,
                                result.error.as_deref().unwrap_or("unknown error")
                            ));
                        }
                        Err(e) if e.is_store_unreachable() => {
                            error!(pair_id = %c.pair_id, error = %e, "Store unreachable during merge, aborting run");
                            return Err(e);
                        }
                        Err(e) => {
                            report.merge_failed += 1;
                            report.errors.push(format!("merge {}: {}", c.pair_id, e));
                        }
                    }
                }
                Decision::Defer => match origin {
                    Origin::Blocking => {
                        let outcome = self.soft(
                            self.deferred.defer(c, r.evidence, now).await,
                            report,
                            "defer candidate",
                        )?;
                        if let Some(outcome) = outcome.filter(|o| !o.evicted.is_empty()) {
                            report.evicted += outcome.evicted.len();
                            let mut evicted_concepts = ConceptMap::new();
                            let evicted = self
                                .rejects_for_deferred(
                                    &outcome.evicted,
                                    REASON_QUEUE_OVERFLOW,
                                    &mut evicted_concepts,
                                    report,
                                )
                                .await?;
                            rejects.extend(evicted);
                        }
                    }
                    Origin::Deferred(entries) => {
                        if let Some(entry) = entries.get(&c.pair_id) {
                            self.soft(
                                self.deferred.record_reevaluation(entry, c, r.evidence, now).await,
                                report,
                                "update deferred entry",
                            )?;
                        }
                    }
                },
                Decision::Propose => {
                    self.soft(self.merge_store.propose(c, &r.reason).await, report, "store proposal")?;
                }
                Decision::Reject => {
                    if let (Some(a), Some(b)) = (concepts.get(&c.id_a), concepts.get(&c.id_b)) {
                        rejects.push(reject_entry(a, b, c.score, r.reason.clone()));
                    }
                    if let Origin::Deferred(_) = origin {
                        self.soft(self.deferred.remove(&c.pair_id).await, report, "remove deferred entry")?;
                    }
                }
            }
        }

        if !rejects.is_empty() {
            let written = self.rejects.insert_many(&rejects).await;
            if written < rejects.len() {
                warn!(written, total = rejects.len(), "Some reject entries were not stored");
            }
        }
        Ok(())
    }

    /// Reject entries for deferred candidates leaving the queue. Concepts not
    /// in `known` are loaded and added to it.
    async fn rejects_for_deferred(
        &self,
        entries: &[DeferredMergeCandidate],
        reason: &str,
        known: &mut ConceptMap,
        report: &mut RunReport,
    ) -> Result<Vec<RejectEntry>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let missing: Vec<Uuid> = entries
            .iter()
            .flat_map(|e| [e.id_a, e.id_b])
            .filter(|id| !known.contains_key(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if !missing.is_empty() {
            let loaded = self.soft(
                self.ctx.graph.get_concepts(self.tenant_id(), &missing).await,
                report,
                "load concepts",
            )?;
            for concept in loaded.unwrap_or_default() {
                known.insert(concept.id, concept);
            }
        }
        Ok(entries
            .iter()
            .filter_map(|e| {
                let a = known.get(&e.id_a)?;
                let b = known.get(&e.id_b)?;
                Some(reject_entry(a, b, e.score, reason))
            })
            .collect())
    }

    /// Recover from a per-pair failure: an unreachable store is fatal, any
    /// other error is recorded and the run continues.
    fn soft<T>(&self, result: Result<T>, report: &mut RunReport, what: &str) -> Result<Option<T>> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_store_unreachable() => {
                error!(error = %e, op = what, "Store unreachable, aborting run");
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, op = what, "Step failed, continuing");
                report.errors.push(format!("{}: {}", what, e));
                Ok(None)
            }
        }
    }
}

/// Concept pairs for blocked pair ids; ids not in `concepts` are skipped.
fn pairs_for(pairs: &[PairId], concepts: &ConceptMap) -> Vec<(CanonicalConcept, CanonicalConcept)> {
    pairs
        .iter()
        .filter_map(|p| {
            let a = concepts.get(&p.low())?;
            let b = concepts.get(&p.high())?;
            Some((a.clone(), b.clone()))
        })
        .collect()
}
