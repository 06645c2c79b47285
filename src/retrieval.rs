//! Multi-strategy retrieval.
//!
//! ```text
//!            ┌── vector  (question + rewritten variants) ──┐
//! request ───┼── keyword (BM25, or substring per term)   ──┼──▶ fuse ──▶ rerank
//!            └── hyde    (generate passage, embed, search) ┘
//! ```
//!
//! The three strategies run concurrently and are joined before fusion.
//! A strategy that fails records an `error` in its pipeline step and
//! contributes nothing; the others still produce results. Inside the
//! vector and substring strategies a failing query or keyword is skipped
//! and recorded, and the hits of the others are kept.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use zerag_core::embedding::cosine_similarity;
use zerag_core::fusion::{clamp_unit, fuse, max_similarity};
use zerag_core::models::{Origin, PipelineStep, RetrievedFragment};
use zerag_core::store::{ChunkCandidate, Store};

use crate::config::{KeywordRanking, RetrievalConfig};
use crate::embedding::EmbeddingService;
use crate::error::RagResult;
use crate::keyword_index::KeywordIndex;
use crate::llm::LanguageModel;
use crate::rewrite::HydeGenerator;

#[derive(Debug, Clone, Default)]
pub struct RetrievalRequest {
    pub question: String,
    /// Restrict to one data source; `None` searches everything.
    pub scope: Option<i64>,
    pub top_k: usize,
    pub keywords: Vec<String>,
    /// Extra phrasings searched by the vector strategy.
    pub query_variants: Vec<String>,
    pub use_hyde: bool,
    pub hyde_hint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub fragments: Vec<RetrievedFragment>,
    pub steps: Vec<PipelineStep>,
    /// Over every fused fragment, before rerank.
    pub max_similarity: f64,
}

// ═══════════════════════════════════════════════════════════════════════
// Reranking
// ═══════════════════════════════════════════════════════════════════════

/// Second-stage scorer applied to the fused list.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Set `rerank_score` on every fragment and reorder by it.
    async fn rerank(&self, question: &str, fragments: &mut Vec<RetrievedFragment>)
        -> RagResult<()>;
}

/// Scores fragments by cosine between the question and the freshly
/// embedded fragment text.
pub struct EmbeddingReranker {
    embeddings: Arc<EmbeddingService>,
}

impl EmbeddingReranker {
    pub fn new(embeddings: Arc<EmbeddingService>) -> Self {
        Self { embeddings }
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    fn name(&self) -> &str {
        "embedding"
    }

    async fn rerank(
        &self,
        question: &str,
        fragments: &mut Vec<RetrievedFragment>,
    ) -> RagResult<()> {
        if fragments.is_empty() {
            return Ok(());
        }
        let query = self.embeddings.embed_query(question).await?;
        let texts: Vec<String> = fragments.iter().map(|f| f.chunk_text.clone()).collect();
        let vectors = self.embeddings.embed_documents(&texts).await?;
        for (frag, v) in fragments.iter_mut().zip(&vectors) {
            frag.rerank_score = Some(clamp_unit(cosine_similarity(&query, v) as f64));
        }
        fragments.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════

pub struct RetrievalEngine {
    store: Arc<dyn Store>,
    embeddings: Arc<EmbeddingService>,
    keyword_index: Arc<KeywordIndex>,
    hyde: HydeGenerator,
    reranker: Option<Arc<dyn Reranker>>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn Store>,
        embeddings: Arc<EmbeddingService>,
        model: Arc<dyn LanguageModel>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            keyword_index: Arc::new(KeywordIndex::new(store.clone(), config.bm25_index_capacity)),
            store,
            embeddings,
            hyde: HydeGenerator::new(model),
            reranker: None,
            config,
        }
    }

    /// Share BM25 indexes with the sync orchestrator, which drops them
    /// when a source is re-synced.
    pub fn with_keyword_index(mut self, index: Arc<KeywordIndex>) -> Self {
        self.keyword_index = index;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    fn pool_size(&self, top_k: usize) -> usize {
        top_k.max(1) * self.config.candidate_multiplier.max(1)
    }

    pub async fn retrieve(&self, req: &RetrievalRequest) -> RetrievalOutcome {
        let pool = self.pool_size(req.top_k);

        let ((vector, vector_step), (keyword, keyword_step), hyde) = tokio::join!(
            self.vector_strategy(req, pool),
            self.keyword_strategy(req, pool),
            async {
                if req.use_hyde {
                    Some(self.hyde_strategy(req, pool).await)
                } else {
                    None
                }
            }
        );

        let mut steps = vec![vector_step, keyword_step];
        let mut batches = vec![(Origin::Keyword, keyword), (Origin::Vector, vector)];
        if let Some((candidates, step)) = hyde {
            steps.push(step);
            batches.push((Origin::Hyde, candidates));
        }

        let candidate_count: usize = batches.iter().map(|(_, c)| c.len()).sum();
        let mut fragments = fuse(batches, req.top_k);
        let max_sim = max_similarity(&fragments);
        steps.push(
            PipelineStep::new("fusion")
                .with("candidates", candidate_count)
                .with("fused", fragments.len())
                .with("max_similarity", max_sim),
        );

        if self.config.rerank {
            if let Some(reranker) = &self.reranker {
                let step = PipelineStep::new("rerank").with("reranker", reranker.name());
                let step = match reranker.rerank(&req.question, &mut fragments).await {
                    Ok(()) => step.with("reranked", fragments.len()),
                    Err(e) => {
                        tracing::warn!(error = %e, "rerank failed, keeping fused order");
                        step.with("error", e.to_string())
                    }
                };
                steps.push(step);
            }
        }

        RetrievalOutcome {
            fragments,
            steps,
            max_similarity: max_sim,
        }
    }

    async fn vector_strategy(
        &self,
        req: &RetrievalRequest,
        pool: usize,
    ) -> (Vec<ChunkCandidate>, PipelineStep) {
        let mut queries = vec![req.question.clone()];
        queries.extend(
            req.query_variants
                .iter()
                .take(self.config.max_query_variants)
                .cloned(),
        );
        let step = PipelineStep::new("vector_search").with("queries", queries.len());

        let mut best: HashMap<i64, ChunkCandidate> = HashMap::new();
        let mut failed = 0usize;
        let mut first_error = None;
        for query in &queries {
            match self.search_text(query, req.scope, pool).await {
                Ok(hits) => {
                    for hit in hits {
                        let keep = best
                            .get(&hit.chunk_id)
                            .map(|b| hit.score > b.score)
                            .unwrap_or(true);
                        if keep {
                            best.insert(hit.chunk_id, hit);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "vector search degraded");
                    failed += 1;
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        let hits = ranked(best.into_values().collect(), pool);
        let top = hits.first().map(|c| c.score).unwrap_or(0.0);
        let mut step = step.with("hits", hits.len()).with("max_similarity", top);
        if let Some(error) = first_error {
            step = step.with("error", error).with("failed_queries", failed);
        }
        (hits, step)
    }

    async fn search_text(
        &self,
        text: &str,
        scope: Option<i64>,
        pool: usize,
    ) -> RagResult<Vec<ChunkCandidate>> {
        let vector = self.embeddings.embed_query(text).await?;
        let mut hits = self.store.vector_search(&vector, scope, pool).await?;
        for h in &mut hits {
            h.score = clamp_unit(h.score);
        }
        Ok(hits)
    }

    async fn keyword_strategy(
        &self,
        req: &RetrievalRequest,
        pool: usize,
    ) -> (Vec<ChunkCandidate>, PipelineStep) {
        let step = PipelineStep::new("keyword_search").with("keywords", json!(req.keywords));
        if req.keywords.is_empty() {
            return (Vec::new(), step.with("hits", 0));
        }

        let scope = match (self.config.keyword_ranking, req.scope) {
            (KeywordRanking::Bm25, Some(scope)) => scope,
            _ => return self.substring_search(req, pool, step).await,
        };
        match self
            .keyword_index
            .search(scope, &req.keywords.join(" "), pool)
            .await
        {
            Ok(hits) if !hits.is_empty() => {
                let hits = self.scale_bm25(hits);
                let step = step.with("method", "bm25").with("hits", hits.len());
                (hits, step)
            }
            Ok(_) => self.substring_search(req, pool, step).await,
            Err(e) => {
                tracing::warn!(error = %e, "bm25 search failed, using substring match");
                let step = step.with("bm25_error", e.to_string());
                self.substring_search(req, pool, step).await
            }
        }
    }

    /// Map raw BM25 scores onto `(0, keyword_hit_score]`, best hit on top.
    fn scale_bm25(&self, mut hits: Vec<ChunkCandidate>) -> Vec<ChunkCandidate> {
        let best = hits.first().map(|h| h.score).unwrap_or(0.0);
        if best <= 0.0 {
            return Vec::new();
        }
        for h in &mut hits {
            h.score = (h.score / best * self.config.keyword_hit_score)
                .min(self.config.keyword_hit_score);
        }
        hits
    }

    /// One substring search per keyword. A chunk scores by the share of
    /// keywords it contains.
    async fn substring_search(
        &self,
        req: &RetrievalRequest,
        pool: usize,
        step: PipelineStep,
    ) -> (Vec<ChunkCandidate>, PipelineStep) {
        let mut found: HashMap<i64, ChunkCandidate> = HashMap::new();
        let mut failed = 0usize;
        let mut first_error = None;
        for kw in &req.keywords {
            match self.store.keyword_search(kw, req.scope, pool).await {
                Ok(hits) => {
                    for hit in hits {
                        found.entry(hit.chunk_id).or_insert(hit);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, keyword = %kw, "keyword search degraded");
                    failed += 1;
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        let total = req.keywords.len() as f64;
        let lowered: Vec<String> = req.keywords.iter().map(|k| k.to_lowercase()).collect();
        let scored: Vec<ChunkCandidate> = found
            .into_values()
            .map(|mut c| {
                let text = c.text.to_lowercase();
                let matched = lowered.iter().filter(|k| text.contains(k.as_str())).count().max(1);
                c.score = self.config.keyword_hit_score * (0.5 + 0.5 * matched as f64 / total);
                c
            })
            .collect();

        let hits = ranked(scored, pool);
        let mut step = step.with("method", "substring").with("hits", hits.len());
        if let Some(error) = first_error {
            step = step.with("error", error).with("failed_keywords", failed);
        }
        (hits, step)
    }

    async fn hyde_strategy(
        &self,
        req: &RetrievalRequest,
        pool: usize,
    ) -> (Vec<ChunkCandidate>, PipelineStep) {
        let step = PipelineStep::new("hyde");
        let passage = match self
            .hyde
            .generate(&req.question, req.hyde_hint.as_deref())
            .await
        {
            Ok(p) if !p.is_empty() => p,
            Ok(_) => return (Vec::new(), step.with("error", "empty hypothetical passage")),
            Err(e) => {
                tracing::warn!(error = %e, "hyde generation failed");
                return (Vec::new(), step.with("error", e.to_string()));
            }
        };

        match self.search_text(&passage, req.scope, pool).await {
            Ok(hits) => {
                let step = step
                    .with("passage_chars", passage.chars().count())
                    .with("hits", hits.len());
                (hits, step)
            }
            Err(e) => {
                tracing::warn!(error = %e, "hyde search degraded");
                (Vec::new(), step.with("error", e.to_string()))
            }
        }
    }
}

/// Sort by score desc, chunk id asc, and keep `limit`.
fn ranked(mut candidates: Vec<ChunkCandidate>, limit: usize) -> Vec<ChunkCandidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(limit);
    candidates
}
