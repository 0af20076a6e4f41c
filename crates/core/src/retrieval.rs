use crate::citations::{collect_references, Reference};
use crate::embeddings::Embedder;
use crate::llm::{CandidateDigest, DigestEntry, QueryRefiner, RelevanceJudge};
use crate::models::truncate_chars;
use crate::traits::VectorStore;
use crate::{ScoredPoint, SearchError, SearchQuery};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Characters of stored body used in the digest when a point has no summary.
pub const DIGEST_FALLBACK_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingStatus {
    /// The judge kept at least one candidate.
    Ranked,
    /// Vector search returned nothing.
    NoCandidates,
    /// Candidates existed but the judge kept none of them.
    NoRelevantDocuments,
    /// The judge failed; `ranked` holds the vector-rank order.
    JudgmentUnavailable,
}

#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    /// The query actually searched: the refined text when a refiner succeeded.
    pub query: String,
    pub candidates: Vec<ScoredPoint>,
    pub ranked: Vec<ScoredPoint>,
    pub status: RankingStatus,
}

impl RetrievalOutcome {
    pub fn references(&self, overrides: &HashMap<String, String>) -> Vec<Reference> {
        collect_references(&self.ranked, overrides)
    }
}

/// Two-stage retrieval: vector recall, then a relevance judgment over compact digests.
/// An optional refiner rewrites the question before recall.
pub struct RetrievalPipeline<S, E, J>
where
    S: VectorStore,
    E: Embedder,
    J: RelevanceJudge,
{
    store: S,
    embedder: E,
    judge: J,
    refiner: Option<Box<dyn QueryRefiner>>,
}

impl<S, E, J> RetrievalPipeline<S, E, J>
where
    S: VectorStore,
    E: Embedder,
    J: RelevanceJudge,
{
    pub fn new(store: S, embedder: E, judge: J) -> Self {
        Self {
            store,
            embedder,
            judge,
            refiner: None,
        }
    }

    pub fn with_refiner(mut self, refiner: Box<dyn QueryRefiner>) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn judge(&self) -> &J {
        &self.judge
    }

    pub async fn retrieve_and_rank(&self, query: &SearchQuery) -> Result<RetrievalOutcome, SearchError> {
        if query.text.trim().is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }

        let text = self.refine(&query.text).await;
        let query_vector = self.embedder.embed(&text).await?;
        let candidates = self.store.search(&query_vector, query).await?;
        debug!(query = %text, candidates = candidates.len(), "vector recall");

        if candidates.is_empty() {
            return Ok(RetrievalOutcome {
                query: text,
                candidates,
                ranked: Vec::new(),
                status: RankingStatus::NoCandidates,
            });
        }

        let digest = build_digest(&candidates);
        let (ranked, status) = match self.judge.judge(&text, &digest).await {
            Ok(judged) => {
                let ranked = apply_judgment(&candidates, &judged);
                if ranked.is_empty() {
                    (ranked, RankingStatus::NoRelevantDocuments)
                } else {
                    (ranked, RankingStatus::Ranked)
                }
            }
            Err(error) => {
                warn!(%error, "relevance judgment failed; keeping vector order");
                (candidates.clone(), RankingStatus::JudgmentUnavailable)
            }
        };

        info!(
            query = %text,
            candidates = candidates.len(),
            ranked = ranked.len(),
            ?status,
            "retrieval finished"
        );

        Ok(RetrievalOutcome {
            query: text,
            candidates,
            ranked,
            status,
        })
    }

    /// Falls back to the raw question when there is no refiner, it fails, or it returns
    /// nothing.
    async fn refine(&self, raw: &str) -> String {
        let Some(refiner) = &self.refiner else {
            return raw.to_string();
        };
        match refiner.refine(raw).await {
            Ok(refined) if !refined.trim().is_empty() => {
                debug!(raw, refined = %refined, "query refined");
                refined.trim().to_string()
            }
            Ok(_) => raw.to_string(),
            Err(error) => {
                warn!(%error, "query refinement failed; searching the raw query");
                raw.to_string()
            }
        }
    }
}

pub fn build_digest(candidates: &[ScoredPoint]) -> CandidateDigest {
    candidates
        .iter()
        .map(|candidate| {
            let summary = candidate
                .payload
                .summary
                .clone()
                .filter(|summary| !summary.trim().is_empty())
                .unwrap_or_else(|| truncate_chars(&candidate.payload.raw_text, DIGEST_FALLBACK_CHARS));
            (
                candidate.id,
                DigestEntry {
                    title: candidate.payload.doc_title.clone(),
                    summary,
                },
            )
        })
        .collect()
}

/// Keeps only candidates named by the judge, in the judge's order. Unknown and repeated
/// ids are ignored.
pub fn apply_judgment(candidates: &[ScoredPoint], judged: &[u64]) -> Vec<ScoredPoint> {
    let mut seen = HashSet::new();
    judged
        .iter()
        .filter(|id| seen.insert(**id))
        .filter_map(|id| candidates.iter().find(|candidate| candidate.id == *id))
        .cloned()
        .collect()
}
