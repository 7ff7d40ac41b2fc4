//! Relevance scoring for cached context entries
//!
//! Produces a per-entry [`RelevanceScore`] from recency, frequency,
//! semantic, attention, and type-expert components. The semantic
//! component is provider-pluggable through [`EmbeddingProvider`] and
//! degrades to zero when no embeddings are available; the attention
//! component goes through [`AttentionScorer`] so a numeric attention
//! library can be plugged in at the same seam.
//!
//! Scoring is a pure function over {entry, context}: recomputation is
//! idempotent for fixed inputs.

use super::entry::{CacheEntry, EntryId, RelevanceScore, ScoreComponents};
use crate::config::ScoringConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The live signals a scoring pass evaluates entries against
#[derive(Debug, Clone)]
pub struct ScoringContext {
    pub current_query: Option<String>,
    pub active_files: Vec<String>,
    pub active_tools: Vec<String>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Default for ScoringContext {
    fn default() -> Self {
        Self::now()
    }
}

impl ScoringContext {
    pub fn now() -> Self {
        Self {
            current_query: None,
            active_files: Vec::new(),
            active_tools: Vec::new(),
            session_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Whether the context carries any attention signal at all
    pub fn has_signal(&self) -> bool {
        self.current_query.is_some()
            || !self.active_files.is_empty()
            || !self.active_tools.is_empty()
    }
}

/// Embedding provider seam for the semantic component
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batched)
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Embedding dimensionality
    fn dimensions(&self) -> usize;
}

/// Attention scorer seam over {query, active files, active tools}
pub trait AttentionScorer: Send + Sync {
    fn attention(&self, entry: &CacheEntry, ctx: &ScoringContext) -> f32;
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

/// Default attention: lexical overlap with the query plus exact matches
/// on active files and tools
pub struct KeywordAttention;

impl KeywordAttention {
    fn query_overlap(content: &str, query: &str) -> f32 {
        let terms: HashSet<String> = query
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .filter(|w| w.len() >= 3)
            .collect();
        if terms.is_empty() {
            return 0.0;
        }

        let content_lower = content.to_lowercase();
        let matched = terms
            .iter()
            .filter(|term| content_lower.contains(term.as_str()))
            .count();
        matched as f32 / terms.len() as f32
    }
}

impl AttentionScorer for KeywordAttention {
    fn attention(&self, entry: &CacheEntry, ctx: &ScoringContext) -> f32 {
        let mut score = 0.0f32;

        if let Some(query) = &ctx.current_query {
            score += 0.5 * Self::query_overlap(&entry.content, query);
        }

        if let Some(file_path) = &entry.metadata.file_path {
            if ctx.active_files.iter().any(|f| f == file_path) {
                score += 0.3;
            }
        } else if ctx
            .active_files
            .iter()
            .any(|f| !f.is_empty() && entry.content.contains(f.as_str()))
        {
            score += 0.2;
        }

        if let Some(tool) = &entry.metadata.tool_name {
            if ctx.active_tools.iter().any(|t| t == tool) {
                score += 0.2;
            }
        }

        score.clamp(0.0, 1.0)
    }
}

/// Relevance scorer driving the five components
pub struct RelevanceScorer {
    config: ScoringConfig,
    embeddings: Option<Arc<dyn EmbeddingProvider>>,
    attention: Arc<dyn AttentionScorer>,
}

impl RelevanceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            embeddings: None,
            attention: Arc::new(KeywordAttention),
        }
    }

    /// Plug in an embedding provider for the semantic component
    pub fn with_embeddings(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }

    /// Replace the attention scorer
    pub fn with_attention(mut self, attention: Arc<dyn AttentionScorer>) -> Self {
        self.attention = attention;
        self
    }

    /// Score a batch of entries against the context
    ///
    /// Returns a map id -> score. Consumers needing a total order sort by
    /// (overall, id) so ties break deterministically.
    pub async fn score_entries(
        &self,
        entries: &[CacheEntry],
        ctx: &ScoringContext,
    ) -> HashMap<EntryId, RelevanceScore> {
        let semantic = self.semantic_scores(entries, ctx).await;

        entries
            .iter()
            .map(|entry| {
                let sem = semantic.as_ref().and_then(|m| m.get(&entry.id)).copied();
                (entry.id, self.score_entry(entry, ctx, sem))
            })
            .collect()
    }

    /// Score a single entry; `semantic` is the precomputed similarity for
    /// the current query, when embeddings are available
    pub fn score_entry(
        &self,
        entry: &CacheEntry,
        ctx: &ScoringContext,
        semantic: Option<f32>,
    ) -> RelevanceScore {
        let age_secs = (ctx.timestamp - entry.last_accessed_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let tau = self.config.tau_recency.as_secs_f64().max(1.0);
        let recency = (-age_secs / tau).exp() as f32;

        let f_max = self.config.frequency_max.max(1) as f32;
        let frequency =
            ((1.0 + entry.access_count as f32).ln() / (1.0 + f_max).ln()).min(1.0);

        let attention = if ctx.has_signal() {
            self.attention.attention(entry, ctx)
        } else {
            0.0
        };

        let expert = entry.entry_type.expert_score();
        let semantic_score = semantic.unwrap_or(0.0).clamp(0.0, 1.0);

        let w = &self.config.weights;
        let overall = (w.recency * recency
            + w.frequency * frequency
            + w.semantic * semantic_score
            + w.attention * attention
            + w.expert * expert)
            .clamp(0.0, 1.0);

        // Recency and expert always contribute; the rest only when their
        // inputs carried signal.
        let mut contributed = 2u32;
        if entry.access_count > 1 {
            contributed += 1;
        }
        if semantic.is_some() {
            contributed += 1;
        }
        if ctx.has_signal() {
            contributed += 1;
        }

        RelevanceScore {
            overall,
            components: ScoreComponents {
                recency,
                frequency,
                semantic: semantic_score,
                attention,
                expert,
            },
            scored_at: ctx.timestamp,
            confidence: contributed as f32 / 5.0,
        }
    }

    /// Query-to-entry similarities, or None when embeddings are absent
    async fn semantic_scores(
        &self,
        entries: &[CacheEntry],
        ctx: &ScoringContext,
    ) -> Option<HashMap<EntryId, f32>> {
        let provider = self.embeddings.as_ref()?;
        let query = ctx.current_query.as_deref().filter(|q| !q.is_empty())?;

        let query_embedding = match provider.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Query embedding failed, semantic component zeroed: {}", e);
                return None;
            }
        };

        let texts: Vec<&str> = entries.iter().map(|e| e.content.as_str()).collect();
        let embeddings = match provider.embed_batch(&texts).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Batch embedding failed, semantic component zeroed: {}", e);
                return None;
            }
        };

        Some(
            entries
                .iter()
                .zip(embeddings.iter())
                .map(|(entry, emb)| {
                    (entry.id, cosine_similarity(&query_embedding, emb).max(0.0))
                })
                .collect(),
        )
    }
}

/// Deterministic ascending ranking: lowest relevance first, ties by id
pub fn rank_ascending(scores: &HashMap<EntryId, RelevanceScore>) -> Vec<EntryId> {
    let mut ids: Vec<EntryId> = scores.keys().copied().collect();
    ids.sort_by(|a, b| {
        let sa = scores[a].overall;
        let sb = scores[b].overall;
        sa.partial_cmp(&sb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(b))
    });
    ids
}
