//! Cache optimizer: the working-set orchestrator
//!
//! Owns the entry table and the token accountant, drives scoring and
//! tier transitions, and executes pruning decisions to keep context
//! utilization below the configured thresholds. External hooks
//! (`on_user_prompt_submit`, `on_pre_compact`) are the integration
//! points for the surrounding agent workflow; both return a
//! [`HookResult`] rather than raising.
//!
//! All entry mutation goes through this type. Readers get snapshots.

use super::accountant::TokenAccountant;
use super::entry::{CacheEntry, EntryId, EntryMetadata, EntryType, RelevanceScore, Tier};
use super::scorer::{rank_ascending, RelevanceScorer, ScoringContext};
use super::tiers::{TierManager, TransitionReport};
use crate::config::HermesConfig;
use crate::error::{HermesError, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Absolute file paths mentioned in a prompt, e.g. /src/lib.rs
static FILE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:/[A-Za-z0-9_.-]+)+\.[A-Za-z0-9]+").unwrap());

/// Tool names recognized in prompt text
const TOOL_NAMES: &[&str] = &[
    "Read", "Write", "Edit", "Bash", "Grep", "Glob", "Task", "WebFetch", "WebSearch",
];

/// How urgently the working set must shrink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruningUrgency {
    None,
    Soft,
    Hard,
    Emergency,
}

/// Planned actions for one pruning pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruningDecision {
    pub urgency: PruningUrgency,
    pub to_prune: Vec<EntryId>,
    pub to_compress: Vec<EntryId>,
    pub to_promote: Vec<EntryId>,
    pub to_demote: Vec<EntryId>,
    pub tokens_to_free: usize,
    pub utilization_before: f64,
    pub projected_utilization: f64,
}

impl PruningDecision {
    fn empty(urgency: PruningUrgency, utilization: f64) -> Self {
        Self {
            urgency,
            to_prune: Vec::new(),
            to_compress: Vec::new(),
            to_promote: Vec::new(),
            to_demote: Vec::new(),
            tokens_to_free: 0,
            utilization_before: utilization,
            projected_utilization: utilization,
        }
    }
}

/// Outcome of executing a pruning decision
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruningResult {
    pub pruned: usize,
    pub compressed: usize,
    pub demoted: usize,
    pub tokens_freed: usize,
    pub utilization_after: f64,
    pub success: bool,
}

/// Result shape returned by lifecycle hooks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookResult {
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub tokens_freed: Option<usize>,
    pub new_utilization: Option<f64>,
    pub compaction_prevented: bool,

    /// Human-readable record of what the hook did or tried
    pub actions: Vec<String>,
}

/// Aggregate optimizer metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub entry_count: usize,
    pub current_tokens: usize,
    pub context_window_size: usize,
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub pruning_count: u64,
    pub compaction_prevented: u64,
    pub entries_by_tier: HashMap<Tier, usize>,
}

/// Snapshot filter for `get_entries`
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryFilter {
    pub tier: Option<Tier>,
    pub entry_type: Option<EntryType>,
}

struct CacheState {
    entries: HashMap<EntryId, CacheEntry>,
    accountant: TokenAccountant,
}

/// The working-set manager
pub struct CacheOptimizer {
    config: HermesConfig,
    scorer: RelevanceScorer,
    tiers: TierManager,
    preserve_regexes: Vec<Regex>,
    state: RwLock<CacheState>,
}

impl CacheOptimizer {
    pub fn new(config: HermesConfig) -> Result<Self> {
        let preserve_regexes = config
            .pruning
            .preserve_patterns
            .regexes
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| HermesError::Configuration(format!("invalid preserve regex: {}", e)))?;

        let scorer = RelevanceScorer::new(config.scoring.clone());
        let tiers = TierManager::new(config.temporal.clone());
        let accountant = TokenAccountant::new(config.context_window_size);

        Ok(Self {
            config,
            scorer,
            tiers,
            preserve_regexes,
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                accountant,
            }),
        })
    }

    /// Replace the relevance scorer, e.g. to plug in embeddings
    pub fn with_scorer(mut self, scorer: RelevanceScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub async fn initialize(&self) -> Result<()> {
        let state = self.state.read().await;
        info!(
            "Cache optimizer initialized: window={} tokens, soft={:.2}, hard={:.2}, emergency={:.2}",
            state.accountant.context_window_size(),
            self.config.pruning.soft_threshold,
            self.config.pruning.hard_threshold,
            self.config.pruning.emergency_threshold
        );
        Ok(())
    }

    /// Insert new content, proactively pruning first when the insertion
    /// would push utilization over the soft threshold
    pub async fn add(
        &self,
        content: String,
        entry_type: EntryType,
        metadata: EntryMetadata,
    ) -> Result<EntryId> {
        let tokens = {
            let state = self.state.read().await;
            state.accountant.count_tokens(&content, entry_type)
        };

        let predicted = {
            let state = self.state.read().await;
            state.accountant.predict_utilization(tokens)
        };

        if predicted > self.config.pruning.soft_threshold {
            debug!(
                "Predicted utilization {:.3} over soft threshold, pruning before insert",
                predicted
            );
            let decision = self.get_pruning_decision(&ScoringContext::now()).await;
            if decision.urgency != PruningUrgency::None {
                self.prune(&decision).await?;
            }
        }

        let entry = CacheEntry::new(entry_type, content, tokens, metadata);
        let id = entry.id;

        let mut state = self.state.write().await;
        state.accountant.add_entry(tokens);
        state.entries.insert(id, entry);
        Ok(id)
    }

    /// Access an entry: bumps access counters and, when configured,
    /// promotes it back to hot
    pub async fn get(&self, id: EntryId) -> Option<CacheEntry> {
        let mut state = self.state.write().await;
        let promote = self.tiers.promote_on_access();

        let (snapshot, token_change) = match state.entries.get_mut(&id) {
            None => {
                state.accountant.record_miss();
                return None;
            }
            Some(entry) => {
                entry.access_count += 1;
                entry.last_accessed_at = Utc::now();
                if promote && entry.tier != Tier::Hot {
                    let before = entry.effective_tokens();
                    self.tiers.promote(entry);
                    let after = entry.effective_tokens();
                    (entry.clone(), Some((before, after)))
                } else {
                    (entry.clone(), None)
                }
            }
        };

        state.accountant.record_hit();
        if let Some((before, after)) = token_change {
            state.accountant.update_entry(before, after);
        }
        Some(snapshot)
    }

    /// Peek at an entry without recording an access
    pub async fn get_entry(&self, id: EntryId) -> Option<CacheEntry> {
        self.state.read().await.entries.get(&id).cloned()
    }

    /// Remove an entry outright
    pub async fn delete(&self, id: EntryId) -> bool {
        let mut state = self.state.write().await;
        match state.entries.remove(&id) {
            Some(entry) => {
                let tokens = entry.effective_tokens();
                state.accountant.remove_entry(tokens);
                true
            }
            None => false,
        }
    }

    /// Drop every entry, keeping the hit/miss counters
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let ids: Vec<EntryId> = state.entries.keys().copied().collect();
        for id in ids {
            if let Some(entry) = state.entries.remove(&id) {
                let tokens = entry.effective_tokens();
                state.accountant.remove_entry(tokens);
            }
        }
    }

    /// Score every entry against the context and write scores back
    pub async fn score_all(&self, ctx: &ScoringContext) -> usize {
        let snapshot: Vec<CacheEntry> = {
            let state = self.state.read().await;
            state.entries.values().cloned().collect()
        };

        let scores = self.scorer.score_entries(&snapshot, ctx).await;

        let mut state = self.state.write().await;
        let mut written = 0;
        for (id, score) in scores {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.score = score;
                written += 1;
            }
        }
        written
    }

    /// Compute the pruning plan for the current state
    ///
    /// Scores all entries first, then walks them in ascending relevance,
    /// pruning sub-threshold entries and demoting borderline ones until
    /// enough tokens are accounted for.
    pub async fn get_pruning_decision(&self, ctx: &ScoringContext) -> PruningDecision {
        self.score_all(ctx).await;

        let state = self.state.read().await;
        let utilization = state.accountant.utilization();
        let p = &self.config.pruning;

        let urgency = if utilization >= p.emergency_threshold {
            PruningUrgency::Emergency
        } else if utilization >= p.hard_threshold {
            PruningUrgency::Hard
        } else if utilization >= p.soft_threshold {
            PruningUrgency::Soft
        } else {
            return PruningDecision::empty(PruningUrgency::None, utilization);
        };

        let preserved = self.preserved_ids(&state.entries);
        let scores: HashMap<EntryId, RelevanceScore> = state
            .entries
            .iter()
            .filter(|(id, _)| !preserved.contains(id))
            .map(|(id, e)| (*id, e.score.clone()))
            .collect();
        let ranked = rank_ascending(&scores);

        let target = if urgency == PruningUrgency::Emergency {
            p.soft_threshold
        } else {
            p.target_utilization
        };
        let tokens_to_free = state.accountant.tokens_to_free(target);

        let warm_ratio = self.tiers.compression_ratio(Tier::Warm);
        let mut decision = PruningDecision::empty(urgency, utilization);
        decision.tokens_to_free = tokens_to_free;

        let mut accounted = 0usize;
        for id in ranked {
            if accounted >= tokens_to_free {
                break;
            }
            let entry = &state.entries[&id];
            let overall = entry.score.overall;

            if overall < p.min_relevance_score {
                accounted += entry.effective_tokens();
                decision.to_prune.push(id);
            } else if overall < 0.5 && matches!(entry.tier, Tier::Hot | Tier::Warm) {
                accounted += (entry.tokens as f32 * (1.0 - warm_ratio)) as usize;
                decision.to_demote.push(id);
                decision.to_compress.push(id);
            }
        }

        let window = state.accountant.context_window_size() as f64;
        decision.projected_utilization =
            (state.accountant.current_tokens().saturating_sub(accounted)) as f64 / window;
        decision
    }

    /// Execute a pruning decision
    ///
    /// Best-effort: a failure on a single entry does not stop the pass.
    /// The call only reports failure when the accounting no longer
    /// matches the table.
    pub async fn prune(&self, decision: &PruningDecision) -> Result<PruningResult> {
        let mut state = self.state.write().await;
        let mut result = PruningResult::default();

        for id in &decision.to_prune {
            if let Some(entry) = state.entries.remove(id) {
                let tokens = entry.effective_tokens();
                state.accountant.remove_entry(tokens);
                result.pruned += 1;
                result.tokens_freed += tokens;
            }
        }
        state.accountant.record_pruned(result.pruned);

        for id in &decision.to_demote {
            let Some(entry) = state.entries.get_mut(id) else {
                continue;
            };
            let before = entry.effective_tokens();
            if self.tiers.demote(entry).is_some() {
                let after = entry.effective_tokens();
                state.accountant.update_entry(before, after);
                result.demoted += 1;
                result.compressed += 1;
                result.tokens_freed += before.saturating_sub(after);
            }
        }

        // Compress-only ids not covered by a demotion
        for id in &decision.to_compress {
            if decision.to_demote.contains(id) {
                continue;
            }
            let Some(entry) = state.entries.get_mut(id) else {
                continue;
            };
            if entry.compressed.is_some() {
                continue;
            }
            let before = entry.effective_tokens();
            if let Some(payload) = self.tiers.compress_entry(entry, entry.tier) {
                entry.compressed = Some(payload);
                let after = entry.effective_tokens();
                state.accountant.update_entry(before, after);
                result.compressed += 1;
                result.tokens_freed += before.saturating_sub(after);
            }
        }

        for id in &decision.to_promote {
            let Some(entry) = state.entries.get_mut(id) else {
                continue;
            };
            let before = entry.effective_tokens();
            self.tiers.promote(entry);
            let after = entry.effective_tokens();
            state.accountant.update_entry(before, after);
        }

        result.utilization_after = state.accountant.utilization();
        result.success = Self::verify_accounting(&state);
        if !result.success {
            warn!("Token accounting drifted from the entry table after prune");
            return Err(HermesError::Invariant(
                "token counter does not match live entries after prune".to_string(),
            ));
        }
        Ok(result)
    }

    /// Compress the given entries at their current tier
    ///
    /// Returns tokens saved.
    pub async fn compress(&self, ids: &[EntryId]) -> usize {
        let mut state = self.state.write().await;
        let mut saved = 0usize;
        for id in ids {
            let Some(entry) = state.entries.get_mut(id) else {
                continue;
            };
            if entry.compressed.is_some() {
                continue;
            }
            // Hot entries move to warm first; compression requires a
            // compressing tier.
            let before = entry.effective_tokens();
            if entry.tier == Tier::Hot {
                if self.tiers.demote(entry).is_none() {
                    continue;
                }
            } else if let Some(payload) = self.tiers.compress_entry(entry, entry.tier) {
                entry.compressed = Some(payload);
            } else {
                continue;
            }
            let after = entry.effective_tokens();
            state.accountant.update_entry(before, after);
            saved += before.saturating_sub(after);
        }
        saved
    }

    /// Run one tier-transition pass over all entries
    pub async fn transition_tiers(&self) -> TransitionReport {
        let mut state = self.state.write().await;
        let preserved = self.preserved_ids(&state.entries);
        let now = Utc::now();

        let report = self
            .tiers
            .process_transitions(state.entries.values_mut(), &preserved, now);
        state.accountant.remove_entry(report.tokens_saved);

        if report.total_moved() > 0 {
            debug!(
                "Tier transitions: {} hot→warm, {} warm→cold, {} cold→archived, {} tokens saved",
                report.hot_to_warm, report.warm_to_cold, report.cold_to_archived,
                report.tokens_saved
            );
        }
        report
    }

    /// Hook: a user prompt was submitted
    ///
    /// Extracts file paths and tool names from the prompt into a scoring
    /// context, prunes proactively when over the soft threshold, and
    /// always runs tier transitions.
    pub async fn on_user_prompt_submit(&self, prompt: &str, session_id: &str) -> HookResult {
        let started = Instant::now();
        let mut result = HookResult {
            success: true,
            ..Default::default()
        };

        let ctx = Self::context_from_prompt(prompt, session_id);
        let p = &self.config.pruning;

        let before = self.get_utilization().await;
        let was_emergency = before >= p.emergency_threshold;
        let mut tokens_freed = 0usize;

        if before > p.soft_threshold {
            let decision = self.get_pruning_decision(&ctx).await;
            if decision.urgency != PruningUrgency::None {
                match self.prune(&decision).await {
                    Ok(pruned) => {
                        tokens_freed += pruned.tokens_freed;
                        result.actions.push(format!(
                            "pruned {} entries, demoted {}, freed {} tokens",
                            pruned.pruned, pruned.demoted, pruned.tokens_freed
                        ));
                    }
                    Err(e) => {
                        result.success = false;
                        result.error = Some(e.to_string());
                    }
                }
            }
        } else {
            self.score_all(&ctx).await;
        }

        let transitions = self.transition_tiers().await;
        tokens_freed += transitions.tokens_saved;
        if transitions.total_moved() > 0 {
            result.actions.push(format!(
                "transitioned {} entries across tiers",
                transitions.total_moved()
            ));
        }

        let after = self.get_utilization().await;
        if was_emergency && after < p.emergency_threshold {
            result.compaction_prevented = true;
            let mut state = self.state.write().await;
            state.accountant.record_compaction_prevented();
        }

        result.tokens_freed = Some(tokens_freed);
        result.new_utilization = Some(after);
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Hook: a forced compaction is imminent
    ///
    /// Emergency path: prunes aggressively enough to bring utilization
    /// back to the soft threshold, extending the prune list past the
    /// normal decision until the freed-token target is met.
    pub async fn on_pre_compact(&self) -> HookResult {
        let started = Instant::now();
        let mut result = HookResult::default();
        let p = &self.config.pruning;

        let ctx = ScoringContext::now();
        self.score_all(&ctx).await;

        let before = self.get_utilization().await;
        let was_emergency = before >= p.emergency_threshold;

        let decision = self.emergency_decision().await;
        result.actions.push(format!(
            "emergency decision: prune {}, demote {}, target {} tokens",
            decision.to_prune.len(),
            decision.to_demote.len(),
            decision.tokens_to_free
        ));

        match self.prune(&decision).await {
            Ok(pruned) => {
                result.actions.push(format!(
                    "pruned {} entries, freed {} tokens",
                    pruned.pruned, pruned.tokens_freed
                ));
                result.tokens_freed = Some(pruned.tokens_freed);
            }
            Err(e) => {
                result.error = Some(e.to_string());
            }
        }

        let after = self.get_utilization().await;
        result.new_utilization = Some(after);
        result.success = after < p.emergency_threshold && result.error.is_none();
        if result.success && was_emergency {
            result.compaction_prevented = true;
            let mut state = self.state.write().await;
            state.accountant.record_compaction_prevented();
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Emergency decision: the normal walk at emergency urgency, then
    /// extend `to_prune` with further low-relevance entries until the
    /// aggressive freed-token target is met
    async fn emergency_decision(&self) -> PruningDecision {
        let state = self.state.read().await;
        let p = &self.config.pruning;

        let preserved = self.preserved_ids(&state.entries);
        let scores: HashMap<EntryId, RelevanceScore> = state
            .entries
            .iter()
            .filter(|(id, _)| !preserved.contains(id))
            .map(|(id, e)| (*id, e.score.clone()))
            .collect();
        let ranked = rank_ascending(&scores);

        let aggressive_target = state.accountant.tokens_to_free(p.soft_threshold);
        let warm_ratio = self.tiers.compression_ratio(Tier::Warm);

        let mut decision =
            PruningDecision::empty(PruningUrgency::Emergency, state.accountant.utilization());
        decision.tokens_to_free = aggressive_target;

        // First the normal walk shape
        let mut accounted = 0usize;
        for id in &ranked {
            if accounted >= aggressive_target {
                break;
            }
            let entry = &state.entries[id];
            let overall = entry.score.overall;
            if overall < p.min_relevance_score {
                accounted += entry.effective_tokens();
                decision.to_prune.push(*id);
            } else if overall < 0.5 && matches!(entry.tier, Tier::Hot | Tier::Warm) {
                accounted += (entry.tokens as f32 * (1.0 - warm_ratio)) as usize;
                decision.to_demote.push(*id);
                decision.to_compress.push(*id);
            }
        }

        // Then extend: convert demotions to prunes and pull in whatever
        // low-relevance entries remain until the target is covered by
        // outright removal.
        let mut freed_by_prune: usize = decision
            .to_prune
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|e| e.effective_tokens())
            .sum();

        for id in &ranked {
            if freed_by_prune >= aggressive_target {
                break;
            }
            if decision.to_prune.contains(id) {
                continue;
            }
            decision.to_demote.retain(|d| d != id);
            decision.to_compress.retain(|d| d != id);
            decision.to_prune.push(*id);
            freed_by_prune += state.entries[id].effective_tokens();
        }

        let window = state.accountant.context_window_size() as f64;
        decision.projected_utilization =
            (state.accountant.current_tokens().saturating_sub(freed_by_prune)) as f64 / window;
        decision
    }

    pub async fn get_utilization(&self) -> f64 {
        self.state.read().await.accountant.utilization()
    }

    pub async fn get_metrics(&self) -> CacheMetrics {
        let state = self.state.read().await;
        let mut entries_by_tier: HashMap<Tier, usize> = HashMap::new();
        for entry in state.entries.values() {
            *entries_by_tier.entry(entry.tier).or_insert(0) += 1;
        }

        CacheMetrics {
            entry_count: state.entries.len(),
            current_tokens: state.accountant.current_tokens(),
            context_window_size: state.accountant.context_window_size(),
            utilization: state.accountant.utilization(),
            hits: state.accountant.hits,
            misses: state.accountant.misses,
            pruning_count: state.accountant.pruning_count,
            compaction_prevented: state.accountant.compaction_prevented,
            entries_by_tier,
        }
    }

    /// Entry snapshots, filtered and sorted by recency of access
    pub async fn get_entries(&self, filter: EntryFilter) -> Vec<CacheEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<CacheEntry> = state
            .entries
            .values()
            .filter(|e| filter.tier.map_or(true, |t| e.tier == t))
            .filter(|e| filter.entry_type.map_or(true, |t| e.entry_type == t))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        entries
    }

    /// Ids exempt from pruning and demotion: preserved types, preserved
    /// content patterns, and the N most recently accessed entries
    fn preserved_ids(&self, entries: &HashMap<EntryId, CacheEntry>) -> HashSet<EntryId> {
        let p = &self.config.pruning;
        let mut preserved: HashSet<EntryId> = entries
            .values()
            .filter(|e| {
                p.preserve_patterns.types.contains(&e.entry_type)
                    || self.preserve_regexes.iter().any(|re| re.is_match(&e.content))
            })
            .map(|e| e.id)
            .collect();

        if p.preserve_recent_count > 0 {
            let mut by_recency: Vec<&CacheEntry> = entries.values().collect();
            by_recency.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
            preserved.extend(
                by_recency
                    .into_iter()
                    .take(p.preserve_recent_count)
                    .map(|e| e.id),
            );
        }

        preserved
    }

    fn context_from_prompt(prompt: &str, session_id: &str) -> ScoringContext {
        let active_files: Vec<String> = FILE_PATH_RE
            .find_iter(prompt)
            .map(|m| m.as_str().to_string())
            .collect();
        let active_tools: Vec<String> = TOOL_NAMES
            .iter()
            .filter(|t| prompt.contains(*t))
            .map(|t| t.to_string())
            .collect();

        ScoringContext {
            current_query: Some(prompt.to_string()),
            active_files,
            active_tools,
            session_id: Some(session_id.to_string()),
            timestamp: Utc::now(),
        }
    }

    fn verify_accounting(state: &CacheState) -> bool {
        let live: usize = state.entries.values().map(|e| e.effective_tokens()).sum();
        live == state.accountant.current_tokens()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window: usize) -> HermesConfig {
        let mut config = HermesConfig::default();
        config.context_window_size = window;
        // Keep recency from preserving everything in tests
        config.pruning.preserve_recent_count = 0;
        config
    }

    async fn seed(optimizer: &CacheOptimizer, count: usize, tokens_each: usize) -> Vec<EntryId> {
        let mut ids = Vec::new();
        for i in 0..count {
            let entry_type = if i % 2 == 0 {
                EntryType::ToolResult
            } else {
                EntryType::FileRead
            };
            // chars sized so the accountant counts tokens_each tokens
            let content = "y".repeat((tokens_each as f32 * entry_type.chars_per_token()) as usize);
            let id = optimizer
                .add(content, entry_type, EntryMetadata::default())
                .await
                .unwrap();
            ids.push(id);
        }
        ids
    }

    /// Insert directly into the table, bypassing add's proactive pruning,
    /// so tests control utilization exactly
    async fn raw_insert(
        optimizer: &CacheOptimizer,
        count: usize,
        tokens_each: usize,
        entry_type: EntryType,
    ) -> Vec<EntryId> {
        let mut state = optimizer.state.write().await;
        let mut ids = Vec::new();
        for _ in 0..count {
            let entry = CacheEntry::new(
                entry_type,
                "y".repeat(tokens_each),
                tokens_each,
                EntryMetadata::default(),
            );
            ids.push(entry.id);
            state.accountant.add_entry(tokens_each);
            state.entries.insert(entry.id, entry);
        }
        ids
    }

    #[tokio::test]
    async fn test_add_and_accounting() {
        let optimizer = CacheOptimizer::new(config(10_000)).unwrap();
        let ids = seed(&optimizer, 4, 100).await;

        let metrics = optimizer.get_metrics().await;
        assert_eq!(metrics.entry_count, 4);
        assert_eq!(metrics.current_tokens, 400);

        assert!(optimizer.delete(ids[0]).await);
        let metrics = optimizer.get_metrics().await;
        assert_eq!(metrics.current_tokens, 300);
    }

    #[tokio::test]
    async fn test_get_promotes_and_counts_hits() {
        let optimizer = CacheOptimizer::new(config(10_000)).unwrap();
        let ids = seed(&optimizer, 1, 100).await;

        // Demote, then access should promote back to hot
        optimizer.compress(&ids).await;
        let entry = optimizer.get_entry(ids[0]).await.unwrap();
        assert_eq!(entry.tier, Tier::Warm);

        let entry = optimizer.get(ids[0]).await.unwrap();
        assert_eq!(entry.tier, Tier::Hot);
        assert!(entry.compressed.is_none());
        assert_eq!(entry.access_count, 2);

        assert!(optimizer.get(EntryId::new()).await.is_none());
        let metrics = optimizer.get_metrics().await;
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.current_tokens, 100);
    }

    #[tokio::test]
    async fn test_pruning_decision_below_soft_is_empty() {
        let optimizer = CacheOptimizer::new(config(10_000)).unwrap();
        seed(&optimizer, 2, 100).await;

        let decision = optimizer.get_pruning_decision(&ScoringContext::now()).await;
        assert_eq!(decision.urgency, PruningUrgency::None);
        assert!(decision.to_prune.is_empty());
    }

    #[tokio::test]
    async fn test_soft_prune_reaches_target() {
        // Window 1000, soft 0.6, target 0.5; min_relevance raised so the
        // fresh low-signal entries are prunable.
        let mut cfg = config(1000);
        cfg.pruning.min_relevance_score = 0.45;
        let optimizer = CacheOptimizer::new(cfg).unwrap();
        raw_insert(&optimizer, 10, 60, EntryType::ToolResult).await;

        assert!((optimizer.get_utilization().await - 0.6).abs() < 1e-9);

        let decision = optimizer.get_pruning_decision(&ScoringContext::now()).await;
        assert_eq!(decision.urgency, PruningUrgency::Soft);
        assert!(!decision.to_prune.is_empty());

        let result = optimizer.prune(&decision).await.unwrap();
        assert!(result.pruned >= 1);
        assert!(result.utilization_after <= 0.5);
    }

    #[tokio::test]
    async fn test_proactive_prune_on_add() {
        let optimizer = CacheOptimizer::new(config(1000)).unwrap();
        raw_insert(&optimizer, 10, 60, EntryType::ToolResult).await;

        // This insert predicts 0.66 utilization, over the soft threshold,
        // so a pruning pass runs before it lands.
        let id = optimizer
            .add("z".repeat(210), EntryType::ToolResult, EntryMetadata::default())
            .await
            .unwrap();
        assert!(optimizer.get_entry(id).await.is_some());

        let metrics = optimizer.get_metrics().await;
        assert!(metrics.utilization < 0.66);
        // Borderline entries were demoted and compressed on the way
        assert!(metrics.entries_by_tier.get(&Tier::Warm).copied().unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn test_preserved_types_never_pruned_or_demoted() {
        let mut cfg = config(1000);
        cfg.pruning.min_relevance_score = 0.99; // everything prunable
        let optimizer = CacheOptimizer::new(cfg).unwrap();

        let protected = raw_insert(&optimizer, 1, 100, EntryType::SystemPrompt).await[0];
        raw_insert(&optimizer, 8, 80, EntryType::ToolResult).await;

        let decision = optimizer.get_pruning_decision(&ScoringContext::now()).await;
        assert_ne!(decision.urgency, PruningUrgency::None);
        assert!(!decision.to_prune.contains(&protected));
        assert!(!decision.to_demote.contains(&protected));
    }

    #[tokio::test]
    async fn test_preserve_regex_shields_content() {
        let mut cfg = config(1000);
        cfg.pruning.min_relevance_score = 0.99;
        cfg.pruning.preserve_patterns.regexes = vec!["^KEEP".to_string()];
        let optimizer = CacheOptimizer::new(cfg).unwrap();

        let kept = {
            let mut state = optimizer.state.write().await;
            let entry = CacheEntry::new(
                EntryType::Other,
                format!("KEEP {}", "z".repeat(300)),
                100,
                EntryMetadata::default(),
            );
            let id = entry.id;
            state.accountant.add_entry(100);
            state.entries.insert(id, entry);
            id
        };
        raw_insert(&optimizer, 8, 80, EntryType::ToolResult).await;

        let decision = optimizer.get_pruning_decision(&ScoringContext::now()).await;
        assert_ne!(decision.urgency, PruningUrgency::None);
        assert!(!decision.to_prune.contains(&kept));
        assert!(!decision.to_demote.contains(&kept));
    }

    #[tokio::test]
    async fn test_pre_compact_brings_utilization_below_emergency() {
        let mut cfg = config(1000);
        cfg.pruning.emergency_threshold = 0.95;
        let optimizer = CacheOptimizer::new(cfg).unwrap();
        raw_insert(&optimizer, 14, 70, EntryType::ToolResult).await; // 980 tokens

        assert!(optimizer.get_utilization().await > 0.95);

        let result = optimizer.on_pre_compact().await;
        assert!(result.success, "error: {:?}", result.error);
        assert!(result.compaction_prevented);
        assert!(result.new_utilization.unwrap() < 0.95);
        assert!(!result.actions.is_empty());

        let metrics = optimizer.get_metrics().await;
        assert_eq!(metrics.compaction_prevented, 1);
    }

    #[tokio::test]
    async fn test_prompt_hook_extracts_context_and_transitions() {
        let optimizer = CacheOptimizer::new(config(10_000)).unwrap();
        seed(&optimizer, 3, 50).await;

        let result = optimizer
            .on_user_prompt_submit("Read /src/cache/entry.rs and fix the Grep output", "sess-1")
            .await;
        assert!(result.success);
        assert!(result.new_utilization.is_some());

        let ctx = CacheOptimizer::context_from_prompt(
            "Read /src/cache/entry.rs and fix the Grep output",
            "sess-1",
        );
        assert_eq!(ctx.active_files, vec!["/src/cache/entry.rs".to_string()]);
        assert!(ctx.active_tools.contains(&"Read".to_string()));
        assert!(ctx.active_tools.contains(&"Grep".to_string()));
    }

    #[tokio::test]
    async fn test_accounting_invariant_across_operations() {
        let mut cfg = config(1000);
        cfg.pruning.min_relevance_score = 0.45;
        let optimizer = CacheOptimizer::new(cfg).unwrap();

        let ids = seed(&optimizer, 9, 60).await;
        optimizer.compress(&ids[0..2]).await;
        optimizer.get(ids[2]).await;
        optimizer.delete(ids[3]).await;

        let decision = optimizer.get_pruning_decision(&ScoringContext::now()).await;
        if decision.urgency != PruningUrgency::None {
            optimizer.prune(&decision).await.unwrap();
        }

        // Live-entry sum equals the accountant's figure
        let state = optimizer.state.read().await;
        let live: usize = state.entries.values().map(|e| e.effective_tokens()).sum();
        assert_eq!(live, state.accountant.current_tokens());
    }
}
