//! Token accounting for the context working set
//!
//! Pure bookkeeping: the accountant tracks the live token total, derived
//! utilization, and hit/miss/pruning counters. All writes are serialized
//! by the optimizer that owns it; the accountant itself never fails.

use super::entry::EntryType;
use serde::{Deserialize, Serialize};

/// Aggregate token state and counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenAccountant {
    /// Sum of effective tokens across live entries
    current_tokens: usize,

    /// Context window size the utilization is measured against
    context_window_size: usize,

    pub hits: u64,
    pub misses: u64,
    pub pruning_count: u64,
    pub compaction_prevented: u64,
}

impl TokenAccountant {
    pub fn new(context_window_size: usize) -> Self {
        Self {
            current_tokens: 0,
            context_window_size: context_window_size.max(1),
            hits: 0,
            misses: 0,
            pruning_count: 0,
            compaction_prevented: 0,
        }
    }

    /// Approximate token count for content of the given type
    pub fn count_tokens(&self, content: &str, entry_type: EntryType) -> usize {
        if content.is_empty() {
            return 0;
        }
        let chars = content.chars().count() as f32;
        (chars / entry_type.chars_per_token()).ceil() as usize
    }

    /// Charge a new entry's tokens
    pub fn add_entry(&mut self, tokens: usize) {
        self.current_tokens += tokens;
    }

    /// Re-charge an entry whose effective token count changed
    pub fn update_entry(&mut self, old_tokens: usize, new_tokens: usize) {
        self.current_tokens = self.current_tokens.saturating_sub(old_tokens) + new_tokens;
    }

    /// Release a removed entry's tokens
    pub fn remove_entry(&mut self, tokens: usize) {
        self.current_tokens = self.current_tokens.saturating_sub(tokens);
    }

    pub fn current_tokens(&self) -> usize {
        self.current_tokens
    }

    pub fn context_window_size(&self) -> usize {
        self.context_window_size
    }

    /// Fraction of the window in use
    pub fn utilization(&self) -> f64 {
        self.current_tokens as f64 / self.context_window_size as f64
    }

    /// Utilization if `extra` more tokens were added
    pub fn predict_utilization(&self, extra: usize) -> f64 {
        (self.current_tokens + extra) as f64 / self.context_window_size as f64
    }

    /// Tokens that must be freed to reach the target utilization
    pub fn tokens_to_free(&self, target_utilization: f64) -> usize {
        let target = (target_utilization * self.context_window_size as f64) as usize;
        self.current_tokens.saturating_sub(target)
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_pruned(&mut self, count: usize) {
        self.pruning_count += count as u64;
    }

    pub fn record_compaction_prevented(&mut self) {
        self.compaction_prevented += 1;
    }
}
