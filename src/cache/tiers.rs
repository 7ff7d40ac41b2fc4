//! Temporal compression and tier transitions
//!
//! Entries cool from hot through warm and cold to archived as they sit
//! idle, shedding tokens at each step according to the tier's
//! compression ratio. Promotion back to hot happens only on access and
//! clears compression.

use super::entry::{CacheEntry, CompressedPayload, CompressionMethod, EntryId, Tier};
use crate::config::{TemporalConfig, TierPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Totals from one transition pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionReport {
    pub hot_to_warm: usize,
    pub warm_to_cold: usize,
    pub cold_to_archived: usize,
    pub tokens_saved: usize,
}

impl TransitionReport {
    pub fn total_moved(&self) -> usize {
        self.hot_to_warm + self.warm_to_cold + self.cold_to_archived
    }
}

/// Tier policy driver
pub struct TierManager {
    config: TemporalConfig,
}

impl TierManager {
    pub fn new(config: TemporalConfig) -> Self {
        Self { config }
    }

    pub fn promote_on_access(&self) -> bool {
        self.config.promote_on_access
    }

    fn policy(&self, tier: Tier) -> &TierPolicy {
        match tier {
            Tier::Hot => &self.config.tiers.hot,
            Tier::Warm => &self.config.tiers.warm,
            Tier::Cold => &self.config.tiers.cold,
            Tier::Archived => &self.config.tiers.archived,
        }
    }

    /// Compression ratio for a tier
    pub fn compression_ratio(&self, tier: Tier) -> f32 {
        self.policy(tier).compression_ratio
    }

    /// Build the compressed payload for an entry at the target tier
    ///
    /// Returns None when the target tier does not compress (ratio >= 1).
    /// Token cost becomes `round(tokens * ratio)`; content keeps a
    /// proportional head and tail with an elision marker between.
    pub fn compress_entry(&self, entry: &CacheEntry, target_tier: Tier) -> Option<CompressedPayload> {
        let ratio = self.compression_ratio(target_tier);
        if ratio >= 1.0 {
            return None;
        }

        let compressed_tokens =
            ((entry.tokens as f32 * ratio).round() as usize).min(entry.tokens);

        Some(CompressedPayload {
            content: elide(&entry.content, ratio),
            original_tokens: entry.tokens,
            compressed_tokens,
            method: CompressionMethod::HeadTail,
        })
    }

    /// Promote an entry back to hot, clearing any compression
    ///
    /// Returns the change in effective tokens (new - old).
    pub fn promote(&self, entry: &mut CacheEntry) -> i64 {
        let before = entry.effective_tokens() as i64;
        entry.tier = Tier::Hot;
        entry.compressed = None;
        entry.tokens as i64 - before
    }

    /// Demote an entry one tier colder and compress it there
    ///
    /// Returns the tokens saved, or None when the entry is already at the
    /// coldest tier.
    pub fn demote(&self, entry: &mut CacheEntry) -> Option<usize> {
        let target = entry.tier.colder()?;
        let before = entry.effective_tokens();

        entry.tier = target;
        if let Some(payload) = self.compress_entry(entry, target) {
            entry.compressed = Some(payload);
        }

        Some(before.saturating_sub(entry.effective_tokens()))
    }

    /// Classify all entries by idle time and move them one tier colder
    /// where their current tier's timeout has elapsed
    ///
    /// Preserved entries are never demoted.
    pub fn process_transitions<'a>(
        &self,
        entries: impl IntoIterator<Item = &'a mut CacheEntry>,
        preserved: &HashSet<EntryId>,
        now: DateTime<Utc>,
    ) -> TransitionReport {
        let mut report = TransitionReport::default();

        for entry in entries {
            if preserved.contains(&entry.id) {
                continue;
            }
            if entry.tier == Tier::Archived {
                continue;
            }

            let idle = entry.idle_secs(now);
            let timeout = self.policy(entry.tier).transition_after.as_secs_f64();
            if idle < timeout {
                continue;
            }

            let from = entry.tier;
            if let Some(saved) = self.demote(entry) {
                report.tokens_saved += saved;
                match from {
                    Tier::Hot => report.hot_to_warm += 1,
                    Tier::Warm => report.warm_to_cold += 1,
                    Tier::Cold => report.cold_to_archived += 1,
                    Tier::Archived => {}
                }
            }
        }

        report
    }
}

/// Keep a proportional head and tail of the content
fn elide(content: &str, ratio: f32) -> String {
    let chars: Vec<char> = content.chars().collect();
    let keep = (chars.len() as f32 * ratio) as usize;
    if keep >= chars.len() {
        return content.to_string();
    }

    let head = keep * 2 / 3;
    let tail = keep - head;
    let mut out: String = chars[..head].iter().collect();
    out.push_str("\n…\n");
    out.extend(chars[chars.len() - tail..].iter());
    out
}
