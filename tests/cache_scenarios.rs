//! End-to-end cache optimizer scenarios through the public API:
//! proactive pruning, preservation, and emergency compaction prevention.

use hermes_core::{
    CacheOptimizer, EntryMetadata, EntryType, HermesConfig, PruningUrgency, ScoringContext,
};

fn config(window: usize) -> HermesConfig {
    let mut config = HermesConfig::default();
    config.context_window_size = window;
    config.pruning.preserve_recent_count = 0;
    config
}

/// Content sized so the accountant charges exactly `tokens` for the type
fn content_for(tokens: usize, entry_type: EntryType) -> String {
    "x".repeat((tokens as f32 * entry_type.chars_per_token()) as usize)
}

async fn add_tokens(optimizer: &CacheOptimizer, tokens: usize, entry_type: EntryType) {
    optimizer
        .add(
            content_for(tokens, entry_type),
            entry_type,
            EntryMetadata::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn proactive_prune_holds_soft_threshold() {
    // Window 1000, soft 0.6, target 0.5. Alternating 60-token entries:
    // at 10 entries utilization sits exactly on the soft threshold.
    let mut cfg = config(1000);
    cfg.pruning.min_relevance_score = 0.45;
    let optimizer = CacheOptimizer::new(cfg).unwrap();

    for i in 0..10 {
        let entry_type = if i % 2 == 0 {
            EntryType::ToolResult
        } else {
            EntryType::FileRead
        };
        add_tokens(&optimizer, 60, entry_type).await;
    }
    assert!((optimizer.get_utilization().await - 0.6).abs() < 1e-9);

    let decision = optimizer.get_pruning_decision(&ScoringContext::now()).await;
    assert_eq!(decision.urgency, PruningUrgency::Soft);

    let result = optimizer.prune(&decision).await.unwrap();
    assert!(result.pruned >= 1, "at least one entry was removed");
    assert!(result.utilization_after <= 0.5);

    // Further inserts keep utilization bounded by the proactive pass
    for _ in 0..4 {
        add_tokens(&optimizer, 60, EntryType::ToolResult).await;
        assert!(optimizer.get_utilization().await < 0.67);
    }
}

#[tokio::test]
async fn preservation_wins_over_low_score() {
    // Everything scores below min_relevance, so only preservation can
    // shield the system prompt.
    let mut cfg = config(1000);
    cfg.pruning.min_relevance_score = 0.99;
    let optimizer = CacheOptimizer::new(cfg).unwrap();

    let protected = optimizer
        .add(
            content_for(10, EntryType::SystemPrompt),
            EntryType::SystemPrompt,
            EntryMetadata::default(),
        )
        .await
        .unwrap();

    for _ in 0..50 {
        add_tokens(&optimizer, 8, EntryType::ToolResult).await;
    }
    // One large insert jumps utilization past the hard threshold; the
    // pre-insert check sees utilization still below soft and lets it in.
    add_tokens(&optimizer, 350, EntryType::FileRead).await;
    assert!(optimizer.get_utilization().await >= 0.75);

    let decision = optimizer.get_pruning_decision(&ScoringContext::now()).await;
    assert_ne!(decision.urgency, PruningUrgency::None);
    assert!(!decision.to_prune.contains(&protected));
    assert!(!decision.to_demote.contains(&protected));

    optimizer.prune(&decision).await.unwrap();
    assert!(
        optimizer.get_entry(protected).await.is_some(),
        "preserved entry survives the prune"
    );
}

#[tokio::test]
async fn pre_compact_prevents_forced_compaction() {
    // Utilization 0.98 against emergency 0.9: the hook must bring it
    // back under the emergency threshold and say so.
    let optimizer = CacheOptimizer::new(config(1000)).unwrap();

    for _ in 0..58 {
        add_tokens(&optimizer, 10, EntryType::ToolResult).await;
    }
    add_tokens(&optimizer, 400, EntryType::FileRead).await;
    assert!(optimizer.get_utilization().await > 0.95);

    let result = optimizer.on_pre_compact().await;
    assert!(result.success, "error: {:?}", result.error);
    assert!(result.compaction_prevented);
    assert!(result.new_utilization.unwrap() < 0.9);
    assert!(result.tokens_freed.unwrap() > 0);
    assert!(!result.actions.is_empty());

    let metrics = optimizer.get_metrics().await;
    assert_eq!(metrics.compaction_prevented, 1);
}

#[tokio::test]
async fn prompt_hook_reports_utilization_and_duration() {
    let optimizer = CacheOptimizer::new(config(10_000)).unwrap();
    add_tokens(&optimizer, 100, EntryType::UserMessage).await;

    let result = optimizer
        .on_user_prompt_submit("please Grep /tmp/app/config.toml for the port", "sess-9")
        .await;
    assert!(result.success);
    assert!(result.error.is_none());
    assert!(result.new_utilization.is_some());
    assert!(!result.compaction_prevented);
}

#[tokio::test]
async fn utilization_bound_or_only_relevant_remain() {
    // After a prune with any urgency, either utilization reached the
    // target or every remaining non-preserved entry scores at or above
    // min_relevance.
    let mut cfg = config(1000);
    cfg.pruning.min_relevance_score = 0.2;
    let optimizer = CacheOptimizer::new(cfg.clone()).unwrap();

    for _ in 0..40 {
        add_tokens(&optimizer, 14, EntryType::BashOutput).await;
    }
    add_tokens(&optimizer, 300, EntryType::FileRead).await;

    let ctx = ScoringContext::now();
    let decision = optimizer.get_pruning_decision(&ctx).await;
    if decision.urgency == PruningUrgency::None {
        return;
    }
    let result = optimizer.prune(&decision).await.unwrap();

    if result.utilization_after > cfg.pruning.target_utilization {
        let entries = optimizer.get_entries(Default::default()).await;
        for entry in entries {
            let preserved = cfg
                .pruning
                .preserve_patterns
                .types
                .contains(&entry.entry_type);
            assert!(
                preserved || entry.score.overall >= cfg.pruning.min_relevance_score,
                "sub-threshold entry survived without reaching the target"
            );
        }
    }
}
