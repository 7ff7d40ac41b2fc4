//! Property tests for the quantified invariants: token accounting
//! stays consistent under arbitrary operation sequences, and retry
//! backoff is monotone and capped.

use hermes_core::config::RetryConfig;
use hermes_core::{CacheOptimizer, EntryId, EntryMetadata, EntryType, HermesConfig};
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Add(usize),
    Get(usize),
    Delete(usize),
    Compress(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..200).prop_map(Op::Add),
        (0usize..32).prop_map(Op::Get),
        (0usize..32).prop_map(Op::Delete),
        (0usize..32).prop_map(Op::Compress),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// P1: current_tokens always equals the sum of live entries'
    /// effective tokens, whatever the operation interleaving.
    #[test]
    fn token_accounting_matches_live_entries(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        runtime.block_on(async move {
            let mut config = HermesConfig::default();
            config.context_window_size = 100_000;
            let optimizer = CacheOptimizer::new(config).unwrap();
            let mut ids: Vec<EntryId> = Vec::new();

            for op in ops {
                match op {
                    Op::Add(tokens) => {
                        let content = "c".repeat(tokens * 4);
                        let id = optimizer
                            .add(content, EntryType::UserMessage, EntryMetadata::default())
                            .await
                            .unwrap();
                        ids.push(id);
                    }
                    Op::Get(i) => {
                        if let Some(id) = ids.get(i) {
                            let _ = optimizer.get(*id).await;
                        }
                    }
                    Op::Delete(i) => {
                        if let Some(id) = ids.get(i) {
                            let _ = optimizer.delete(*id).await;
                        }
                    }
                    Op::Compress(i) => {
                        if let Some(id) = ids.get(i) {
                            let _ = optimizer.compress(&[*id]).await;
                        }
                    }
                }

                let metrics = optimizer.get_metrics().await;
                let live: usize = optimizer
                    .get_entries(Default::default())
                    .await
                    .iter()
                    .map(|e| e.effective_tokens())
                    .sum();
                prop_assert_eq!(metrics.current_tokens, live);
            }
            Ok(())
        })?;
    }

    /// P5: delays are min(base * factor^k, max) and non-decreasing in k
    /// until capped.
    #[test]
    fn backoff_is_monotone_and_capped(
        base_ms in 1u64..500,
        factor in 1.0f64..4.0,
        cap_mult in 1u64..64,
        attempts in 1u32..24,
    ) {
        let retry = RetryConfig {
            max_retries: attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(base_ms * cap_mult),
            backoff_factor: factor,
        };

        let mut previous = Duration::ZERO;
        for attempt in 0..attempts {
            let delay = retry.delay_for_attempt(attempt);
            let expected =
                (base_ms as f64 * factor.powi(attempt as i32)).min((base_ms * cap_mult) as f64);

            prop_assert!(delay >= previous, "delay decreased at attempt {}", attempt);
            prop_assert!(delay <= retry.max_delay);
            let diff = (delay.as_millis() as f64 - expected).abs();
            prop_assert!(diff <= 1.0, "delay off by {}ms at attempt {}", diff, attempt);
            previous = delay;
        }
    }
}
