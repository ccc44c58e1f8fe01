mod common;

use common::*;
use proptest::prelude::*;
use refresh_batch::{BatchPlanner, ChunkExecutor, MutationSpec};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("test runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn batches_partition_the_selection_suffix(
        rows in 0u64..120,
        batch_size in 1u64..40,
        start in 0u64..140,
        dry_run in any::<bool>(),
    ) {
        let store = numbered_store(rows);
        let before = store.rows(IMAGE_TABLE);
        let mut request = retitle_request("partition", batch_size);
        request.batch_start = Some(start);
        request.dry_run = dry_run;
        let spec = MutationSpec::try_from(request).expect("valid request");

        let (total, snapshot) = runtime().block_on(async {
            let selection = BatchPlanner::new(store.clone())
                .plan(&spec)
                .await
                .expect("plan");
            let executor = ChunkExecutor::new(store.clone());
            let total = executor.run(&spec, &selection, start).await.expect("run");
            (total, executor.progress().snapshot())
        });

        let expected = rows.saturating_sub(start);
        prop_assert_eq!(total, expected);
        prop_assert_eq!(snapshot.batches.len() as u64, expected.div_ceil(batch_size));

        // Contiguous, non-overlapping, and covering exactly `start..rows`.
        let mut next = start;
        for batch in &snapshot.batches {
            prop_assert_eq!(batch.start, next);
            prop_assert!(batch.end > batch.start);
            prop_assert!(batch.end - batch.start <= batch_size);
            next = batch.end;
        }
        prop_assert_eq!(next, if expected > 0 { rows } else { start });

        if dry_run {
            prop_assert_eq!(store.update_calls(), 0);
            prop_assert_eq!(store.rows(IMAGE_TABLE), before);
        } else {
            let untouched = (0..rows.min(start))
                .all(|i| title_of(&store, &format!("row_{i:06}")) == OLD_TITLE);
            let rewritten = (start..rows)
                .all(|i| title_of(&store, &format!("row_{i:06}")) == NEW_TITLE);
            prop_assert!(untouched);
            prop_assert!(rewritten);
        }
    }
}
