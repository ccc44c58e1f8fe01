//! Shared fixtures for batch engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use refresh_batch::{MemoryStore, MutationRequest};

pub const IMAGE_TABLE: &str = "image";
pub const FID_A: &str = "a";
pub const FID_B: &str = "b";
pub const FID_C: &str = "c";
pub const MATCHING_PROVIDER: &str = "foo";
pub const NOT_MATCHING_PROVIDER: &str = "bar";
pub const OLD_TITLE: &str = "old title";
pub const NEW_TITLE: &str = "new title";

/// Three image rows: `a` and `b` from the matching provider, `c` from another.
pub fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (fid, provider) in [
        (FID_A, MATCHING_PROVIDER),
        (FID_B, MATCHING_PROVIDER),
        (FID_C, NOT_MATCHING_PROVIDER),
    ] {
        store.insert(
            IMAGE_TABLE,
            fid,
            [
                ("provider", provider),
                ("title", OLD_TITLE),
                ("license", "by"),
            ],
        );
    }
    store
}

/// `n` rows with zero-padded identifiers so identifier order equals insert order.
pub fn numbered_store(n: u64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.create_table(IMAGE_TABLE);
    for i in 0..n {
        store.insert(
            IMAGE_TABLE,
            &format!("row_{i:06}"),
            [("provider", MATCHING_PROVIDER), ("title", OLD_TITLE)],
        );
    }
    store
}

/// Request rewriting every row titled [`OLD_TITLE`] to [`NEW_TITLE`].
pub fn retitle_request(run_id: &str, batch_size: u64) -> MutationRequest {
    MutationRequest {
        table: IMAGE_TABLE.to_string(),
        filter_predicate: format!("WHERE title = '{OLD_TITLE}'"),
        set_clause: format!("SET title = '{NEW_TITLE}'"),
        expected_row_count: None,
        batch_size,
        batch_start: None,
        dry_run: false,
        timeout_ms: 0,
        per_batch_timeout_ms: 0,
        run_id: run_id.to_string(),
        resume: false,
    }
}

pub fn title_of(store: &MemoryStore, fid: &str) -> String {
    store
        .row(IMAGE_TABLE, fid)
        .and_then(|row| row.get("title").cloned())
        .unwrap_or_default()
}
