//! Runs the engine against a real PostgreSQL. Point `REFRESH_DATABASE_URL`
//! at a scratch database and run with `--ignored`.

mod common;

use std::sync::Arc;

use anyhow::{Context, Result};
use common::*;
use refresh_batch::{
    BatchPlanner, BatchedMutation, MutationError, MutationRequest, MutationSpec, PgRowStore,
    RowStore, Verdict,
};
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;

struct PgHarness {
    admin: Client,
    store: Arc<PgRowStore>,
    table: String,
}

impl PgHarness {
    /// Recreates `image_<name>` with rows `a`, `b` (provider `foo`) and `c`
    /// (provider `bar`), and drops any selection left by run `<name>`.
    async fn start(name: &str) -> Result<Self> {
        let url = std::env::var("REFRESH_DATABASE_URL")
            .context("REFRESH_DATABASE_URL must name a scratch database")?;
        let (admin, connection) = tokio_postgres::connect(&url, NoTls)
            .await
            .context("connect admin client")?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let table = format!("{IMAGE_TABLE}_{name}");
        admin
            .batch_execute(&format!(
                "DROP TABLE IF EXISTS {name}_rows_to_update;
                 DROP TABLE IF EXISTS {table};
                 CREATE TABLE {table} (
                     identifier TEXT PRIMARY KEY,
                     provider TEXT NOT NULL,
                     title TEXT NOT NULL
                 );
                 INSERT INTO {table} VALUES
                     ('{FID_A}', '{MATCHING_PROVIDER}', '{OLD_TITLE}'),
                     ('{FID_B}', '{MATCHING_PROVIDER}', '{OLD_TITLE}'),
                     ('{FID_C}', '{NOT_MATCHING_PROVIDER}', '{OLD_TITLE}');"
            ))
            .await
            .with_context(|| format!("seed {table}"))?;

        let store = PgRowStore::connect(&url).await?;
        Ok(Self {
            admin,
            store: Arc::new(store),
            table,
        })
    }

    fn request(&self, run_id: &str) -> MutationRequest {
        MutationRequest {
            table: self.table.clone(),
            ..retitle_request(run_id, 1)
        }
    }

    fn engine(&self) -> BatchedMutation {
        BatchedMutation::new(self.store.clone())
    }

    async fn title(&self, fid: &str) -> Result<String> {
        let row = self
            .admin
            .query_one(
                &format!("SELECT title FROM {} WHERE identifier = $1", self.table),
                &[&fid],
            )
            .await
            .with_context(|| format!("read title of {fid}"))?;
        Ok(row.try_get(0)?)
    }

    async fn has_selection(&self, run_id: &str) -> Result<bool> {
        let row = self
            .admin
            .query_one(
                "SELECT to_regclass($1) IS NOT NULL",
                &[&format!("{run_id}_rows_to_update")],
            )
            .await
            .context("look up selection table")?;
        Ok(row.try_get(0)?)
    }
}

fn planning_reason(err: &MutationError) -> &str {
    match err {
        MutationError::Planning { reason, .. } => reason,
        other => panic!("expected a planning error, got {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs a scratch PostgreSQL at REFRESH_DATABASE_URL"]
async fn pg_full_run_rewrites_every_row_and_drops_selection() -> Result<()> {
    let harness = PgHarness::start("pg_full").await?;

    let outcome = harness
        .engine()
        .execute(harness.request("pg_full"), CancellationToken::new())
        .await?;

    assert_eq!(outcome.total_rows_updated, 3);
    assert_eq!(outcome.batches, 3);
    assert_eq!(outcome.verdict, Verdict::Match);
    assert!(outcome.selection_released);
    for fid in [FID_A, FID_B, FID_C] {
        assert_eq!(harness.title(fid).await?, NEW_TITLE);
    }
    assert!(!harness.has_selection("pg_full").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs a scratch PostgreSQL at REFRESH_DATABASE_URL"]
async fn pg_batch_start_and_provider_predicate_narrow_the_run() -> Result<()> {
    let harness = PgHarness::start("pg_narrow").await?;

    let mut request = harness.request("pg_narrow");
    request.filter_predicate = format!("WHERE provider = '{MATCHING_PROVIDER}'");
    request.batch_start = Some(1);
    let outcome = harness
        .engine()
        .execute(request, CancellationToken::new())
        .await?;

    assert_eq!(outcome.total_rows_updated, 1);
    assert_eq!(outcome.final_cursor, 2);
    assert_eq!(harness.title(FID_A).await?, OLD_TITLE);
    assert_eq!(harness.title(FID_B).await?, NEW_TITLE);
    assert_eq!(harness.title(FID_C).await?, OLD_TITLE);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs a scratch PostgreSQL at REFRESH_DATABASE_URL"]
async fn pg_dry_run_counts_without_writing() -> Result<()> {
    let harness = PgHarness::start("pg_dry").await?;

    let mut request = harness.request("pg_dry");
    request.dry_run = true;
    let outcome = harness
        .engine()
        .execute(request, CancellationToken::new())
        .await?;

    assert_eq!(outcome.total_rows_updated, 3);
    for fid in [FID_A, FID_B, FID_C] {
        assert_eq!(harness.title(fid).await?, OLD_TITLE);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs a scratch PostgreSQL at REFRESH_DATABASE_URL"]
async fn pg_selection_window_follows_row_numbers() -> Result<()> {
    let harness = PgHarness::start("pg_window").await?;
    let spec = MutationSpec::try_from(harness.request("pg_window"))?;
    let selection = BatchPlanner::new(harness.store.clone()).plan(&spec).await?;
    assert_eq!(selection.len(), 3);

    let store: &dyn RowStore = harness.store.as_ref();
    assert_eq!(store.read_selection(selection.name(), 0, 2).await?, [FID_A, FID_B]);
    assert_eq!(store.read_selection(selection.name(), 1, 1).await?, [FID_B]);
    assert!(store.read_selection(selection.name(), 3, 10).await?.is_empty());
    assert_eq!(store.attach_selection(selection.name()).await?, 3);

    store.drop_selection(selection.name()).await?;
    // Dropping twice is fine.
    store.drop_selection(selection.name()).await?;
    assert!(!harness.has_selection("pg_window").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs a scratch PostgreSQL at REFRESH_DATABASE_URL"]
async fn pg_duplicate_selection_requires_resume() -> Result<()> {
    let harness = PgHarness::start("pg_dup").await?;
    let spec = MutationSpec::try_from(harness.request("pg_dup"))?;
    BatchPlanner::new(harness.store.clone()).plan(&spec).await?;

    let err = harness
        .engine()
        .execute(harness.request("pg_dup"), CancellationToken::new())
        .await
        .expect_err("selection already exists");
    assert!(planning_reason(&err).contains("already exists"), "{err}");

    let mut resumed = harness.request("pg_dup");
    resumed.resume = true;
    let outcome = harness
        .engine()
        .execute(resumed, CancellationToken::new())
        .await?;
    assert_eq!(outcome.total_rows_updated, 3);
    assert!(!harness.has_selection("pg_dup").await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs a scratch PostgreSQL at REFRESH_DATABASE_URL"]
async fn pg_unknown_table_and_malformed_predicate_fail_planning() -> Result<()> {
    let harness = PgHarness::start("pg_bad").await?;

    let mut unknown = harness.request("pg_bad");
    unknown.table = "image_does_not_exist".to_string();
    let err = harness
        .engine()
        .execute(unknown, CancellationToken::new())
        .await
        .expect_err("unknown table");
    assert!(planning_reason(&err).contains("unknown table"), "{err}");
    assert!(!harness.has_selection("pg_bad").await?);

    let mut malformed = harness.request("pg_bad");
    malformed.filter_predicate = "WHERE provider =".to_string();
    let err = harness
        .engine()
        .execute(malformed, CancellationToken::new())
        .await
        .expect_err("syntax error");
    assert!(planning_reason(&err).contains("invalid query"), "{err}");
    Ok(())
}
