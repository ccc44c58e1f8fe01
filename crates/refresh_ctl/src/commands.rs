//! Subcommand arguments and handlers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use refresh_batch::postgres::DEFAULT_ID_COLUMN;
use refresh_batch::spec::DEFAULT_BATCH_SIZE;
use refresh_batch::{
    expected_update_count, BatchPlanner, BatchedMutation, MediaType, MutationRequest,
    MutationSpec, PgRowStore, PopularitySql,
};
use refresh_coord::{
    ClaimBoard, ConflictSensor, ConflictToken, CoordinationRequest, Coordinator,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{data_refresh_workflows, CtlConfig, MediaProfile};

/// Which rows to touch and how.
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Media type whose table is targeted.
    #[arg(long, conflicts_with = "table")]
    pub media: Option<MediaType>,

    /// Table to target when it is not a media table.
    #[arg(long)]
    pub table: Option<String>,

    /// Row filter, e.g. "WHERE provider = 'flickr'". Empty selects every row.
    #[arg(long, default_value = "", conflicts_with = "provider")]
    pub predicate: String,

    /// Shorthand for a predicate selecting one provider's rows.
    #[arg(long)]
    pub provider: Option<String>,

    /// Identifier column that orders the selection.
    #[arg(long, default_value = DEFAULT_ID_COLUMN)]
    pub id_column: String,

    /// Update applied to each selected row, e.g. "SET title = 'x'".
    #[arg(long = "set", conflicts_with = "standardized_popularity")]
    pub set_clause: Option<String>,

    /// Recompute the stored standardized popularity score (requires --media).
    #[arg(long, requires = "media")]
    pub standardized_popularity: bool,

    /// Names the selection artifact; reuse it with --resume.
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Conflict wait settings shared by `mutate` and `wait`.
#[derive(Args, Debug, Clone, Default)]
pub struct CoordinationArgs {
    /// Deployment context whose tags gate entry (defaults to REFRESH_ENVIRONMENT).
    #[arg(long)]
    pub environment: Option<String>,

    /// Run ids that never count as conflicts.
    #[arg(long = "exclude")]
    pub excluded_run_ids: Vec<String>,

    /// First wait until no data refresh workflow has a live run.
    #[arg(long)]
    pub wait_for_data_refresh: bool,

    /// Delay between polls (defaults to REFRESH_POLL_INTERVAL_MS).
    #[arg(long)]
    pub poll_interval: Option<humantime::Duration>,

    /// Give up waiting after this long (defaults to REFRESH_WAIT_TIMEOUT_MS).
    #[arg(long)]
    pub wait_timeout: Option<humantime::Duration>,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[arg(long)]
    pub batch_start: Option<u64>,

    /// Drop the selection after counting instead of keeping it for `mutate --resume`.
    #[arg(long)]
    pub release: bool,
}

#[derive(Args, Debug, Clone)]
pub struct MutateArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Read the whole mutation request from a JSON file instead of flags.
    #[arg(long, conflicts_with_all = ["media", "table", "set_clause", "standardized_popularity"])]
    pub request: Option<PathBuf>,

    /// Fail unless exactly this many rows are updated (defaults to the selection size).
    #[arg(long)]
    pub expected_row_count: Option<u64>,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: u64,

    /// Selection offset to start from, e.g. the cursor of a failed run.
    #[arg(long)]
    pub batch_start: Option<u64>,

    /// Count what each batch would touch without writing.
    #[arg(long)]
    pub dry_run: bool,

    /// Overall budget; 0 disables it.
    #[arg(long, default_value = "0s")]
    pub timeout: humantime::Duration,

    #[arg(long, default_value = "1h")]
    pub per_batch_timeout: humantime::Duration,

    /// Reuse the selection left behind by an earlier run with the same run id.
    #[arg(long)]
    pub resume: bool,

    /// Skip the conflict wait.
    #[arg(long)]
    pub no_wait: bool,

    #[command(flatten)]
    pub coordination: CoordinationArgs,
}

#[derive(Args, Debug, Clone)]
pub struct WaitArgs {
    /// Wait on this tag instead of the environment's tags.
    #[arg(long)]
    pub tag: Option<String>,

    /// The calling run; never counted as a conflict.
    #[arg(long)]
    pub run_id: Option<String>,

    #[command(flatten)]
    pub coordination: CoordinationArgs,
}

#[derive(Debug, Serialize)]
struct PlanReport {
    run_id: String,
    table: String,
    selection: String,
    rows: u64,
    expected_update_count: u64,
    released: bool,
}

#[derive(Debug, Serialize)]
struct WaitReport {
    environment: String,
    tags: Vec<String>,
    status: &'static str,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("encode output")?
    );
    Ok(())
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Resolves the target table and set clause from flags.
fn resolve_target(
    target: &TargetArgs,
    profiles: &BTreeMap<MediaType, MediaProfile>,
) -> Result<(String, String)> {
    let profile = target.media.and_then(|media| profiles.get(&media));
    let table = match (&target.table, profile) {
        (Some(table), _) => table.clone(),
        (None, Some(profile)) => profile.table.clone(),
        (None, None) => bail!("pass --media or --table"),
    };
    let set_clause = match (&target.set_clause, profile) {
        (Some(set_clause), _) => set_clause.clone(),
        (None, Some(profile)) if target.standardized_popularity => {
            profile.popularity.standardized_popularity_set_clause()
        }
        _ => bail!("pass --set or --standardized-popularity"),
    };
    Ok((table, set_clause))
}

fn predicate(target: &TargetArgs) -> String {
    match &target.provider {
        Some(provider) => PopularitySql::provider_predicate(provider),
        None => target.predicate.clone(),
    }
}

async fn connect_store(config: &CtlConfig, target: &TargetArgs) -> Result<PgRowStore> {
    PgRowStore::connect(config.database_url()?)
        .await?
        .with_id_column(&target.id_column)
}

fn run_id(target: &TargetArgs) -> Result<String> {
    target
        .run_id
        .clone()
        .context("pass --run-id to name the selection")
}

pub(crate) fn build_mutation_request(
    args: &MutateArgs,
    profiles: &BTreeMap<MediaType, MediaProfile>,
) -> Result<MutationRequest> {
    if let Some(path) = &args.request {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read mutation request {}", path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("parse mutation request {}", path.display()));
    }
    let (table, set_clause) = resolve_target(&args.target, profiles)?;
    Ok(MutationRequest {
        table,
        filter_predicate: predicate(&args.target),
        set_clause,
        expected_row_count: args.expected_row_count,
        batch_size: args.batch_size,
        batch_start: args.batch_start,
        dry_run: args.dry_run,
        timeout_ms: millis(*args.timeout),
        per_batch_timeout_ms: millis(*args.per_batch_timeout),
        run_id: run_id(&args.target)?,
        resume: args.resume,
    })
}

/// One request per tag the environment holds. An environment without tags
/// needs no waiting.
pub(crate) fn coordination_requests(
    config: &CtlConfig,
    args: &CoordinationArgs,
    tags: &[String],
    own_run_id: Option<&str>,
) -> Vec<CoordinationRequest> {
    let workflow_ids = if args.wait_for_data_refresh {
        data_refresh_workflows(&environment(config, args))
    } else {
        Vec::new()
    };
    let mut excluded = args.excluded_run_ids.clone();
    if let Some(run_id) = own_run_id {
        excluded.push(run_id.to_string());
    }
    let poll_interval = args
        .poll_interval
        .as_deref()
        .copied()
        .unwrap_or(config.poll_interval);
    let timeout = args
        .wait_timeout
        .as_deref()
        .copied()
        .unwrap_or(config.wait_timeout);

    tags.iter()
        .map(|tag| CoordinationRequest {
            tag: tag.clone(),
            excluded_run_ids: excluded.clone(),
            workflow_ids: workflow_ids.clone(),
            poll_interval_ms: millis(poll_interval).max(1),
            timeout_ms: millis(timeout),
        })
        .collect()
}

fn environment(config: &CtlConfig, args: &CoordinationArgs) -> String {
    args.environment
        .clone()
        .unwrap_or_else(|| config.environment.clone())
}

fn environment_tags(config: &CtlConfig, args: &CoordinationArgs) -> Result<(String, Vec<String>)> {
    let environment = environment(config, args);
    let registry = config.registry()?;
    let tags = registry.tags_for(&environment).to_vec();
    Ok((environment, tags))
}

pub async fn plan(config: &CtlConfig, args: PlanArgs) -> Result<()> {
    let profiles = config.media_profiles();
    let (table, set_clause) = resolve_target(&args.target, &profiles)?;
    let request = MutationRequest {
        table,
        filter_predicate: predicate(&args.target),
        set_clause,
        expected_row_count: None,
        batch_size: DEFAULT_BATCH_SIZE,
        batch_start: args.batch_start,
        dry_run: true,
        timeout_ms: 0,
        per_batch_timeout_ms: 0,
        run_id: run_id(&args.target)?,
        resume: false,
    };
    let spec = MutationSpec::try_from(request)?;

    let store = connect_store(config, &args.target).await?;
    let planner = BatchPlanner::new(Arc::new(store));
    let selection = planner.plan(&spec).await?;
    let released = if args.release {
        planner
            .release(&selection)
            .await
            .context("drop selection")?;
        true
    } else {
        info!(
            selection = selection.name(),
            "selection kept; continue with `mutate --resume --run-id {}`",
            spec.run_id()
        );
        false
    };

    print_json(&PlanReport {
        run_id: spec.run_id().to_string(),
        table: spec.table().to_string(),
        selection: selection.name().to_string(),
        rows: selection.len(),
        expected_update_count: expected_update_count(&selection, Some(spec.batch_start())),
        released,
    })
}

async fn enter_coordinated(
    config: &CtlConfig,
    args: &CoordinationArgs,
    run_id: &str,
) -> Result<Vec<ConflictToken>> {
    let (environment, tags) = environment_tags(config, args)?;
    if tags.is_empty() {
        warn!(environment, "no resource tags for environment; not waiting");
        return Ok(Vec::new());
    }
    let coordinator = Coordinator::new(config.run_source(), ClaimBoard::new());
    let mut tokens = Vec::with_capacity(tags.len());
    for request in coordination_requests(config, args, &tags, Some(run_id)) {
        let token = coordinator
            .enter(&request, run_id, env!("CARGO_PKG_NAME"))
            .await
            .with_context(|| format!("wait for conflicts on `{}`", request.tag))?;
        tokens.push(token);
    }
    Ok(tokens)
}

pub async fn mutate(config: &CtlConfig, args: MutateArgs) -> Result<()> {
    let profiles = config.media_profiles();
    let request = build_mutation_request(&args, &profiles)?;
    // Validate before waiting so a typo does not cost a full conflict wait.
    let spec = MutationSpec::try_from(request)?;

    let _tokens = if args.no_wait {
        Vec::new()
    } else {
        enter_coordinated(config, &args.coordination, spec.run_id()).await?
    };

    let store = connect_store(config, &args.target).await?;
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping after the current batch");
                cancel.cancel();
            }
        }
    });

    let engine = BatchedMutation::new(Arc::new(store));
    match engine.execute_spec(&spec, cancel).await {
        Ok(outcome) => print_json(&outcome),
        Err(err) => {
            if let Some(offset) = err.resume_offset() {
                error!(
                    run_id = spec.run_id(),
                    resume_from = offset,
                    "rerun with --resume --batch-start {offset}"
                );
            }
            Err(anyhow::Error::new(err).context("batched update failed"))
        }
    }
}

pub async fn wait(config: &CtlConfig, args: WaitArgs) -> Result<()> {
    let (environment, tags) = match &args.tag {
        Some(tag) => (environment(config, &args.coordination), vec![tag.clone()]),
        None => environment_tags(config, &args.coordination)?,
    };

    let sensor = ConflictSensor::new(config.run_source());
    for request in coordination_requests(config, &args.coordination, &tags, args.run_id.as_deref())
    {
        sensor
            .await_all(&request)
            .await
            .with_context(|| format!("wait for conflicts on `{}`", request.tag))?;
    }
    print_json(&WaitReport {
        environment,
        tags,
        status: "clear",
    })
}
