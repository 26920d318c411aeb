use std::{process, sync::Arc};

use cascade_cache::{
    application::error::AppError,
    cache::{
        CacheConfig, CacheService, CacheStore, EntityType, InvalidationPlan, InvalidationReport,
        InvalidationRequest,
    },
    config::{self, GetArgs, InvalidateArgs, KeysArgs, PurgeArgs},
    infra::{redis::RedisStore, telemetry},
};
use serde_json::{Value, json};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    let store: Arc<dyn CacheStore> = Arc::new(RedisStore::connect(&settings.redis).await?);
    let service = CacheService::new(store, CacheConfig::from(&settings.cache));

    let result = match cli_args.command {
        config::Command::Stats => run_stats(&service).await,
        config::Command::Keys(args) => run_keys(&service, args).await,
        config::Command::Get(args) => run_get(&service, args).await,
        config::Command::Purge(args) => run_purge(&service, args).await,
        config::Command::Invalidate(args) => run_invalidate(&service, args).await,
    };

    service.close().await;
    result
}

async fn run_stats(service: &CacheService) -> Result<(), AppError> {
    let stats = service.statistics().await;
    print_json(&json!(stats))
}

async fn run_keys(service: &CacheService, args: KeysArgs) -> Result<(), AppError> {
    let mut keys = service.keys(&args.pattern).await?;
    if let Some(limit) = args.limit {
        keys.truncate(limit);
    }
    for key in &keys {
        println!("{key}");
    }
    info!(pattern = %args.pattern, count = keys.len(), "Listed keys");
    Ok(())
}

async fn run_get(service: &CacheService, args: GetArgs) -> Result<(), AppError> {
    match service.get::<Value>(&args.key).await? {
        Some(value) => print_json(&value),
        None => Err(AppError::validation(format!("no entry under `{}`", args.key))),
    }
}

async fn run_purge(service: &CacheService, args: PurgeArgs) -> Result<(), AppError> {
    let removed = service.remove_by_pattern(&args.pattern).await?;
    info!(pattern = %args.pattern, removed, "Purged keys");
    print_json(&json!({ "pattern": args.pattern, "removed": removed }))
}

async fn run_invalidate(service: &CacheService, args: InvalidateArgs) -> Result<(), AppError> {
    let entity_type: EntityType = args
        .entity_type
        .parse()
        .map_err(|err| AppError::validation(format!("{err}")))?;

    let request = match (args.key, args.id) {
        (Some(key), _) => InvalidationRequest::keyed(entity_type, key),
        (None, Some(id)) => InvalidationRequest::entity(entity_type, id),
        (None, None) => InvalidationRequest::all(entity_type),
    }
    .with_cascade(args.cascade);

    if args.dry_run {
        let plan = InvalidationPlan::for_request(&request);
        info!(plan = %plan, "Dry run; nothing deleted");
        return print_json(&plan_json(&plan));
    }

    let report = service.invalidate(&request).await;
    print_json(&report_json(&report))?;
    if report.is_clean() {
        Ok(())
    } else {
        Err(AppError::unexpected(format!(
            "{} invalidation branch(es) failed",
            report.failed_branches
        )))
    }
}

fn plan_json(plan: &InvalidationPlan) -> Value {
    json!({
        "keys": plan.keys,
        "patterns": plan.patterns,
        "cascades": plan.cascades.iter().map(|ty| ty.prefix()).collect::<Vec<_>>(),
    })
}

fn report_json(report: &InvalidationReport) -> Value {
    json!({
        "keys_removed": report.keys_removed,
        "pattern_keys_removed": report.pattern_keys_removed,
        "total_removed": report.total_removed(),
        "cascaded": report.cascaded.iter().map(|ty| ty.prefix()).collect::<Vec<_>>(),
        "failed_branches": report.failed_branches,
    })
}

fn print_json(value: &Value) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
