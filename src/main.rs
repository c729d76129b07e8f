mod batch;
mod binlog;
mod cli;
mod config;
mod control;
mod error;
mod sharding;
mod stream;
mod supervisor;
mod tables;
mod throttle;

use crate::batch::TableHelper;
use crate::binlog::coordinates::BinlogCoordinates;
use crate::cli::Cli;
use crate::config::DatabaseConfig;
use crate::control::RunControl;
use crate::error::AppResult;
use crate::sharding::applier::ApplierSettings;
use crate::supervisor::{
    BATCH_WRITE_COUNT, OriginTable, TOTAL_SHARD_NUM, build_appliers, run_batch, run_incremental,
    watch_signals,
};
use crate::tables::UserRecordingLikeHelper;
use anyhow::{Context, bail};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_logging(log_prefix: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_prefix.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return None;
    }

    let path = Path::new(log_prefix);
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let prefix = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "shardstream".to_string());

    let appender = tracing_appender::rolling::daily(dir, prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.log_prefix);

    let config = Arc::new(
        DatabaseConfig::from_file(&cli.conf)
            .with_context(|| format!("loading config {}", cli.conf))?,
    );

    let binlog_override: Option<BinlogCoordinates> = if cli.binlog_info.is_empty() {
        None
    } else {
        Some(cli.binlog_info.parse()?)
    };

    if !cli.batch_mode && (cli.meta_dir.is_empty() || !Path::new(&cli.meta_dir).is_dir()) {
        bail!("invalid meta-dir '{}'", cli.meta_dir);
    }

    let origin = OriginTable {
        table_pattern: "user_recording_like".to_string(),
        database_pattern: "*".to_string(),
        db_alias: "final".to_string(),
    };

    let control = RunControl::new();
    let helper = Arc::new(UserRecordingLikeHelper::new(TOTAL_SHARD_NUM, true));

    let settings = ApplierSettings {
        batch_insert_size: BATCH_WRITE_COUNT,
        cache_size: BATCH_WRITE_COUNT * 10,
        max_retries: 10,
        dry_run: cli.dry_run,
        batch_insert_sleep: Duration::from_millis(20),
    };
    let applier_set = build_appliers(
        &config,
        helper.builder(),
        TOTAL_SHARD_NUM,
        1,
        &settings,
    )?;

    let signal_task = watch_signals(
        control.clone(),
        Arc::clone(&applier_set.appliers),
        cli.batch_mode,
        Arc::clone(&config),
        origin.db_alias.clone(),
    );

    let result: AppResult<()> = if cli.batch_mode {
        run_batch(
            &config,
            helper,
            &applier_set,
            &control,
            &origin,
            cli.batch_cache,
        )
        .await
    } else {
        run_incremental(
            &config,
            helper,
            &applier_set,
            &control,
            &origin,
            cli.replica_server_id,
            binlog_override,
            &cli.meta_dir,
        )
        .await
    };

    signal_task.abort();
    result?;
    Ok(())
}
