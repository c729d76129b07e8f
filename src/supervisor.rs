use crate::batch::{BatchPipeline, TableHelper};
use crate::binlog::coordinates::BinlogCoordinates;
use crate::binlog::entry::{BinlogEntry, EventDml};
use crate::binlog::reader::SourceConnection;
use crate::config::DatabaseConfig;
use crate::control::RunControl;
use crate::error::AppResult;
use crate::sharding::applier::{ApplierSettings, ShardApplier, ShardAppliers};
use crate::sharding::sql::SqlBuilder;
use crate::stream::listener::DmlHandler;
use crate::stream::streamer::{EventsStreamer, print_binlog_pos};
use crate::throttle::start_throttle_check;
use sqlx::mysql::MySqlPoolOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub const TOTAL_SHARD_NUM: usize = 32;
pub const MAX_RETRY_NUM: u64 = 10;
pub const MAX_BINLOG_DELAY_SECONDS: u64 = 5;
pub const BATCH_READ_COUNT: u32 = 2000;
pub const BATCH_WRITE_COUNT: usize = 2000;

/// The source table being split, plus the listener selector for it.
#[derive(Debug, Clone)]
pub struct OriginTable {
    pub table_pattern: String,
    pub database_pattern: String,
    pub db_alias: String,
}

/// All shard writers plus the per-host throttle flags they poll.
pub struct ApplierSet {
    pub appliers: Arc<ShardAppliers>,
    pub host_pauses: HashMap<String, Arc<AtomicBool>>,
    pub shard_aliases: Vec<String>,
    dry_run: bool,
}

impl ApplierSet {
    /// Heartbeat/lag watchdogs touch real databases; a dry run keeps
    /// everything offline.
    async fn start_throttle(&self, config: &DatabaseConfig) -> AppResult<()> {
        if self.dry_run {
            return Ok(());
        }
        start_throttle_check(config, &self.shard_aliases, &self.host_pauses).await
    }
}

/// Build one applier per shard index. With a `replication` factor > 1 the
/// shards are tables split across fewer instances: applier `i` writes to
/// alias `shard{i / replication}`. Appliers on the same hostname share one
/// throttle pause flag.
pub fn build_appliers<B: SqlBuilder>(
    config: &DatabaseConfig,
    builder: &B,
    shard_num: usize,
    replication: usize,
    settings: &ApplierSettings,
) -> AppResult<ApplierSet> {
    let mut host_pauses: HashMap<String, Arc<AtomicBool>> = HashMap::new();
    let mut shard_aliases = Vec::new();
    let mut appliers = Vec::with_capacity(shard_num);

    for shard_index in 0..shard_num {
        let db_index = shard_index / replication.max(1);
        let alias = format!("shard{db_index}");

        let location = config.get_db(&alias)?;
        let pause = host_pauses
            .entry(location.hostname.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)));

        appliers.push(ShardApplier::new(
            shard_index,
            &config.db_url(&alias)?,
            builder.batch_insert_tuple().to_string(),
            settings.clone(),
            Arc::clone(pause),
        )?);

        if !shard_aliases.contains(&alias) {
            shard_aliases.push(alias);
        }
    }

    Ok(ApplierSet {
        appliers: Arc::new(ShardAppliers::new(appliers)),
        host_pauses,
        shard_aliases,
        dry_run: settings.dry_run,
    })
}

/// SIGHUP toggles pause (batch) or dumps binlog positions (incremental);
/// SIGTERM starts the graceful stop and, after the binlog delay grace, closes
/// all appliers so in-flight batches flush cleanly.
pub fn watch_signals(
    control: RunControl,
    appliers: Arc<ShardAppliers>,
    batch_only: bool,
    config: Arc<DatabaseConfig>,
    source_alias: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    if batch_only {
                        let paused = control.toggle_pause();
                        info!(paused, "pause toggled");
                    } else if let Err(e) =
                        print_binlog_pos(&[source_alias.as_str()], &config).await
                    {
                        error!(error = %e, "failed to print binlog position");
                    }
                }
                _ = terminate.recv() => {
                    if control.request_stop() {
                        info!("stop requested, draining");
                        let appliers = Arc::clone(&appliers);
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(
                                MAX_BINLOG_DELAY_SECONDS + 1,
                            ))
                            .await;
                            appliers.close_all().await;
                        });
                    }
                }
            }
        }
    })
}

/// Batch backfill: page through the source table, bucket or stream, then the
/// ordered bulk load, then drain every applier.
pub async fn run_batch<H: TableHelper + 'static>(
    config: &DatabaseConfig,
    helper: Arc<H>,
    applier_set: &ApplierSet,
    control: &RunControl,
    origin: &OriginTable,
    batch_cache: usize,
) -> AppResult<()> {
    applier_set.start_throttle(config).await?;

    // Read-only source connection, capped so a runaway scan cannot starve
    // the source instance.
    let pool = MySqlPoolOptions::new()
        .max_connections(2)
        .connect_lazy(&config.db_url(&origin.db_alias)?)?;

    let mut pipeline = BatchPipeline::new(
        Arc::clone(&helper),
        &origin.table_pattern,
        applier_set.appliers.len(),
        BATCH_READ_COUNT,
        batch_cache,
    );

    pipeline
        .run(&pool, &applier_set.appliers, control)
        .await?;
    pipeline
        .reorder_and_apply(Arc::clone(&applier_set.appliers))
        .await?;

    applier_set.appliers.close_all().await;
    let executed = applier_set.appliers.wait_all().await?;
    info!(executed, "data sharding finished");
    Ok(())
}

/// Incremental mode: tail the binlog and fan DML out to the shard writers
/// until a stop is requested.
pub async fn run_incremental<H: TableHelper + 'static>(
    config: &DatabaseConfig,
    helper: Arc<H>,
    applier_set: &ApplierSet,
    control: &RunControl,
    origin: &OriginTable,
    server_id: u32,
    binlog_override: Option<BinlogCoordinates>,
    meta_dir: &str,
) -> AppResult<()> {
    applier_set.start_throttle(config).await?;

    let location = config.get_db(&origin.db_alias)?.clone();
    let source = SourceConnection {
        location,
        user: config.user.clone(),
        password: config.password.clone(),
    };

    let mut streamer = EventsStreamer::new(source, MAX_RETRY_NUM, server_id, meta_dir)?;
    streamer.init_connections(binlog_override).await?;
    streamer.add_listener(
        false,
        &origin.database_pattern,
        &origin.table_pattern,
        dml_to_appliers(
            Arc::clone(&helper),
            Arc::clone(&applier_set.appliers),
            control.clone(),
        ),
    )?;

    info!("beginning streaming");
    let control = control.clone();
    let result = streamer.stream_events(move || control.stop_requested()).await;
    streamer.close();

    applier_set.appliers.close_all().await;
    let executed = applier_set.appliers.wait_all().await?;
    info!(executed, "done streaming");
    result
}

/// The incremental listener: each row event becomes one routed statement.
/// A push failure means a shard writer died with its buffer unflushed; the
/// run must stop rather than keep consuming the binlog past lost rows.
fn dml_to_appliers<H: TableHelper + 'static>(
    helper: Arc<H>,
    appliers: Arc<ShardAppliers>,
    control: RunControl,
) -> DmlHandler {
    Arc::new(move |entry: Arc<BinlogEntry>| {
        let helper = Arc::clone(&helper);
        let appliers = Arc::clone(&appliers);
        let control = control.clone();
        Box::pin(async move {
            let event = &entry.dml_event;
            let builder = helper.builder();

            let sharding_sql = match event.dml {
                EventDml::Insert => match &event.new_column_values {
                    Some(new) => Some(builder.insert(new)?),
                    None => None,
                },
                EventDml::Update => {
                    match (&event.new_column_values, &event.where_column_values) {
                        (Some(new), Some(where_values)) => {
                            Some(builder.update(new, where_values)?)
                        }
                        _ => None,
                    }
                }
                EventDml::Delete => match &event.where_column_values {
                    Some(where_values) => Some(builder.delete(where_values)?),
                    None => None,
                },
            };

            if let Some(sharding_sql) = sharding_sql {
                debug!(shard = sharding_sql.shard_index, sql = %sharding_sql, "binlog entry routed");
                if helper.shard_filter(sharding_sql.shard_index) {
                    if let Err(e) = appliers.push(sharding_sql).await {
                        error!(error = %e, "shard writer unavailable, stopping the run");
                        control.request_stop();
                        return Err(e);
                    }
                }
            }
            Ok(())
        })
    })
}
