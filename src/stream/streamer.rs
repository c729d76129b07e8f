use crate::binlog::coordinates::BinlogCoordinates;
use crate::binlog::entry::BinlogEntry;
use crate::binlog::reader::{BinlogReader, SourceConnection};
use crate::config::DatabaseConfig;
use crate::error::{AppError, AppResult};
use crate::stream::listener::{BinlogEventListener, DmlHandler};
use crate::stream::master_info::MasterInfo;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const EVENTS_CHANNEL_BUFFER_SIZE: usize = 1;
const RECONNECT_STREAMER_SLEEP: Duration = Duration::from_secs(5);

/// Turns the source's binlog into [`BinlogEntry`] values and hands them to
/// registered listeners.
///
/// The streamer owns its reader; listeners and the applied-rows hint are
/// shared snapshots, so there is no cyclic ownership anywhere in the run.
pub struct EventsStreamer {
    source: SourceConnection,
    max_retry: u64,
    server_id: u32,
    master_info: Arc<MasterInfo>,
    listeners: Arc<Mutex<Vec<BinlogEventListener>>>,
    initial_coordinates: BinlogCoordinates,
    reader: Option<BinlogReader>,
}

impl EventsStreamer {
    pub fn new(
        source: SourceConnection,
        max_retry: u64,
        server_id: u32,
        meta_dir: &str,
    ) -> AppResult<Self> {
        let master_info = Arc::new(MasterInfo::load(meta_dir, &source.instance_key())?);
        Ok(Self {
            source,
            max_retry,
            server_id,
            master_info,
            listeners: Arc::new(Mutex::new(Vec::new())),
            initial_coordinates: BinlogCoordinates::default(),
            reader: None,
        })
    }

    /// Register a listener. Empty selector fields are refused; use `"*"` to
    /// match everything.
    pub fn add_listener(
        &self,
        r#async: bool,
        database_name: &str,
        table_name: &str,
        on_dml_event: DmlHandler,
    ) -> AppResult<()> {
        if database_name.is_empty() {
            return Err(AppError::Internal("empty database name in listener".into()));
        }
        if table_name.is_empty() {
            return Err(AppError::Internal("empty table name in listener".into()));
        }
        self.listeners
            .lock()
            .expect("listeners mutex poisoned")
            .push(BinlogEventListener::new(
                r#async,
                database_name,
                table_name,
                on_dml_event,
            ));
        Ok(())
    }

    /// Resolve the start coordinate and connect the reader.
    ///
    /// First-wins: explicit `override_coordinates` → persisted MasterInfo →
    /// `SHOW MASTER STATUS` on the source.
    pub async fn init_connections(
        &mut self,
        override_coordinates: Option<BinlogCoordinates>,
    ) -> AppResult<()> {
        let persisted = self.master_info.position();

        self.initial_coordinates = match override_coordinates {
            Some(coords) if !coords.is_empty() => coords,
            _ if !persisted.is_empty() => persisted,
            _ => read_master_coordinates(&self.source).await?,
        };
        info!(coordinates = %self.initial_coordinates, "initial binlog coordinates");

        self.reader = Some(
            BinlogReader::connect(
                &self.source,
                self.server_id,
                self.initial_coordinates.clone(),
            )
            .await?,
        );
        Ok(())
    }

    /// Blocking stream loop: dispatch entries until `can_stop` reports true.
    ///
    /// Reader failures are retried forever as long as the applied-rows hint
    /// keeps advancing; `max_retry` consecutive failures at the same hint is
    /// a dead end and aborts with `ReconnectOverflow`.
    pub async fn stream_events(&mut self, can_stop: impl Fn() -> bool) -> AppResult<()> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| AppError::Internal("stream_events before init_connections".into()))?;

        let (tx, mut rx) = mpsc::channel::<BinlogEntry>(EVENTS_CHANNEL_BUFFER_SIZE);

        let listeners = Arc::clone(&self.listeners);
        let dispatcher = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                notify_listeners(&listeners, Arc::new(entry)).await;
            }
        });

        let mut successive_failures: u64 = 0;
        let mut last_hint = BinlogCoordinates::default();
        let can_stop = &can_stop;

        let result = loop {
            let hint_handle = reader.hint_handle();
            let master_info = Arc::clone(&self.master_info);

            let stream_result = reader
                .stream_events(&tx, move || {
                    // Checkpoint between reader iterations; rate-limited
                    // inside MasterInfo.
                    let hint = hint_handle.lock().expect("hint mutex poisoned").clone();
                    master_info.save(&hint);
                    can_stop()
                })
                .await;

            match stream_result {
                Ok(()) => break Ok(()),
                Err(e) => {
                    warn!(error = %e, "streamer encountered unexpected error");
                    tokio::time::sleep(RECONNECT_STREAMER_SLEEP).await;

                    let hint = reader.last_applied_rows_event_hint();
                    if hint == last_hint {
                        successive_failures += 1;
                    } else {
                        successive_failures = 0;
                    }
                    if successive_failures > self.max_retry {
                        break Err(AppError::ReconnectOverflow {
                            failures: successive_failures,
                            coordinates: reader.current_coordinates().to_string(),
                        });
                    }
                    last_hint = hint.clone();

                    // Reposition at the start of the current file; the hint
                    // makes the replayed prefix a no-op.
                    let resume_at = reader.current_coordinates().file_start();
                    info!(resume_at = %resume_at, hint = %hint, "reconnecting binlog streamer");

                    match BinlogReader::connect(&self.source, self.server_id, resume_at).await {
                        Ok(new_reader) => {
                            new_reader.set_last_applied_rows_event_hint(hint);
                            reader = new_reader;
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        drop(tx);
        if let Err(e) = dispatcher.await {
            error!(error = %e, "listener dispatcher task failed");
        }

        self.reader = Some(reader);
        result
    }

    /// Flush the checkpoint. Safe to call repeatedly.
    pub fn close(&self) {
        self.master_info.close();
    }
}

async fn notify_listeners(
    listeners: &Arc<Mutex<Vec<BinlogEventListener>>>,
    entry: Arc<BinlogEntry>,
) {
    // Snapshot matching handlers so the registry lock is not held across
    // listener awaits.
    let matched: Vec<(bool, DmlHandler)> = {
        let listeners = listeners.lock().expect("listeners mutex poisoned");
        listeners
            .iter()
            .filter(|l| {
                l.matches(&entry.dml_event.database_name, &entry.dml_event.table_name)
            })
            .map(|l| (l.r#async, Arc::clone(&l.on_dml_event)))
            .collect()
    };

    for (is_async, handler) in matched {
        if is_async {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move {
                if let Err(e) = handler(entry).await {
                    error!(error = %e, "async binlog listener failed");
                }
            });
        } else if let Err(e) = handler(Arc::clone(&entry)).await {
            error!(error = %e, "binlog listener failed");
        }
    }
}

/// `SHOW MASTER STATUS` fallback for a fresh run with no checkpoint.
async fn read_master_coordinates(source: &SourceConnection) -> AppResult<BinlogCoordinates> {
    let pool = source_pool(source, 1)?;
    let row = sqlx::query("SHOW MASTER STATUS")
        .fetch_optional(&pool)
        .await?
        .ok_or(AppError::EmptyCoordinate)?;

    let file: String = row.try_get("File")?;
    let pos: u64 = row.try_get("Position")?;
    pool.close().await;

    if file.is_empty() {
        return Err(AppError::EmptyCoordinate);
    }
    Ok(BinlogCoordinates::new(file, pos))
}

/// Log the current binlog position of each alias. SIGHUP path in incremental
/// mode; handy when deciding where to restart a run.
pub async fn print_binlog_pos(aliases: &[&str], config: &DatabaseConfig) -> AppResult<()> {
    for alias in aliases {
        let location = config.get_db(alias)?.clone();
        let source = SourceConnection {
            location,
            user: config.user.clone(),
            password: config.password.clone(),
        };
        match read_master_coordinates(&source).await {
            Ok(coords) => {
                info!(alias = %alias, host = %source.location.hostname, coordinates = %coords, "binlog position")
            }
            Err(e) => warn!(alias = %alias, error = %e, "failed to read binlog position"),
        }
    }
    Ok(())
}

fn source_pool(source: &SourceConnection, max_connections: u32) -> AppResult<MySqlPool> {
    let url = source
        .location
        .url(&source.user, &source.password);
    Ok(MySqlPoolOptions::new()
        .max_connections(max_connections)
        .connect_lazy(&url)?)
}
