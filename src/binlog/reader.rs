use crate::binlog::coordinates::BinlogCoordinates;
use crate::binlog::entry::{
    BinlogEntry, ColumnValue, ColumnValues, EventDml, entries_from_row_pairs,
};
use crate::config::DbLocation;
use crate::error::{AppError, AppResult};
use futures_util::StreamExt;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, OptsBuilder};
use mysql_common::binlog::consts::EventType;
use mysql_common::binlog::events::{EventData, RowsEventData};
use mysql_common::binlog::row::BinlogRow;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// The rows-event variants carry distinct payload types; this dispatches a
/// method call across all six DML-bearing variants.
macro_rules! rows_event_apply {
    ($event_data:expr, $event:ident . $($op:tt)*) => {{
        match $event_data {
            RowsEventData::WriteRowsEvent($event) => $event.$($op)*,
            RowsEventData::WriteRowsEventV1($event) => $event.$($op)*,
            RowsEventData::UpdateRowsEvent($event) => $event.$($op)*,
            RowsEventData::UpdateRowsEventV1($event) => $event.$($op)*,
            RowsEventData::DeleteRowsEvent($event) => $event.$($op)*,
            RowsEventData::DeleteRowsEventV1($event) => $event.$($op)*,
            _ => unreachable!("checked by the DML match above"),
        }
    }};
}

/// Credentials plus instance key for the source server.
#[derive(Debug, Clone)]
pub struct SourceConnection {
    pub location: DbLocation,
    pub user: String,
    pub password: String,
}

impl SourceConnection {
    fn opts(&self) -> OptsBuilder {
        OptsBuilder::default()
            .ip_or_hostname(self.location.hostname.clone())
            .tcp_port(self.location.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
    }

    /// `host_port`, used for checkpoint file names.
    pub fn instance_key(&self) -> String {
        format!("{}_{}", self.location.hostname, self.location.port)
    }
}

/// Streams row events from a source server, registered as a replica.
///
/// `current_coordinates` tracks the position of the event being processed and
/// is updated under a mutex so other tasks can snapshot it at any time. The
/// hint marks the last rows event fully enqueued downstream; events at or
/// before it are skipped, which makes replay after reconnect idempotent.
pub struct BinlogReader {
    stream: BinlogStream,
    current_coordinates: Arc<Mutex<BinlogCoordinates>>,
    last_applied_rows_event_hint: Arc<Mutex<BinlogCoordinates>>,
}

impl BinlogReader {
    /// Connect to the source as a replica and start streaming at
    /// `coordinates`. Empty coordinates are refused.
    pub async fn connect(
        source: &SourceConnection,
        server_id: u32,
        coordinates: BinlogCoordinates,
    ) -> AppResult<Self> {
        if coordinates.is_empty() {
            return Err(AppError::EmptyCoordinate);
        }

        info!(coordinates = %coordinates, server_id, "connecting binlog streamer");

        let conn = Conn::new(source.opts()).await?;
        let stream = conn
            .get_binlog_stream(
                BinlogStreamRequest::new(server_id)
                    .with_filename(coordinates.log_file.as_bytes())
                    .with_pos(coordinates.log_pos),
            )
            .await?;

        Ok(Self {
            stream,
            current_coordinates: Arc::new(Mutex::new(coordinates)),
            last_applied_rows_event_hint: Arc::new(Mutex::new(BinlogCoordinates::default())),
        })
    }

    pub fn current_coordinates(&self) -> BinlogCoordinates {
        self.current_coordinates
            .lock()
            .expect("coordinates mutex poisoned")
            .clone()
    }

    /// Shared handle, so the streamer can read the hint while the reader is
    /// borrowed by the streaming loop.
    pub fn hint_handle(&self) -> Arc<Mutex<BinlogCoordinates>> {
        Arc::clone(&self.last_applied_rows_event_hint)
    }

    pub fn last_applied_rows_event_hint(&self) -> BinlogCoordinates {
        self.last_applied_rows_event_hint
            .lock()
            .expect("hint mutex poisoned")
            .clone()
    }

    /// Restore the hint after a reconnect so replayed events are skipped.
    pub fn set_last_applied_rows_event_hint(&self, hint: BinlogCoordinates) {
        *self
            .last_applied_rows_event_hint
            .lock()
            .expect("hint mutex poisoned") = hint;
    }

    /// Pump events into `entries` until `can_stop` returns true or the
    /// stream fails. `can_stop` is polled between events; a pending fetch is
    /// never cancelled mid-flight.
    pub async fn stream_events(
        &mut self,
        entries: &mpsc::Sender<BinlogEntry>,
        mut can_stop: impl FnMut() -> bool,
    ) -> AppResult<()> {
        while !can_stop() {
            let event = match self.stream.next().await {
                Some(ev) => ev?,
                None => return Err(AppError::BinlogStreamEnded),
            };

            let event_type = match event.header().event_type() {
                Ok(t) => t,
                // Unknown event classes are forward-compat noise; skip them.
                Err(_) => continue,
            };

            match event_type {
                EventType::ROTATE_EVENT => {
                    let Some(EventData::RotateEvent(rotate)) = event.read_data()? else {
                        continue;
                    };
                    // File and pos move together, inside one critical
                    // section, so no reader can observe (newFile, oldPos).
                    let mut current = self
                        .current_coordinates
                        .lock()
                        .expect("coordinates mutex poisoned");
                    current.log_file = rotate.name().to_string();
                    current.log_pos = rotate.position();
                    info!(next = %current, "binlog rotate");
                }

                EventType::WRITE_ROWS_EVENT
                | EventType::UPDATE_ROWS_EVENT
                | EventType::DELETE_ROWS_EVENT
                | EventType::WRITE_ROWS_EVENT_V1
                | EventType::UPDATE_ROWS_EVENT_V1
                | EventType::DELETE_ROWS_EVENT_V1 => {
                    self.advance_pos(u64::from(event.header().log_pos()));

                    let Some(EventData::RowsEvent(rows)) = event.read_data()? else {
                        continue;
                    };
                    let timestamp = i64::from(event.header().timestamp());
                    self.handle_rows_event(rows, timestamp, entries).await?;
                }

                EventType::QUERY_EVENT => {
                    // DDL. Schemas are assumed stable for the lifetime of a
                    // run; statement events are not applied.
                    self.advance_pos(u64::from(event.header().log_pos()));
                }

                _ => {
                    self.advance_pos(u64::from(event.header().log_pos()));
                }
            }
        }

        debug!("done streaming events");
        Ok(())
    }

    fn advance_pos(&self, log_pos: u64) {
        // Format/heartbeat events report pos 0; keep the last real position.
        if log_pos > 0 {
            self.current_coordinates
                .lock()
                .expect("coordinates mutex poisoned")
                .log_pos = log_pos;
        }
    }

    async fn handle_rows_event(
        &self,
        rows_event: RowsEventData<'_>,
        timestamp: i64,
        entries: &mpsc::Sender<BinlogEntry>,
    ) -> AppResult<()> {
        let current = self.current_coordinates();
        {
            let hint = self
                .last_applied_rows_event_hint
                .lock()
                .expect("hint mutex poisoned");
            if current <= *hint {
                debug!(coordinates = %current, "skipping already-applied rows event");
                return Ok(());
            }
        }

        let dml = match &rows_event {
            RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                EventDml::Insert
            }
            RowsEventData::UpdateRowsEvent(_) | RowsEventData::UpdateRowsEventV1(_) => {
                EventDml::Update
            }
            RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
                EventDml::Delete
            }
            other => return Err(AppError::UnknownDml(format!("{other:?}"))),
        };

        let table_id = rows_event_apply!(&rows_event, ev.table_id());
        let tme = self.stream.get_tme(table_id).ok_or_else(|| {
            AppError::Internal(format!("missing table map event for table id {table_id}"))
        })?;

        let database_name = tme.database_name().to_string();
        let table_name = tme.table_name().to_string();

        let mut pairs = Vec::new();
        for row in rows_event_apply!(&rows_event, ev.rows(tme)) {
            let (before, after) = row.map_err(|e| AppError::Internal(e.to_string()))?;
            pairs.push((
                before.map(decode_row).transpose()?,
                after.map(decode_row).transpose()?,
            ));
        }

        let new_entries = entries_from_row_pairs(
            &current,
            current.log_pos,
            timestamp,
            &database_name,
            &table_name,
            dml,
            pairs,
        )?;

        for entry in new_entries {
            // The channel throttles: the consumer decides whether dispatch is
            // synchronous before the next event is read.
            entries
                .send(entry)
                .await
                .map_err(|_| AppError::Internal("binlog entries channel closed".into()))?;
        }

        // The whole rows event is downstream now; this is what the
        // checkpointer is allowed to persist.
        *self
            .last_applied_rows_event_hint
            .lock()
            .expect("hint mutex poisoned") = current;

        Ok(())
    }
}

fn decode_row(row: BinlogRow) -> AppResult<ColumnValues> {
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        match row.as_ref(idx) {
            Some(value) => values.push(ColumnValue::from_binlog_value(value.clone())),
            None => values.push(Ok(ColumnValue::Null)),
        }
    }
    values
        .into_iter()
        .collect::<AppResult<Vec<_>>>()
        .map(ColumnValues)
}
