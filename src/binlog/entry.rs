use crate::binlog::coordinates::BinlogCoordinates;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, TimeZone, Utc};
use mysql_common::Value;
use mysql_common::binlog::value::BinlogValue;
use std::fmt;

/// One decoded column value from a binlog row image.
///
/// Driver-level nullable wrappers are unwrapped on ingress; what flows through
/// the pipeline is always a plain scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl ColumnValue {
    pub fn from_binlog_value(value: BinlogValue<'_>) -> AppResult<Self> {
        match value {
            BinlogValue::Value(v) => Ok(Self::from_value(v)),
            other => Err(AppError::Internal(format!(
                "unsupported binlog column value: {other:?}"
            ))),
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::NULL => ColumnValue::Null,
            Value::Int(v) => ColumnValue::Int(v),
            Value::UInt(v) => ColumnValue::UInt(v),
            Value::Float(v) => ColumnValue::Float(v as f64),
            Value::Double(v) => ColumnValue::Float(v),
            Value::Bytes(b) => ColumnValue::Bytes(b),
            Value::Date(y, m, d, h, min, s, us) => {
                match Utc.with_ymd_and_hms(y as i32, m as u32, d as u32, h as u32, min as u32, s as u32)
                {
                    chrono::LocalResult::Single(dt) => {
                        ColumnValue::Timestamp(dt + chrono::Duration::microseconds(us as i64))
                    }
                    // zero dates and other unrepresentable values
                    _ => ColumnValue::Null,
                }
            }
            Value::Time(neg, d, h, m, s, us) => {
                let sign = if neg { "-" } else { "" };
                let hours = u32::from(h) + d * 24;
                ColumnValue::Text(format!("{sign}{hours:02}:{m:02}:{s:02}.{us:06}"))
            }
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Int(v) => write!(f, "{v}"),
            ColumnValue::UInt(v) => write!(f, "{v}"),
            ColumnValue::Float(v) => write!(f, "{v}"),
            ColumnValue::Bool(v) => write!(f, "{v}"),
            ColumnValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            ColumnValue::Text(s) => write!(f, "{s}"),
            ColumnValue::Timestamp(t) => write!(f, "{t}"),
        }
    }
}

/// Ordered row image; positions match the source table's column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnValues(pub Vec<ColumnValue>);

impl ColumnValues {
    pub fn get(&self, index: usize) -> Option<&ColumnValue> {
        self.0.get(index)
    }
}

impl From<Vec<ColumnValue>> for ColumnValues {
    fn from(values: Vec<ColumnValue>) -> Self {
        Self(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDml {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EventDml {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventDml::Insert => write!(f, "insert"),
            EventDml::Update => write!(f, "update"),
            EventDml::Delete => write!(f, "delete"),
        }
    }
}

/// A single logical row change.
///
/// Insert carries only `new_column_values`; Delete only `where_column_values`;
/// Update carries both (the before image selects the row, the after image is
/// the new content).
#[derive(Debug, Clone)]
pub struct BinlogDmlEvent {
    pub database_name: String,
    pub table_name: String,
    pub dml: EventDml,
    pub where_column_values: Option<ColumnValues>,
    pub new_column_values: Option<ColumnValues>,
}

/// An entry in the binary log, positioned for checkpointing.
#[derive(Debug, Clone)]
pub struct BinlogEntry {
    pub coordinates: BinlogCoordinates,
    pub end_log_pos: u64,
    pub timestamp: i64,
    pub dml_event: BinlogDmlEvent,
}

/// Build one entry per decoded (before, after) row pair.
///
/// The raw update event interleaves before/after images; the pair iterator
/// upstream already groups them, so 2k raw rows arrive here as k pairs.
pub fn entries_from_row_pairs(
    coordinates: &BinlogCoordinates,
    end_log_pos: u64,
    timestamp: i64,
    database_name: &str,
    table_name: &str,
    dml: EventDml,
    pairs: Vec<(Option<ColumnValues>, Option<ColumnValues>)>,
) -> AppResult<Vec<BinlogEntry>> {
    let mut entries = Vec::with_capacity(pairs.len());

    for (before, after) in pairs {
        let (where_column_values, new_column_values) = match dml {
            EventDml::Insert => {
                let after = after.ok_or_else(|| {
                    AppError::Internal(format!("missing row image in {dml} event"))
                })?;
                (None, Some(after))
            }
            EventDml::Delete => {
                let before = before.ok_or_else(|| {
                    AppError::Internal(format!("missing row image in {dml} event"))
                })?;
                (Some(before), None)
            }
            EventDml::Update => {
                let before = before.ok_or_else(|| {
                    AppError::Internal(format!("missing before image in {dml} event"))
                })?;
                let after = after.ok_or_else(|| {
                    AppError::Internal(format!("missing after image in {dml} event"))
                })?;
                (Some(before), Some(after))
            }
        };

        entries.push(BinlogEntry {
            coordinates: coordinates.clone(),
            end_log_pos,
            timestamp,
            dml_event: BinlogDmlEvent {
                database_name: database_name.to_string(),
                table_name: table_name.to_string(),
                dml,
                where_column_values,
                new_column_values,
            },
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[i64]) -> ColumnValues {
        ColumnValues(values.iter().map(|v| ColumnValue::Int(*v)).collect())
    }

    #[test]
    fn update_pair_becomes_one_entry() {
        let coords = BinlogCoordinates::new("mysql-bin.000007", 1024);
        let entries = entries_from_row_pairs(
            &coords,
            2048,
            1_700_000_000,
            "media",
            "user_recording_like",
            EventDml::Update,
            vec![(Some(row(&[1, 10, 100])), Some(row(&[1, 10, 200])))],
        )
        .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].coordinates, coords);
        assert_eq!(entries[0].end_log_pos, 2048);
        assert_eq!(entries[0].timestamp, 1_700_000_000);
        let ev = &entries[0].dml_event;
        assert_eq!(ev.dml, EventDml::Update);
        assert_eq!(ev.where_column_values, Some(row(&[1, 10, 100])));
        assert_eq!(ev.new_column_values, Some(row(&[1, 10, 200])));
    }

    #[test]
    fn insert_carries_only_new_values() {
        let coords = BinlogCoordinates::new("mysql-bin.000007", 1024);
        let entries = entries_from_row_pairs(
            &coords,
            2048,
            0,
            "media",
            "user_recording_like",
            EventDml::Insert,
            vec![(None, Some(row(&[1, 2, 3]))), (None, Some(row(&[4, 5, 6])))],
        )
        .unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries[0].dml_event.where_column_values.is_none());
        assert_eq!(entries[1].dml_event.new_column_values, Some(row(&[4, 5, 6])));
    }

    #[test]
    fn delete_missing_before_image_errors() {
        let coords = BinlogCoordinates::default();
        let res = entries_from_row_pairs(
            &coords,
            0,
            0,
            "media",
            "t",
            EventDml::Delete,
            vec![(None, None)],
        );
        assert!(res.is_err());
    }

    #[test]
    fn plain_values_unwrap() {
        assert_eq!(
            ColumnValue::from_value(Value::Int(-7)),
            ColumnValue::Int(-7)
        );
        assert_eq!(ColumnValue::from_value(Value::NULL), ColumnValue::Null);
        assert_eq!(
            ColumnValue::from_value(Value::Bytes(b"abc".to_vec())),
            ColumnValue::Bytes(b"abc".to_vec())
        );
    }
}
