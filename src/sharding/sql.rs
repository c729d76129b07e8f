use crate::binlog::entry::{ColumnValue, ColumnValues};
use crate::error::AppResult;
use std::fmt;

/// A parameterised statement routed to one target shard.
#[derive(Debug, Clone)]
pub struct ShardingSql {
    pub shard_index: usize,
    pub sql: String,
    pub args: Vec<ColumnValue>,
}

impl fmt::Display for ShardingSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} --> {:?}", self.sql, self.args)
    }
}

/// Turns row images and models into shard-routed statements.
///
/// One implementation per migrated table: it knows the statement shapes, the
/// binlog column positions, and which column selects the shard.
pub trait SqlBuilder: Send + Sync {
    type Model;

    /// Row appeared on the source.
    fn insert(&self, args: &ColumnValues) -> AppResult<ShardingSql>;

    /// Row changed; `where_args` is the before image, `new_args` the after.
    fn update(&self, new_args: &ColumnValues, where_args: &ColumnValues) -> AppResult<ShardingSql>;

    /// Row removed from the source.
    fn delete(&self, where_args: &ColumnValues) -> AppResult<ShardingSql>;

    /// Idempotent bulk-load statement for a batch-read model.
    fn insert_ignore(&self, model: &Self::Model) -> AppResult<ShardingSql>;

    fn shard_index_of_model(&self, model: &Self::Model) -> AppResult<usize>;

    /// The parameter group appended per extra row when insert-ignore
    /// statements are concatenated into one multi-row insert, e.g. `(?, ?, ?)`.
    fn batch_insert_tuple(&self) -> &'static str;
}

/// Wrap a db/table/column name in backticks. Not an injection barrier, just
/// correctness for reserved words and dotted names coming from config.
pub fn escape_name(name: &str) -> String {
    format!("`{}`", name.trim_matches('`'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_wraps_and_never_doubles() {
        assert_eq!(escape_name("user_like"), "`user_like`");
        assert_eq!(escape_name("`user_like`"), "`user_like`");
    }

    #[test]
    fn display_includes_sql_and_args() {
        let sql = ShardingSql {
            shard_index: 3,
            sql: "delete from t where id=?".to_string(),
            args: vec![ColumnValue::Int(9)],
        };
        let s = sql.to_string();
        assert!(s.contains("delete from t"));
        assert!(s.contains("Int(9)"));
    }
}
