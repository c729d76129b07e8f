use crate::binlog::entry::BinlogEntry;
use crate::error::AppResult;
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// Callback invoked for each matching binlog entry.
pub type DmlHandler =
    Arc<dyn Fn(Arc<BinlogEntry>) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

/// A per-table subscription. Selectors are matched case-insensitively; a
/// trailing `*` on either field means prefix match. No other wildcard syntax
/// exists, which keeps the per-entry match branch-cheap.
pub struct BinlogEventListener {
    pub r#async: bool,
    database_name_lower: String,
    table_name_lower: String,
    db_pattern: bool,
    table_pattern: bool,
    pub on_dml_event: DmlHandler,
}

impl BinlogEventListener {
    pub fn new(
        r#async: bool,
        database_name: &str,
        table_name: &str,
        on_dml_event: DmlHandler,
    ) -> Self {
        let (database_name_lower, db_pattern) = normalize(database_name);
        let (table_name_lower, table_pattern) = normalize(table_name);
        Self {
            r#async,
            database_name_lower,
            table_name_lower,
            db_pattern,
            table_pattern,
            on_dml_event,
        }
    }

    pub fn matches(&self, db: &str, table: &str) -> bool {
        let db = db.to_lowercase();
        let ok = if self.db_pattern {
            db.starts_with(&self.database_name_lower)
        } else {
            db == self.database_name_lower
        };
        if !ok {
            return false;
        }

        let table = table.to_lowercase();
        if self.table_pattern {
            table.starts_with(&self.table_name_lower)
        } else {
            table == self.table_name_lower
        }
    }
}

fn normalize(name: &str) -> (String, bool) {
    let lower = name.to_lowercase();
    match lower.strip_suffix('*') {
        Some(prefix) => (prefix.to_string(), true),
        None => (lower, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(db: &str, table: &str) -> BinlogEventListener {
        BinlogEventListener::new(false, db, table, Arc::new(|_| Box::pin(async { Ok(()) })))
    }

    #[test]
    fn prefix_pattern_on_database() {
        let l = listener("shard_*", "user_like");
        assert!(l.matches("shard_07", "user_like"));
        assert!(!l.matches("shard", "user_like"));
        assert!(!l.matches("shard_07", "user_likes"));
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let l = listener("Media", "User_Like");
        assert!(l.matches("media", "user_like"));
        assert!(l.matches("MEDIA", "USER_LIKE"));
        assert!(!l.matches("media2", "user_like"));
    }

    #[test]
    fn table_pattern() {
        let l = listener("media", "user_*");
        assert!(l.matches("media", "user_like"));
        assert!(l.matches("media", "user_follow"));
        assert!(!l.matches("media", "recording"));
    }

    #[test]
    fn bare_star_matches_everything() {
        let l = listener("*", "user_like");
        assert!(l.matches("anything", "user_like"));
    }
}
