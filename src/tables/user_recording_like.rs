use crate::batch::TableHelper;
use crate::binlog::entry::{ColumnValue, ColumnValues};
use crate::error::{AppError, AppResult};
use crate::sharding::hash::SmHashSharder;
use crate::sharding::sql::{ShardingSql, SqlBuilder, escape_name};
use async_trait::async_trait;
use sqlx::MySqlPool;

const SQL_DELETE: &str = "delete from user_recording_like where user_id=? and recording_id=?";
const SQL_UPDATE: &str = "update user_recording_like SET user_id=?, recording_id=?, created_on=? \
     where user_id=? and recording_id=?";
const SQL_INSERT: &str =
    "replace into user_recording_like (user_id, recording_id, created_on) values (?, ?, ?)";
const SQL_INSERT_IGNORE: &str =
    "insert ignore into user_recording_like (user_id, recording_id, created_on) values (?, ?, ?)";

// binlog column positions in the source table's row image
const IDX_CREATED_ON: usize = 1;
const IDX_USER: usize = 2;
const IDX_RECORDING_ID: usize = 3;

/// Shard whose rows are dropped instead of migrated (robot traffic).
const FILTERED_SHARD: usize = 5;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecordingLike {
    pub id: i64,
    pub user_id: i64,
    pub recording_id: i64,
    pub created_on: i32,
}

pub struct UserRecordingLikeBuilder {
    sharder: SmHashSharder,
}

impl UserRecordingLikeBuilder {
    pub fn new(shard_num: usize) -> Self {
        Self {
            sharder: SmHashSharder::new(shard_num, 1),
        }
    }

    fn shard_index_of_args(&self, args: &ColumnValues) -> AppResult<usize> {
        let key = args
            .get(IDX_USER)
            .ok_or_else(|| AppError::InvalidKey("row image misses user_id column".into()))?;
        self.sharder.shard_index_of(key)
    }

    fn pick(args: &ColumnValues, index: usize) -> AppResult<ColumnValue> {
        args.get(index)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("row image misses column {index}")))
    }
}

impl SqlBuilder for UserRecordingLikeBuilder {
    type Model = UserRecordingLike;

    fn insert(&self, args: &ColumnValues) -> AppResult<ShardingSql> {
        Ok(ShardingSql {
            shard_index: self.shard_index_of_args(args)?,
            sql: SQL_INSERT.to_string(),
            args: vec![
                Self::pick(args, IDX_USER)?,
                Self::pick(args, IDX_RECORDING_ID)?,
                Self::pick(args, IDX_CREATED_ON)?,
            ],
        })
    }

    fn update(&self, new_args: &ColumnValues, where_args: &ColumnValues) -> AppResult<ShardingSql> {
        Ok(ShardingSql {
            shard_index: self.shard_index_of_args(new_args)?,
            sql: SQL_UPDATE.to_string(),
            args: vec![
                Self::pick(new_args, IDX_USER)?,
                Self::pick(new_args, IDX_RECORDING_ID)?,
                Self::pick(new_args, IDX_CREATED_ON)?,
                Self::pick(where_args, IDX_USER)?,
                Self::pick(where_args, IDX_RECORDING_ID)?,
            ],
        })
    }

    fn delete(&self, where_args: &ColumnValues) -> AppResult<ShardingSql> {
        Ok(ShardingSql {
            shard_index: self.shard_index_of_args(where_args)?,
            sql: SQL_DELETE.to_string(),
            args: vec![
                Self::pick(where_args, IDX_USER)?,
                Self::pick(where_args, IDX_RECORDING_ID)?,
            ],
        })
    }

    fn insert_ignore(&self, model: &UserRecordingLike) -> AppResult<ShardingSql> {
        Ok(ShardingSql {
            shard_index: self.shard_index_of_model(model)?,
            sql: SQL_INSERT_IGNORE.to_string(),
            args: vec![
                ColumnValue::Int(model.user_id),
                ColumnValue::Int(model.recording_id),
                ColumnValue::Int(i64::from(model.created_on)),
            ],
        })
    }

    fn shard_index_of_model(&self, model: &UserRecordingLike) -> AppResult<usize> {
        self.sharder.shard_index_of(&ColumnValue::Int(model.user_id))
    }

    fn batch_insert_tuple(&self) -> &'static str {
        "(?, ?, ?)"
    }
}

pub struct UserRecordingLikeHelper {
    builder: UserRecordingLikeBuilder,
    need_reorder: bool,
}

impl UserRecordingLikeHelper {
    pub fn new(shard_num: usize, need_reorder: bool) -> Self {
        Self {
            builder: UserRecordingLikeBuilder::new(shard_num),
            need_reorder,
        }
    }
}

#[async_trait]
impl TableHelper for UserRecordingLikeHelper {
    type Model = UserRecordingLike;
    type Builder = UserRecordingLikeBuilder;

    fn builder(&self) -> &UserRecordingLikeBuilder {
        &self.builder
    }

    fn need_reorder(&self) -> bool {
        self.need_reorder
    }

    fn shard_filter(&self, shard_index: usize) -> bool {
        shard_index != FILTERED_SHARD
    }

    async fn read_page(
        &self,
        pool: &MySqlPool,
        table: &str,
        last_id: i64,
        page_size: u32,
    ) -> AppResult<Vec<UserRecordingLike>> {
        let sql = format!(
            "SELECT id, user_id, recording_id, created_on FROM {} \
             WHERE id > ? ORDER BY id ASC LIMIT ?",
            escape_name(table),
        );
        Ok(sqlx::query_as::<_, UserRecordingLike>(&sql)
            .bind(last_id)
            .bind(page_size)
            .fetch_all(pool)
            .await?)
    }

    fn row_id(&self, model: &UserRecordingLike) -> i64 {
        model.id
    }

    /// The target's primary key is (user_id, recording_id); inserting in that
    /// order is the fastest bulk-load path.
    fn sort_shard(&self, rows: &mut [UserRecordingLike]) {
        rows.sort_by(|a, b| {
            (a.user_id, a.recording_id).cmp(&(b.user_id, b.recording_id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_image(user_id: i64, recording_id: i64, created_on: i64) -> ColumnValues {
        // (id, created_on, user_id, recording_id) per the source column order
        ColumnValues(vec![
            ColumnValue::Int(1),
            ColumnValue::Int(created_on),
            ColumnValue::Int(user_id),
            ColumnValue::Int(recording_id),
        ])
    }

    #[test]
    fn insert_extracts_and_orders_args() {
        let builder = UserRecordingLikeBuilder::new(32);
        let sql = builder.insert(&row_image(42, 7, 1_600_000_000)).unwrap();

        assert_eq!(sql.sql, SQL_INSERT);
        assert_eq!(
            sql.args,
            vec![
                ColumnValue::Int(42),
                ColumnValue::Int(7),
                ColumnValue::Int(1_600_000_000),
            ]
        );
    }

    #[test]
    fn update_appends_where_args() {
        let builder = UserRecordingLikeBuilder::new(32);
        let sql = builder
            .update(&row_image(42, 7, 200), &row_image(42, 7, 100))
            .unwrap();

        assert_eq!(sql.sql, SQL_UPDATE);
        assert_eq!(sql.args.len(), 5);
        assert_eq!(sql.args[2], ColumnValue::Int(200));
        assert_eq!(sql.args[3], ColumnValue::Int(42));
    }

    #[test]
    fn delete_uses_key_columns_only() {
        let builder = UserRecordingLikeBuilder::new(32);
        let sql = builder.delete(&row_image(42, 7, 100)).unwrap();

        assert_eq!(sql.sql, SQL_DELETE);
        assert_eq!(sql.args, vec![ColumnValue::Int(42), ColumnValue::Int(7)]);
    }

    #[test]
    fn model_and_row_image_route_identically() {
        let builder = UserRecordingLikeBuilder::new(32);
        let model = UserRecordingLike {
            id: 1,
            user_id: 6_755_399_444_017_774,
            recording_id: 7,
            created_on: 100,
        };

        let from_model = builder.shard_index_of_model(&model).unwrap();
        let from_image = builder
            .insert(&row_image(model.user_id, 7, 100))
            .unwrap()
            .shard_index;
        assert_eq!(from_model, from_image);
    }

    #[test]
    fn helper_filters_the_robot_shard() {
        let helper = UserRecordingLikeHelper::new(32, true);
        assert!(!helper.shard_filter(FILTERED_SHARD));
        assert!(helper.shard_filter(0));
    }

    #[test]
    fn sort_orders_by_new_primary_key() {
        let helper = UserRecordingLikeHelper::new(32, true);
        let mut rows = vec![
            UserRecordingLike { id: 3, user_id: 2, recording_id: 1, created_on: 0 },
            UserRecordingLike { id: 1, user_id: 1, recording_id: 9, created_on: 0 },
            UserRecordingLike { id: 2, user_id: 1, recording_id: 2, created_on: 0 },
        ];
        helper.sort_shard(&mut rows);

        let keys: Vec<(i64, i64)> = rows.iter().map(|r| (r.user_id, r.recording_id)).collect();
        assert_eq!(keys, vec![(1, 2), (1, 9), (2, 1)]);
    }
}
