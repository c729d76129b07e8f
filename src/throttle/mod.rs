use crate::config::DatabaseConfig;
use crate::error::AppResult;
use crate::sharding::sql::escape_name;
use chrono::Utc;
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

pub const LAG_TABLE_NAME: &str = "sharding_heartbeat";
pub const MAX_LAG: Duration = Duration::from_millis(1500);
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Should the writers targeting this host pause?
///
/// `None` means the sample is unusable (clock skew put the heartbeat in the
/// future); the previous decision stands.
pub fn pause_for_lag(now_nanos: i64, heartbeat_nanos: i64, max_lag: Duration) -> Option<bool> {
    let lag_nanos = now_nanos - heartbeat_nanos;
    if lag_nanos <= 0 {
        return None;
    }
    Some(lag_nanos as u128 > max_lag.as_nanos())
}

/// Source→replica lag watchdog for one master host.
///
/// A writer task REPLACEs a wall-clock heartbeat on the master twice a
/// second; a sampler task reads it back from the replica and flips the
/// shared pause flag whenever the observed lag crosses the threshold. Every
/// applier writing to this host polls that flag.
pub struct ThrottleNode {
    db_name: String,
    master_pool: MySqlPool,
    slave_pool: MySqlPool,
    pause: Arc<AtomicBool>,
    max_lag: Duration,
}

impl ThrottleNode {
    pub async fn connect(
        config: &DatabaseConfig,
        master_alias: &str,
        slave_host: &str,
        pause: Arc<AtomicBool>,
    ) -> AppResult<Self> {
        let master = config.get_db(master_alias)?.clone();
        let mut slave = master.clone();
        slave.hostname = slave_host.to_string();

        let master_pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_lazy(&master.url(&config.user, &config.password))?;
        let slave_pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_lazy(&slave.url(&config.user, &config.password))?;

        let node = Self {
            db_name: master.db_name,
            master_pool,
            slave_pool,
            pause,
            max_lag: MAX_LAG,
        };
        node.ensure_heartbeat_table().await?;
        Ok(node)
    }

    async fn ensure_heartbeat_table(&self) -> AppResult<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (id INT PRIMARY KEY, value BIGINT)",
            escape_name(&self.db_name),
            escape_name(LAG_TABLE_NAME),
        );
        sqlx::query(&ddl).execute(&self.master_pool).await?;
        Ok(())
    }

    /// Spawn the heartbeat writer and the lag sampler; both run for the rest
    /// of the process.
    pub fn start(self) {
        let heartbeat_sql = format!(
            "REPLACE INTO {}.{} (id, value) VALUES (1, ?)",
            escape_name(&self.db_name),
            escape_name(LAG_TABLE_NAME),
        );
        let lag_sql = format!(
            "SELECT value FROM {}.{} WHERE id = 1",
            escape_name(&self.db_name),
            escape_name(LAG_TABLE_NAME),
        );

        let master_pool = self.master_pool;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                ticker.tick().await;
                let now_nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
                if let Err(e) = sqlx::query(&heartbeat_sql)
                    .bind(now_nanos)
                    .execute(&master_pool)
                    .await
                {
                    error!(error = %e, "heartbeat update failed");
                }
            }
        });

        let slave_pool = self.slave_pool;
        let pause = self.pause;
        let max_lag = self.max_lag;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                ticker.tick().await;
                let heartbeat: i64 = match sqlx::query_scalar(&lag_sql).fetch_one(&slave_pool).await
                {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "replica lag query failed");
                        continue;
                    }
                };

                let now_nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
                if let Some(should_pause) = pause_for_lag(now_nanos, heartbeat, max_lag) {
                    let was = pause.swap(should_pause, Ordering::Relaxed);
                    if was != should_pause {
                        info!(paused = should_pause, "replica lag threshold crossed");
                    }
                }
            }
        });
    }
}

/// Start one throttle node per master host that both carries writers (has a
/// pause flag) and has a replica configured in `slave_master_mapping`.
pub async fn start_throttle_check(
    config: &DatabaseConfig,
    master_aliases: &[String],
    host_pauses: &HashMap<String, Arc<AtomicBool>>,
) -> AppResult<()> {
    let mut started_hosts = std::collections::HashSet::new();
    for alias in master_aliases {
        let master_host = config.get_db(alias)?.hostname.clone();
        if !started_hosts.insert(master_host.clone()) {
            continue;
        }

        let Some(pause) = host_pauses.get(&master_host) else {
            continue;
        };
        let Some(slave_host) = config.slave_of(&master_host) else {
            warn!(host = %master_host, "no replica mapping, writers never throttle");
            continue;
        };

        let node =
            ThrottleNode::connect(config, alias, slave_host, Arc::clone(pause)).await?;
        node.start();
        info!(alias = %alias, host = %master_host, "throttle check started");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1_000_000_000;

    #[test]
    fn lag_over_threshold_pauses() {
        let now = 100 * SEC;
        assert_eq!(pause_for_lag(now, now - 2 * SEC, MAX_LAG), Some(true));
    }

    #[test]
    fn lag_under_threshold_resumes() {
        let now = 100 * SEC;
        let heartbeat = now - (8 * SEC) / 10;
        assert_eq!(pause_for_lag(now, heartbeat, MAX_LAG), Some(false));
    }

    #[test]
    fn future_heartbeat_is_ignored() {
        let now = 100 * SEC;
        assert_eq!(pause_for_lag(now, now + SEC, MAX_LAG), None);
        assert_eq!(pause_for_lag(now, now, MAX_LAG), None);
    }

    #[test]
    fn boundary_is_exclusive() {
        let now = 100 * SEC;
        let heartbeat = now - MAX_LAG.as_nanos() as i64;
        assert_eq!(pause_for_lag(now, heartbeat, MAX_LAG), Some(false));
    }
}
