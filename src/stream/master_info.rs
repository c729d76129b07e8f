use crate::binlog::coordinates::BinlogCoordinates;
use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, error};

const SAVE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Serialize, Deserialize)]
struct MasterInfoRecord {
    bin_name: String,
    bin_pos: u64,
}

struct MasterInfoState {
    record: MasterInfoRecord,
    last_save_time: Instant,
}

/// Durable checkpoint of the last rows event fully handed downstream.
///
/// The on-disk value never goes backwards within a run: `save` is only fed
/// the reader's applied-rows hint, which is itself monotone. Writes go
/// through a temp file and a rename so a crash never leaves a torn file.
pub struct MasterInfo {
    file_path: Option<PathBuf>,
    state: RwLock<MasterInfoState>,
}

impl MasterInfo {
    /// Load the checkpoint for `instance_key` (`host_port`) from `meta_dir`.
    /// A missing file is a fresh start, not an error. An empty `meta_dir`
    /// disables persistence (batch-only runs).
    pub fn load(meta_dir: &str, instance_key: &str) -> AppResult<Self> {
        if meta_dir.is_empty() {
            return Ok(Self {
                file_path: None,
                state: RwLock::new(MasterInfoState {
                    record: MasterInfoRecord::default(),
                    last_save_time: Instant::now(),
                }),
            });
        }

        fs::create_dir_all(meta_dir)?;
        let file_path = PathBuf::from(meta_dir).join(format!("{instance_key}.info"));

        let record = match fs::read_to_string(&file_path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MasterInfoRecord::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            file_path: Some(file_path),
            state: RwLock::new(MasterInfoState {
                record,
                last_save_time: Instant::now(),
            }),
        })
    }

    pub fn position(&self) -> BinlogCoordinates {
        let state = self.state.read().expect("master info lock poisoned");
        BinlogCoordinates::new(state.record.bin_name.clone(), state.record.bin_pos)
    }

    /// Record `pos`, flushing to disk at most once per second.
    pub fn save(&self, pos: &BinlogCoordinates) {
        self.save_inner(pos, false)
    }

    /// Final flush; bypasses the rate limit.
    pub fn close(&self) {
        let pos = self.position();
        self.save_inner(&pos, true)
    }

    fn save_inner(&self, pos: &BinlogCoordinates, force: bool) {
        // The hint is empty until the first rows event; writing it out would
        // regress a valid checkpoint from a previous run.
        if pos.is_empty() {
            return;
        }

        let mut state = self.state.write().expect("master info lock poisoned");
        state.record.bin_name = pos.log_file.clone();
        state.record.bin_pos = pos.log_pos;

        let Some(file_path) = &self.file_path else {
            return;
        };

        let now = Instant::now();
        if !force && now.duration_since(state.last_save_time) < SAVE_INTERVAL {
            return;
        }
        state.last_save_time = now;

        debug!(position = %pos, "save binlog position");
        if let Err(e) = write_atomic(file_path, &state.record) {
            error!(error = %e, path = %file_path.display(), "failed to save master info");
        }
    }
}

fn write_atomic(path: &PathBuf, record: &MasterInfoRecord) -> AppResult<()> {
    let contents =
        toml::to_string(record).map_err(|e| crate::error::AppError::Internal(e.to_string()))?;
    let tmp = path.with_extension("info.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_meta_dir(tag: &str) -> String {
        let dir = std::env::temp_dir().join(format!(
            "shardstream-master-info-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir.to_string_lossy().into_owned()
    }

    #[test]
    fn save_close_load_round_trip() {
        let dir = temp_meta_dir("roundtrip");
        let info = MasterInfo::load(&dir, "10.0.0.1_3306").unwrap();
        assert!(info.position().is_empty());

        let pos = BinlogCoordinates::new("mysql-bin.000009", 7777);
        info.save(&pos);
        info.close();

        let reloaded = MasterInfo::load(&dir, "10.0.0.1_3306").unwrap();
        assert_eq!(reloaded.position(), pos);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rapid_saves_are_rate_limited_but_close_flushes() {
        let dir = temp_meta_dir("ratelimit");
        let info = MasterInfo::load(&dir, "db_3306").unwrap();

        // First save after load is within the interval: memory only.
        info.save(&BinlogCoordinates::new("mysql-bin.000001", 10));
        info.save(&BinlogCoordinates::new("mysql-bin.000001", 20));
        assert_eq!(info.position().log_pos, 20);

        let on_disk = MasterInfo::load(&dir, "db_3306").unwrap();
        assert!(on_disk.position().is_empty());

        info.close();
        let flushed = MasterInfo::load(&dir, "db_3306").unwrap();
        assert_eq!(
            flushed.position(),
            BinlogCoordinates::new("mysql-bin.000001", 20)
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_meta_dir_disables_persistence() {
        let info = MasterInfo::load("", "db_3306").unwrap();
        info.save(&BinlogCoordinates::new("mysql-bin.000001", 10));
        info.close();
        assert_eq!(info.position().log_pos, 10);
    }
}
