use crate::error::{AppError, AppResult};
use std::fmt;
use std::str::FromStr;

/// A position inside a source server's binary log.
///
/// Log files are sequentially numbered (`mysql-bin.000042`), so comparing the
/// file name as a string and then the offset gives the stream order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BinlogCoordinates {
    pub log_file: String,
    pub log_pos: u64,
}

/// Events in a fresh binlog file start after the 4-byte magic header.
pub const BINLOG_FILE_START_POS: u64 = 4;

impl BinlogCoordinates {
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.log_file.is_empty()
    }

    /// The resume point after a reader failure: start of the current file,
    /// relying on the skip-ahead hint to elide already-seen events.
    pub fn file_start(&self) -> Self {
        Self::new(self.log_file.clone(), BINLOG_FILE_START_POS)
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

impl FromStr for BinlogCoordinates {
    type Err = AppError;

    /// Parses `"mysql-bin.024709:19464691"`.
    fn from_str(s: &str) -> AppResult<Self> {
        let (file, pos) = s
            .rsplit_once(':')
            .ok_or_else(|| AppError::InvalidCoordinate(s.to_string()))?;
        if file.is_empty() {
            return Err(AppError::InvalidCoordinate(s.to_string()));
        }
        let pos = pos
            .parse::<u64>()
            .map_err(|_| AppError::InvalidCoordinate(s.to_string()))?;
        Ok(Self::new(file, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_file_then_pos() {
        let a = BinlogCoordinates::new("mysql-bin.000001", 900);
        let b = BinlogCoordinates::new("mysql-bin.000002", 4);
        let c = BinlogCoordinates::new("mysql-bin.000002", 100);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
        assert!(a <= a.clone());
    }

    #[test]
    fn empty_only_when_file_empty() {
        assert!(BinlogCoordinates::default().is_empty());
        assert!(!BinlogCoordinates::new("mysql-bin.000001", 0).is_empty());
    }

    #[test]
    fn display_parse_round_trip() {
        let c = BinlogCoordinates::new("mysql-bin.024709", 19_464_691);
        let parsed: BinlogCoordinates = c.to_string().parse().unwrap();
        assert_eq!(parsed, c);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("mysql-bin.024709".parse::<BinlogCoordinates>().is_err());
        assert!(":123".parse::<BinlogCoordinates>().is_err());
        assert!("file:notanumber".parse::<BinlogCoordinates>().is_err());
    }

    #[test]
    fn file_start_keeps_file() {
        let c = BinlogCoordinates::new("mysql-bin.024709", 19_464_691);
        let r = c.file_start();
        assert_eq!(r.log_file, "mysql-bin.024709");
        assert_eq!(r.log_pos, BINLOG_FILE_START_POS);
    }
}
