//! InnoDB engine reads
//!
//! The log positions come from the human-readable `SHOW ENGINE INNODB
//! STATUS` dump; only the three counters of the LOG section are kept.

use super::Db;
use crate::error::{Error, Result};

const LSN_PREFIX: &str = "Log sequence number";
const FLUSHED_PREFIX: &str = "Log flushed up to";
const CHECKPOINT_PREFIX: &str = "Last checkpoint at";

/// The three monotone log counters of an InnoDB status snapshot.
///
/// Invariant under normal operation: `lsn >= log_flushed_up_to >=
/// last_checkpoint_at`; snapshots violating it are rejected as malformed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InnodbStatus {
    pub lsn: u64,
    pub log_flushed_up_to: u64,
    pub last_checkpoint_at: u64,
}

impl Db {
    /// Total bytes of InnoDB table and index data
    pub async fn get_innodb_size(&self) -> Result<u64> {
        self.observe(
            sqlx::query_scalar(
                "SELECT CAST(IFNULL(SUM(data_length + index_length), 0) AS UNSIGNED) \
                 FROM information_schema.tables WHERE engine = 'InnoDB'",
            )
            .fetch_one(self.pool())
            .await,
        )
    }

    /// Parse the log counters out of `SHOW ENGINE INNODB STATUS`
    pub async fn get_innodb_status(&self) -> Result<InnodbStatus> {
        let row = self.observe(
            sqlx::query_as::<_, EngineStatus>("SHOW ENGINE INNODB STATUS")
                .fetch_one(self.pool())
                .await,
        )?;

        parse_innodb_status(&row.status)
    }
}

/// `SHOW ENGINE xxx STATUS` output row
#[derive(Debug, sqlx::FromRow)]
struct EngineStatus {
    #[sqlx(rename = "Type")]
    #[allow(dead_code)]
    kind: String,
    #[sqlx(rename = "Name")]
    #[allow(dead_code)]
    name: String,
    #[sqlx(rename = "Status")]
    status: String,
}

fn parse_innodb_status(status: &str) -> Result<InnodbStatus> {
    let mut parsed = InnodbStatus::default();

    for line in status.lines() {
        for prefix in [LSN_PREFIX, FLUSHED_PREFIX, CHECKPOINT_PREFIX] {
            if !line.starts_with(prefix) {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != prefix.split_whitespace().count() + 1 {
                return Err(Error::Parse(format!(
                    "unexpected innodb status line: {line:?}"
                )));
            }

            let value: u64 = parts
                .last()
                .unwrap()
                .parse()
                .map_err(|_| Error::Parse(format!("unexpected innodb status line: {line:?}")))?;

            match prefix {
                LSN_PREFIX => parsed.lsn = value,
                FLUSHED_PREFIX => parsed.log_flushed_up_to = value,
                _ => parsed.last_checkpoint_at = value,
            }
        }
    }

    if parsed.lsn < parsed.log_flushed_up_to
        || parsed.log_flushed_up_to < parsed.last_checkpoint_at
    {
        return Err(Error::Parse(format!(
            "innodb log counters out of order: {parsed:?}"
        )));
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "\
=====================================
2024-05-04 12:00:00 0x7f INNODB MONITOR OUTPUT
=====================================
---
LOG
---
Log sequence number          63396650
Log flushed up to   63396620
Last checkpoint at  63396508
---
BUFFER POOL AND MEMORY
---
";

    #[test]
    fn test_parse_status() {
        let status = parse_innodb_status(STATUS).unwrap();
        assert_eq!(
            status,
            InnodbStatus {
                lsn: 63396650,
                log_flushed_up_to: 63396620,
                last_checkpoint_at: 63396508,
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage_value() {
        let malformed = "Log sequence number notanumber\n";
        assert!(parse_innodb_status(malformed).is_err());
    }

    #[test]
    fn test_parse_rejects_extra_fields() {
        let malformed = "Last checkpoint at 123 456\n";
        assert!(parse_innodb_status(malformed).is_err());
    }

    #[test]
    fn test_parse_rejects_counter_inversion() {
        let inverted = "\
Log sequence number 100
Log flushed up to   200
Last checkpoint at  50
";
        assert!(parse_innodb_status(inverted).is_err());
    }

    #[test]
    fn test_parse_missing_lines_is_zeroed() {
        // A dump without a LOG section yields zeroed counters, which
        // still satisfy the ordering.
        let status = parse_innodb_status("BUFFER POOL AND MEMORY\n").unwrap();
        assert_eq!(status, InnodbStatus::default());
    }
}
