//! Database Facade
//!
//! Wraps the MySQL connection pool behind typed read and execute
//! operations. Every result funnels through an error observer so that
//! "too many connections" (MySQL error 1040) leaves a timestamp the
//! `max_connections` tuner can read.

mod global;
mod innodb;

pub use global::{GlobalRow, GlobalVariables};
pub use innodb::InnodbStatus;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};

use crate::config::Config;
use crate::error::{Error, Result};

/// MySQL error number for "Too many connections"
const ER_CON_COUNT_ERROR: u16 = 1040;

/// Records noteworthy database errors as they pass through the facade.
///
/// Injected into both the facade and the `max_connections` tuner so the
/// signal does not live in a global.
#[derive(Clone, Default)]
pub struct ErrorMonitor {
    last_too_many_conn: Arc<Mutex<Option<DateTime<Local>>>>,
}

impl ErrorMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time of the most recent "too many connections" error, if any
    pub fn last_too_many_connections(&self) -> Option<DateTime<Local>> {
        *self.last_too_many_conn.lock().unwrap()
    }

    fn record_too_many_connections(&self) {
        *self.last_too_many_conn.lock().unwrap() = Some(Local::now());
    }
}

/// Handle to the database, cheap to clone
#[derive(Clone)]
pub struct Db {
    pool: MySqlPool,
    errors: ErrorMonitor,
}

impl Db {
    /// Connect to the server described by the configuration. The Unix
    /// socket is preferred when one is configured.
    pub async fn connect(config: &Config, errors: ErrorMonitor) -> Result<Self> {
        let mut options = MySqlConnectOptions::new()
            .username(&config.username)
            .password(&config.password);

        if !config.socket.is_empty() {
            options = options.socket(&config.socket);
        } else {
            options = options.host(config.db_host()).port(config.db_port());
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        Ok(Self { pool, errors })
    }

    /// Execute a statement, returning the number of affected rows
    pub async fn exec(&self, sql: &str) -> Result<u64> {
        let result = self.observe(sqlx::query(sql).execute(&self.pool).await)?;
        Ok(result.rows_affected())
    }

    /// The server's data directory
    pub async fn get_datadir(&self) -> Result<String> {
        self.observe(
            sqlx::query_scalar("SELECT @@datadir")
                .fetch_one(&self.pool)
                .await,
        )
    }

    pub(crate) fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Check a driver result for errors worth remembering before
    /// converting it
    pub(crate) fn observe<T>(&self, result: sqlx::Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if is_too_many_connections(err) {
                self.errors.record_too_many_connections();
            }
        }
        result.map_err(Error::from)
    }
}

fn is_too_many_connections(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
            .map(|e| e.number() == ER_CON_COUNT_ERROR)
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_monitor_starts_empty() {
        let monitor = ErrorMonitor::new();
        assert!(monitor.last_too_many_connections().is_none());
    }

    #[test]
    fn test_error_monitor_records() {
        let monitor = ErrorMonitor::new();
        let before = Local::now();
        monitor.record_too_many_connections();
        let recorded = monitor.last_too_many_connections().unwrap();
        assert!(recorded >= before);

        // A clone sees the same cell.
        let clone = monitor.clone();
        assert_eq!(clone.last_too_many_connections(), Some(recorded));
    }
}
