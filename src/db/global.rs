//! Global variable and status reads

use sqlx::mysql::MySqlRow;
use sqlx::{FromRow, Row};

use super::Db;
use crate::error::Result;

/// Snapshot of the server globals relevant to tuning, read atomically by
/// one SELECT
#[derive(Debug, Clone, Default)]
pub struct GlobalVariables {
    pub innodb_buffer_pool_size: u64,
    pub innodb_log_buffer_size: u64,
    pub key_buffer_size: u64,
    /// 0 when the server has no query cache
    pub query_cache_size: u64,
    pub max_connections: u64,
    pub join_buffer_size: u64,
    pub read_buffer_size: u64,
    pub read_rnd_buffer_size: u64,
    pub sort_buffer_size: u64,
    pub tmp_table_size: u64,
    pub table_open_cache: u64,
    pub table_definition_cache: u64,
    pub innodb_log_file_size: u64,
    pub innodb_log_files_in_group: u64,
    pub innodb_flush_neighbors: u64,
    pub innodb_buffer_pool_instances: u64,
    pub innodb_buffer_pool_chunk_size: u64,
    pub table_open_cache_instances: u64,
    pub innodb_io_capacity_max: u64,
    pub innodb_io_capacity: u64,
    pub large_pages: bool,
    pub innodb_page_size: u64,
    pub innodb_checksum_algorithm: String,
    pub innodb_doublewrite: String,
    pub innodb_use_native_aio: bool,
    pub innodb_log_write_ahead_size: u64,
}

impl GlobalVariables {
    /// Upper bound on the server's memory footprint given these settings
    pub fn max_memory_usage(&self) -> u64 {
        self.innodb_buffer_pool_size
            + self.innodb_log_buffer_size
            + self.key_buffer_size
            + self.query_cache_size
            + self.max_connections
                * (self.join_buffer_size
                    + self.read_buffer_size
                    + self.read_rnd_buffer_size
                    + self.sort_buffer_size
                    + self.tmp_table_size)
    }
}

impl FromRow<'_, MySqlRow> for GlobalVariables {
    fn from_row(row: &MySqlRow) -> sqlx::Result<Self> {
        Ok(Self {
            innodb_buffer_pool_size: row.try_get("innodb_buffer_pool_size")?,
            innodb_log_buffer_size: row.try_get("innodb_log_buffer_size")?,
            key_buffer_size: row.try_get("key_buffer_size")?,
            query_cache_size: row.try_get("query_cache_size")?,
            max_connections: row.try_get("max_connections")?,
            join_buffer_size: row.try_get("join_buffer_size")?,
            read_buffer_size: row.try_get("read_buffer_size")?,
            read_rnd_buffer_size: row.try_get("read_rnd_buffer_size")?,
            sort_buffer_size: row.try_get("sort_buffer_size")?,
            tmp_table_size: row.try_get("tmp_table_size")?,
            table_open_cache: row.try_get("table_open_cache")?,
            table_definition_cache: row.try_get("table_definition_cache")?,
            innodb_log_file_size: row.try_get("innodb_log_file_size")?,
            innodb_log_files_in_group: row.try_get("innodb_log_files_in_group")?,
            innodb_flush_neighbors: row.try_get("innodb_flush_neighbors")?,
            innodb_buffer_pool_instances: row.try_get("innodb_buffer_pool_instances")?,
            innodb_buffer_pool_chunk_size: row.try_get("innodb_buffer_pool_chunk_size")?,
            table_open_cache_instances: row.try_get("table_open_cache_instances")?,
            innodb_io_capacity_max: row.try_get("innodb_io_capacity_max")?,
            innodb_io_capacity: row.try_get("innodb_io_capacity")?,
            large_pages: row.try_get::<u64, _>("large_pages")? != 0,
            innodb_page_size: row.try_get("innodb_page_size")?,
            innodb_checksum_algorithm: row.try_get("innodb_checksum_algorithm")?,
            innodb_doublewrite: row.try_get("innodb_doublewrite")?,
            innodb_use_native_aio: row.try_get::<u64, _>("innodb_use_native_aio")? != 0,
            innodb_log_write_ahead_size: row.try_get("innodb_log_write_ahead_size")?,
        })
    }
}

/// One row of `SHOW VARIABLES` / `SHOW GLOBAL STATUS` output
#[derive(Debug, Clone, FromRow)]
pub struct GlobalRow {
    #[sqlx(rename = "Variable_name")]
    pub name: String,
    #[sqlx(rename = "Value")]
    pub value: String,
}

impl Db {
    /// Read the tuning-relevant global variables in one statement.
    ///
    /// `query_cache_size` was removed in MySQL 8; its presence is probed
    /// first and absent servers report 0.
    pub async fn get_global_variables(&self) -> Result<GlobalVariables> {
        let rows = self.show_variables_like("query_cache_size").await?;
        let query_cache_column = if rows.iter().any(|r| r.name == "query_cache_size") {
            "CAST(@@query_cache_size AS UNSIGNED) AS query_cache_size"
        } else {
            "0 AS query_cache_size"
        };

        let query = format!(
            "SELECT \
             CAST(@@innodb_buffer_pool_size AS UNSIGNED) AS innodb_buffer_pool_size, \
             CAST(@@innodb_log_buffer_size AS UNSIGNED) AS innodb_log_buffer_size, \
             CAST(@@key_buffer_size AS UNSIGNED) AS key_buffer_size, \
             {query_cache_column}, \
             CAST(@@max_connections AS UNSIGNED) AS max_connections, \
             CAST(@@join_buffer_size AS UNSIGNED) AS join_buffer_size, \
             CAST(@@read_buffer_size AS UNSIGNED) AS read_buffer_size, \
             CAST(@@read_rnd_buffer_size AS UNSIGNED) AS read_rnd_buffer_size, \
             CAST(@@sort_buffer_size AS UNSIGNED) AS sort_buffer_size, \
             CAST(@@tmp_table_size AS UNSIGNED) AS tmp_table_size, \
             CAST(@@table_open_cache AS UNSIGNED) AS table_open_cache, \
             CAST(@@table_definition_cache AS UNSIGNED) AS table_definition_cache, \
             CAST(@@innodb_log_file_size AS UNSIGNED) AS innodb_log_file_size, \
             CAST(@@innodb_log_files_in_group AS UNSIGNED) AS innodb_log_files_in_group, \
             CAST(@@innodb_flush_neighbors AS UNSIGNED) AS innodb_flush_neighbors, \
             CAST(@@innodb_buffer_pool_instances AS UNSIGNED) AS innodb_buffer_pool_instances, \
             CAST(@@innodb_buffer_pool_chunk_size AS UNSIGNED) AS innodb_buffer_pool_chunk_size, \
             CAST(@@table_open_cache_instances AS UNSIGNED) AS table_open_cache_instances, \
             CAST(@@innodb_io_capacity_max AS UNSIGNED) AS innodb_io_capacity_max, \
             CAST(@@innodb_io_capacity AS UNSIGNED) AS innodb_io_capacity, \
             CAST(@@large_pages AS UNSIGNED) AS large_pages, \
             CAST(@@innodb_page_size AS UNSIGNED) AS innodb_page_size, \
             CAST(@@innodb_checksum_algorithm AS CHAR) AS innodb_checksum_algorithm, \
             CAST(@@innodb_doublewrite AS CHAR) AS innodb_doublewrite, \
             CAST(@@innodb_use_native_aio AS UNSIGNED) AS innodb_use_native_aio, \
             CAST(@@innodb_log_write_ahead_size AS UNSIGNED) AS innodb_log_write_ahead_size"
        );

        self.observe(
            sqlx::query_as::<_, GlobalVariables>(&query)
                .fetch_one(self.pool())
                .await,
        )
    }

    /// Rows matching `SHOW VARIABLES LIKE '<pattern>'`
    pub async fn show_variables_like(&self, pattern: &str) -> Result<Vec<GlobalRow>> {
        let query = format!("SHOW VARIABLES LIKE '{pattern}'");
        self.observe(
            sqlx::query_as::<_, GlobalRow>(&query)
                .fetch_all(self.pool())
                .await,
        )
    }

    /// A single `SHOW GLOBAL STATUS` counter, when the server exposes it
    pub async fn get_global_status(&self, name: &str) -> Result<Option<GlobalRow>> {
        let query = format!("SHOW GLOBAL STATUS LIKE '{name}'");
        self.observe(
            sqlx::query_as::<_, GlobalRow>(&query)
                .fetch_optional(self.pool())
                .await,
        )
    }

    /// Total number of tables the server knows about
    pub async fn table_count(&self) -> Result<u64> {
        self.observe(
            sqlx::query_scalar(
                "SELECT CAST(COUNT(1) AS UNSIGNED) FROM information_schema.tables",
            )
            .fetch_one(self.pool())
            .await,
        )
    }

    /// Total bytes of MyISAM index data
    pub async fn myisam_index_size(&self) -> Result<u64> {
        self.observe(
            sqlx::query_scalar(
                "SELECT CAST(IFNULL(SUM(index_length), 0) AS UNSIGNED) \
                 FROM information_schema.tables WHERE engine = 'MyISAM'",
            )
            .fetch_one(self.pool())
            .await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GlobalVariables {
        GlobalVariables {
            innodb_buffer_pool_size: 128 * 1024 * 1024,
            innodb_log_buffer_size: 16 * 1024 * 1024,
            key_buffer_size: 8 * 1024 * 1024,
            query_cache_size: 0,
            max_connections: 151,
            join_buffer_size: 256 * 1024,
            read_buffer_size: 128 * 1024,
            read_rnd_buffer_size: 256 * 1024,
            sort_buffer_size: 256 * 1024,
            tmp_table_size: 16 * 1024 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_max_memory_usage() {
        let vars = base();
        let per_conn = vars.join_buffer_size
            + vars.read_buffer_size
            + vars.read_rnd_buffer_size
            + vars.sort_buffer_size
            + vars.tmp_table_size;
        let want = vars.innodb_buffer_pool_size
            + vars.innodb_log_buffer_size
            + vars.key_buffer_size
            + vars.max_connections * per_conn;
        assert_eq!(vars.max_memory_usage(), want);
    }

    #[test]
    fn test_max_memory_usage_monotone() {
        let vars = base();
        let baseline = vars.max_memory_usage();

        let mut bigger = vars.clone();
        bigger.innodb_buffer_pool_size += 1;
        assert!(bigger.max_memory_usage() > baseline);

        let mut bigger = vars.clone();
        bigger.max_connections += 1;
        assert!(bigger.max_memory_usage() > baseline);

        let mut bigger = vars;
        bigger.sort_buffer_size += 1;
        assert!(bigger.max_memory_usage() > baseline);
    }
}
