//! table_definition_cache tuner
//!
//! Sizes the definition cache to the next power of two above the number
//! of tables the server knows about.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::db::Db;
use crate::notify::{self, Message};
use crate::tuner::persist::{PersistedSetting, Persistor};
use crate::tuner::{tune_period, Tuner};
use crate::util;

/// Bounds for table_definition_cache
const MIN_TABLE_DEFINITION_CACHE: u64 = 400;
const MAX_TABLE_DEFINITION_CACHE: u64 = 524_288;

#[derive(Clone)]
pub struct TableDefinitionCacheTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl TableDefinitionCacheTuner {
    pub fn new(
        token: CancellationToken,
        db: Db,
        interval_secs: u64,
        notify: Arc<notify::Service>,
        persist: Persistor,
    ) -> Self {
        Self {
            token,
            period: tune_period(interval_secs),
            db,
            notify,
            persist,
        }
    }
}

fn target(table_count: u64) -> u64 {
    util::next_power_of_two(table_count)
        .clamp(MIN_TABLE_DEFINITION_CACHE, MAX_TABLE_DEFINITION_CACHE)
}

#[async_trait::async_trait]
impl Tuner for TableDefinitionCacheTuner {
    fn name(&self) -> &'static str {
        "table_definition_cache"
    }

    async fn run(&mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            tracing::debug!(tuner = self.name(), "tuner is running");

            let table_count = match self.db.table_count().await {
                Ok(count) => count,
                Err(err) => {
                    tracing::error!(tuner = self.name(), error = %err, "get table count failed");
                    continue;
                }
            };

            let vars = match self.db.get_global_variables().await {
                Ok(vars) => vars,
                Err(err) => {
                    tracing::error!(tuner = self.name(), error = %err, "get global variables failed");
                    continue;
                }
            };

            let value = target(table_count);
            if value == vars.table_definition_cache {
                continue;
            }

            self.persist
                .send(PersistedSetting::mysqld(self.name(), value.to_string()))
                .await;

            let statement = format!("SET GLOBAL table_definition_cache = {value}");
            if let Err(err) = self.db.exec(&statement).await {
                tracing::error!(tuner = self.name(), error = %err, value, "set table_definition_cache failed");
                continue;
            }

            let now = Local::now();
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to {} at {}",
                        self.name(),
                        vars.table_definition_cache,
                        value,
                        now
                    ),
                    time: now,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_catalogs_hit_the_floor() {
        assert_eq!(target(50), 400);
        assert_eq!(target(0), 400);
    }

    #[test]
    fn test_grows_with_catalog() {
        assert_eq!(target(600), 1024);
        assert_eq!(target(100_000), 131_072);
    }

    #[test]
    fn test_huge_catalogs_hit_the_ceiling() {
        assert_eq!(target(1_000_000), 524_288);
    }
}
