//! table_open_cache tuner
//!
//! Rounds the cache up onto the instance grid once the server is using
//! three quarters of it.

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

#[derive(Clone)]
pub struct TableOpenCacheTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl TableOpenCacheTuner {
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

/// `None` when the cache is still comfortable or already on the grid
fn target(cache: u64, instances: u64, open_tables: u64) -> Option<u64> {
    if open_tables < (0.75 * cache as f64) as u64 {
        return None;
    }

    let value = util::next_multiple(cache, instances);
    (value != cache).then_some(value)
}

#[async_trait::async_trait]
impl Tuner for TableOpenCacheTuner {
    fn name(&self) -> &'static str {
        "table_open_cache"
    }

    async fn run(&mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            tracing::debug!(tuner = self.name(), "tuner is running");

            let vars = match self.db.get_global_variables().await {
                Ok(vars) => vars,
                Err(err) => {
                    tracing::error!(tuner = self.name(), error = %err, "get global variables failed");
                    continue;
                }
            };

            let row = match self.db.get_global_status("Open_tables").await {
                Ok(Some(row)) => row,
                Ok(None) => {
                    tracing::error!(tuner = self.name(), "Open_tables status not reported");
                    continue;
                }
                Err(err) => {
                    tracing::error!(tuner = self.name(), error = %err, "get Open_tables failed");
                    continue;
                }
            };

            let open_tables: u64 = match row.value.parse() {
                Ok(count) => count,
                Err(_) => {
                    tracing::error!(
                        tuner = self.name(),
                        value = %row.value,
                        "parse Open_tables failed"
                    );
                    continue;
                }
            };

            let Some(value) = target(
                vars.table_open_cache,
                vars.table_open_cache_instances,
                open_tables,
            ) else {
                tracing::debug!(
                    tuner = self.name(),
                    open_tables,
                    table_open_cache = vars.table_open_cache,
                    "cache sufficient"
                );
                continue;
            };

            self.persist
                .send(PersistedSetting::mysqld(self.name(), value.to_string()))
                .await;

            let statement = format!("SET GLOBAL table_open_cache = {value}");
            if let Err(err) = self.db.exec(&statement).await {
                tracing::error!(tuner = self.name(), error = %err, value, "set table_open_cache failed");
                continue;
            }

            let now = Local::now();
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to {} at {}",
                        self.name(),
                        vars.table_open_cache,
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
    fn test_skips_while_cache_comfortable() {
        assert_eq!(target(2000, 16, 100), None);
        assert_eq!(target(2000, 16, 1499), None);
    }

    #[test]
    fn test_rounds_up_to_instance_grid() {
        assert_eq!(target(2002, 16, 1502), Some(2016));
        assert_eq!(target(2001, 16, 2001), Some(2016));
    }

    #[test]
    fn test_skips_when_already_aligned() {
        assert_eq!(target(2048, 16, 2048), None);
        assert_eq!(target(2000, 16, 1500), None);
    }
}
