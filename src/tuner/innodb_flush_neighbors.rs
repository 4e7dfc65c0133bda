//! innodb_flush_neighbors tuner
//!
//! Neighbor flushing only helps spinning media; on SSDs the tuner turns
//! it off once and leaves it off.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::StorageKind;
use crate::db::Db;
use crate::notify::{self, Message};
use crate::tuner::persist::{PersistedSetting, Persistor};
use crate::tuner::{tune_period, Tuner};

#[derive(Clone)]
pub struct InnodbFlushNeighborsTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    storage: StorageKind,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl InnodbFlushNeighborsTuner {
    pub fn new(
        token: CancellationToken,
        db: Db,
        interval_secs: u64,
        storage: StorageKind,
        notify: Arc<notify::Service>,
        persist: Persistor,
    ) -> Self {
        Self {
            token,
            period: tune_period(interval_secs),
            db,
            storage,
            notify,
            persist,
        }
    }
}

fn should_disable(storage: StorageKind, current: u64) -> bool {
    storage == StorageKind::Ssd && current != 0
}

#[async_trait::async_trait]
impl Tuner for InnodbFlushNeighborsTuner {
    fn name(&self) -> &'static str {
        "innodb_flush_neighbors"
    }

    async fn run(&mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            tracing::debug!(tuner = self.name(), "tuner is running");

            if self.storage != StorageKind::Ssd {
                tracing::debug!(tuner = self.name(), storage = ?self.storage, "not an SSD");
                continue;
            }

            let vars = match self.db.get_global_variables().await {
                Ok(vars) => vars,
                Err(err) => {
                    tracing::error!(tuner = self.name(), error = %err, "get global variables failed");
                    continue;
                }
            };

            if !should_disable(self.storage, vars.innodb_flush_neighbors) {
                continue;
            }

            self.persist
                .send(PersistedSetting::mysqld(self.name(), "0".to_string()))
                .await;

            let statement = "SET GLOBAL innodb_flush_neighbors = 0";
            if let Err(err) = self.db.exec(statement).await {
                tracing::error!(tuner = self.name(), error = %err, "set innodb_flush_neighbors failed");
                continue;
            }

            let now = Local::now();
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to 0 at {}",
                        self.name(),
                        vars.innodb_flush_neighbors,
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
    fn test_spinning_storage_never_disables() {
        assert!(!should_disable(StorageKind::Spinning, 1));
        assert!(!should_disable(StorageKind::Unknown, 2));
    }

    #[test]
    fn test_ssd_disables_once() {
        assert!(should_disable(StorageKind::Ssd, 1));
        assert!(should_disable(StorageKind::Ssd, 2));
        assert!(!should_disable(StorageKind::Ssd, 0));
    }
}
