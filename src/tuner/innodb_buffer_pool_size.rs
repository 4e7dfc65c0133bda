//! innodb_buffer_pool_size tuner
//!
//! Sizes the buffer pool against physical RAM and the actual InnoDB data
//! volume: a pool larger than the data shrinks to the data, otherwise the
//! pool grows until the projected memory footprint matches the desired
//! share of RAM. Never shrinks below a configured huge-page arena.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use sysinfo::System;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::db::Db;
use crate::notify::{self, Message};
use crate::tuner::persist::{PersistedSetting, Persistor};
use crate::tuner::{tune_period, Tuner};
use crate::util;

/// Share of physical RAM the server may claim
const RAM_SHARE: f64 = 0.9;

#[derive(Clone)]
pub struct InnodbBufPoolSizeTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    huge_page_alloc: u64,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl InnodbBufPoolSizeTuner {
    pub fn new(
        token: CancellationToken,
        db: Db,
        interval_secs: u64,
        huge_page_alloc: u64,
        notify: Arc<notify::Service>,
        persist: Persistor,
    ) -> Self {
        Self {
            token,
            period: tune_period(interval_secs),
            db,
            huge_page_alloc,
            notify,
            persist,
        }
    }
}

/// Raw target before alignment; `None` means leave the pool alone
fn raw_target(current_pool: u64, innodb_size: u64, max_memory: u64, desired_ram: u64) -> Option<u64> {
    if current_pool > innodb_size {
        Some(innodb_size)
    } else if max_memory != desired_ram {
        Some(desired_ram)
    } else {
        None
    }
}

#[async_trait::async_trait]
impl Tuner for InnodbBufPoolSizeTuner {
    fn name(&self) -> &'static str {
        "innodb_buffer_pool_size"
    }

    async fn run(&mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            tracing::debug!(tuner = self.name(), "tuner is running");

            let total_ram = {
                let mut sys = System::new();
                sys.refresh_memory();
                sys.total_memory()
            };

            let vars = match self.db.get_global_variables().await {
                Ok(vars) => vars,
                Err(err) => {
                    tracing::error!(tuner = self.name(), error = %err, "get global variables failed");
                    continue;
                }
            };

            let innodb_size = match self.db.get_innodb_size().await {
                Ok(size) => size,
                Err(err) => {
                    tracing::error!(tuner = self.name(), error = %err, "get innodb size failed");
                    continue;
                }
            };

            // The desired-RAM formula keeps its historical 1024 scale
            // factor.
            let desired_ram = (total_ram as f64 * RAM_SHARE) as u64 * 1024;

            let Some(size) = raw_target(
                vars.innodb_buffer_pool_size,
                innodb_size,
                vars.max_memory_usage(),
                desired_ram,
            ) else {
                continue;
            };

            let size = util::next_multiple(
                size,
                vars.innodb_buffer_pool_instances * vars.innodb_buffer_pool_chunk_size,
            );

            if vars.large_pages && self.huge_page_alloc > 0 && size < self.huge_page_alloc {
                self.notify
                    .notify(Message {
                        subject: "innodb_buffer_pool_size adjustment warning".to_string(),
                        content: format!(
                            "trying to reduce innodb buffer pool below huge page allocation \
                             (value = {}, huge page allocation = {}, InnoDB data size = {})",
                            size, self.huge_page_alloc, innodb_size
                        ),
                        time: Local::now(),
                    })
                    .await;
                continue;
            }

            if size == vars.innodb_buffer_pool_size {
                tracing::debug!(tuner = self.name(), size, "already sized");
                continue;
            }

            self.persist
                .send(PersistedSetting::mysqld(
                    self.name(),
                    util::to_size_string(size),
                ))
                .await;

            let statement = format!("SET GLOBAL innodb_buffer_pool_size = {size}");
            if let Err(err) = self.db.exec(&statement).await {
                tracing::error!(tuner = self.name(), error = %err, size, "set innodb_buffer_pool_size failed");
                continue;
            }

            let now = Local::now();
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to {} at {}",
                        self.name(),
                        vars.innodb_buffer_pool_size,
                        size,
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

    const GIB: u64 = 1 << 30;

    #[test]
    fn test_oversized_pool_shrinks_to_data() {
        assert_eq!(raw_target(8 * GIB, 2 * GIB, 10 * GIB, 12 * GIB), Some(2 * GIB));
    }

    #[test]
    fn test_pool_grows_toward_desired_ram() {
        assert_eq!(raw_target(GIB, 4 * GIB, 6 * GIB, 12 * GIB), Some(12 * GIB));
    }

    #[test]
    fn test_balanced_pool_untouched() {
        assert_eq!(raw_target(GIB, 4 * GIB, 12 * GIB, 12 * GIB), None);
    }

    #[test]
    fn test_alignment_to_chunk_grid() {
        // 8 instances x 128M chunks.
        let grid = 8 * 128 * (1 << 20);
        let aligned = util::next_multiple(3 * GIB + 1, grid);
        assert_eq!(aligned % grid, 0);
        assert!(aligned >= 3 * GIB + 1);
    }
}
