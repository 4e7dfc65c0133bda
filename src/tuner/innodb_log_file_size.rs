//! innodb_log_file_size tuner
//!
//! Doubles the redo log files when the checkpoint age reaches three
//! quarters of the group capacity. The variable needs a restart, so the
//! proposal is persisted and cached, never set at runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::db::{Db, InnodbStatus};
use crate::notify::{self, Message};
use crate::tuner::persist::{PersistedSetting, Persistor};
use crate::tuner::{tune_period, Tuner};
use crate::util;

/// Floor for innodb_log_file_size
const MIN_LOG_FILE_SIZE: u64 = 4 << 20;

/// Ceiling for innodb_log_file_size * innodb_log_files_in_group
const MAX_LOG_FILE_TOTAL_SIZE: u64 = 512 << 30;

#[derive(Clone)]
pub struct InnodbLogFileSizeTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    value: Option<u64>,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl InnodbLogFileSizeTuner {
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
            value: None,
            notify,
            persist,
        }
    }
}

fn checkpoint_pressured(status: &InnodbStatus, file_size: u64, files_in_group: u64) -> bool {
    if file_size == 0 || files_in_group == 0 {
        return false;
    }

    (status.lsn - status.last_checkpoint_at) as f64 / (file_size * files_in_group) as f64 >= 0.75
}

fn target(file_size: u64, files_in_group: u64) -> u64 {
    let mut value = util::next_power_of_two(file_size);
    if value < MIN_LOG_FILE_SIZE {
        value = MIN_LOG_FILE_SIZE;
    } else if value > file_size * files_in_group {
        value = MAX_LOG_FILE_TOTAL_SIZE / files_in_group;
    }

    value
}

#[async_trait::async_trait]
impl Tuner for InnodbLogFileSizeTuner {
    fn name(&self) -> &'static str {
        "innodb_log_file_size"
    }

    async fn run(&mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            tracing::debug!(tuner = self.name(), "tuner is running");

            let status = match self.db.get_innodb_status().await {
                Ok(status) => status,
                Err(err) => {
                    tracing::error!(tuner = self.name(), error = %err, "get innodb status failed");
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

            let file_size = match self.value {
                Some(proposed) if proposed != 0 => proposed,
                _ => vars.innodb_log_file_size,
            };

            if !checkpoint_pressured(&status, file_size, vars.innodb_log_files_in_group) {
                tracing::debug!(
                    tuner = self.name(),
                    file_size,
                    lsn = status.lsn,
                    last_checkpoint_at = status.last_checkpoint_at,
                    innodb_log_files_in_group = vars.innodb_log_files_in_group,
                    "checkpoint age acceptable"
                );
                continue;
            }

            let value = target(file_size, vars.innodb_log_files_in_group);
            if value == file_size {
                continue;
            }

            self.persist
                .send(PersistedSetting::mysqld(
                    self.name(),
                    util::to_size_string(value),
                ))
                .await;

            self.value = Some(value);
            let now = Local::now();
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to {} at {}",
                        self.name(),
                        file_size,
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

    fn status(lsn: u64, checkpoint: u64) -> InnodbStatus {
        InnodbStatus {
            lsn,
            log_flushed_up_to: lsn,
            last_checkpoint_at: checkpoint,
        }
    }

    #[test]
    fn test_pressure_threshold() {
        let file = 48 << 20;
        let files = 2;
        let capacity = file * files;
        assert!(!checkpoint_pressured(&status(capacity / 2, 0), file, files));
        assert!(checkpoint_pressured(&status(capacity * 3 / 4, 0), file, files));
        assert!(!checkpoint_pressured(&status(100, 0), 0, files));
        assert!(!checkpoint_pressured(&status(100, 0), file, 0));
    }

    #[test]
    fn test_target_doubles_within_group() {
        // 48M in a group of two: the next power of two still fits.
        assert_eq!(target(48 << 20, 2), 64 << 20);
    }

    #[test]
    fn test_target_caps_at_group_budget() {
        // A single file always outgrows its own group and caps at the
        // 512G budget.
        assert_eq!(target(64 << 20, 1), MAX_LOG_FILE_TOTAL_SIZE);
        assert_eq!(target(1 << 30, 1), MAX_LOG_FILE_TOTAL_SIZE);
    }

    #[test]
    fn test_target_floor() {
        assert_eq!(target(1 << 20, 4), MIN_LOG_FILE_SIZE);
    }
}
