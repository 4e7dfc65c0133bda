//! innodb_log_buffer_size tuner
//!
//! Doubles the redo log buffer when the unflushed log span reaches three
//! quarters of it.

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

/// Bounds for innodb_log_buffer_size
const MIN_LOG_BUFFER_SIZE: u64 = 1 << 20;
const MAX_LOG_BUFFER_SIZE: u64 = 4_294_967_295;

#[derive(Clone)]
pub struct InnodbLogBufferSizeTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl InnodbLogBufferSizeTuner {
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

fn buffer_pressured(status: &InnodbStatus, buffer_size: u64) -> bool {
    buffer_size == 0
        || (status.lsn - status.log_flushed_up_to) as f64 / buffer_size as f64 >= 0.75
}

fn target(current: u64) -> u64 {
    util::next_power_of_two(current).clamp(MIN_LOG_BUFFER_SIZE, MAX_LOG_BUFFER_SIZE)
}

#[async_trait::async_trait]
impl Tuner for InnodbLogBufferSizeTuner {
    fn name(&self) -> &'static str {
        "innodb_log_buffer_size"
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

            if !buffer_pressured(&status, vars.innodb_log_buffer_size) {
                tracing::debug!(
                    tuner = self.name(),
                    lsn = status.lsn,
                    log_flushed_up_to = status.log_flushed_up_to,
                    innodb_log_buffer_size = vars.innodb_log_buffer_size,
                    "buffer not under pressure"
                );
                continue;
            }

            let value = target(vars.innodb_log_buffer_size);
            if value == vars.innodb_log_buffer_size {
                continue;
            }

            self.persist
                .send(PersistedSetting::mysqld(
                    self.name(),
                    util::to_size_string(value),
                ))
                .await;

            let statement = format!("SET GLOBAL innodb_log_buffer_size = {value}");
            if let Err(err) = self.db.exec(&statement).await {
                tracing::error!(tuner = self.name(), error = %err, value, "set innodb_log_buffer_size failed");
                continue;
            }

            let now = Local::now();
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to {} at {}",
                        self.name(),
                        vars.innodb_log_buffer_size,
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

    fn status(lsn: u64, flushed: u64) -> InnodbStatus {
        InnodbStatus {
            lsn,
            log_flushed_up_to: flushed,
            last_checkpoint_at: flushed,
        }
    }

    #[test]
    fn test_pressure_threshold() {
        let buffer = 16 << 20;
        assert!(!buffer_pressured(&status(1000, 900), buffer));
        assert!(buffer_pressured(&status(buffer, 0), buffer));
        // Exactly 75% counts as pressured.
        assert!(buffer_pressured(&status(buffer * 3 / 4, 0), buffer));
    }

    #[test]
    fn test_target_bounds() {
        assert_eq!(target(0), MIN_LOG_BUFFER_SIZE);
        assert_eq!(target(16 << 20), 32 << 20);
        // next_power_of_two overflows to 0 above 2^63 and the clamp
        // raises it back to the floor.
        assert_eq!(target(u64::MAX), MIN_LOG_BUFFER_SIZE);
    }
}
