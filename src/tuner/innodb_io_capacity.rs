//! innodb_io_capacity tuner
//!
//! Keeps the steady-state flush rate at half of the burst ceiling set by
//! `innodb_io_capacity_max`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::db::Db;
use crate::notify::{self, Message};
use crate::tuner::persist::{PersistedSetting, Persistor};
use crate::tuner::{tune_period, Tuner};

/// Floor for innodb_io_capacity
const MIN_IO_CAPACITY: u64 = 200;

#[derive(Clone)]
pub struct InnodbIoCapacityTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl InnodbIoCapacityTuner {
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

fn target(capacity_max: u64) -> u64 {
    ((capacity_max as f64 * 0.5) as u64).max(MIN_IO_CAPACITY)
}

#[async_trait::async_trait]
impl Tuner for InnodbIoCapacityTuner {
    fn name(&self) -> &'static str {
        "innodb_io_capacity"
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

            if vars.innodb_io_capacity as f64 / vars.innodb_io_capacity_max as f64 == 0.5 {
                tracing::debug!(
                    tuner = self.name(),
                    innodb_io_capacity = vars.innodb_io_capacity,
                    innodb_io_capacity_max = vars.innodb_io_capacity_max,
                    "already at half of the ceiling"
                );
                continue;
            }

            let value = target(vars.innodb_io_capacity_max);
            if vars.innodb_io_capacity == value {
                continue;
            }

            self.persist
                .send(PersistedSetting::mysqld(self.name(), value.to_string()))
                .await;

            let statement = format!("SET GLOBAL innodb_io_capacity = {value}");
            if let Err(err) = self.db.exec(&statement).await {
                tracing::error!(tuner = self.name(), error = %err, value, "set innodb_io_capacity failed");
                continue;
            }

            let now = Local::now();
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to {} at {}",
                        self.name(),
                        vars.innodb_io_capacity,
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
    fn test_target_half_of_ceiling() {
        assert_eq!(target(4000), 2000);
        assert_eq!(target(5000), 2500);
    }

    #[test]
    fn test_target_floored() {
        assert_eq!(target(100), 200);
        assert_eq!(target(0), 200);
    }
}
