//! innodb_buffer_pool_instances tuner
//!
//! One pool instance per CPU, capped at 64. The variable only takes
//! effect after a server restart, so the proposed value is persisted and
//! cached instead of set at runtime; the cache keeps the loop from
//! re-proposing the same value every tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::db::Db;
use crate::notify::{self, Message};
use crate::tuner::persist::{PersistedSetting, Persistor};
use crate::tuner::{cpu_count, tune_period, Tuner};

/// Max value of innodb_buffer_pool_instances
const MAX_BUF_POOL_INSTANCES: u64 = 64;

#[derive(Clone)]
pub struct InnodbBufPoolInstsTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    value: Option<u64>,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl InnodbBufPoolInstsTuner {
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

fn target(cpus: u64) -> u64 {
    cpus.min(MAX_BUF_POOL_INSTANCES)
}

#[async_trait::async_trait]
impl Tuner for InnodbBufPoolInstsTuner {
    fn name(&self) -> &'static str {
        "innodb_buffer_pool_instances"
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

            let size = target(cpu_count());

            let instances = match self.value {
                Some(proposed) if proposed != 0 => proposed,
                _ => vars.innodb_buffer_pool_instances,
            };

            if instances == size {
                tracing::debug!(tuner = self.name(), size, "already proposed");
                continue;
            }

            self.persist
                .send(PersistedSetting::mysqld(self.name(), size.to_string()))
                .await;

            self.value = Some(size);
            let now = Local::now();
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to {} at {}",
                        self.name(),
                        instances,
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

    #[test]
    fn test_target() {
        assert_eq!(target(1), 1);
        assert_eq!(target(16), 16);
        assert_eq!(target(96), 64);
    }
}
