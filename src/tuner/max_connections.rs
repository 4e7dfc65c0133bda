//! max_connections tuner
//!
//! Grows the connection limit to the next power of two, but only after
//! the database has actually refused a connection with "too many
//! connections" since the last adjustment.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::db::{Db, ErrorMonitor};
use crate::notify::{self, Message};
use crate::tuner::persist::{PersistedSetting, Persistor};
use crate::tuner::{tune_period, Tuner};
use crate::util;

/// Hard ceiling for max_connections
const MAX_MAX_CONNECTIONS: u64 = 100_000;

#[derive(Clone)]
pub struct MaxConnectionsTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    errors: ErrorMonitor,
    last_update_time: DateTime<Local>,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl MaxConnectionsTuner {
    pub fn new(
        token: CancellationToken,
        db: Db,
        errors: ErrorMonitor,
        interval_secs: u64,
        notify: Arc<notify::Service>,
        persist: Persistor,
    ) -> Self {
        Self {
            token,
            period: tune_period(interval_secs),
            db,
            errors,
            last_update_time: Local::now(),
            notify,
            persist,
        }
    }
}

fn target(current: u64) -> u64 {
    util::next_power_of_two(current).min(MAX_MAX_CONNECTIONS)
}

#[async_trait::async_trait]
impl Tuner for MaxConnectionsTuner {
    fn name(&self) -> &'static str {
        "max_connections"
    }

    async fn run(&mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            tracing::debug!(tuner = self.name(), "tuner is running");

            let Some(last_refusal) = self.errors.last_too_many_connections() else {
                continue;
            };
            if self.last_update_time > last_refusal {
                tracing::debug!(
                    tuner = self.name(),
                    %last_refusal,
                    last_update_time = %self.last_update_time,
                    "no refusal since the last update"
                );
                continue;
            }

            let vars = match self.db.get_global_variables().await {
                Ok(vars) => vars,
                Err(err) => {
                    tracing::error!(tuner = self.name(), error = %err, "get global variables failed");
                    continue;
                }
            };

            let value = target(vars.max_connections);
            if vars.max_connections == value {
                continue;
            }

            self.persist
                .send(PersistedSetting::mysqld(self.name(), value.to_string()))
                .await;

            let statement = format!("SET GLOBAL max_connections = {value}");
            if let Err(err) = self.db.exec(&statement).await {
                tracing::error!(tuner = self.name(), error = %err, value, "set max_connections failed");
                continue;
            }

            let now = Local::now();
            self.last_update_time = now;
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to {} at {}",
                        self.name(),
                        vars.max_connections,
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
    fn test_target_doubles_to_power_of_two() {
        assert_eq!(target(151), 256);
        assert_eq!(target(256), 512);
    }

    #[test]
    fn test_target_clamped() {
        assert_eq!(target(90_000), 100_000);
        assert_eq!(target(100_000), 100_000);
    }
}
