//! innodb_io_capacity_max tuner
//!
//! The only consumer of the observed I/O state. Ticks and broadcast
//! updates are multiplexed: an update refreshes the cached state and the
//! policy runs on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::db::Db;
use crate::notify::{self, Message};
use crate::tuner::persist::{PersistedSetting, Persistor};
use crate::tuner::{tune_period, IoState, Tuner};

/// Floor for innodb_io_capacity_max
const MIN_IO_CAPACITY_MAX: u64 = 2000;

#[derive(Clone)]
pub struct InnodbIoCapacityMaxTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    io_rx: watch::Receiver<Option<IoState>>,
    io_state: Option<IoState>,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl InnodbIoCapacityMaxTuner {
    pub fn new(
        token: CancellationToken,
        db: Db,
        interval_secs: u64,
        io_rx: watch::Receiver<Option<IoState>>,
        notify: Arc<notify::Service>,
        persist: Persistor,
    ) -> Self {
        Self {
            token,
            period: tune_period(interval_secs),
            db,
            io_rx,
            io_state: None,
            notify,
            persist,
        }
    }
}

/// The tuner only acts inside the narrow utilisation band where the
/// current speed sits between 75% and ~83% of the inferred maximum.
fn should_skip(state: &IoState) -> bool {
    state.current_io_speed / state.max_io_speed < 0.75
        || state.max_io_speed / state.current_io_speed < 1.2
}

fn target(max_io_speed: f64) -> u64 {
    ((max_io_speed * 0.75) as u64).max(MIN_IO_CAPACITY_MAX)
}

#[async_trait::async_trait]
impl Tuner for InnodbIoCapacityMaxTuner {
    fn name(&self) -> &'static str {
        "innodb_io_capacity_max"
    }

    async fn run(&mut self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                changed = self.io_rx.changed() => {
                    if changed.is_err() {
                        // Observer gone; the service is shutting down.
                        return;
                    }
                    self.io_state = *self.io_rx.borrow_and_update();
                    continue;
                }
                _ = ticker.tick() => {}
            }
            tracing::debug!(tuner = self.name(), "tuner is running");

            let Some(state) = self.io_state else {
                tracing::debug!(tuner = self.name(), "no i/o state observed yet");
                continue;
            };

            if should_skip(&state) {
                tracing::debug!(
                    tuner = self.name(),
                    current_io_speed = state.current_io_speed,
                    max_io_speed = state.max_io_speed,
                    "device not in the adjustment band"
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

            let value = target(state.max_io_speed);
            if vars.innodb_io_capacity_max == value {
                continue;
            }

            self.persist
                .send(PersistedSetting::mysqld(self.name(), value.to_string()))
                .await;

            let statement = format!("SET GLOBAL innodb_io_capacity_max = {value}");
            if let Err(err) = self.db.exec(&statement).await {
                tracing::error!(tuner = self.name(), error = %err, value, "set innodb_io_capacity_max failed");
                continue;
            }

            let now = Local::now();
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to {} at {}",
                        self.name(),
                        vars.innodb_io_capacity_max,
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

    fn state(current: f64, max: f64) -> IoState {
        IoState {
            current_io_speed: current,
            max_io_speed: max,
        }
    }

    #[test]
    fn test_skips_outside_the_band() {
        // Below 75% of the maximum.
        assert!(should_skip(&state(500.0, 1000.0)));
        // Above ~83% of the maximum.
        assert!(should_skip(&state(900.0, 1000.0)));
    }

    #[test]
    fn test_acts_inside_the_band() {
        assert!(!should_skip(&state(800.0, 1000.0)));
        assert!(!should_skip(&state(750.0, 1000.0)));
    }

    #[test]
    fn test_target() {
        assert_eq!(target(10_000.0), 7500);
        assert_eq!(target(100.0), MIN_IO_CAPACITY_MAX);
    }
}
