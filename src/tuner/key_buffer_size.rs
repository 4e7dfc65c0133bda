//! key_buffer_size tuner
//!
//! Grows the MyISAM key buffer once the on-disk index volume has caught
//! up with it.

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

/// Granularity of key_buffer_size adjustments
const KEY_BUFFER_UNIT: u64 = 4096;

#[derive(Clone)]
pub struct KeyBufferSizeTuner {
    token: CancellationToken,
    period: Duration,
    db: Db,
    notify: Arc<notify::Service>,
    persist: Persistor,
}

impl KeyBufferSizeTuner {
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

#[async_trait::async_trait]
impl Tuner for KeyBufferSizeTuner {
    fn name(&self) -> &'static str {
        "key_buffer_size"
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

            let index_size = match self.db.myisam_index_size().await {
                Ok(size) => size,
                Err(err) => {
                    tracing::error!(tuner = self.name(), error = %err, "get MyISAM index size failed");
                    continue;
                }
            };

            if index_size < vars.key_buffer_size {
                tracing::debug!(
                    tuner = self.name(),
                    index_size,
                    key_buffer_size = vars.key_buffer_size,
                    "buffer already covers the indexes"
                );
                continue;
            }

            let value = util::next_multiple(vars.table_open_cache, KEY_BUFFER_UNIT);
            if value == vars.key_buffer_size {
                continue;
            }

            self.persist
                .send(PersistedSetting::mysqld(
                    self.name(),
                    util::to_size_string(value),
                ))
                .await;

            let statement = format!("SET GLOBAL key_buffer_size = {value}");
            if let Err(err) = self.db.exec(&statement).await {
                tracing::error!(tuner = self.name(), error = %err, value, "set key_buffer_size failed");
                continue;
            }

            let now = Local::now();
            self.notify
                .notify(Message {
                    subject: format!("{} changed", self.name()),
                    content: format!(
                        "{} has been changed from {} to {} at {}",
                        self.name(),
                        vars.key_buffer_size,
                        value,
                        now
                    ),
                    time: now,
                })
                .await;
        }
    }
}
