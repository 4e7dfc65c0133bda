//! Periodic Tuner Engine
//!
//! Each tunable parameter gets its own policy loop driven by a ticker.
//! The service wires the loops to the database facade, the notification
//! queue, the persistence writer and the I/O observer, supervises them,
//! and periodically re-invokes the observer so the broadcast I/O state
//! stays fresh.

mod host;
mod io_observer;
mod persist;

mod innodb_buffer_pool_instances;
mod innodb_buffer_pool_size;
mod innodb_flush_neighbors;
mod innodb_io_capacity;
mod innodb_io_capacity_max;
mod innodb_log_buffer_size;
mod innodb_log_file_size;
mod key_buffer_size;
mod max_connections;
mod table_definition_cache;
mod table_open_cache;
mod table_open_cache_instances;

pub use host::Device;
pub use io_observer::IoState;
pub use persist::{PersistWriter, PersistedSetting, Persistor, PERSIST_QUEUE_CAPACITY};

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ini::Ini;
use sysinfo::System;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, StorageKind, StoragePreference};
use crate::db::{Db, ErrorMonitor};
use crate::error::Result;
use crate::notify;
use crate::supervise::spawn_supervised;

use innodb_buffer_pool_instances::InnodbBufPoolInstsTuner;
use innodb_buffer_pool_size::InnodbBufPoolSizeTuner;
use innodb_flush_neighbors::InnodbFlushNeighborsTuner;
use innodb_io_capacity::InnodbIoCapacityTuner;
use innodb_io_capacity_max::InnodbIoCapacityMaxTuner;
use innodb_log_buffer_size::InnodbLogBufferSizeTuner;
use innodb_log_file_size::InnodbLogFileSizeTuner;
use key_buffer_size::KeyBufferSizeTuner;
use max_connections::MaxConnectionsTuner;
use table_definition_cache::TableDefinitionCacheTuner;
use table_open_cache::TableOpenCacheTuner;
use table_open_cache_instances::TableOpenCacheInstsTuner;

/// Default tuning period in seconds; a configured period of 0 means this
pub const DEFAULT_TUNE_INTERVAL: u64 = 60;

/// A periodic tuning loop for one parameter
#[async_trait::async_trait]
pub trait Tuner: Send + Sync {
    /// Name of the tuned parameter
    fn name(&self) -> &'static str;

    /// Run the policy loop until cancellation
    async fn run(&mut self);
}

pub(crate) fn tune_period(secs: u64) -> Duration {
    Duration::from_secs(if secs == 0 { DEFAULT_TUNE_INTERVAL } else { secs })
}

/// Number of logical CPUs, at least 1
pub(crate) fn cpu_count() -> u64 {
    let sys = System::new_all();
    sys.cpus().len().max(1) as u64
}

/// Service owning the tuner collection and its shared plumbing
pub struct TunerService {
    token: CancellationToken,
    db: Db,
    errors: ErrorMonitor,
    notify: Arc<notify::Service>,
    persist: Persistor,
    persist_path: Option<PathBuf>,
    persist_rx: Option<Arc<Mutex<mpsc::Receiver<PersistedSetting>>>>,
    device: Option<Device>,
    storage: StorageKind,
    bold: bool,
    hp_alloc: u64,
    io_tx: watch::Sender<Option<IoState>>,
    intervals: crate::config::TuneIntervals,
}

impl TunerService {
    /// Probe the host and assemble the service. Only an unusable
    /// persistent-tune file is fatal here; host probes degrade.
    pub async fn new(
        token: CancellationToken,
        config: &Config,
        db: Db,
        errors: ErrorMonitor,
        notify: Arc<notify::Service>,
    ) -> Result<Self> {
        let (persist, persist_path, persist_rx) = if config.persistent_tune.is_empty() {
            tracing::warn!("persistent_tune not configured, changes will not survive restarts");
            (Persistor::disabled(), None, None)
        } else {
            let path = PathBuf::from(&config.persistent_tune);
            ensure_tune_file(&path)?;
            // Parse now so a corrupt file fails startup instead of the
            // writer's first flush.
            Ini::load_from_file(&path)?;

            let (tx, rx) = mpsc::channel(PERSIST_QUEUE_CAPACITY);
            (
                Persistor::new(tx),
                Some(path),
                Some(Arc::new(Mutex::new(rx))),
            )
        };

        let datadir = db.get_datadir().await?;

        let device = match host::detect_device(&datadir).await {
            Ok(device) => Some(device),
            Err(err) => {
                tracing::warn!(error = %err, datadir = %datadir, "detecting data device failed");
                None
            }
        };

        let storage = match config.ssd {
            StoragePreference::Spinning => StorageKind::Spinning,
            StoragePreference::Ssd => StorageKind::Ssd,
            StoragePreference::AutoDetect => match &device {
                Some(device) => match host::detect_storage(&device.kernel_name).await {
                    Ok(kind) => kind,
                    Err(err) => {
                        tracing::error!(
                            error = %err,
                            "can't detect storage type, assuming spinning"
                        );
                        StorageKind::Spinning
                    }
                },
                None => {
                    tracing::warn!("no device to classify, assuming spinning storage");
                    StorageKind::Spinning
                }
            },
        };

        let hp_alloc = match host::huge_page_allocation() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "reading huge page allocation failed");
                0
            }
        };

        let (io_tx, _) = watch::channel(None);

        Ok(Self {
            token,
            db,
            errors,
            notify,
            persist,
            persist_path,
            persist_rx,
            device,
            storage,
            bold: config.bold,
            hp_alloc,
            io_tx,
            intervals: config.interval.clone(),
        })
    }

    /// Launch the one-shot probes, the persistence writer and the tuner
    /// loops, then keep re-invoking the I/O observer until cancellation.
    pub async fn run(self: Arc<Self>) {
        // Children live under a scope that dies with this run, even when
        // the run itself crashes.
        let scope = self.token.child_token();
        let _guard = scope.clone().drop_guard();

        let svc = Arc::clone(&self);
        tokio::spawn(async move { svc.tune_query_cache().await });
        let svc = Arc::clone(&self);
        tokio::spawn(async move { svc.tune_zfs().await });
        let svc = Arc::clone(&self);
        tokio::spawn(async move { svc.tune_os().await });

        if let (Some(path), Some(rx)) = (&self.persist_path, &self.persist_rx) {
            let writer = PersistWriter::new(path.clone(), Arc::clone(rx), scope.clone());
            spawn_supervised("persist_writer", scope.clone(), move || {
                let writer = writer.clone();
                async move { writer.run().await }
            });
        }

        self.spawn_tuners(&scope);

        let mut ticker =
            tokio::time::interval(Duration::from_secs(2 * DEFAULT_TUNE_INTERVAL));
        loop {
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = ticker.tick() => {}
            }

            self.infer_io_state(&scope).await;
        }
    }

    fn spawn_tuners(&self, scope: &CancellationToken) {
        let iv = &self.intervals;

        self.spawn(
            scope,
            MaxConnectionsTuner::new(
                scope.clone(),
                self.db.clone(),
                self.errors.clone(),
                iv.max_connections,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            InnodbBufPoolSizeTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.innodb_buffer_pool_size,
                self.hp_alloc,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            TableOpenCacheTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.table_open_cache,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            KeyBufferSizeTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.key_buffer_size,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            TableDefinitionCacheTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.table_definition_cache,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            InnodbFlushNeighborsTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.innodb_flush_neighbors,
                self.storage,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            InnodbBufPoolInstsTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.innodb_buffer_pool_instances,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            InnodbIoCapacityMaxTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.innodb_io_capacity_max,
                self.io_tx.subscribe(),
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            TableOpenCacheInstsTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.table_open_cache_instances,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            InnodbIoCapacityTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.innodb_io_capacity,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            InnodbLogBufferSizeTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.innodb_log_buffer_size,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
        self.spawn(
            scope,
            InnodbLogFileSizeTuner::new(
                scope.clone(),
                self.db.clone(),
                iv.innodb_log_file_size,
                Arc::clone(&self.notify),
                self.persist.clone(),
            ),
        );
    }

    /// Supervise one tuner; a crashed loop restarts from a fresh clone
    fn spawn<T>(&self, scope: &CancellationToken, tuner: T)
    where
        T: Tuner + Clone + 'static,
    {
        spawn_supervised(tuner.name(), scope.clone(), move || {
            let mut tuner = tuner.clone();
            async move { tuner.run().await }
        });
    }
}

fn ensure_tune_file(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tune_period() {
        assert_eq!(tune_period(0), Duration::from_secs(DEFAULT_TUNE_INTERVAL));
        assert_eq!(tune_period(90), Duration::from_secs(90));
    }

    #[test]
    fn test_cpu_count_positive() {
        assert!(cpu_count() >= 1);
    }

    #[test]
    fn test_ensure_tune_file_creates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune.cnf");
        ensure_tune_file(&path).unwrap();
        assert!(path.exists());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        // Idempotent on an existing file.
        ensure_tune_file(&path).unwrap();
    }
}
