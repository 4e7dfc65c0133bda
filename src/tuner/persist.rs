//! Persistent tune writer
//!
//! A single writer task owns the in-memory INI document mirroring every
//! applied change. Tuners only enqueue `(section, key, value)` updates;
//! the writer coalesces them and flushes the whole document on a short
//! timer. Losing updates enqueued after the last flush at shutdown is
//! acceptable, the runtime `SET GLOBAL` stays in effect.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ini::Ini;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Queue capacity between the tuners and the writer
pub const PERSIST_QUEUE_CAPACITY: usize = 10;

const FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// One key update destined for the persistent tune file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSetting {
    pub section: String,
    pub key: String,
    pub value: String,
}

impl PersistedSetting {
    /// A `[mysqld]` setting; the key is the variable name with dashes
    pub fn mysqld(variable: &str, value: String) -> Self {
        Self {
            section: "mysqld".to_string(),
            key: variable.replace('_', "-"),
            value,
        }
    }
}

/// Producer handle for the persistence queue, cheap to clone.
///
/// An unconfigured persistent tune file leaves the handle empty and
/// enqueueing becomes a no-op.
#[derive(Clone, Default)]
pub struct Persistor {
    tx: Option<mpsc::Sender<PersistedSetting>>,
}

impl Persistor {
    pub fn new(tx: mpsc::Sender<PersistedSetting>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn send(&self, setting: PersistedSetting) {
        let Some(tx) = &self.tx else {
            return;
        };

        if tx.send(setting).await.is_err() {
            tracing::warn!("persistence queue closed, setting dropped");
        }
    }
}

/// The writer side of the persistence queue
#[derive(Clone)]
pub struct PersistWriter {
    path: PathBuf,
    rx: Arc<Mutex<mpsc::Receiver<PersistedSetting>>>,
    token: CancellationToken,
}

impl PersistWriter {
    pub fn new(
        path: PathBuf,
        rx: Arc<Mutex<mpsc::Receiver<PersistedSetting>>>,
        token: CancellationToken,
    ) -> Self {
        Self { path, rx, token }
    }

    /// Apply queued settings to the document and flush when dirty, until
    /// cancellation. No final flush on shutdown.
    pub async fn run(&self) {
        let mut doc = match Ini::load_from_file(&self.path) {
            Ok(doc) => doc,
            Err(err) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %err,
                    "loading persistent tune file failed, starting from an empty document"
                );
                Ini::new()
            }
        };

        let mut dirty = false;
        let mut flush = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                msg = async { self.rx.lock().await.recv().await } => {
                    let Some(msg) = msg else { return };
                    doc.with_section(Some(msg.section.as_str()))
                        .set(msg.key.as_str(), msg.value.as_str());
                    dirty = true;
                }
                _ = flush.tick() => {
                    if !dirty {
                        continue;
                    }
                    match doc.write_to_file(&self.path) {
                        Ok(()) => dirty = false,
                        Err(err) => {
                            tracing::error!(
                                path = %self.path.display(),
                                error = %err,
                                "saving persistent tune file failed"
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_mysqld_setting_key() {
        let setting = PersistedSetting::mysqld("max_connections", "256".to_string());
        assert_eq!(setting.section, "mysqld");
        assert_eq!(setting.key, "max-connections");
        assert_eq!(setting.value, "256");
    }

    #[tokio::test]
    async fn test_writer_flushes_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mtuned.cnf");

        let (tx, rx) = mpsc::channel(PERSIST_QUEUE_CAPACITY);
        let token = CancellationToken::new();
        let writer = PersistWriter::new(path.clone(), Arc::new(Mutex::new(rx)), token.clone());

        let handle = tokio::spawn(async move { writer.run().await });

        let persistor = Persistor::new(tx);
        persistor
            .send(PersistedSetting::mysqld("max_connections", "256".to_string()))
            .await;
        persistor
            .send(PersistedSetting::mysqld(
                "innodb_buffer_pool_size",
                "2G".to_string(),
            ))
            .await;
        // The last write per key wins.
        persistor
            .send(PersistedSetting::mysqld("max_connections", "512".to_string()))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap();

        let doc = Ini::load_from_file(&path).unwrap();
        assert_eq!(doc.get_from(Some("mysqld"), "max-connections"), Some("512"));
        assert_eq!(
            doc.get_from(Some("mysqld"), "innodb-buffer-pool-size"),
            Some("2G")
        );
    }

    #[tokio::test]
    async fn test_disabled_persistor_is_noop() {
        let persistor = Persistor::disabled();
        persistor
            .send(PersistedSetting::mysqld("max_connections", "256".to_string()))
            .await;
    }
}
