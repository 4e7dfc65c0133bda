//! Task supervision
//!
//! Long-running loops (the notification service, the tuner service, the
//! persistence writer, every tuner) run under a supervisor that restarts
//! them when they crash. Restart is immediate and unbounded; cancellation
//! of the shared token short-circuits it.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns `factory`'s future as a supervised task.
///
/// Each run executes in its own `tokio::spawn` so a panic is confined to
/// that run; the supervisor observes it through the join error and starts
/// a fresh run. A run that completes normally is also restarted, unless
/// the token has been cancelled, which ends supervision.
pub fn spawn_supervised<F, Fut>(
    name: impl Into<String>,
    token: CancellationToken,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        loop {
            let run = tokio::spawn(factory());
            match run.await {
                Ok(()) => {}
                Err(err) if err.is_panic() => {
                    tracing::error!(task = %name, error = %err, "task crashed, restarting");
                }
                // The runtime is shutting down; nothing left to supervise.
                Err(_) => return,
            }

            if token.is_cancelled() {
                tracing::debug!(task = %name, "supervision ended");
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_restarts_after_panic() {
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicU32::new(0));

        let factory_runs = Arc::clone(&runs);
        let factory_token = token.clone();
        let handle = spawn_supervised("test", token.clone(), move || {
            let runs = Arc::clone(&factory_runs);
            let token = factory_token.clone();
            async move {
                let n = runs.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    panic!("boom");
                }
                token.cancel();
            }
        });

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        let runs = Arc::new(AtomicU32::new(0));
        let factory_runs = Arc::clone(&runs);
        let handle = spawn_supervised("test", token, move || {
            let runs = Arc::clone(&factory_runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
