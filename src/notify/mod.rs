//! Notification Service
//!
//! A bounded queue of messages drained by one task. Delivery goes through
//! at most one configured transport (e-mail preferred, then Slack, then a
//! generic webhook) and same-subject messages are rate limited according
//! to the configured frequency.

mod email;
mod slack;
mod webhook;

pub use email::EmailNotifier;
pub use slack::SlackNotifier;
pub use webhook::WebhookNotifier;

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Duration as ChronoDuration, Local};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, NotifyFrequency};
use crate::error::Result;

const QUEUE_CAPACITY: usize = 10;
const DAILY_WINDOW_SECS: i64 = 24 * 60 * 60;

/// A notification to be delivered out of band
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub content: String,
    pub time: DateTime<Local>,
}

/// Sends one notification through a concrete transport
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, content: &str) -> Result<()>;
}

/// Notification service
pub struct Service {
    disabled: bool,
    /// Suppression window for same-subject resends; zero means none
    window_secs: i64,
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    /// subject -> time of the last successful delivery
    records: StdMutex<HashMap<String, DateTime<Local>>>,
    sender: Option<Box<dyn Notifier>>,
}

impl Service {
    /// Build the service from the configuration, picking the first
    /// configured transport
    pub fn new(config: &Config) -> Self {
        let notify = &config.notify;
        let sender: Option<Box<dyn Notifier>> = if !notify.email.is_empty() {
            Some(Box::new(EmailNotifier::new(
                notify.email.clone(),
                notify.smtp_username.clone(),
                notify.smtp_password.clone(),
                notify.smtp_host.clone(),
                notify.smtp_port,
            )))
        } else if !notify.slack_webhook.is_empty() {
            Some(Box::new(SlackNotifier::new(notify.slack_webhook.clone())))
        } else if !notify.generic_webhook.is_empty() {
            Some(Box::new(WebhookNotifier::new(
                notify.generic_webhook.clone(),
            )))
        } else {
            None
        };

        Self::with_sender(config.notify_frequency, sender)
    }

    /// Build the service around an explicit sender
    pub fn with_sender(frequency: NotifyFrequency, sender: Option<Box<dyn Notifier>>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        Self {
            disabled: frequency == NotifyFrequency::Never,
            window_secs: match frequency {
                NotifyFrequency::Daily => DAILY_WINDOW_SECS,
                _ => 0,
            },
            tx,
            rx: Mutex::new(rx),
            records: StdMutex::new(HashMap::new()),
            sender,
        }
    }

    /// Enqueue a message for delivery
    pub async fn notify(&self, msg: Message) {
        if self.tx.send(msg).await.is_err() {
            tracing::warn!("notification queue closed, message dropped");
        }
    }

    /// Drain the queue until cancellation
    pub async fn run(&self, token: CancellationToken) {
        let mut rx = self.rx.lock().await;
        loop {
            let msg = tokio::select! {
                _ = token.cancelled() => return,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
            };

            // Disabled or unconfigured services still drain the queue so
            // producers never block forever.
            let Some(sender) = (!self.disabled).then_some(self.sender.as_ref()).flatten() else {
                continue;
            };

            if self.suppressed(&msg) {
                continue;
            }

            tracing::info!(
                subject = %msg.subject,
                content = %msg.content,
                time = %msg.time,
                "[Notify]"
            );

            match sender.send(&msg.subject, &msg.content).await {
                Ok(()) => {
                    self.records
                        .lock()
                        .unwrap()
                        .insert(msg.subject, msg.time);
                }
                Err(err) => {
                    tracing::error!(
                        subject = %msg.subject,
                        error = %err,
                        "failed to send notification"
                    );
                }
            }
        }
    }

    fn suppressed(&self, msg: &Message) -> bool {
        if self.window_secs == 0 {
            return false;
        }

        let records = self.records.lock().unwrap();
        match records.get(&msg.subject) {
            Some(last) => *last + ChronoDuration::seconds(self.window_secs) > msg.time,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    struct RecordingNotifier {
        sent: StdMutex<Vec<String>>,
        fail: StdMutex<bool>,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                fail: StdMutex::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Notifier for Arc<RecordingNotifier> {
        async fn send(&self, subject: &str, _content: &str) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(crate::Error::Notify("transport down".into()));
            }
            self.sent.lock().unwrap().push(subject.to_string());
            Ok(())
        }
    }

    fn message(subject: &str, time: DateTime<Local>) -> Message {
        Message {
            subject: subject.to_string(),
            content: "content".to_string(),
            time,
        }
    }

    async fn drain(service: &Arc<Service>) {
        let token = CancellationToken::new();
        let runner = Arc::clone(service);
        let run_token = token.clone();
        let handle = tokio::spawn(async move { runner.run(run_token).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_daily_suppresses_same_subject() {
        let recorder = Arc::new(RecordingNotifier::new());
        let service = Arc::new(Service::with_sender(
            NotifyFrequency::Daily,
            Some(Box::new(Arc::clone(&recorder))),
        ));

        let now = Local::now();
        service.notify(message("max_connections changed", now)).await;
        service
            .notify(message("max_connections changed", now + ChronoDuration::seconds(5)))
            .await;
        service.notify(message("other subject", now)).await;

        drain(&service).await;
        assert_eq!(
            *recorder.sent.lock().unwrap(),
            vec!["max_connections changed", "other subject"]
        );
    }

    #[tokio::test]
    async fn test_immediate_does_not_suppress() {
        let recorder = Arc::new(RecordingNotifier::new());
        let service = Arc::new(Service::with_sender(
            NotifyFrequency::Immediately,
            Some(Box::new(Arc::clone(&recorder))),
        ));

        let now = Local::now();
        service.notify(message("subject", now)).await;
        service.notify(message("subject", now)).await;

        drain(&service).await;
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_never_discards() {
        let recorder = Arc::new(RecordingNotifier::new());
        let service = Arc::new(Service::with_sender(
            NotifyFrequency::Never,
            Some(Box::new(Arc::clone(&recorder))),
        ));

        service.notify(message("subject", Local::now())).await;
        drain(&service).await;
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_retries_next_time() {
        let recorder = Arc::new(RecordingNotifier::new());
        let service = Arc::new(Service::with_sender(
            NotifyFrequency::Daily,
            Some(Box::new(Arc::clone(&recorder))),
        ));

        *recorder.fail.lock().unwrap() = true;
        service.notify(message("subject", Local::now())).await;
        drain(&service).await;
        assert!(recorder.sent.lock().unwrap().is_empty());

        // The failed send left no record, so the same subject goes out
        // on the next attempt.
        *recorder.fail.lock().unwrap() = false;
        service.notify(message("subject", Local::now())).await;
        drain(&service).await;
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }
}
