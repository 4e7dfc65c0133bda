//! Generic webhook transport

use serde::Serialize;

use super::Notifier;
use crate::error::{Error, Result};

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    content: &'a str,
}

/// Posts notifications as JSON to an arbitrary HTTP endpoint
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, subject: &str, content: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { subject, content })
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Notify(format!(
                "webhook returned an unexpected response: {body}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let payload = WebhookPayload {
            subject: "s",
            content: "c",
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"subject":"s","content":"c"}"#);
    }
}
