//! Slack webhook transport

use serde::Serialize;

use super::Notifier;
use crate::error::{Error, Result};

#[derive(Serialize)]
struct SlackPayload {
    text: String,
}

/// Posts notifications to a Slack incoming webhook
pub struct SlackNotifier {
    url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, subject: &str, content: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&SlackPayload {
                text: format!("{subject}\n\n{content}"),
            })
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Notify(format!(
                "slack webhook returned an unexpected response: {body}"
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
        let payload = SlackPayload {
            text: "subject\n\ncontent".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"text":"subject\n\ncontent"}"#);
    }
}
