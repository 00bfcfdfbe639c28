use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::{AppConfig, EmailConfig};

/// Delivery e-mail for one purchased agent template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseEmail {
    pub to: String,
    pub order_id: String,
    pub agent_id: String,
    pub agent_title: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("email transport failed: {0}")]
    Transport(String),
    #[error("email rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Sends the purchase e-mail and returns the provider message id.
    async fn send_agent_purchase_email(&self, email: &PurchaseEmail) -> Result<String, EmailError>;
}

/// Writes e-mails to the log. Default for development.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_agent_purchase_email(&self, email: &PurchaseEmail) -> Result<String, EmailError> {
        let message_id = format!("log-{}", Uuid::new_v4());
        info!(
            to = %email.to,
            order_id = %email.order_id,
            agent_id = %email.agent_id,
            download_url = %email.download_url,
            message_id = %message_id,
            "purchase e-mail (log backend)"
        );
        Ok(message_id)
    }
}

/// Posts e-mails to a transactional mail API.
pub struct HttpEmailSender {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    from: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(alias = "messageId", alias = "id")]
    message_id: String,
}

impl HttpEmailSender {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        from: String,
        timeout: std::time::Duration,
    ) -> Result<Self, EmailError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmailError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_url,
            api_key,
            from,
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    #[instrument(skip(self, email), fields(order_id = %email.order_id, agent_id = %email.agent_id))]
    async fn send_agent_purchase_email(&self, email: &PurchaseEmail) -> Result<String, EmailError> {
        let mut request = self.client.post(&self.api_url).json(&json!({
            "from": self.from,
            "to": email.to,
            "template": "agent_purchase",
            "data": email,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmailError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Rejected(format!(
                "{}: {}",
                status.as_u16(),
                body.chars().take(256).collect::<String>()
            )));
        }
        let sent: SendResponse = response
            .json()
            .await
            .map_err(|e| EmailError::Transport(e.to_string()))?;
        Ok(sent.message_id)
    }
}

pub fn email_sender_from_config(
    email: &EmailConfig,
    app: &AppConfig,
) -> Result<Arc<dyn EmailSender>, EmailError> {
    match (email.backend.as_str(), email.api_url.as_ref()) {
        ("http", Some(url)) => Ok(Arc::new(HttpEmailSender::new(
            url.clone(),
            email.api_key.clone(),
            email.from_address.clone(),
            app.http_timeout(),
        )?)),
        _ => Ok(Arc::new(LogEmailSender)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn email() -> PurchaseEmail {
        PurchaseEmail {
            to: "buyer@example.com".into(),
            order_id: "ord_1".into(),
            agent_id: "agent-1".into(),
            agent_title: "Research agent".into(),
            download_url: "https://agents.market/api/v1/templates/download/agent-1?orderId=ord_1&token=t".into(),
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn http_sender_returns_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("authorization", "Bearer key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messageId": "m-42"})))
            .expect(1)
            .mount(&server)
            .await;

        let sender = HttpEmailSender::new(
            format!("{}/send", server.uri()),
            Some("key".into()),
            "orders@agents.market".into(),
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(sender.send_agent_purchase_email(&email()).await.unwrap(), "m-42");
    }

    #[tokio::test]
    async fn http_sender_surfaces_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("mailbox unavailable"))
            .mount(&server)
            .await;

        let sender = HttpEmailSender::new(
            server.uri(),
            None,
            "orders@agents.market".into(),
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        let err = sender.send_agent_purchase_email(&email()).await.unwrap_err();
        assert!(err.to_string().contains("mailbox unavailable"));
    }
}
