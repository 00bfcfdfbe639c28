use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use std::sync::Arc;
use tracing::info;

use crate::entities::webhook_event::{self, Entity as WebhookEvent};
use crate::errors::{is_unique_violation, ServiceError};

use super::NormalizedWebhook;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResult {
    Inserted,
    AlreadyExists,
}

/// Dedup ledger keyed by `(provider, event_id)`. The row is written before
/// any mutation, so the insert itself is the claim.
#[derive(Clone)]
pub struct WebhookLedger {
    db: Arc<DatabaseConnection>,
}

impl WebhookLedger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn record(&self, webhook: &NormalizedWebhook) -> Result<SaveResult, ServiceError> {
        let row = webhook_event::ActiveModel {
            provider: Set(webhook.provider.as_ref().to_string()),
            event_id: Set(webhook.event_id.clone()),
            event_type: Set(webhook.event_type.clone()),
            provider_session_id: Set(webhook.provider_session_id.clone()),
            received_at: Set(Utc::now()),
        };

        match row.insert(self.db.as_ref()).await {
            Ok(_) => Ok(SaveResult::Inserted),
            Err(e) if is_unique_violation(&e) => {
                info!(provider = %webhook.provider, event_id = %webhook.event_id, "duplicate webhook ignored");
                metrics::counter!("marketplace.webhooks.duplicates", 1, "provider" => webhook.provider.as_ref().to_string());
                Ok(SaveResult::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn contains(&self, provider: &str, event_id: &str) -> Result<bool, ServiceError> {
        Ok(WebhookEvent::find_by_id((provider.to_string(), event_id.to_string()))
            .one(self.db.as_ref())
            .await?
            .is_some())
    }
}
