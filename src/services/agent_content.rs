use async_trait::async_trait;
use sea_orm::{DatabaseConnection, EntityTrait};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::entities::agent;
use crate::errors::ServiceError;

/// Deliverable body of an agent listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum TemplateContent {
    Text(String),
    Json(Value),
}

impl TemplateContent {
    /// Stored templates that parse as a JSON object or array are treated as JSON.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value @ (Value::Object(_) | Value::Array(_))) => TemplateContent::Json(value),
            _ => TemplateContent::Text(raw.to_string()),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            TemplateContent::Text(text) => text.clone(),
            TemplateContent::Json(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }

    pub fn as_json(&self) -> Value {
        match self {
            TemplateContent::Text(text) => Value::String(text.clone()),
            TemplateContent::Json(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTemplate {
    pub agent_id: String,
    pub title: String,
    pub content: TemplateContent,
}

#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn resolve(&self, agent_id: &str) -> Result<AgentTemplate, ServiceError>;
}

/// Resolves deliverables from the `agents` table.
pub struct DbContentResolver {
    db: Arc<DatabaseConnection>,
}

impl DbContentResolver {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ContentResolver for DbContentResolver {
    #[instrument(skip(self))]
    async fn resolve(&self, agent_id: &str) -> Result<AgentTemplate, ServiceError> {
        let listing = agent::Entity::find_by_id(agent_id.to_string())
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::ContentUnavailable(format!("agent {agent_id} not found")))?;

        if !listing.is_active {
            return Err(ServiceError::ContentUnavailable(format!(
                "agent {agent_id} is not active"
            )));
        }

        let raw = listing
            .template
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::ContentUnavailable(format!("agent {agent_id} has no template"))
            })?;

        debug!(agent_id, bytes = raw.len(), "resolved agent template");
        Ok(AgentTemplate {
            agent_id: listing.id,
            title: listing.title,
            content: TemplateContent::parse(&raw),
        })
    }
}
