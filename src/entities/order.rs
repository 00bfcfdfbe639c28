use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    #[sea_orm(column_type = "Json")]
    pub items: LineItems,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total: Decimal,
    pub currency: String,
    pub status: String,
    pub payment_id: Option<String>,
    pub payment_method: Option<String>,
    pub provider: Option<String>,
    pub delivery_status: String,
    #[sea_orm(column_type = "Json")]
    pub delivery_results: DeliveryResults,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// One purchased listing as captured at checkout time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub item_id: String,
    pub title: String,
    pub unit_price: Decimal,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(transparent)]
pub struct LineItems(pub Vec<LineItem>);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub item_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn delivered(item_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            success: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn failed(item_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(transparent)]
pub struct DeliveryResults(pub Vec<DeliveryResult>);

impl DeliveryResults {
    /// Replaces the result for each item present in `updates`, keeping the rest.
    pub fn merge(&mut self, updates: Vec<DeliveryResult>) {
        for update in updates {
            match self.0.iter_mut().find(|r| r.item_id == update.item_id) {
                Some(existing) => *existing = update,
                None => self.0.push(update),
            }
        }
    }

    pub fn succeeded(&self, item_id: &str) -> bool {
        self.0.iter().any(|r| r.item_id == item_id && r.success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Skipped,
    SkippedByFlag,
    Completed,
    Partial,
    Failed,
}

impl DeliveryStatus {
    /// Derives the aggregate status from per-item results.
    ///
    /// Suppressed delivery (`Skipped`/`SkippedByFlag`) is decided before any
    /// result exists and is never produced here.
    pub fn from_results(results: &[DeliveryResult]) -> Self {
        if results.is_empty() {
            return DeliveryStatus::Pending;
        }
        let delivered = results.iter().filter(|r| r.success).count();
        if delivered == results.len() {
            DeliveryStatus::Completed
        } else if delivered > 0 {
            DeliveryStatus::Partial
        } else {
            DeliveryStatus::Failed
        }
    }
}

impl Model {
    pub fn delivery_status(&self) -> DeliveryStatus {
        self.delivery_status
            .parse()
            .unwrap_or(DeliveryStatus::Pending)
    }
}
