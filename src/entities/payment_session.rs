use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::order::LineItems;

/// Session Registry row: one provider checkout correlated to an internal order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_sessions")]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub provider_session_id: String,
    pub provider: String,
    #[sea_orm(indexed)]
    pub internal_order_id: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount: Decimal,
    pub currency: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub original_amount: Option<Decimal>,
    pub original_currency: Option<String>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub tax_amount: Option<Decimal>,
    #[sea_orm(column_type = "Decimal(Some((6, 4)))")]
    pub tax_rate: Option<Decimal>,
    #[sea_orm(column_type = "Json")]
    pub items: LineItems,
    #[sea_orm(column_type = "Json")]
    pub customer_info: CustomerInfo,
    #[sea_orm(column_type = "Json")]
    pub metadata: SessionMetadata,
    pub status: String,
    pub provider_payment_id: Option<String>,
    pub payment_url: Option<String>,
    pub last_provider_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Customer snapshot taken at checkout. Only these fields are ever persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// ISO 3166-1 alpha-2, used for VAT.
    #[serde(default)]
    pub country_code: Option<String>,
}

/// Allow-listed checkout metadata. Unknown keys sent by clients are dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub skip_email_sending: bool,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub coupon_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Confirmed,
    Success,
    Failed,
    Cancelled,
    Refunded,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Success
                | SessionStatus::Failed
                | SessionStatus::Cancelled
                | SessionStatus::Refunded
        )
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// Non-terminal states may move anywhere. Among terminal states only a
    /// refund of a successful payment is allowed.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        if *self == next {
            return false;
        }
        match self {
            SessionStatus::Created | SessionStatus::Confirmed => true,
            SessionStatus::Success => next == SessionStatus::Refunded,
            SessionStatus::Failed | SessionStatus::Cancelled | SessionStatus::Refunded => false,
        }
    }
}

impl Model {
    pub fn status(&self) -> SessionStatus {
        self.status.parse().unwrap_or(SessionStatus::Created)
    }
}
