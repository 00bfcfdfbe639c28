use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::entities::order::{LineItem, LineItems};
use crate::entities::payment_session::{
    self, ActiveModel, Column, CustomerInfo, Entity as PaymentSession, Model, SessionMetadata,
    SessionStatus,
};
use crate::errors::{is_unique_violation, ServiceError};
use crate::events::{outbox, Event};
use crate::services::payments::ProviderKind;

const MAX_STATUS_RETRIES: usize = 3;

/// Everything stored when a checkout is opened.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub provider_session_id: String,
    pub provider: ProviderKind,
    pub internal_order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub original_amount: Option<Decimal>,
    pub original_currency: Option<String>,
    pub tax_amount: Option<Decimal>,
    pub tax_rate: Option<Decimal>,
    pub items: Vec<LineItem>,
    pub customer: CustomerInfo,
    pub metadata: SessionMetadata,
    pub payment_url: Option<String>,
    pub raw_status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(Model),
    /// The session already had the requested status.
    Unchanged(Model),
    /// The session is terminal and the requested status would overwrite it.
    Rejected(Model),
}

impl TransitionOutcome {
    pub fn session(&self) -> &Model {
        match self {
            TransitionOutcome::Applied(m)
            | TransitionOutcome::Unchanged(m)
            | TransitionOutcome::Rejected(m) => m,
        }
    }
}

/// Maps provider session ids to internal orders.
#[derive(Clone)]
pub struct SessionRegistry {
    db: Arc<DatabaseConnection>,
}

impl SessionRegistry {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(session_id = %new.provider_session_id, provider = %new.provider))]
    pub async fn put(&self, new: NewSession) -> Result<Model, ServiceError> {
        let now = Utc::now();
        let model = ActiveModel {
            provider_session_id: Set(new.provider_session_id.clone()),
            provider: Set(new.provider.as_ref().to_string()),
            internal_order_id: Set(new.internal_order_id),
            amount: Set(new.amount),
            currency: Set(new.currency.to_ascii_uppercase()),
            original_amount: Set(new.original_amount),
            original_currency: Set(new.original_currency),
            tax_amount: Set(new.tax_amount),
            tax_rate: Set(new.tax_rate),
            items: Set(LineItems(new.items)),
            customer_info: Set(new.customer),
            metadata: Set(new.metadata),
            status: Set(SessionStatus::Created.to_string()),
            provider_payment_id: Set(None),
            payment_url: Set(new.payment_url),
            last_provider_status: Set(Some(new.raw_status)),
            created_at: Set(now),
            updated_at: Set(now),
            confirmed_at: Set(None),
            paid_at: Set(None),
            failed_at: Set(None),
            cancelled_at: Set(None),
            refunded_at: Set(None),
        };

        model.insert(self.db.as_ref()).await.map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::Conflict(format!(
                    "session {} is already registered",
                    new.provider_session_id
                ))
            } else {
                ServiceError::DatabaseError(e)
            }
        })
    }

    pub async fn get(&self, provider_session_id: &str) -> Result<Option<Model>, ServiceError> {
        Ok(PaymentSession::find_by_id(provider_session_id.to_string())
            .one(self.db.as_ref())
            .await?)
    }

    pub async fn require(&self, provider_session_id: &str) -> Result<Model, ServiceError> {
        self.get(provider_session_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("session {provider_session_id} not found")))
    }

    pub async fn list_by_internal_order_id(&self, order_id: &str) -> Result<Vec<Model>, ServiceError> {
        Ok(PaymentSession::find()
            .filter(Column::InternalOrderId.eq(order_id))
            .order_by_asc(Column::CreatedAt)
            .all(self.db.as_ref())
            .await?)
    }

    /// Looks a session up by the provider's payment (capture or charge) id.
    pub async fn find_by_provider_payment_id(
        &self,
        provider: ProviderKind,
        provider_payment_id: &str,
    ) -> Result<Option<Model>, ServiceError> {
        Ok(PaymentSession::find()
            .filter(Column::Provider.eq(provider.to_string()))
            .filter(Column::ProviderPaymentId.eq(provider_payment_id))
            .one(self.db.as_ref())
            .await?)
    }

    /// Moves a session to `next`, stamping the matching transition timestamp.
    ///
    /// The write is conditional on the status that was read, so a concurrent
    /// writer forces a re-read instead of being silently overwritten.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        provider_session_id: &str,
        next: SessionStatus,
    ) -> Result<TransitionOutcome, ServiceError> {
        for _ in 0..MAX_STATUS_RETRIES {
            let current = self.require(provider_session_id).await?;
            let current_status = current.status();

            if current_status == next {
                return Ok(TransitionOutcome::Unchanged(current));
            }
            if !current_status.can_transition_to(next) {
                warn!(
                    session_id = provider_session_id,
                    current = %current_status,
                    attempted = %next,
                    "refusing to overwrite terminal session status"
                );
                metrics::counter!("marketplace.sessions.anomalies", 1);
                outbox::enqueue_best_effort(
                    self.db.as_ref(),
                    Event::SessionAnomaly {
                        provider: current.provider.clone(),
                        session_id: provider_session_id.to_string(),
                        current_status: current_status.to_string(),
                        attempted_status: next.to_string(),
                    },
                )
                .await;
                return Ok(TransitionOutcome::Rejected(current));
            }

            let now = Utc::now();
            let stamp = match next {
                SessionStatus::Confirmed => Some(Column::ConfirmedAt),
                SessionStatus::Success => Some(Column::PaidAt),
                SessionStatus::Failed => Some(Column::FailedAt),
                SessionStatus::Cancelled => Some(Column::CancelledAt),
                SessionStatus::Refunded => Some(Column::RefundedAt),
                SessionStatus::Created => None,
            };

            let mut update = PaymentSession::update_many()
                .col_expr(Column::Status, Expr::value(next.to_string()))
                .col_expr(Column::UpdatedAt, Expr::value(now));
            if let Some(column) = stamp {
                update = update.col_expr(column, Expr::value(Some(now)));
            }
            let result = update
                .filter(Column::ProviderSessionId.eq(provider_session_id))
                .filter(Column::Status.eq(current.status.clone()))
                .exec(self.db.as_ref())
                .await?;

            if result.rows_affected == 1 {
                info!(
                    session_id = provider_session_id,
                    from = %current_status,
                    to = %next,
                    "session status updated"
                );
                let updated = self.require(provider_session_id).await?;
                return Ok(TransitionOutcome::Applied(updated));
            }
        }

        Err(ServiceError::Conflict(format!(
            "session {provider_session_id} kept changing while updating status"
        )))
    }

    /// Stores the provider's raw status and, when known, its payment id.
    pub async fn record_provider_status(
        &self,
        provider_session_id: &str,
        raw_status: &str,
        provider_payment_id: Option<&str>,
    ) -> Result<Model, ServiceError> {
        let current = self.require(provider_session_id).await?;
        let mut active: payment_session::ActiveModel = current.into();
        active.last_provider_status = Set(Some(raw_status.to_string()));
        if let Some(payment_id) = provider_payment_id {
            active.provider_payment_id = Set(Some(payment_id.to_string()));
        }
        active.updated_at = Set(Utc::now());
        Ok(active.update(self.db.as_ref()).await?)
    }
}
