use axum::http::HeaderMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use sea_orm::DatabaseConnection;
use tracing::{error, info, instrument, warn};

use crate::entities::payment_session::{self, SessionStatus};
use crate::errors::ServiceError;
use crate::events::{outbox, Event};
use crate::services::invoicing::{InvoiceService, IssuedInvoice};
use crate::services::order_processor::{OrderProcessor, PaymentSucceeded, ProcessedOrder};
use crate::services::payments::{PaymentService, ProviderKind, RefundResult};
use crate::services::session_registry::TransitionOutcome;

use super::ledger::{SaveResult, WebhookLedger};
use super::{map_status, NormalizedWebhook, PaymentOutcome};

/// Body returned to the provider. Every parsed webhook is acknowledged.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub received: bool,
    pub duplicate: bool,
    pub event_id: String,
    pub outcome: PaymentOutcome,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

/// Redirect query string. Providers spell the keys differently.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(alias = "sessionId", alias = "token", alias = "payment_intent")]
    pub session_id: String,
    #[serde(default, alias = "paymentId", alias = "PayerID")]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// A successful payment turned into an order and, when possible, an invoice.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettledPayment {
    #[serde(flatten)]
    pub order: ProcessedOrder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<uuid::Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackOutcome {
    pub session_id: String,
    pub order_id: String,
    pub outcome: PaymentOutcome,
    pub session_status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<SettledPayment>,
}

/// Drives the Session Registry, Order Processor and Invoice Generator from
/// provider webhooks, redirect callbacks and API captures.
#[derive(Clone)]
pub struct WebhookRouter {
    db: Arc<DatabaseConnection>,
    payments: PaymentService,
    processor: OrderProcessor,
    invoices: InvoiceService,
    ledger: WebhookLedger,
}

impl WebhookRouter {
    pub fn new(
        db: Arc<DatabaseConnection>,
        payments: PaymentService,
        processor: OrderProcessor,
        invoices: InvoiceService,
    ) -> Self {
        Self {
            ledger: WebhookLedger::new(db.clone()),
            db,
            payments,
            processor,
            invoices,
        }
    }

    /// Verify, parse, dedup, then dispatch. Returns `Unauthorized` or
    /// `BadRequest` before parsing succeeds and an acknowledgement after.
    #[instrument(skip(self, payload, headers), fields(provider = %kind))]
    pub async fn handle_webhook(
        &self,
        kind: ProviderKind,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<WebhookAck, ServiceError> {
        if !self.payments.verify_webhook_signature(kind, payload, headers).await? {
            counter!("marketplace.webhooks.rejected", 1, "provider" => kind.as_ref().to_string());
            warn!("webhook signature verification failed");
            return Err(ServiceError::Unauthorized("invalid webhook signature".into()));
        }

        let webhook = self.payments.parse_webhook(kind, payload)?;
        counter!("marketplace.webhooks.received", 1, "provider" => kind.as_ref().to_string());
        let outcome = map_status(kind, &webhook.raw_status);

        if self.ledger.record(&webhook).await? == SaveResult::AlreadyExists {
            return Ok(WebhookAck {
                received: true,
                duplicate: true,
                event_id: webhook.event_id,
                outcome,
                processed: false,
                order_id: None,
            });
        }

        info!(event_id = %webhook.event_id, event_type = %webhook.event_type, %outcome, "webhook accepted");
        let (processed, order_id) = match self.dispatch(kind, &webhook, outcome).await {
            Ok(order_id) => (true, order_id),
            Err(e) => {
                error!(event_id = %webhook.event_id, error = %e, "webhook processing failed");
                counter!("marketplace.webhooks.failed", 1, "provider" => kind.as_ref().to_string());
                outbox::enqueue_best_effort(
                    self.db.as_ref(),
                    Event::WebhookProcessingFailed {
                        provider: kind.as_ref().to_string(),
                        event_id: Some(webhook.event_id.clone()),
                        session_id: webhook.provider_session_id.clone(),
                        error: e.to_string(),
                    },
                )
                .await;
                (false, None)
            }
        };

        Ok(WebhookAck {
            received: true,
            duplicate: false,
            event_id: webhook.event_id,
            outcome,
            processed,
            order_id,
        })
    }

    async fn dispatch(
        &self,
        kind: ProviderKind,
        webhook: &NormalizedWebhook,
        outcome: PaymentOutcome,
    ) -> Result<Option<String>, ServiceError> {
        let session_id = match (&webhook.provider_session_id, &webhook.provider_payment_id) {
            (Some(session_id), _) => {
                self.session_for(kind, session_id).await?;
                session_id.clone()
            }
            (None, Some(payment_id)) => {
                let Some(session) = self
                    .payments
                    .sessions()
                    .find_by_provider_payment_id(kind, payment_id)
                    .await?
                else {
                    info!(%payment_id, event_type = %webhook.event_type, "no session for payment id");
                    return Ok(None);
                };
                session.provider_session_id
            }
            (None, None) => {
                info!(event_type = %webhook.event_type, "webhook carries no session reference");
                return Ok(None);
            }
        };
        let session_id = session_id.as_str();
        let session = self
            .payments
            .sessions()
            .record_provider_status(
                session_id,
                &webhook.raw_status,
                webhook.provider_payment_id.as_deref(),
            )
            .await?;
        let order_id = Some(session.internal_order_id.clone());

        match outcome {
            PaymentOutcome::Success => {
                self.settle_success(kind, session_id).await?;
            }
            PaymentOutcome::Failed | PaymentOutcome::Cancelled => {
                self.record_unsuccessful(kind, &session, outcome, &webhook.raw_status)
                    .await?;
            }
            PaymentOutcome::Refunded => {
                self.record_refund(&session, webhook).await?;
            }
            PaymentOutcome::Pending => {
                if session.status() == SessionStatus::Created {
                    self.payments
                        .sessions()
                        .update_status(session_id, SessionStatus::Confirmed)
                        .await?;
                }
            }
            PaymentOutcome::Unknown => {}
        }
        Ok(order_id)
    }

    async fn session_for(
        &self,
        kind: ProviderKind,
        session_id: &str,
    ) -> Result<payment_session::Model, ServiceError> {
        let session = self.payments.sessions().require(session_id).await?;
        if session.provider != kind.as_ref() {
            return Err(ServiceError::NotFound(format!("{kind} session {session_id} not found")));
        }
        Ok(session)
    }

    async fn record_unsuccessful(
        &self,
        kind: ProviderKind,
        session: &payment_session::Model,
        outcome: PaymentOutcome,
        raw_status: &str,
    ) -> Result<(), ServiceError> {
        let next = if outcome == PaymentOutcome::Cancelled {
            SessionStatus::Cancelled
        } else {
            SessionStatus::Failed
        };
        let transition = self
            .payments
            .sessions()
            .update_status(&session.provider_session_id, next)
            .await?;
        if matches!(transition, TransitionOutcome::Applied(_)) {
            outbox::enqueue_best_effort(
                self.db.as_ref(),
                Event::PaymentFailed {
                    provider: kind.as_ref().to_string(),
                    session_id: session.provider_session_id.clone(),
                    status: raw_status.to_string(),
                },
            )
            .await;
        }
        Ok(())
    }

    async fn record_refund(
        &self,
        session: &payment_session::Model,
        webhook: &NormalizedWebhook,
    ) -> Result<(), ServiceError> {
        match session.status() {
            SessionStatus::Refunded => {
                info!(session_id = %session.provider_session_id, "refund already recorded");
                Ok(())
            }
            SessionStatus::Success => {
                let refund = RefundResult {
                    refund_id: webhook
                        .refund_id
                        .clone()
                        .or_else(|| webhook.provider_payment_id.clone())
                        .unwrap_or_else(|| webhook.event_id.clone()),
                    status: webhook.raw_status.clone(),
                    amount: webhook.amount.unwrap_or(session.amount),
                    currency: webhook
                        .currency
                        .clone()
                        .unwrap_or_else(|| session.currency.clone())
                        .to_ascii_uppercase(),
                };
                self.payments
                    .apply_refund_bookkeeping(session, refund, "refunded")
                    .await?;
                Ok(())
            }
            other => {
                // Goes through the terminal-status guard, which records the anomaly.
                self.payments
                    .sessions()
                    .update_status(&session.provider_session_id, SessionStatus::Refunded)
                    .await?;
                warn!(session_id = %session.provider_session_id, status = %other, "refund for unpaid session");
                Ok(())
            }
        }
    }

    /// Marks the session paid, runs the Order Processor on the stored
    /// snapshot and issues the invoice. Safe to call repeatedly.
    #[instrument(skip(self), fields(provider = %kind))]
    pub async fn settle_success(
        &self,
        kind: ProviderKind,
        session_id: &str,
    ) -> Result<SettledPayment, ServiceError> {
        let transition = self
            .payments
            .sessions()
            .update_status(session_id, SessionStatus::Success)
            .await?;
        let session = match transition {
            TransitionOutcome::Rejected(session) => {
                return Err(ServiceError::InvalidStatus(format!(
                    "session {session_id} is {} and cannot be settled",
                    session.status
                )));
            }
            TransitionOutcome::Applied(session) => {
                outbox::enqueue_best_effort(
                    self.db.as_ref(),
                    Event::PaymentSucceeded {
                        provider: kind.as_ref().to_string(),
                        session_id: session_id.to_string(),
                        order_id: session.internal_order_id.clone(),
                    },
                )
                .await;
                session
            }
            TransitionOutcome::Unchanged(session) => session,
        };

        let processed = self
            .processor
            .process(PaymentSucceeded::from_session(&session, kind))
            .await?;
        let invoice = self.issue_invoice(kind, &session, &processed).await;

        Ok(SettledPayment {
            invoice_number: invoice.as_ref().map(|i| i.invoice_number.clone()),
            invoice_id: invoice.as_ref().map(|i| i.invoice_id),
            order: processed,
        })
    }

    /// Invoice failures do not undo the order; they are logged and queued.
    async fn issue_invoice(
        &self,
        kind: ProviderKind,
        session: &payment_session::Model,
        processed: &ProcessedOrder,
    ) -> Option<IssuedInvoice> {
        match self
            .invoices
            .create_invoice(&processed.order, Some(session), session.customer_info.name.clone())
            .await
        {
            Ok(invoice) => Some(invoice),
            Err(e) => {
                error!(order_id = %processed.order_id, error = %e, "invoice generation failed");
                outbox::enqueue_best_effort(
                    self.db.as_ref(),
                    Event::WebhookProcessingFailed {
                        provider: kind.as_ref().to_string(),
                        event_id: None,
                        session_id: Some(session.provider_session_id.clone()),
                        error: format!("invoice: {e}"),
                    },
                )
                .await;
                None
            }
        }
    }

    /// API capture/confirm. A successful provider answer settles the order
    /// through the same path as the success webhook.
    pub async fn capture_and_settle(
        &self,
        kind: ProviderKind,
        session_id: &str,
        amount: Option<rust_decimal::Decimal>,
        payment_token: Option<&str>,
    ) -> Result<CallbackOutcome, ServiceError> {
        let capture = self
            .payments
            .confirm_or_capture(kind, session_id, amount, payment_token)
            .await?;
        let outcome = if capture.success {
            PaymentOutcome::Success
        } else {
            map_status(kind, &capture.raw_status)
        };
        self.apply_confirmed_outcome(kind, session_id, outcome, &capture.raw_status)
            .await
    }

    /// Redirect callback. The status in the query string is only a hint; the
    /// outcome is re-confirmed with the provider before anything is settled.
    #[instrument(skip(self, query), fields(provider = %kind, session_id = %query.session_id))]
    pub async fn handle_callback(
        &self,
        kind: ProviderKind,
        query: &CallbackQuery,
    ) -> Result<CallbackOutcome, ServiceError> {
        let session = self.session_for(kind, &query.session_id).await?;
        let claimed = query
            .status
            .as_deref()
            .map(|s| map_status(kind, s))
            .unwrap_or(PaymentOutcome::Unknown);

        if session.status() == SessionStatus::Success {
            return self
                .apply_confirmed_outcome(kind, &query.session_id, PaymentOutcome::Success, "success")
                .await;
        }
        if claimed == PaymentOutcome::Cancelled {
            return self
                .apply_confirmed_outcome(kind, &query.session_id, PaymentOutcome::Cancelled, "cancelled")
                .await;
        }
        if kind == ProviderKind::Wallet {
            // Wallet outcomes only arrive by webhook.
            return Ok(CallbackOutcome {
                session_id: session.provider_session_id.clone(),
                order_id: session.internal_order_id.clone(),
                outcome: PaymentOutcome::Pending,
                session_status: session.status(),
                settlement: None,
            });
        }

        let blob = self.payments.get_status(kind, &query.session_id).await?;
        let raw = blob
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        if kind == ProviderKind::Paypal && raw.eq_ignore_ascii_case("APPROVED") {
            return self.capture_and_settle(kind, &query.session_id, None, None).await;
        }

        let payment_id = blob
            .get("transaction_id")
            .and_then(Value::as_str)
            .or(query.payment_id.as_deref());
        self.payments
            .sessions()
            .record_provider_status(&query.session_id, &raw, payment_id)
            .await?;
        let confirmed = map_status(kind, &raw);
        if claimed != PaymentOutcome::Unknown && claimed != confirmed {
            warn!(claimed = %claimed, confirmed = %confirmed, "callback status disagrees with provider");
        }
        self.apply_confirmed_outcome(kind, &query.session_id, confirmed, &raw)
            .await
    }

    async fn apply_confirmed_outcome(
        &self,
        kind: ProviderKind,
        session_id: &str,
        outcome: PaymentOutcome,
        raw_status: &str,
    ) -> Result<CallbackOutcome, ServiceError> {
        let settlement = match outcome {
            PaymentOutcome::Success => Some(self.settle_success(kind, session_id).await?),
            PaymentOutcome::Failed | PaymentOutcome::Cancelled => {
                let session = self.session_for(kind, session_id).await?;
                self.record_unsuccessful(kind, &session, outcome, raw_status)
                    .await?;
                None
            }
            _ => None,
        };

        let session = self.session_for(kind, session_id).await?;
        Ok(CallbackOutcome {
            session_id: session.provider_session_id.clone(),
            order_id: session.internal_order_id.clone(),
            outcome,
            session_status: session.status(),
            settlement,
        })
    }
}
