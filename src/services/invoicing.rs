use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::invoice::{self, Column, Entity as Invoice, InvoiceStatus, Model};
use crate::entities::{order, payment_session};
use crate::errors::{is_unique_violation, ServiceError};
use crate::events::{outbox, Event};

const MAX_NUMBER_ATTEMPTS: usize = 5;
const MAX_PAGE_SIZE: u64 = 200;

/// Result of `create_invoice`. `created` is false when the order already had one.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedInvoice {
    pub invoice: Model,
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub created: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceFilters {
    pub status: Option<String>,
    pub customer_email: Option<String>,
    pub order_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Derives invoices from completed orders.
#[derive(Clone)]
pub struct InvoiceService {
    db: Arc<DatabaseConnection>,
}

pub fn invoice_number_prefix(at: DateTime<Utc>) -> String {
    format!("INV-{}-", at.format("%Y%m%d"))
}

fn next_sequence(last_number: Option<&str>, prefix: &str) -> u32 {
    last_number
        .and_then(|n| n.strip_prefix(prefix))
        .and_then(|seq| seq.parse::<u32>().ok())
        .map_or(1, |seq| seq + 1)
}

fn escape_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

impl InvoiceService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: Uuid) -> Result<Model, ServiceError> {
        Invoice::find_by_id(id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("invoice {id} not found")))
    }

    pub async fn get_by_order(&self, order_id: &str) -> Result<Option<Model>, ServiceError> {
        Ok(Invoice::find()
            .filter(Column::OrderId.eq(order_id))
            .one(self.db.as_ref())
            .await?)
    }

    async fn next_invoice_number(&self, now: DateTime<Utc>) -> Result<String, ServiceError> {
        let prefix = invoice_number_prefix(now);
        let last = Invoice::find()
            .filter(Column::InvoiceNumber.starts_with(&prefix))
            .order_by_desc(Column::InvoiceNumber)
            .one(self.db.as_ref())
            .await?;
        let seq = next_sequence(last.as_ref().map(|m| m.invoice_number.as_str()), &prefix);
        Ok(format!("{prefix}{seq:06}"))
    }

    /// Issues the invoice for a paid order. Calling it again for the same
    /// order returns the existing invoice.
    #[instrument(skip(self, order, session), fields(order_id = %order.id))]
    pub async fn create_invoice(
        &self,
        order: &order::Model,
        session: Option<&payment_session::Model>,
        customer_name: Option<String>,
    ) -> Result<IssuedInvoice, ServiceError> {
        if let Some(existing) = self.get_by_order(&order.id).await? {
            return Ok(Self::issued(existing, false));
        }

        let tax_amount = session
            .and_then(|s| s.tax_amount)
            .unwrap_or(Decimal::ZERO)
            .min(order.total);
        let subtotal = order.total - tax_amount;
        let metadata = json!({
            "providerSessionId": session.map(|s| s.provider_session_id.clone()),
            "taxRate": session.and_then(|s| s.tax_rate),
            "originalAmount": session.and_then(|s| s.original_amount),
            "originalCurrency": session.and_then(|s| s.original_currency.clone()),
            "paymentMethod": order.payment_method,
        });

        for attempt in 1..=MAX_NUMBER_ATTEMPTS {
            let now = Utc::now();
            let invoice_number = self.next_invoice_number(now).await?;
            let model = invoice::ActiveModel {
                id: Set(Uuid::new_v4()),
                invoice_number: Set(invoice_number.clone()),
                order_id: Set(order.id.clone()),
                payment_id: Set(order.payment_id.clone()),
                provider: Set(order.provider.clone()),
                customer_email: Set(order.user_email.clone()),
                customer_name: Set(customer_name.clone()),
                items: Set(order.items.clone()),
                subtotal: Set(subtotal),
                tax_amount: Set(tax_amount),
                total: Set(order.total),
                currency: Set(order.currency.clone()),
                status: Set(InvoiceStatus::Paid.to_string()),
                issued_at: Set(now),
                paid_at: Set(Some(now)),
                metadata: Set(metadata.clone()),
                created_at: Set(now),
                updated_at: Set(now),
            };

            match model.insert(self.db.as_ref()).await {
                Ok(created) => {
                    info!(invoice_number = %created.invoice_number, total = %created.total, "invoice issued");
                    metrics::counter!("marketplace.invoices.created", 1);
                    outbox::enqueue_best_effort(
                        self.db.as_ref(),
                        Event::InvoiceCreated {
                            invoice_id: created.id,
                            invoice_number: created.invoice_number.clone(),
                            order_id: created.order_id.clone(),
                        },
                    )
                    .await;
                    return Ok(Self::issued(created, true));
                }
                Err(e) if is_unique_violation(&e) => {
                    // Either another writer invoiced this order, or took the number.
                    if let Some(existing) = self.get_by_order(&order.id).await? {
                        return Ok(Self::issued(existing, false));
                    }
                    warn!(attempt, %invoice_number, "invoice number taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ServiceError::Conflict(format!(
            "could not allocate an invoice number for order {}",
            order.id
        )))
    }

    fn issued(invoice: Model, created: bool) -> IssuedInvoice {
        IssuedInvoice {
            invoice_id: invoice.id,
            invoice_number: invoice.invoice_number.clone(),
            invoice,
            created,
        }
    }

    /// Sets the status and merges `metadata` keys into the stored metadata.
    #[instrument(skip(self, metadata))]
    pub async fn update_invoice_status(
        &self,
        id: Uuid,
        status: &str,
        metadata: Option<Value>,
    ) -> Result<Model, ServiceError> {
        let status: InvoiceStatus = status.trim().parse().map_err(|_| {
            ServiceError::ValidationError(format!(
                "unknown invoice status '{status}', expected one of paid, pending, overdue, cancelled, refunded, disputed"
            ))
        })?;
        let current = self.get(id).await?;
        self.apply_status(current, status, metadata).await
    }

    async fn apply_status(
        &self,
        current: Model,
        status: InvoiceStatus,
        metadata: Option<Value>,
    ) -> Result<Model, ServiceError> {
        let now = Utc::now();
        let mut merged = match current.metadata.clone() {
            Value::Object(stored) => stored,
            _ => serde_json::Map::new(),
        };
        if let Some(Value::Object(updates)) = metadata {
            merged.extend(updates);
        }
        merged.insert(format!("{}At", status.as_ref()), json!(now));

        let paid_at = match (status, current.paid_at) {
            (InvoiceStatus::Paid, None) => Some(now),
            (_, existing) => existing,
        };

        let mut model: invoice::ActiveModel = current.into();
        model.status = Set(status.to_string());
        model.metadata = Set(Value::Object(merged));
        model.paid_at = Set(paid_at);
        model.updated_at = Set(now);
        Ok(model.update(self.db.as_ref()).await?)
    }

    /// Marks the order's invoice refunded. Returns `None` when no invoice exists.
    pub async fn mark_refunded_for_order(&self, order_id: &str) -> Result<Option<Model>, ServiceError> {
        match self.get_by_order(order_id).await? {
            Some(current) if current.status() == Some(InvoiceStatus::Refunded) => Ok(Some(current)),
            Some(current) => Ok(Some(
                self.apply_status(current, InvoiceStatus::Refunded, None).await?,
            )),
            None => Ok(None),
        }
    }

    fn filtered(filters: &InvoiceFilters) -> Result<sea_orm::Select<Invoice>, ServiceError> {
        let mut query = Invoice::find();
        if let Some(status) = filters.status.as_deref() {
            let status: InvoiceStatus = status
                .parse()
                .map_err(|_| ServiceError::ValidationError(format!("unknown invoice status '{status}'")))?;
            query = query.filter(Column::Status.eq(status.to_string()));
        }
        if let Some(email) = &filters.customer_email {
            query = query.filter(Column::CustomerEmail.eq(email.as_str()));
        }
        if let Some(order_id) = &filters.order_id {
            query = query.filter(Column::OrderId.eq(order_id.as_str()));
        }
        if let Some(from) = filters.from {
            query = query.filter(Column::IssuedAt.gte(from));
        }
        if let Some(to) = filters.to {
            query = query.filter(Column::IssuedAt.lte(to));
        }
        Ok(query.order_by_desc(Column::IssuedAt))
    }

    /// Returns one page of invoices (1-based) and the total match count.
    pub async fn search(
        &self,
        filters: &InvoiceFilters,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<Model>, u64), ServiceError> {
        let per_page = per_page.clamp(1, MAX_PAGE_SIZE);
        let paginator = Self::filtered(filters)?.paginate(self.db.as_ref(), per_page);
        let total = paginator.num_items().await?;
        let invoices = paginator.fetch_page(page.max(1) - 1).await?;
        Ok((invoices, total))
    }

    pub async fn export_csv(&self, filters: &InvoiceFilters) -> Result<String, ServiceError> {
        let invoices = Self::filtered(filters)?.all(self.db.as_ref()).await?;
        let mut lines = Vec::with_capacity(invoices.len() + 1);
        lines.push(
            "invoice_number,order_id,status,customer_email,customer_name,subtotal,tax_amount,total,currency,issued_at,paid_at"
                .to_string(),
        );
        for inv in invoices {
            let row = [
                inv.invoice_number,
                inv.order_id,
                inv.status,
                inv.customer_email.unwrap_or_default(),
                inv.customer_name.unwrap_or_default(),
                inv.subtotal.round_dp(2).to_string(),
                inv.tax_amount.round_dp(2).to_string(),
                inv.total.round_dp(2).to_string(),
                inv.currency,
                inv.issued_at.to_rfc3339(),
                inv.paid_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ];
            lines.push(row.iter().map(|f| escape_field(f)).collect::<Vec<_>>().join(","));
        }
        Ok(lines.join("\n"))
    }
}
