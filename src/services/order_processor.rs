use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::entities::order::{DeliveryResult, DeliveryStatus, LineItem, Model as OrderModel, OrderStatus};
use crate::entities::payment_session::{self, CustomerInfo, SessionMetadata};
use crate::errors::ServiceError;
use crate::events::{outbox, Event};
use crate::services::agent_content::ContentResolver;
use crate::services::notifications::{EmailSender, PurchaseEmail};
use crate::services::orders::{NewOrder, OrderService};
use crate::services::payments::{generate_order_id, ProviderKind};
use crate::services::template_access::TemplateAccessService;

/// Normalized payment-succeeded event. Built from the Session Registry
/// snapshot so the processor never branches on provider payloads.
#[derive(Debug, Clone)]
pub struct PaymentSucceeded {
    pub external_payment_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub items: Vec<LineItem>,
    pub customer: CustomerInfo,
    pub metadata: SessionMetadata,
    pub provider: ProviderKind,
    pub payment_method: Option<String>,
}

impl PaymentSucceeded {
    pub fn from_session(session: &payment_session::Model, provider: ProviderKind) -> Self {
        let mut metadata = session.metadata.clone();
        if metadata.order_id.is_none() {
            metadata.order_id = Some(session.internal_order_id.clone());
        }
        Self {
            external_payment_id: session
                .provider_payment_id
                .clone()
                .or_else(|| Some(session.provider_session_id.clone())),
            amount: session.amount,
            currency: session.currency.clone(),
            items: session.items.0.clone(),
            customer: session.customer_info.clone(),
            metadata,
            provider,
            payment_method: Some(provider.as_ref().to_string()),
        }
    }

    /// Customer e-mail first, then the one passed in checkout metadata.
    pub fn resolved_email(&self) -> Option<String> {
        [self.customer.email.as_deref(), self.metadata.email.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|e| !e.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredTemplate {
    pub agent_id: String,
    pub title: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedOrder {
    /// False only when every delivery attempt failed.
    pub success: bool,
    pub order_id: String,
    pub delivery_status: DeliveryStatus,
    pub delivery_results: Vec<DeliveryResult>,
    pub templates: Vec<DeliveredTemplate>,
    #[serde(skip)]
    pub order: OrderModel,
    #[serde(skip)]
    pub created: bool,
}

impl ProcessedOrder {
    fn new(order: OrderModel, created: bool, templates: Vec<DeliveredTemplate>) -> Self {
        let delivery_status = order.delivery_status();
        Self {
            success: delivery_status != DeliveryStatus::Failed,
            order_id: order.id.clone(),
            delivery_status,
            delivery_results: order.delivery_results.0.clone(),
            templates,
            order,
            created,
        }
    }
}

/// Turns successful payments into orders with delivered template access.
#[derive(Clone)]
pub struct OrderProcessor {
    db: Arc<DatabaseConnection>,
    orders: OrderService,
    tokens: TemplateAccessService,
    content: Arc<dyn ContentResolver>,
    email: Arc<dyn EmailSender>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl OrderProcessor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: OrderService,
        tokens: TemplateAccessService,
        content: Arc<dyn ContentResolver>,
        email: Arc<dyn EmailSender>,
    ) -> Self {
        Self {
            db,
            orders,
            tokens,
            content,
            email,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    /// Runs `f` while holding the in-process lock for `order_id`.
    async fn with_order_lock<T, F>(&self, order_id: &str, f: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let lock = self
            .locks
            .entry(order_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let out = {
            let _guard = lock.lock().await;
            f.await
        };
        drop(lock);
        self.locks
            .remove_if(order_id, |_, l| Arc::strong_count(l) == 1);
        out
    }

    #[instrument(skip(self, event), fields(provider = %event.provider))]
    pub async fn process(&self, event: PaymentSucceeded) -> Result<ProcessedOrder, ServiceError> {
        let order_id = event
            .metadata
            .order_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_order_id);

        self.with_order_lock(&order_id, self.process_locked(order_id.clone(), event))
            .await
    }

    async fn process_locked(
        &self,
        order_id: String,
        event: PaymentSucceeded,
    ) -> Result<ProcessedOrder, ServiceError> {
        let email = event.resolved_email();
        let initial_status = match (&email, event.metadata.skip_email_sending) {
            (None, _) => DeliveryStatus::Skipped,
            (Some(_), true) => DeliveryStatus::SkippedByFlag,
            (Some(_), false) => DeliveryStatus::Pending,
        };
        if email.is_none() {
            warn!(%order_id, "no e-mail on payment, delivery skipped");
        }

        let (order, created) = self
            .orders
            .create_if_absent(NewOrder {
                id: order_id.clone(),
                user_id: event.customer.user_id.clone(),
                user_email: email,
                items: event.items.clone(),
                total: event.amount,
                currency: event.currency.clone(),
                payment_id: event.external_payment_id.clone(),
                payment_method: event.payment_method.clone(),
                provider: Some(event.provider.as_ref().to_string()),
                delivery_status: initial_status,
            })
            .await?;

        if created {
            counter!("marketplace.orders.created", 1, "provider" => event.provider.as_ref().to_string());
            outbox::enqueue_best_effort(
                self.db.as_ref(),
                Event::OrderCreated {
                    order_id: order_id.clone(),
                    provider: event.provider.as_ref().to_string(),
                },
            )
            .await;
        }

        self.deliver_outstanding(order, created).await
    }

    /// Retries delivery for items of an existing order that have no
    /// successful result.
    #[instrument(skip(self))]
    pub async fn redeliver(&self, order_id: &str) -> Result<ProcessedOrder, ServiceError> {
        self.with_order_lock(order_id, async {
            let order = self.orders.require_order(order_id).await?;
            self.deliver_outstanding(order, false).await
        })
        .await
    }

    async fn deliver_outstanding(
        &self,
        order: OrderModel,
        created: bool,
    ) -> Result<ProcessedOrder, ServiceError> {
        let status = order.delivery_status();
        let completed = order.status == OrderStatus::Completed.as_ref();

        match status {
            DeliveryStatus::Completed => {
                info!(order_id = %order.id, "order already delivered");
                return Ok(ProcessedOrder::new(order, created, Vec::new()));
            }
            DeliveryStatus::Skipped | DeliveryStatus::SkippedByFlag => {
                let order = if completed {
                    order
                } else {
                    let results = order.delivery_results.clone();
                    self.orders.record_delivery(order, status, results).await?
                };
                return Ok(ProcessedOrder::new(order, created, Vec::new()));
            }
            DeliveryStatus::Pending | DeliveryStatus::Partial | DeliveryStatus::Failed => {}
        }

        let Some(email) = order.user_email.clone() else {
            let results = order.delivery_results.clone();
            let order = self
                .orders
                .record_delivery(order, DeliveryStatus::Skipped, results)
                .await?;
            return Ok(ProcessedOrder::new(order, created, Vec::new()));
        };

        let outstanding: Vec<LineItem> = order
            .items
            .0
            .iter()
            .filter(|item| !order.delivery_results.succeeded(&item.item_id))
            .cloned()
            .collect();

        let attempts = join_all(
            outstanding
                .iter()
                .map(|item| self.deliver_item(&order, item, &email)),
        )
        .await;

        let mut results = order.delivery_results.clone();
        let mut templates = Vec::new();
        let mut fresh = Vec::with_capacity(attempts.len());
        for (result, template) in attempts {
            fresh.push(result);
            templates.extend(template);
        }
        let delivered = fresh.iter().filter(|r| r.success).count();
        let failed = fresh.len() - delivered;
        results.merge(fresh);

        let next_status = DeliveryStatus::from_results(&results.0);
        let order_id = order.id.clone();
        let order = self.orders.record_delivery(order, next_status, results).await?;

        counter!("marketplace.deliveries", delivered as u64, "outcome" => "delivered");
        counter!("marketplace.deliveries", failed as u64, "outcome" => "failed");
        info!(%order_id, delivery_status = %next_status, delivered, failed, "order delivery recorded");
        outbox::enqueue_best_effort(
            self.db.as_ref(),
            Event::OrderDelivered {
                order_id,
                delivery_status: next_status,
                delivered,
                failed,
            },
        )
        .await;

        Ok(ProcessedOrder::new(order, created, templates))
    }

    /// Resolve content, mint a token, send the e-mail. Any failure becomes a
    /// failed result for this item only.
    async fn deliver_item(
        &self,
        order: &OrderModel,
        item: &LineItem,
        email: &str,
    ) -> (DeliveryResult, Option<DeliveredTemplate>) {
        let template = match self.content.resolve(&item.item_id).await {
            Ok(template) => template,
            Err(e) => {
                warn!(order_id = %order.id, agent_id = %item.item_id, error = %e, "content unavailable");
                return (DeliveryResult::failed(&item.item_id, e.to_string()), None);
            }
        };

        let token = match self
            .tokens
            .mint(&order.id, &item.item_id, order.user_id.as_deref(), email)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!(order_id = %order.id, agent_id = %item.item_id, error = %e, "token mint failed");
                return (DeliveryResult::failed(&item.item_id, e.to_string()), None);
            }
        };

        let delivered = DeliveredTemplate {
            agent_id: item.item_id.clone(),
            title: template.title.clone(),
            download_url: self.tokens.download_url(&item.item_id, &order.id, &token.token),
            expires_at: token.expires_at,
        };

        let message = PurchaseEmail {
            to: email.to_string(),
            order_id: order.id.clone(),
            agent_id: item.item_id.clone(),
            agent_title: template.title,
            download_url: delivered.download_url.clone(),
            expires_at: token.expires_at,
        };
        match self.email.send_agent_purchase_email(&message).await {
            Ok(message_id) => (
                DeliveryResult::delivered(&item.item_id, message_id),
                Some(delivered),
            ),
            Err(e) => {
                warn!(order_id = %order.id, agent_id = %item.item_id, error = %e, "delivery e-mail failed");
                (DeliveryResult::failed(&item.item_id, e.to_string()), Some(delivered))
            }
        }
    }
}
