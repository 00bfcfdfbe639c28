pub mod health;
pub mod invoices;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;
pub mod templates;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::errors::ServiceError;
use crate::services::agent_content::{ContentResolver, DbContentResolver};
use crate::services::invoicing::InvoiceService;
use crate::services::notifications::{email_sender_from_config, EmailSender};
use crate::services::order_processor::OrderProcessor;
use crate::services::orders::OrderService;
use crate::services::payments::PaymentService;
use crate::services::session_registry::SessionRegistry;
use crate::services::template_access::TemplateAccessService;
use crate::webhooks::WebhookRouter;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub payments: PaymentService,
    pub webhooks: WebhookRouter,
    pub processor: OrderProcessor,
    pub orders: OrderService,
    pub invoices: InvoiceService,
    pub tokens: TemplateAccessService,
    pub content: Arc<dyn ContentResolver>,
}

impl AppServices {
    /// Wires every service over one pool with the given delivery collaborators.
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        email: Arc<dyn EmailSender>,
        content: Arc<dyn ContentResolver>,
    ) -> Result<Self, ServiceError> {
        let sessions = SessionRegistry::new(db_pool.clone());
        let invoices = InvoiceService::new(db_pool.clone());
        let tokens = TemplateAccessService::new(db_pool.clone(), &config.delivery);
        let orders = OrderService::new(db_pool.clone());

        let payments = PaymentService::from_config(
            config,
            db_pool.clone(),
            sessions,
            invoices.clone(),
            tokens.clone(),
        )?;
        let processor = OrderProcessor::new(
            db_pool.clone(),
            orders.clone(),
            tokens.clone(),
            content.clone(),
            email,
        );
        let webhooks = WebhookRouter::new(
            db_pool,
            payments.clone(),
            processor.clone(),
            invoices.clone(),
        );

        Ok(Self {
            payments,
            webhooks,
            processor,
            orders,
            invoices,
            tokens,
            content,
        })
    }

    /// Production wiring: e-mail backend from config, content from `agents`.
    pub fn from_config(db_pool: Arc<DbPool>, config: &AppConfig) -> Result<Self, ServiceError> {
        let email = email_sender_from_config(&config.email, config)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let content: Arc<dyn ContentResolver> = Arc::new(DbContentResolver::new(db_pool.clone()));
        Self::new(db_pool, config, email, content)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Guards refunds, revocations, redelivery and invoice updates.
///
/// Without a configured key the admin routes are open in development only.
pub async fn require_admin_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let presented = request
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match (state.config.admin_api_key.as_deref(), presented) {
        (Some(expected), Some(given)) if constant_time_eq(expected, given) => {}
        (None, _) if state.config.is_development() => {}
        _ => {
            warn!(path = %request.uri().path(), "admin request rejected");
            return Err(ServiceError::Unauthorized("admin key required".into()));
        }
    }
    Ok(next.run(request).await)
}
