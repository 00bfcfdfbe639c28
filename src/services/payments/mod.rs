//! Provider adapters and the uniform payment contract built on top of them.
//!
//! Each adapter speaks one provider's HTTP API and converts its payloads at
//! the boundary. [`PaymentService`] owns the bookkeeping that is the same for
//! every provider: Session Registry writes, refund side effects and outbox
//! events.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, EntityTrait};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::entities::agent;
use crate::entities::order::{self, LineItem};
use crate::entities::payment_session::{self, CustomerInfo, SessionMetadata, SessionStatus};
use crate::errors::ServiceError;
use crate::events::{outbox, Event};
use crate::services::invoicing::InvoiceService;
use crate::services::session_registry::{NewSession, SessionRegistry};
use crate::services::template_access::TemplateAccessService;
use crate::webhooks::NormalizedWebhook;

pub mod paypal;
pub mod pricing;
pub mod regional_gateway;
pub mod token_cache;
pub mod wallet;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Paypal,
    Gateway,
    Wallet,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentProviderError {
    #[error("{provider} returned {status}: {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },

    #[error("{provider} request failed: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} authentication failed: {message}")]
    Auth {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} sent an unexpected response: {message}")]
    InvalidResponse {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} cannot {operation}: {message}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
        message: String,
    },
}

/// What an adapter needs to open a checkout at its provider.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub internal_order_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub tax_amount: Decimal,
    pub items: Vec<LineItem>,
    pub customer: CustomerInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSession {
    pub provider_session_id: String,
    pub payment_url: Option<String>,
    /// Client-side secret for wallet sheets; never persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub provider_order_id: String,
    pub raw_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub success: bool,
    pub raw_status: String,
    pub provider_payment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResult {
    pub refund_id: String,
    pub status: String,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub provider: ProviderKind,
    pub authenticated: bool,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One external payment API.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Converts a gross amount into what this provider will actually charge.
    /// Providers that settle in the buyer's currency return it unchanged.
    fn normalize_amount(
        &self,
        amount: Decimal,
        currency: &str,
    ) -> Result<(Decimal, String), PaymentProviderError> {
        Ok((pricing::round_money(amount), currency.to_ascii_uppercase()))
    }

    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<ProviderSession, PaymentProviderError>;

    async fn capture(
        &self,
        session: &payment_session::Model,
        amount: Option<Decimal>,
        payment_token: Option<&str>,
    ) -> Result<CaptureResult, PaymentProviderError>;

    async fn refund(
        &self,
        session: &payment_session::Model,
        amount: Decimal,
        reason: Option<&str>,
    ) -> Result<RefundResult, PaymentProviderError>;

    async fn status(&self, provider_session_id: &str) -> Result<Value, PaymentProviderError>;

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<bool, PaymentProviderError>;

    fn parse_webhook(&self, payload: &[u8]) -> Result<NormalizedWebhook, PaymentProviderError>;

    async fn health_check(&self) -> HealthStatus;
}

pub(crate) fn http_client(
    provider: &'static str,
    config: &AppConfig,
) -> Result<reqwest::Client, PaymentProviderError> {
    reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .map_err(|e| transport(provider, e))
}

pub(crate) fn transport(provider: &'static str, err: reqwest::Error) -> PaymentProviderError {
    PaymentProviderError::Transport {
        provider,
        message: err.to_string(),
    }
}

/// Reads a provider response, turning non-2xx answers into `Api` errors that
/// carry the provider's own message.
pub(crate) async fn decode_response<T: DeserializeOwned>(
    provider: &'static str,
    response: reqwest::Response,
    describe: fn(&Value) -> Option<String>,
) -> Result<T, PaymentProviderError> {
    let status = response.status();
    let body = response.bytes().await.map_err(|e| transport(provider, e))?;

    if !status.is_success() {
        let message = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| describe(&v))
            .unwrap_or_else(|| {
                let text = String::from_utf8_lossy(&body);
                if text.trim().is_empty() {
                    status.canonical_reason().unwrap_or("error").to_string()
                } else {
                    text.chars().take(512).collect()
                }
            });
        return Err(PaymentProviderError::Api {
            provider,
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_slice(&body).map_err(|e| PaymentProviderError::InvalidResponse {
        provider,
        message: e.to_string(),
    })
}

/// Client-facing checkout request after HTTP validation.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub amount: Decimal,
    pub currency: String,
    pub items: Vec<LineItem>,
    pub customer: CustomerInfo,
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub provider: ProviderKind,
    pub session_id: String,
    pub order_id: String,
    pub payment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub original_amount: Decimal,
    pub original_currency: String,
    pub tax_amount: Decimal,
    pub tax_rate: Decimal,
    pub provider_order_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundOutcome {
    #[serde(flatten)]
    pub refund: RefundResult,
    pub session_id: String,
    pub order_id: String,
    pub tokens_revoked: u64,
    pub invoice_refunded: bool,
}

/// Requests the adapter refuses up front are the caller's fault, not the provider's.
fn provider_failure(err: PaymentProviderError) -> ServiceError {
    match err {
        PaymentProviderError::Unsupported { .. } => ServiceError::BadRequest(err.to_string()),
        other => ServiceError::PaymentProvider(other),
    }
}

pub fn generate_order_id() -> String {
    format!("ord_{}", Uuid::new_v4().simple())
}

/// Uniform payment contract over every configured provider.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    providers: HashMap<ProviderKind, Arc<dyn PaymentProvider>>,
    sessions: SessionRegistry,
    invoices: InvoiceService,
    tokens: TemplateAccessService,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        sessions: SessionRegistry,
        invoices: InvoiceService,
        tokens: TemplateAccessService,
    ) -> Self {
        Self {
            db,
            providers: HashMap::new(),
            sessions,
            invoices,
            tokens,
        }
    }

    /// Builds an adapter for every provider section present in `config`.
    pub fn from_config(
        config: &AppConfig,
        db: Arc<DatabaseConnection>,
        sessions: SessionRegistry,
        invoices: InvoiceService,
        tokens: TemplateAccessService,
    ) -> Result<Self, PaymentProviderError> {
        let mut service = Self::new(db, sessions, invoices, tokens);
        if let Some(cfg) = &config.paypal {
            service = service.with_provider(Arc::new(paypal::PayPalProvider::new(cfg.clone(), config)?));
        }
        if let Some(cfg) = &config.gateway {
            service = service.with_provider(Arc::new(regional_gateway::RegionalGatewayProvider::new(
                cfg.clone(),
                config,
            )?));
        }
        if let Some(cfg) = &config.wallet {
            service = service.with_provider(Arc::new(wallet::WalletProvider::new(cfg.clone(), config)?));
        }
        Ok(service)
    }

    pub fn with_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn configured(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_ref().to_string());
        kinds
    }

    pub fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn PaymentProvider>, ServiceError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ServiceError::BadRequest(format!("payment provider '{kind}' is not configured")))
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    async fn session_for(
        &self,
        kind: ProviderKind,
        session_id: &str,
    ) -> Result<payment_session::Model, ServiceError> {
        let session = self.sessions.require(session_id).await?;
        if session.provider != kind.as_ref() {
            return Err(ServiceError::NotFound(format!(
                "{kind} session {session_id} not found"
            )));
        }
        Ok(session)
    }

    /// Opens a checkout at the provider and stores the Session Registry entry.
    #[instrument(skip(self, request), fields(provider = %kind))]
    pub async fn create_session(
        &self,
        kind: ProviderKind,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        let provider = self.provider(kind)?;
        if request.amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError("amount must be positive".into()));
        }
        if request.items.is_empty() {
            return Err(ServiceError::ValidationError("at least one item is required".into()));
        }

        let currency = request.currency.to_ascii_uppercase();
        let (items, net) = self.price_items(&request.items, &currency).await?;
        if pricing::round_money(request.amount) != net {
            return Err(ServiceError::ValidationError(format!(
                "amount {} does not match the item total {net} {currency}",
                request.amount
            )));
        }

        let requested_order_id = request
            .metadata
            .order_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let internal_order_id = match requested_order_id {
            Some(id) => {
                self.ensure_order_id_unused(id).await?;
                id.to_string()
            }
            None => generate_order_id(),
        };

        let price = pricing::apply_vat(net, request.customer.country_code.as_deref());
        let unsupported = |e: PaymentProviderError| ServiceError::ValidationError(e.to_string());
        let (charged, charged_currency) = provider
            .normalize_amount(price.gross, &currency)
            .map_err(unsupported)?;
        let (charged_tax, _) = provider
            .normalize_amount(price.tax_amount, &currency)
            .map_err(unsupported)?;

        let provider_session = provider
            .create_session(&SessionRequest {
                internal_order_id: internal_order_id.clone(),
                amount: charged,
                currency: charged_currency.clone(),
                tax_amount: charged_tax,
                items: items.clone(),
                customer: request.customer.clone(),
            })
            .await?;

        let converted = charged_currency != currency;
        let mut metadata = request.metadata;
        metadata.order_id = Some(internal_order_id.clone());

        self.sessions
            .put(NewSession {
                provider_session_id: provider_session.provider_session_id.clone(),
                provider: kind,
                internal_order_id: internal_order_id.clone(),
                amount: provider_session.amount,
                currency: provider_session.currency.clone(),
                original_amount: converted.then_some(price.gross),
                original_currency: converted.then(|| currency.clone()),
                tax_amount: Some(charged_tax),
                tax_rate: Some(price.tax_rate),
                items,
                customer: request.customer,
                metadata,
                payment_url: provider_session.payment_url.clone(),
                raw_status: provider_session.raw_status.clone(),
            })
            .await?;

        metrics::counter!("marketplace.payments.sessions_created", 1, "provider" => kind.as_ref().to_string());
        info!(
            session_id = %provider_session.provider_session_id,
            order_id = %internal_order_id,
            amount = %provider_session.amount,
            currency = %provider_session.currency,
            "checkout session created"
        );

        Ok(CheckoutSession {
            provider: kind,
            session_id: provider_session.provider_session_id,
            order_id: internal_order_id,
            payment_url: provider_session.payment_url,
            client_secret: provider_session.client_secret,
            amount: provider_session.amount,
            currency: provider_session.currency,
            original_amount: price.gross,
            original_currency: currency,
            tax_amount: price.tax_amount,
            tax_rate: price.tax_rate,
            provider_order_id: provider_session.provider_order_id,
        })
    }

    /// Prices the basket from the listing table. The client's figures must agree
    /// with it; titles and prices are taken from the listing.
    async fn price_items(
        &self,
        items: &[LineItem],
        currency: &str,
    ) -> Result<(Vec<LineItem>, Decimal), ServiceError> {
        let mut priced = Vec::with_capacity(items.len());
        let mut net = Decimal::ZERO;
        for item in items {
            let listing = agent::Entity::find_by_id(item.item_id.clone())
                .one(self.db.as_ref())
                .await?
                .filter(|listing| listing.is_active)
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!("item '{}' is not available", item.item_id))
                })?;
            if !listing.currency.eq_ignore_ascii_case(currency) {
                return Err(ServiceError::ValidationError(format!(
                    "item '{}' is sold in {}, not {currency}",
                    listing.id,
                    listing.currency.to_ascii_uppercase()
                )));
            }
            let unit_price = pricing::round_money(listing.price);
            if pricing::round_money(item.unit_price) != unit_price {
                return Err(ServiceError::ValidationError(format!(
                    "price of item '{}' is {unit_price} {currency}",
                    listing.id
                )));
            }
            net += unit_price;
            priced.push(LineItem {
                item_id: listing.id,
                title: listing.title,
                unit_price,
            });
        }
        Ok((priced, net))
    }

    /// A caller-chosen order id must not attach to someone else's order.
    async fn ensure_order_id_unused(&self, order_id: &str) -> Result<(), ServiceError> {
        let has_order = order::Entity::find_by_id(order_id.to_string())
            .one(self.db.as_ref())
            .await?
            .is_some();
        if has_order || !self.sessions.list_by_internal_order_id(order_id).await?.is_empty() {
            warn!(%order_id, "checkout rejected: order id already in use");
            return Err(ServiceError::Conflict(format!("order id {order_id} is already in use")));
        }
        Ok(())
    }

    /// Captures (PayPal), confirms (wallet) or settles (gateway) a session.
    ///
    /// Only records what the provider answered; order processing is driven by
    /// the webhook router so that every success path shares one code path.
    #[instrument(skip(self, payment_token), fields(provider = %kind))]
    pub async fn confirm_or_capture(
        &self,
        kind: ProviderKind,
        session_id: &str,
        amount: Option<Decimal>,
        payment_token: Option<&str>,
    ) -> Result<CaptureResult, ServiceError> {
        let provider = self.provider(kind)?;
        let session = self.session_for(kind, session_id).await?;
        if let Some(amount) = amount {
            if amount <= Decimal::ZERO || amount > session.amount {
                return Err(ServiceError::ValidationError(format!(
                    "capture amount must be between 0 and {}",
                    session.amount
                )));
            }
        }

        let result = provider
            .capture(&session, amount, payment_token)
            .await
            .map_err(provider_failure)?;
        self.sessions
            .record_provider_status(
                session_id,
                &result.raw_status,
                result.provider_payment_id.as_deref(),
            )
            .await?;
        Ok(result)
    }

    /// Refunds at the provider, then applies order-level refund bookkeeping.
    #[instrument(skip(self), fields(provider = %kind))]
    pub async fn create_refund(
        &self,
        kind: ProviderKind,
        session_id: &str,
        amount: Decimal,
        reason: Option<String>,
    ) -> Result<RefundOutcome, ServiceError> {
        let provider = self.provider(kind)?;
        let session = self.session_for(kind, session_id).await?;
        if session.status() != SessionStatus::Success {
            return Err(ServiceError::InvalidStatus(format!(
                "session {session_id} is {} and cannot be refunded",
                session.status
            )));
        }
        if amount <= Decimal::ZERO || amount > session.amount {
            return Err(ServiceError::ValidationError(format!(
                "refund amount must be between 0 and {}",
                session.amount
            )));
        }

        let refund = provider
            .refund(&session, amount, reason.as_deref())
            .await
            .map_err(provider_failure)?;
        self.apply_refund_bookkeeping(&session, refund, "refunded").await
    }

    /// Side effects shared by API-initiated refunds and refund webhooks.
    pub async fn apply_refund_bookkeeping(
        &self,
        session: &payment_session::Model,
        refund: RefundResult,
        revoke_reason: &str,
    ) -> Result<RefundOutcome, ServiceError> {
        let order_id = session.internal_order_id.clone();
        self.sessions
            .update_status(&session.provider_session_id, SessionStatus::Refunded)
            .await?;
        let invoice_refunded = self.invoices.mark_refunded_for_order(&order_id).await?.is_some();
        let tokens_revoked = self.tokens.revoke_for_order(&order_id, revoke_reason).await?;

        outbox::enqueue_best_effort(
            self.db.as_ref(),
            Event::PaymentRefunded {
                provider: session.provider.clone(),
                session_id: session.provider_session_id.clone(),
                order_id: order_id.clone(),
                amount: refund.amount,
                currency: refund.currency.clone(),
            },
        )
        .await;
        if tokens_revoked > 0 {
            outbox::enqueue_best_effort(
                self.db.as_ref(),
                Event::TokensRevoked {
                    order_id: order_id.clone(),
                    count: tokens_revoked,
                    reason: revoke_reason.to_string(),
                },
            )
            .await;
        }

        Ok(RefundOutcome {
            refund,
            session_id: session.provider_session_id.clone(),
            order_id,
            tokens_revoked,
            invoice_refunded,
        })
    }

    pub async fn get_status(&self, kind: ProviderKind, session_id: &str) -> Result<Value, ServiceError> {
        let provider = self.provider(kind)?;
        Ok(provider.status(session_id).await?)
    }

    /// Signature check on the raw body. Adapter transport failures count as
    /// unverified rather than surfacing as 502.
    pub async fn verify_webhook_signature(
        &self,
        kind: ProviderKind,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<bool, ServiceError> {
        let provider = self.provider(kind)?;
        match provider.verify_webhook(payload, headers).await {
            Ok(valid) => Ok(valid),
            Err(e) => {
                warn!(provider = %kind, error = %e, "webhook verification call failed");
                Ok(false)
            }
        }
    }

    pub fn parse_webhook(&self, kind: ProviderKind, payload: &[u8]) -> Result<NormalizedWebhook, ServiceError> {
        let provider = self.provider(kind)?;
        provider
            .parse_webhook(payload)
            .map_err(|e| ServiceError::BadRequest(e.to_string()))
    }

    pub async fn health_check(&self, kind: ProviderKind) -> Result<HealthStatus, ServiceError> {
        let provider = self.provider(kind)?;
        let started = Utc::now();
        let status = provider.health_check().await;
        info!(
            provider = %kind,
            authenticated = status.authenticated,
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            "provider health checked"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_tags_parse_case_insensitively() {
        assert_eq!("paypal".parse::<ProviderKind>().unwrap(), ProviderKind::Paypal);
        assert_eq!("Gateway".parse::<ProviderKind>().unwrap(), ProviderKind::Gateway);
        assert_eq!(ProviderKind::Wallet.as_ref(), "wallet");
        assert!("stripe".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn generated_order_ids_are_unique() {
        let a = generate_order_id();
        let b = generate_order_id();
        assert!(a.starts_with("ord_"));
        assert_ne!(a, b);
    }
}
