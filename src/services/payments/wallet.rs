use async_trait::async_trait;
use axum::http::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::pricing::{from_minor_units, to_minor_units};
use super::token_cache::{FetchedToken, TokenCache};
use super::{
    decode_response, http_client, transport, CaptureResult, HealthStatus, PaymentProvider,
    PaymentProviderError, ProviderKind, ProviderSession, RefundResult, SessionRequest,
};
use crate::config::{AppConfig, WalletConfig};
use crate::entities::payment_session;
use crate::webhooks::NormalizedWebhook;

const PROVIDER: &str = "wallet";

/// Direct wallet (Apple Pay / Google Pay) processor built on payment intents.
pub struct WalletProvider {
    config: WalletConfig,
    client: reqwest::Client,
    token: TokenCache,
}

#[derive(Debug, Deserialize)]
struct OAuthToken {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    latest_charge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

/// Either a payment intent or, for `charge.*` events, a charge.
#[derive(Debug, Deserialize)]
struct WebhookObject {
    id: String,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    latest_charge: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    /// Cumulative refunded amount on a charge.
    #[serde(default)]
    amount_refunded: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

fn describe_error(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    let message = error.get("message").and_then(Value::as_str);
    let code = error
        .get("code")
        .or_else(|| error.get("type"))
        .and_then(Value::as_str);
    match (code, message) {
        (Some(code), Some(message)) => Some(format!("{code}: {message}")),
        (None, Some(message)) => Some(message.to_string()),
        (Some(code), None) => Some(code.to_string()),
        _ => None,
    }
}

impl WalletProvider {
    pub fn new(config: WalletConfig, app: &AppConfig) -> Result<Self, PaymentProviderError> {
        Ok(Self {
            client: http_client(PROVIDER, app)?,
            token: TokenCache::new(PROVIDER, app.token_refresh_margin_secs),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base(), path)
    }

    async fn access_token(&self) -> Result<String, PaymentProviderError> {
        self.token
            .get_or_refresh(|| async {
                let response = self
                    .client
                    .post(self.url("/v1/oauth/token"))
                    .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                    .form(&[("grant_type", "client_credentials")])
                    .send()
                    .await
                    .map_err(|e| transport(PROVIDER, e))?;
                let token: OAuthToken = decode_response(PROVIDER, response, describe_error)
                    .await
                    .map_err(|e| PaymentProviderError::Auth {
                        provider: PROVIDER,
                        message: e.to_string(),
                    })?;
                Ok(FetchedToken {
                    access_token: token.access_token,
                    expires_in: token.expires_in,
                })
            })
            .await
    }
}

#[async_trait]
impl PaymentProvider for WalletProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Wallet
    }

    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<ProviderSession, PaymentProviderError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url("/v1/payment_intents"))
            .bearer_auth(token)
            .header("Idempotency-Key", &request.internal_order_id)
            .json(&json!({
                "amount": to_minor_units(request.amount),
                "currency": request.currency.to_ascii_lowercase(),
                "payment_method_types": ["apple_pay", "google_pay"],
                "receipt_email": request.customer.email,
                "metadata": { "order_id": request.internal_order_id },
            }))
            .send()
            .await
            .map_err(|e| transport(PROVIDER, e))?;
        let intent: PaymentIntent = decode_response(PROVIDER, response, describe_error).await?;

        Ok(ProviderSession {
            provider_session_id: intent.id.clone(),
            payment_url: None,
            client_secret: intent.client_secret,
            amount: request.amount,
            currency: request.currency.clone(),
            provider_order_id: intent.id,
            raw_status: intent.status,
        })
    }

    async fn capture(
        &self,
        session: &payment_session::Model,
        _amount: Option<Decimal>,
        payment_token: Option<&str>,
    ) -> Result<CaptureResult, PaymentProviderError> {
        let payment_token = payment_token.ok_or_else(|| PaymentProviderError::Unsupported {
            provider: PROVIDER,
            operation: "confirm",
            message: "paymentToken from the wallet sheet is required".into(),
        })?;
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url(&format!(
                "/v1/payment_intents/{}/confirm",
                session.provider_session_id
            )))
            .bearer_auth(token)
            .json(&json!({ "payment_token": payment_token }))
            .send()
            .await
            .map_err(|e| transport(PROVIDER, e))?;
        let intent: PaymentIntent = decode_response(PROVIDER, response, describe_error).await?;

        Ok(CaptureResult {
            success: intent.status == "succeeded",
            raw_status: intent.status,
            provider_payment_id: intent.latest_charge,
        })
    }

    async fn refund(
        &self,
        session: &payment_session::Model,
        amount: Decimal,
        reason: Option<&str>,
    ) -> Result<RefundResult, PaymentProviderError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url("/v1/refunds"))
            .bearer_auth(token)
            .json(&json!({
                "payment_intent": session.provider_session_id,
                "amount": to_minor_units(amount),
                "reason": reason.unwrap_or("requested_by_customer"),
            }))
            .send()
            .await
            .map_err(|e| transport(PROVIDER, e))?;
        let refund: RefundResponse = decode_response(PROVIDER, response, describe_error).await?;

        Ok(RefundResult {
            refund_id: refund.id,
            status: refund.status,
            amount,
            currency: session.currency.clone(),
        })
    }

    /// Wallet state is only pushed through webhooks; there is nothing to poll.
    async fn status(&self, provider_session_id: &str) -> Result<Value, PaymentProviderError> {
        Ok(json!({
            "provider": PROVIDER,
            "sessionId": provider_session_id,
            "status": "check_webhooks",
            "message": "Wallet payment status is delivered through webhooks",
        }))
    }

    async fn verify_webhook(
        &self,
        _payload: &[u8],
        _headers: &HeaderMap,
    ) -> Result<bool, PaymentProviderError> {
        if self.config.reject_unverified_webhooks {
            warn!("wallet webhook rejected: signature verification is not available");
            return Ok(false);
        }
        warn!("wallet webhook accepted without signature verification");
        Ok(true)
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<NormalizedWebhook, PaymentProviderError> {
        let envelope: WebhookEnvelope =
            serde_json::from_slice(payload).map_err(|e| PaymentProviderError::InvalidResponse {
                provider: PROVIDER,
                message: format!("invalid webhook payload: {e}"),
            })?;
        let object = envelope.data.object;

        let (session_id, payment_id) = if envelope.event_type.starts_with("charge.") {
            (object.payment_intent, Some(object.id))
        } else {
            (Some(object.id), object.latest_charge)
        };
        let amount = if envelope.event_type == "charge.refunded" {
            object.amount_refunded.or(object.amount)
        } else {
            object.amount
        };

        Ok(NormalizedWebhook {
            provider: ProviderKind::Wallet,
            event_id: envelope.id,
            raw_status: envelope.event_type.clone(),
            event_type: envelope.event_type,
            provider_session_id: session_id,
            provider_payment_id: payment_id,
            refund_id: None,
            amount: amount.map(from_minor_units),
            currency: object.currency.map(|c| c.to_ascii_uppercase()),
        })
    }

    async fn health_check(&self) -> HealthStatus {
        let result = self.access_token().await;
        HealthStatus {
            provider: ProviderKind::Wallet,
            authenticated: result.is_ok(),
            environment: self.config.environment().to_string(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}
