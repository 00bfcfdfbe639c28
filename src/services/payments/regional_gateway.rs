use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{instrument, warn};

use super::pricing::{self, from_minor_units, to_minor_units};
use super::token_cache::{FetchedToken, TokenCache};
use super::{
    decode_response, http_client, transport, CaptureResult, HealthStatus, PaymentProvider,
    PaymentProviderError, ProviderKind, ProviderSession, RefundResult, SessionRequest,
};
use crate::config::{AppConfig, GatewayConfig};
use crate::entities::payment_session;
use crate::webhooks::NormalizedWebhook;

type HmacSha256 = Hmac<Sha256>;

const PROVIDER: &str = "gateway";
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Regional card gateway. Amounts travel in minor units of one fixed
/// settlement currency.
pub struct RegionalGatewayProvider {
    config: GatewayConfig,
    client: reqwest::Client,
    token: TokenCache,
}

#[derive(Debug, Deserialize)]
struct OAuthToken {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: String,
    status: String,
    #[serde(default)]
    redirect_url: Option<String>,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event_id: String,
    event_type: String,
    data: WebhookPayment,
}

#[derive(Debug, Deserialize)]
struct WebhookPayment {
    payment_id: String,
    status: String,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

fn describe_error(body: &Value) -> Option<String> {
    let error = body.get("error");
    let code = error
        .and_then(|e| e.get("code"))
        .or_else(|| body.get("code"))
        .and_then(Value::as_str);
    let message = error
        .and_then(|e| e.get("message"))
        .or_else(|| body.get("message"))
        .and_then(Value::as_str);
    match (code, message) {
        (Some(code), Some(message)) => Some(format!("{code}: {message}")),
        (None, Some(message)) => Some(message.to_string()),
        (Some(code), None) => Some(code.to_string()),
        _ => None,
    }
}

/// Computes the `v1` signature for `"{timestamp}.{body}"`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a `t=<unix>,v1=<hex>` signature header against the raw body.
pub fn verify_signature(secret: &str, header: &str, payload: &[u8], now: i64) -> bool {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signature = hex::decode(value).ok(),
            _ => {}
        }
    }
    let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
        return false;
    };
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return false;
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

impl RegionalGatewayProvider {
    pub fn new(config: GatewayConfig, app: &AppConfig) -> Result<Self, PaymentProviderError> {
        Ok(Self {
            client: http_client(PROVIDER, app)?,
            token: TokenCache::new(PROVIDER, app.token_refresh_margin_secs),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base(), path)
    }

    /// Merchant reference sent to the gateway, e.g. `AM20240611T101500K3F9QZ`.
    fn merchant_reference(&self) -> String {
        const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
        let mut rng = rand::thread_rng();
        let suffix: String = (0..6)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        format!(
            "{}{}{}",
            self.config.merchant_order_prefix,
            Utc::now().format("%Y%m%dT%H%M%S"),
            suffix
        )
    }

    async fn access_token(&self) -> Result<String, PaymentProviderError> {
        self.token
            .get_or_refresh(|| async {
                let response = self
                    .client
                    .post(self.url("/oauth/token"))
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
impl PaymentProvider for RegionalGatewayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gateway
    }

    fn normalize_amount(
        &self,
        amount: Decimal,
        currency: &str,
    ) -> Result<(Decimal, String), PaymentProviderError> {
        let settlement = self.config.settlement_currency.to_ascii_uppercase();
        let converted = pricing::convert(amount, currency, &settlement, &self.config.conversion_rates)
            .ok_or_else(|| PaymentProviderError::Unsupported {
                provider: PROVIDER,
                operation: "convert",
                message: format!("no conversion rate from {currency} to {settlement}"),
            })?;
        Ok((converted, settlement))
    }

    #[instrument(skip(self, request), fields(order_id = %request.internal_order_id))]
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<ProviderSession, PaymentProviderError> {
        let token = self.access_token().await?;
        let reference = self.merchant_reference();
        let description: Vec<&str> = request.items.iter().map(|i| i.title.as_str()).collect();

        let body = json!({
            "amount": to_minor_units(request.amount),
            "currency": request.currency,
            "tax_amount": to_minor_units(request.tax_amount),
            "merchant_reference": reference,
            "description": description.join(", "),
            "customer": {
                "email": request.customer.email,
                "name": request.customer.name,
                "country": request.customer.country_code,
            },
            "success_url": self.config.success_url,
            "cancel_url": self.config.cancel_url,
            "metadata": { "order_id": request.internal_order_id },
        });

        let response = self
            .client
            .post(self.url("/v1/payments"))
            .bearer_auth(token)
            .header("Idempotency-Key", &request.internal_order_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(PROVIDER, e))?;
        let payment: PaymentResponse = decode_response(PROVIDER, response, describe_error).await?;

        let amount = payment
            .amount
            .map(from_minor_units)
            .unwrap_or(request.amount);
        Ok(ProviderSession {
            provider_session_id: payment.id,
            payment_url: payment.redirect_url,
            client_secret: None,
            amount,
            currency: payment
                .currency
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or_else(|| request.currency.clone()),
            provider_order_id: reference,
            raw_status: payment.status,
        })
    }

    async fn capture(
        &self,
        session: &payment_session::Model,
        amount: Option<Decimal>,
        _payment_token: Option<&str>,
    ) -> Result<CaptureResult, PaymentProviderError> {
        let token = self.access_token().await?;
        let mut body = json!({});
        if let Some(amount) = amount {
            body["amount"] = json!(to_minor_units(amount));
        }
        let response = self
            .client
            .post(self.url(&format!("/v1/payments/{}/capture", session.provider_session_id)))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(PROVIDER, e))?;
        let payment: PaymentResponse = decode_response(PROVIDER, response, describe_error).await?;

        let success = matches!(
            payment.status.to_ascii_lowercase().as_str(),
            "success" | "succeeded" | "paid" | "completed"
        );
        Ok(CaptureResult {
            success,
            raw_status: payment.status,
            provider_payment_id: payment.transaction_id,
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
            .post(self.url(&format!("/v1/payments/{}/refunds", session.provider_session_id)))
            .bearer_auth(token)
            .json(&json!({
                "amount": to_minor_units(amount),
                "reason": reason,
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

    async fn status(&self, provider_session_id: &str) -> Result<Value, PaymentProviderError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.url(&format!("/v1/payments/{provider_session_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport(PROVIDER, e))?;
        decode_response(PROVIDER, response, describe_error).await
    }

    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<bool, PaymentProviderError> {
        let Some(header) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
            warn!("gateway webhook without signature header");
            return Ok(false);
        };
        Ok(verify_signature(
            &self.config.webhook_secret,
            header,
            payload,
            Utc::now().timestamp(),
        ))
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<NormalizedWebhook, PaymentProviderError> {
        let envelope: WebhookEnvelope =
            serde_json::from_slice(payload).map_err(|e| PaymentProviderError::InvalidResponse {
                provider: PROVIDER,
                message: format!("invalid webhook payload: {e}"),
            })?;

        Ok(NormalizedWebhook {
            provider: ProviderKind::Gateway,
            event_id: envelope.event_id,
            event_type: envelope.event_type,
            provider_session_id: Some(envelope.data.payment_id),
            provider_payment_id: envelope.data.transaction_id,
            refund_id: None,
            raw_status: envelope.data.status,
            amount: envelope.data.amount.map(from_minor_units),
            currency: envelope.data.currency.map(|c| c.to_ascii_uppercase()),
        })
    }

    async fn health_check(&self) -> HealthStatus {
        let result = self.access_token().await;
        HealthStatus {
            provider: ProviderKind::Gateway,
            authenticated: result.is_ok(),
            environment: self.config.environment().to_string(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_0123456789abcdef";

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"event_id":"evt_1"}"#;
        let now = 1_717_000_000;
        let header = format!("t={},v1={}", now, sign_payload(SECRET, now, body));
        assert!(verify_signature(SECRET, &header, body, now + 10));
    }

    #[test]
    fn tampered_body_or_stale_timestamp_is_rejected() {
        let body = br#"{"event_id":"evt_1"}"#;
        let now = 1_717_000_000;
        let header = format!("t={},v1={}", now, sign_payload(SECRET, now, body));

        assert!(!verify_signature(SECRET, &header, br#"{"event_id":"evt_2"}"#, now));
        assert!(!verify_signature(SECRET, &header, body, now + 301));
        assert!(!verify_signature("another_secret_value", &header, body, now));
        assert!(!verify_signature(SECRET, "v1=deadbeef", body, now));
    }

    #[test]
    fn error_body_is_summarised() {
        let body = json!({"error": {"code": "card_declined", "message": "Insufficient funds"}});
        assert_eq!(
            describe_error(&body).as_deref(),
            Some("card_declined: Insufficient funds")
        );
    }
}
