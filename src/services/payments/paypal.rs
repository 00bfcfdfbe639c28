use async_trait::async_trait;
use axum::http::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use tracing::{debug, instrument, warn};

use super::token_cache::{FetchedToken, TokenCache};
use super::{
    decode_response, http_client, transport, CaptureResult, HealthStatus, PaymentProvider,
    PaymentProviderError, ProviderKind, ProviderSession, RefundResult, SessionRequest,
};
use crate::config::{AppConfig, PayPalConfig};
use crate::entities::payment_session;
use crate::webhooks::NormalizedWebhook;

const PROVIDER: &str = "paypal";

/// PayPal Orders v2 adapter.
pub struct PayPalProvider {
    config: PayPalConfig,
    client: reqwest::Client,
    token: TokenCache,
}

#[derive(Debug, Deserialize)]
struct OAuthToken {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

#[derive(Debug, Default, Deserialize)]
struct PurchaseUnit {
    #[serde(default)]
    payments: Option<UnitPayments>,
}

#[derive(Debug, Default, Deserialize)]
struct UnitPayments {
    #[serde(default)]
    captures: Vec<Capture>,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    verification_status: String,
}

/// Webhook envelope. Only the fields the pipeline reads are declared.
#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    id: String,
    event_type: String,
    #[serde(default)]
    resource: WebhookResource,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookResource {
    id: Option<String>,
    status: Option<String>,
    amount: Option<Money>,
    supplementary_data: Option<SupplementaryData>,
    #[serde(default)]
    links: Vec<Link>,
}

impl WebhookResource {
    /// Refund resources point at their capture through the `up` link.
    fn parent_capture_id(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel == "up")
            .and_then(|l| l.href.rsplit_once("/captures/"))
            .map(|(_, id)| id.trim_end_matches('/').to_string())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct Money {
    currency_code: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SupplementaryData {
    related_ids: Option<RelatedIds>,
}

#[derive(Debug, Deserialize)]
struct RelatedIds {
    order_id: Option<String>,
}

fn describe_error(body: &Value) -> Option<String> {
    let name = body.get("name").and_then(Value::as_str);
    let issue = body
        .get("details")
        .and_then(|d| d.get(0))
        .and_then(|d| d.get("issue"))
        .and_then(Value::as_str);
    let message = body.get("message").and_then(Value::as_str);
    let oauth = body.get("error_description").and_then(Value::as_str);

    match (name, issue, message, oauth) {
        (Some(name), Some(issue), _, _) => Some(format!("{name}: {issue}")),
        (Some(name), None, Some(message), _) => Some(format!("{name}: {message}")),
        (None, _, _, Some(desc)) => Some(desc.to_string()),
        (_, _, Some(message), _) => Some(message.to_string()),
        _ => None,
    }
}

fn money(amount: Decimal) -> String {
    format!("{:.2}", amount)
}

impl PayPalProvider {
    pub fn new(config: PayPalConfig, app: &AppConfig) -> Result<Self, PaymentProviderError> {
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
                debug!("refreshing PayPal access token");
                let response = self
                    .client
                    .post(self.url("/v1/oauth2/token"))
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
impl PaymentProvider for PayPalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Paypal
    }

    #[instrument(skip(self, request), fields(order_id = %request.internal_order_id))]
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<ProviderSession, PaymentProviderError> {
        let token = self.access_token().await?;
        let description: String = request
            .items
            .iter()
            .map(|item| item.title.as_str())
            .collect::<Vec<_>>()
            .join(", ")
            .chars()
            .take(127)
            .collect();

        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.internal_order_id,
                "custom_id": request.internal_order_id,
                "description": description,
                "amount": {
                    "currency_code": request.currency,
                    "value": money(request.amount),
                },
            }],
            "application_context": {
                "brand_name": self.config.brand_name,
                "return_url": self.config.return_url,
                "cancel_url": self.config.cancel_url,
                "user_action": "PAY_NOW",
                "shipping_preference": "NO_SHIPPING",
            },
        });

        let response = self
            .client
            .post(self.url("/v2/checkout/orders"))
            .bearer_auth(token)
            .header("PayPal-Request-Id", &request.internal_order_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport(PROVIDER, e))?;
        let order: OrderResponse = decode_response(PROVIDER, response, describe_error).await?;

        let approve = order
            .links
            .iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href.clone());
        if approve.is_none() {
            warn!(paypal_order_id = %order.id, "PayPal order has no approval link");
        }

        Ok(ProviderSession {
            provider_session_id: order.id.clone(),
            payment_url: approve,
            client_secret: None,
            amount: request.amount,
            currency: request.currency.clone(),
            provider_order_id: order.id,
            raw_status: order.status,
        })
    }

    #[instrument(skip(self, session, _payment_token), fields(session_id = %session.provider_session_id))]
    async fn capture(
        &self,
        session: &payment_session::Model,
        _amount: Option<Decimal>,
        _payment_token: Option<&str>,
    ) -> Result<CaptureResult, PaymentProviderError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url(&format!(
                "/v2/checkout/orders/{}/capture",
                session.provider_session_id
            )))
            .bearer_auth(token)
            .header("PayPal-Request-Id", format!("capture-{}", session.provider_session_id))
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| transport(PROVIDER, e))?;
        let order: OrderResponse = decode_response(PROVIDER, response, describe_error).await?;

        let capture = order
            .purchase_units
            .iter()
            .filter_map(|u| u.payments.as_ref())
            .flat_map(|p| p.captures.iter())
            .next();

        let raw_status = capture
            .map(|c| c.status.clone())
            .unwrap_or_else(|| order.status.clone());
        Ok(CaptureResult {
            success: raw_status == "COMPLETED",
            raw_status,
            provider_payment_id: capture.map(|c| c.id.clone()),
        })
    }

    async fn refund(
        &self,
        session: &payment_session::Model,
        amount: Decimal,
        reason: Option<&str>,
    ) -> Result<RefundResult, PaymentProviderError> {
        let capture_id = session.provider_payment_id.as_deref().ok_or_else(|| {
            PaymentProviderError::Unsupported {
                provider: PROVIDER,
                operation: "refund",
                message: "no capture id recorded for this order".into(),
            }
        })?;
        let token = self.access_token().await?;

        let mut body = json!({
            "amount": { "value": money(amount), "currency_code": session.currency },
        });
        if let Some(reason) = reason {
            body["note_to_payer"] = Value::String(reason.chars().take(255).collect());
        }

        let response = self
            .client
            .post(self.url(&format!("/v2/payments/captures/{capture_id}/refund")))
            .bearer_auth(token)
            .json(&body)
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
            .get(self.url(&format!("/v2/checkout/orders/{provider_session_id}")))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport(PROVIDER, e))?;
        decode_response(PROVIDER, response, describe_error).await
    }

    /// Delegates to PayPal's verify-webhook-signature API.
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<bool, PaymentProviderError> {
        let Some(webhook_id) = self.config.webhook_id.as_deref() else {
            warn!("PayPal webhook_id is not configured; rejecting webhook");
            return Ok(false);
        };
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let (Some(auth_algo), Some(cert_url), Some(transmission_id), Some(sig), Some(time)) = (
            header("paypal-auth-algo"),
            header("paypal-cert-url"),
            header("paypal-transmission-id"),
            header("paypal-transmission-sig"),
            header("paypal-transmission-time"),
        ) else {
            return Ok(false);
        };
        let Ok(event) = serde_json::from_slice::<Value>(payload) else {
            return Ok(false);
        };

        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url("/v1/notifications/verify-webhook-signature"))
            .bearer_auth(token)
            .json(&json!({
                "auth_algo": auth_algo,
                "cert_url": cert_url,
                "transmission_id": transmission_id,
                "transmission_sig": sig,
                "transmission_time": time,
                "webhook_id": webhook_id,
                "webhook_event": event,
            }))
            .send()
            .await
            .map_err(|e| transport(PROVIDER, e))?;
        let verdict: VerifyResponse = decode_response(PROVIDER, response, describe_error).await?;
        Ok(verdict.verification_status == "SUCCESS")
    }

    fn parse_webhook(&self, payload: &[u8]) -> Result<NormalizedWebhook, PaymentProviderError> {
        let envelope: WebhookEnvelope =
            serde_json::from_slice(payload).map_err(|e| PaymentProviderError::InvalidResponse {
                provider: PROVIDER,
                message: format!("invalid webhook payload: {e}"),
            })?;

        // Capture events reference the order through related_ids, order
        // events carry the order id directly. Refund resources only link back
        // to the capture, so the session is found through its payment id.
        let is_capture = envelope.event_type.starts_with("PAYMENT.CAPTURE.");
        let is_refund = matches!(
            envelope.event_type.as_str(),
            "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.CAPTURE.REVERSED"
        );
        let related_order = envelope
            .resource
            .supplementary_data
            .as_ref()
            .and_then(|s| s.related_ids.as_ref())
            .and_then(|r| r.order_id.clone());
        let (session_id, payment_id, refund_id) = if is_refund {
            (
                related_order,
                envelope.resource.parent_capture_id(),
                envelope.resource.id.clone(),
            )
        } else if is_capture {
            (related_order, envelope.resource.id.clone(), None)
        } else {
            (envelope.resource.id.clone(), None, None)
        };

        let amount = envelope
            .resource
            .amount
            .as_ref()
            .and_then(|m| Decimal::from_str(&m.value).ok());

        let raw_status = if envelope.event_type.is_empty() {
            envelope.resource.status.clone().unwrap_or_default()
        } else {
            envelope.event_type.clone()
        };

        Ok(NormalizedWebhook {
            provider: ProviderKind::Paypal,
            event_id: envelope.id,
            event_type: envelope.event_type,
            provider_session_id: session_id,
            provider_payment_id: payment_id,
            refund_id,
            raw_status,
            amount,
            currency: envelope.resource.amount.map(|m| m.currency_code),
        })
    }

    async fn health_check(&self) -> HealthStatus {
        let result = self.access_token().await;
        HealthStatus {
            provider: ProviderKind::Paypal,
            authenticated: result.is_ok(),
            environment: self.config.environment().to_string(),
            error: result.err().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> PayPalProvider {
        let app = AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            0,
            "test".into(),
        );
        let cfg = PayPalConfig {
            client_id: "id".into(),
            client_secret: "secret".into(),
            sandbox: true,
            base_url: Some("http://127.0.0.1:1".into()),
            webhook_id: None,
            return_url: "https://shop.example/return".into(),
            cancel_url: "https://shop.example/cancel".into(),
            brand_name: "Agent Marketplace".into(),
        };
        PayPalProvider::new(cfg, &app).unwrap()
    }

    #[test]
    fn capture_webhook_points_at_the_order() {
        let payload = json!({
            "id": "WH-58D329510W468432D-8HN650336L201105X",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "3C679366HH908993F",
                "status": "COMPLETED",
                "amount": {"currency_code": "EUR", "value": "119.00"},
                "supplementary_data": {"related_ids": {"order_id": "5O190127TN364715T"}}
            }
        });
        let hook = provider()
            .parse_webhook(payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(hook.provider_session_id.as_deref(), Some("5O190127TN364715T"));
        assert_eq!(hook.provider_payment_id.as_deref(), Some("3C679366HH908993F"));
        assert_eq!(hook.raw_status, "PAYMENT.CAPTURE.COMPLETED");
        assert_eq!(hook.amount, Some(Decimal::new(11900, 2)));
    }

    #[test]
    fn refund_webhook_points_at_the_capture() {
        let payload = json!({
            "id": "WH-1GE84257G0350133W-6RW800890C634293G",
            "event_type": "PAYMENT.CAPTURE.REFUNDED",
            "resource": {
                "id": "1Y107995YT783435V",
                "status": "COMPLETED",
                "amount": {"currency_code": "EUR", "value": "60.00"},
                "links": [
                    {"href": "https://api.sandbox.paypal.com/v2/payments/refunds/1Y107995YT783435V", "rel": "self"},
                    {"href": "https://api.sandbox.paypal.com/v2/payments/captures/0KG5963426578311J", "rel": "up"}
                ]
            }
        });
        let hook = provider()
            .parse_webhook(payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(hook.provider_session_id, None);
        assert_eq!(hook.provider_payment_id.as_deref(), Some("0KG5963426578311J"));
        assert_eq!(hook.refund_id.as_deref(), Some("1Y107995YT783435V"));
        assert_eq!(hook.amount, Some(Decimal::new(6000, 2)));
    }

    #[test]
    fn error_body_keeps_issue_code() {
        let body = json!({
            "name": "UNPROCESSABLE_ENTITY",
            "details": [{"issue": "ORDER_NOT_APPROVED", "description": "Payer has not yet approved the Order for payment."}],
            "message": "The requested action could not be performed.",
            "debug_id": "f4b1f1a1"
        });
        assert_eq!(
            describe_error(&body).as_deref(),
            Some("UNPROCESSABLE_ENTITY: ORDER_NOT_APPROVED")
        );
        assert_eq!(
            describe_error(&json!({"error": "invalid_client", "error_description": "Client Authentication failed"}))
                .as_deref(),
            Some("Client Authentication failed")
        );
    }

    #[tokio::test]
    async fn missing_transmission_headers_fail_verification() {
        let mut p = provider();
        p.config.webhook_id = Some("WH-1".into());
        let ok = p.verify_webhook(b"{}", &HeaderMap::new()).await.unwrap();
        assert!(!ok);
    }
}
