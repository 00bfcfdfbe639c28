use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

use crate::entities::order::LineItem;
use crate::entities::payment_session::{CustomerInfo, SessionMetadata};
use crate::errors::ServiceError;
use crate::handlers::{payment_webhooks, require_admin_key, AppState};
use crate::services::payments::{
    CheckoutRequest, CheckoutSession, HealthStatus, ProviderKind, RefundOutcome,
};
use crate::webhooks::router::{CallbackOutcome, CallbackQuery};
use crate::{ApiResponse, ApiResult};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub provider: String,
    pub amount: Decimal,
    #[validate(length(equal = 3, message = "Currency must be a 3-letter ISO code"))]
    pub currency: String,
    #[validate(length(min = 1, message = "At least one item is required"))]
    pub items: Vec<CheckoutItem>,
    #[serde(default)]
    pub customer_info: CustomerInfo,
    /// Unknown keys are dropped by `SessionMetadata`.
    #[serde(default)]
    pub metadata: SessionMetadata,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CheckoutItem {
    pub id: String,
    pub title: String,
    pub price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub session_id: String,
    pub amount: Option<Decimal>,
    pub payment_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub session_id: String,
    pub amount: Decimal,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusLookup {
    #[default]
    Session,
    Order,
    Provider,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default, rename = "type")]
    pub lookup: StatusLookup,
}

pub(crate) fn parse_provider(raw: &str) -> Result<ProviderKind, ServiceError> {
    raw.parse()
        .map_err(|_| ServiceError::BadRequest(format!("unknown payment provider '{raw}'")))
}

fn checkout_request(request: CreateSessionRequest) -> Result<CheckoutRequest, ServiceError> {
    request.validate()?;
    let email = request
        .customer_info
        .email
        .as_deref()
        .or(request.metadata.email.as_deref())
        .ok_or_else(|| ServiceError::ValidationError("a customer email is required".into()))?;
    if !validator::validate_email(email) {
        return Err(ServiceError::ValidationError(format!("invalid customer email '{email}'")));
    }
    if request.items.iter().any(|i| i.price < Decimal::ZERO || i.id.trim().is_empty()) {
        return Err(ServiceError::ValidationError(
            "items need an id and a non-negative price".into(),
        ));
    }

    Ok(CheckoutRequest {
        amount: request.amount,
        currency: request.currency,
        items: request
            .items
            .into_iter()
            .map(|i| LineItem {
                item_id: i.id,
                title: i.title,
                unit_price: i.price,
            })
            .collect(),
        customer: request.customer_info,
        metadata: request.metadata,
    })
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutSession>>), ServiceError> {
    let kind = parse_provider(&request.provider)?;
    let session = state
        .services
        .payments
        .create_session(kind, checkout_request(request)?)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(session))))
}

async fn capture(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(request): Json<CaptureRequest>,
) -> ApiResult<CallbackOutcome> {
    let kind = parse_provider(&provider)?;
    let outcome = state
        .services
        .webhooks
        .capture_and_settle(
            kind,
            &request.session_id,
            request.amount,
            request.payment_token.as_deref(),
        )
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

async fn refund(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(request): Json<RefundRequest>,
) -> ApiResult<RefundOutcome> {
    let kind = parse_provider(&provider)?;
    let outcome = state
        .services
        .payments
        .create_refund(kind, &request.session_id, request.amount, request.reason)
        .await?;
    Ok(Json(ApiResponse::success(outcome)))
}

async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<CallbackOutcome> {
    let kind = parse_provider(&provider)?;
    let outcome = state.services.webhooks.handle_callback(kind, &query).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

async fn payment_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Value> {
    let sessions = state.services.payments.sessions();
    let body = match query.lookup {
        StatusLookup::Session => json!({ "session": sessions.require(&id).await? }),
        StatusLookup::Order => {
            let order = state.services.orders.get_order(&id).await?;
            let linked = sessions.list_by_internal_order_id(&id).await?;
            if order.is_none() && linked.is_empty() {
                return Err(ServiceError::NotFound(format!("order {id} not found")));
            }
            json!({ "order": order, "sessions": linked })
        }
        StatusLookup::Provider => {
            let session = sessions.require(&id).await?;
            let kind = parse_provider(&session.provider)?;
            let remote = state.services.payments.get_status(kind, &id).await?;
            json!({ "provider": kind, "sessionId": id, "status": remote })
        }
    };
    Ok(Json(ApiResponse::success(body)))
}

async fn provider_health(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<(StatusCode, Json<ApiResponse<HealthStatus>>), ServiceError> {
    let kind = parse_provider(&provider)?;
    let status = state.services.payments.health_check(kind).await?;
    let code = if status.authenticated {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((code, Json(ApiResponse::success(status))))
}

/// Payment routes, nested under `/payments`.
pub fn payment_routes(state: &AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/:provider/refund", post(refund))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    Router::new()
        .route("/create-session", post(create_session))
        .route("/status/:id", get(payment_status))
        .route("/:provider/capture", post(capture))
        .route("/:provider/webhook", post(payment_webhooks::payment_webhook))
        .route("/:provider/callback", get(callback))
        .route("/:provider/health", get(provider_health))
        .merge(admin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(body: Value) -> CreateSessionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn checkout_request_maps_items_and_drops_unknown_metadata() {
        let mapped = checkout_request(request(json!({
            "provider": "gateway",
            "amount": "100",
            "currency": "EUR",
            "items": [{"id": "agent-1", "title": "Agent", "price": "100"}],
            "customerInfo": {"email": "buyer@example.com", "countryCode": "DE"},
            "metadata": {"skipEmailSending": true, "isAdmin": true}
        })))
        .unwrap();

        assert_eq!(mapped.items[0].item_id, "agent-1");
        assert_eq!(mapped.items[0].unit_price, dec!(100));
        assert!(mapped.metadata.skip_email_sending);
    }

    #[test]
    fn invalid_requests_are_validation_errors() {
        let no_items = checkout_request(request(json!({
            "provider": "gateway", "amount": "10", "currency": "EUR", "items": []
        })));
        assert!(matches!(no_items, Err(ServiceError::ValidationError(_))));

        let bad_email = checkout_request(request(json!({
            "provider": "gateway", "amount": "10", "currency": "EUR",
            "items": [{"id": "a", "title": "A", "price": "10"}],
            "customerInfo": {"email": "not-an-email"}
        })));
        assert!(matches!(bad_email, Err(ServiceError::ValidationError(_))));

        let no_email = checkout_request(request(json!({
            "provider": "gateway", "amount": "10", "currency": "EUR",
            "items": [{"id": "a", "title": "A", "price": "10"}],
            "customerInfo": {"name": "Ada"}
        })));
        assert!(matches!(no_email, Err(ServiceError::ValidationError(_))));
    }

    #[test]
    fn metadata_email_satisfies_the_email_requirement() {
        let mapped = checkout_request(request(json!({
            "provider": "gateway", "amount": "10", "currency": "EUR",
            "items": [{"id": "a", "title": "A", "price": "10"}],
            "metadata": {"email": "buyer@example.com"}
        })))
        .unwrap();
        assert_eq!(mapped.metadata.email.as_deref(), Some("buyer@example.com"));
        assert!(mapped.customer.email.is_none());
    }

    #[test]
    fn providers_parse_case_insensitively() {
        assert_eq!(parse_provider("PayPal").unwrap(), ProviderKind::Paypal);
        assert!(matches!(parse_provider("stripe"), Err(ServiceError::BadRequest(_))));
    }
}
