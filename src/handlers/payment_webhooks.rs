use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use bytes::Bytes;
use tracing::debug;

use crate::errors::ServiceError;
use crate::handlers::{payments::parse_provider, AppState};
use crate::webhooks::router::WebhookAck;

// POST /api/v1/payments/{provider}/webhook
//
// The body is taken raw so signatures are checked on the exact bytes sent.
pub async fn payment_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let kind = parse_provider(&provider)?;
    debug!(provider = %kind, bytes = body.len(), "webhook received");
    let ack = state
        .services
        .webhooks
        .handle_webhook(kind, &body, &headers)
        .await?;
    Ok(Json(ack))
}
