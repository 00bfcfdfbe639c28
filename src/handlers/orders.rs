use axum::{
    extract::{Path, State},
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;

use crate::entities::{invoice, order, payment_session};
use crate::handlers::{require_admin_key, AppState};
use crate::services::order_processor::ProcessedOrder;
use crate::{ApiResponse, ApiResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
    pub order: order::Model,
    pub sessions: Vec<payment_session::Model>,
    pub invoice: Option<invoice::Model>,
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<OrderDetails> {
    let order = state.services.orders.require_order(&id).await?;
    let sessions = state
        .services
        .payments
        .sessions()
        .list_by_internal_order_id(&id)
        .await?;
    let invoice = state.services.invoices.get_by_order(&id).await?;
    Ok(Json(ApiResponse::success(OrderDetails {
        order,
        sessions,
        invoice,
    })))
}

async fn redeliver_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ProcessedOrder> {
    let processed = state.services.processor.redeliver(&id).await?;
    Ok(Json(ApiResponse::success(processed)))
}

/// Order routes, nested under `/orders`.
pub fn order_routes(state: &AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/:id/redeliver", post(redeliver_order))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    Router::new().route("/:id", get(get_order)).merge(admin)
}
