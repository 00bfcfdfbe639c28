use axum::{
    extract::{Path, Query, State},
    http::header,
    middleware,
    response::{IntoResponse, Json},
    routing::{get, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::invoice;
use crate::errors::ServiceError;
use crate::handlers::{require_admin_key, AppState};
use crate::services::invoicing::InvoiceFilters;
use crate::{ApiResponse, ApiResult, PaginatedResponse};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceQuery {
    pub status: Option<String>,
    pub customer_email: Option<String>,
    pub order_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

fn default_page() -> u64 {
    1
}
fn default_per_page() -> u64 {
    20
}

impl InvoiceQuery {
    fn filters(&self) -> InvoiceFilters {
        InvoiceFilters {
            status: self.status.clone(),
            customer_email: self.customer_email.clone(),
            order_id: self.order_id.clone(),
            from: self.from,
            to: self.to,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoiceQuery>,
) -> ApiResult<PaginatedResponse<invoice::Model>> {
    let (items, total) = state
        .services
        .invoices
        .search(&query.filters(), query.page, query.per_page)
        .await?;
    let limit = query.per_page.max(1);
    Ok(Json(ApiResponse::success(PaginatedResponse {
        items,
        total,
        page: query.page.max(1),
        limit,
        total_pages: total.div_ceil(limit),
    })))
}

async fn export_invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoiceQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let csv = state.services.invoices.export_csv(&query.filters()).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"invoices.csv\""),
        ],
        csv,
    ))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<invoice::Model> {
    Ok(Json(ApiResponse::success(state.services.invoices.get(id).await?)))
}

async fn update_invoice_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> ApiResult<invoice::Model> {
    let updated = state
        .services
        .invoices
        .update_invoice_status(id, &request.status, request.metadata)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// Invoice routes, nested under `/invoices`.
pub fn invoice_routes(state: &AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/:id/status", put(update_invoice_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    Router::new()
        .route("/", get(list_invoices))
        .route("/export", get(export_invoices))
        .route("/:id", get(get_invoice))
        .merge(admin)
}
