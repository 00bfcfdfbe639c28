//! Agent marketplace backend.
//!
//! Checkout sessions across several payment providers, webhook and callback
//! reconciliation, order processing with template delivery, and invoicing.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod services;
pub mod tracing;
pub mod webhooks;

use axum::{response::Json, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub services: handlers::AppServices,
}

// Common response wrappers
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            meta: Some(ResponseMeta::capture()),
        }
    }
}


/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Versioned API surface mounted under `/api/v1`.
pub fn api_v1_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .nest("/payments", handlers::payments::payment_routes(state))
        .nest("/templates", handlers::templates::template_routes(state))
        .nest("/orders", handlers::orders::order_routes(state))
        .nest("/invoices", handlers::invoices::invoice_routes(state))
        .merge(handlers::health::health_routes())
}

/// Full application router with request ids and HTTP tracing applied.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(handlers::health::health_routes())
        .nest("/api/v1", api_v1_routes(&state))
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            crate::tracing::request_id_middleware,
        ))
        .with_state(state)
}
