use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::entities::template_access_token;
use crate::errors::ServiceError;
use crate::handlers::{require_admin_key, AppState};
use crate::services::agent_content::TemplateContent;
use crate::services::template_access::TokenCheck;
use crate::{ApiResponse, ApiResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub order_id: Option<String>,
    pub token: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadFormat {
    Attachment,
    Text,
    Json,
}

impl DownloadFormat {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|f| f.trim().to_ascii_lowercase()).as_deref() {
            Some("download" | "file") => DownloadFormat::Attachment,
            Some("text" | "txt") => DownloadFormat::Text,
            _ => DownloadFormat::Json,
        }
    }
}

/// 403 body for unusable tokens. Carries the revocation reason or expiry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDenied {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
}

impl AccessDenied {
    fn from_check(check: TokenCheck) -> Option<Self> {
        let denied = |message: &str| AccessDenied {
            error: "Forbidden",
            message: message.to_string(),
            revoked_reason: None,
            expired_at: None,
        };
        match check {
            TokenCheck::Valid(_) => None,
            TokenCheck::NotFound => Some(denied("invalid access token")),
            TokenCheck::Mismatch => Some(denied("access token does not match this order and agent")),
            TokenCheck::Expired { expired_at } => Some(AccessDenied {
                expired_at: Some(expired_at),
                ..denied("access token expired")
            }),
            TokenCheck::Revoked { reason } => Some(AccessDenied {
                revoked_reason: Some(reason.unwrap_or_else(|| "revoked".to_string())),
                ..denied("access token revoked")
            }),
        }
    }
}

impl IntoResponse for AccessDenied {
    fn into_response(self) -> Response {
        (StatusCode::FORBIDDEN, Json(self)).into_response()
    }
}

async fn download_template(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ServiceError> {
    let (Some(order_id), Some(token)) = (query.order_id.as_deref(), query.token.as_deref()) else {
        return Err(ServiceError::ValidationError("orderId and token are required".into()));
    };

    let check = state.services.tokens.check(token, order_id, &agent_id).await?;
    let record = match check {
        TokenCheck::Valid(record) => record,
        other => {
            warn!(%agent_id, order_id, "template download denied");
            metrics::counter!("marketplace.templates.denied", 1);
            return Ok(AccessDenied::from_check(other)
                .map(|denied| denied.into_response())
                .unwrap_or_else(|| StatusCode::FORBIDDEN.into_response()));
        }
    };

    let template = state.services.content.resolve(&agent_id).await?;
    state.services.tokens.record_use(token).await?;
    metrics::counter!("marketplace.templates.downloads", 1);
    info!(%agent_id, order_id, "template downloaded");

    let format = DownloadFormat::parse(query.format.as_deref());
    Ok(match format {
        DownloadFormat::Attachment => {
            let body = match &template.content {
                TemplateContent::Json(value) => value.clone(),
                TemplateContent::Text(text) => json!({
                    "agentId": template.agent_id,
                    "title": template.title,
                    "template": text,
                }),
            };
            let pretty = serde_json::to_string_pretty(&body)?;
            (
                [
                    (header::CONTENT_TYPE, "application/json".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{}.json\"", sanitize_filename(&agent_id)),
                    ),
                ],
                pretty,
            )
                .into_response()
        }
        DownloadFormat::Text => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            template.content.as_text(),
        )
            .into_response(),
        DownloadFormat::Json => Json(ApiResponse::success(json!({
            "agentId": template.agent_id,
            "title": template.title,
            "orderId": record.order_id,
            "format": match template.content {
                TemplateContent::Json(_) => "json",
                TemplateContent::Text(_) => "text",
            },
            "template": template.content.as_json(),
            "expiresAt": record.expires_at,
        })))
        .into_response(),
    })
}

fn sanitize_filename(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
pub struct RevokeRequest {
    pub reason: Option<String>,
}

async fn revoke_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: Option<Json<RevokeRequest>>,
) -> ApiResult<template_access_token::Model> {
    let reason = body
        .and_then(|Json(r)| r.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "revoked_by_admin".to_string());
    let revoked = state.services.tokens.revoke(&token, &reason).await?;
    Ok(Json(ApiResponse::success(revoked)))
}

/// Template routes, nested under `/templates`.
pub fn template_routes(state: &AppState) -> Router<AppState> {
    let admin = Router::new()
        .route("/tokens/:token/revoke", post(revoke_token))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    Router::new()
        .route("/download/:agent_id", get(download_template))
        .merge(admin)
}
