#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::{DateTime, Utc};
use marketplace_api::{
    config::{AppConfig, GatewayConfig, PayPalConfig},
    db,
    entities::{agent, template_access_token},
    handlers::{AppServices, ADMIN_KEY_HEADER},
    services::agent_content::{ContentResolver, DbContentResolver},
    services::notifications::{EmailError, EmailSender, PurchaseEmail},
    AppState,
};
use rust_decimal_macros::dec;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use tower::ServiceExt;
use wiremock::MockServer;

pub const ADMIN_KEY: &str = "test-admin-key";
pub const GATEWAY_WEBHOOK_SECRET: &str = "gw_webhook_secret_0123456789";

/// E-mail backend that records every message and can be told to fail.
#[derive(Default)]
pub struct RecordingEmail {
    sent: Mutex<Vec<PurchaseEmail>>,
    failing: Mutex<bool>,
}

impl RecordingEmail {
    pub fn sent(&self) -> Vec<PurchaseEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl EmailSender for RecordingEmail {
    async fn send_agent_purchase_email(&self, email: &PurchaseEmail) -> Result<String, EmailError> {
        if *self.failing.lock().unwrap() {
            return Err(EmailError::Transport("smtp unavailable".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(email.clone());
        Ok(format!("msg-{}", sent.len()))
    }
}

/// Application over a fresh in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub email: Arc<RecordingEmail>,
}

fn base_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.admin_api_key = Some(ADMIN_KEY.to_string());
    cfg.http_timeout_secs = 5;
    cfg.delivery.public_base_url = "https://agents.test".to_string();
    cfg
}

/// Gateway and PayPal both pointed at one mock server; their paths do not overlap.
pub fn mock_provider_config(server: &MockServer) -> AppConfig {
    let mut cfg = base_config();
    cfg.gateway = Some(GatewayConfig {
        client_id: "gw-client".into(),
        client_secret: "gw-secret".into(),
        sandbox: true,
        base_url: Some(server.uri()),
        webhook_secret: GATEWAY_WEBHOOK_SECRET.into(),
        settlement_currency: "EUR".into(),
        conversion_rates: HashMap::from([
            ("EUR".to_string(), dec!(1)),
            ("USD".to_string(), dec!(0.92)),
        ]),
        merchant_order_prefix: "AM".into(),
        success_url: "https://agents.test/checkout/success".into(),
        cancel_url: "https://agents.test/checkout/cancel".into(),
    });
    cfg.paypal = Some(PayPalConfig {
        client_id: "pp-client".into(),
        client_secret: "pp-secret".into(),
        sandbox: true,
        base_url: Some(server.uri()),
        webhook_id: None,
        return_url: "https://agents.test/checkout/paypal/return".into(),
        cancel_url: "https://agents.test/checkout/paypal/cancel".into(),
        brand_name: "Agent Marketplace".into(),
    });
    cfg
}

impl TestApp {
    /// No payment providers configured.
    pub async fn new() -> Self {
        Self::with_config(base_config()).await
    }

    pub async fn with_mock_providers(server: &MockServer) -> Self {
        Self::with_config(mock_provider_config(server)).await
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        let pool = db::establish_connection(&cfg.database_url)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let email = Arc::new(RecordingEmail::default());
        let content: Arc<dyn ContentResolver> = Arc::new(DbContentResolver::new(db_arc.clone()));
        let services = AppServices::new(db_arc.clone(), &cfg, email.clone(), content)
            .expect("services should build");

        let state = AppState {
            db: db_arc,
            config: cfg,
            services,
        };
        let router = marketplace_api::build_app(state.clone());

        Self {
            router,
            state,
            email,
        }
    }

    /// Active listing priced at 100 EUR.
    pub async fn seed_agent(&self, id: &str, title: &str, template: &str) -> agent::Model {
        self.seed_listing(id, title, template, dec!(100), "EUR").await
    }

    pub async fn seed_listing(
        &self,
        id: &str,
        title: &str,
        template: &str,
        price: Decimal,
        currency: &str,
    ) -> agent::Model {
        agent::ActiveModel {
            id: Set(id.to_string()),
            title: Set(title.to_string()),
            price: Set(price),
            currency: Set(currency.to_string()),
            template: Set(Some(template.to_string())),
            is_active: Set(true),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(self.state.db.as_ref())
        .await
        .expect("seed agent")
    }

    /// Rewrites a token's expiry directly in storage.
    pub async fn set_token_expiry(&self, token: &str, expires_at: DateTime<Utc>) {
        let stored = template_access_token::Entity::find_by_id(token.to_string())
            .one(self.state.db.as_ref())
            .await
            .expect("load token")
            .expect("token exists");
        let mut active: template_access_token::ActiveModel = stored.into();
        active.expires_at = Set(expires_at);
        active
            .update(self.state.db.as_ref())
            .await
            .expect("update token expiry");
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request_with_headers(method, uri, body, &[]).await
    }

    pub async fn request_admin(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        self.request_with_headers(method, uri, body, &[(ADMIN_KEY_HEADER, ADMIN_KEY)])
            .await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("valid request");
        self.send(request).await
    }

    /// Posts raw bytes, as a provider would, with the given headers.
    pub async fn post_raw(&self, uri: &str, payload: Vec<u8>, headers: &[(&str, String)]) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        self.send(builder.body(Body::from(payload)).expect("valid request"))
            .await
    }
}

pub async fn response_bytes(response: Response) -> Vec<u8> {
    body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes")
        .to_vec()
}

pub async fn response_json(response: Response) -> Value {
    serde_json::from_slice(&response_bytes(response).await).expect("json response")
}

/// Decimals come back as strings with storage-dependent scale.
pub fn decimal(value: &Value) -> rust_decimal::Decimal {
    value
        .as_str()
        .map(|s| s.parse().expect("decimal string"))
        .or_else(|| value.as_f64().map(|f| rust_decimal::Decimal::try_from(f).expect("decimal")))
        .expect("decimal value")
        .round_dp(2)
}
