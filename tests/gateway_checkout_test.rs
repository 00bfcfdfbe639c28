//! End-to-end checkout through the regional gateway: session creation,
//! signed webhooks, order delivery, invoicing and refunds.

mod common;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use common::{decimal, response_json, TestApp, GATEWAY_WEBHOOK_SECRET};
use marketplace_api::entities::order::DeliveryStatus;
use marketplace_api::services::orders::NewOrder;
use marketplace_api::services::payments::regional_gateway::{sign_payload, SIGNATURE_HEADER};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn gateway_server(payment_id: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "gw-token", "expires_in": 3600})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/payments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": payment_id,
            "status": "created",
            "redirect_url": format!("https://gateway.test/pay/{payment_id}"),
        })))
        .mount(&server)
        .await;
    server
}

fn checkout_body(currency: &str, country: &str) -> Value {
    json!({
        "provider": "gateway",
        "amount": "100.00",
        "currency": currency,
        "items": [{"id": "agent-alpha", "title": "Research Agent", "price": "100.00"}],
        "customerInfo": {
            "email": "buyer@example.com",
            "name": "Ada Buyer",
            "countryCode": country
        },
        "metadata": {"source": "web", "isAdmin": true}
    })
}

async fn post_checkout(app: &TestApp, body: Value) -> axum::response::Response {
    app.request(Method::POST, "/api/v1/payments/create-session", Some(body))
        .await
}

async fn create_gateway_session(app: &TestApp, currency: &str, country: &str) -> Value {
    let response = post_checkout(app, checkout_body(currency, country)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    response_json(response).await["data"].clone()
}

fn webhook_body(event_id: &str, payment_id: &str, status: &str) -> Vec<u8> {
    json!({
        "event_id": event_id,
        "event_type": format!("payment.{status}"),
        "data": {
            "payment_id": payment_id,
            "status": status,
            "transaction_id": format!("txn_{event_id}"),
            "amount": 11900,
            "currency": "EUR"
        }
    })
    .to_string()
    .into_bytes()
}

async fn send_signed(app: &TestApp, body: Vec<u8>) -> axum::response::Response {
    let now = Utc::now().timestamp();
    let signature = format!("t={},v1={}", now, sign_payload(GATEWAY_WEBHOOK_SECRET, now, &body));
    app.post_raw(
        "/api/v1/payments/gateway/webhook",
        body,
        &[(SIGNATURE_HEADER, signature)],
    )
    .await
}

#[tokio::test]
async fn create_session_applies_vat_and_records_the_session() {
    let server = gateway_server("pay_vat").await;
    let app = TestApp::with_mock_providers(&server).await;
    app.seed_agent("agent-alpha", "Research Agent", "prompt").await;

    let session = create_gateway_session(&app, "EUR", "DE").await;
    assert_eq!(session["provider"], "gateway");
    assert_eq!(session["sessionId"], "pay_vat");
    assert_eq!(session["paymentUrl"], "https://gateway.test/pay/pay_vat");
    assert_eq!(decimal(&session["amount"]), dec!(119.00));
    assert_eq!(decimal(&session["taxAmount"]), dec!(19.00));
    assert_eq!(session["currency"], "EUR");
    assert!(session["orderId"].as_str().unwrap().starts_with("ord_"));

    let response = app
        .request(Method::GET, "/api/v1/payments/status/pay_vat", None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let stored = &response_json(response).await["data"]["session"];
    assert_eq!(stored["status"], "created");
    assert_eq!(stored["customerInfo"]["email"], "buyer@example.com");
    // Unknown metadata keys never reach storage.
    assert!(stored["metadata"].get("isAdmin").is_none());
    assert_eq!(stored["metadata"]["source"], "web");
}

#[tokio::test]
async fn foreign_currency_is_converted_to_settlement_currency() {
    let server = gateway_server("pay_usd").await;
    let app = TestApp::with_mock_providers(&server).await;
    app.seed_listing("agent-alpha", "Research Agent", "prompt", dec!(100), "USD")
        .await;

    let session = create_gateway_session(&app, "USD", "US").await;
    assert_eq!(session["currency"], "EUR");
    assert_eq!(decimal(&session["amount"]), dec!(92.00));
    assert_eq!(session["originalCurrency"], "USD");
    assert_eq!(decimal(&session["originalAmount"]), dec!(100.00));
    assert_eq!(decimal(&session["taxAmount"]), dec!(0));
}

#[tokio::test]
async fn success_webhook_creates_one_order_and_one_invoice() {
    let server = gateway_server("pay_123").await;
    let app = TestApp::with_mock_providers(&server).await;
    app.seed_agent("agent-alpha", "Research Agent", "You are a meticulous research agent.")
        .await;

    let session = create_gateway_session(&app, "EUR", "DE").await;
    let order_id = session["orderId"].as_str().unwrap().to_string();

    let response = send_signed(&app, webhook_body("evt_1", "pay_123", "succeeded")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack = response_json(response).await;
    assert_eq!(ack["received"], true);
    assert_eq!(ack["duplicate"], false);
    assert_eq!(ack["processed"], true);
    assert_eq!(ack["outcome"], "success");
    assert_eq!(ack["orderId"], order_id.as_str());

    let response = app
        .request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let details = response_json(response).await["data"].clone();
    assert_eq!(details["order"]["status"], "completed");
    assert_eq!(details["order"]["deliveryStatus"], "completed");
    assert_eq!(details["order"]["userEmail"], "buyer@example.com");
    assert_eq!(details["order"]["paymentId"], "txn_evt_1");
    assert_eq!(details["sessions"][0]["status"], "success");
    let invoice = &details["invoice"];
    assert_eq!(invoice["status"], "paid");
    assert_eq!(decimal(&invoice["total"]), dec!(119.00));
    assert_eq!(decimal(&invoice["taxAmount"]), dec!(19.00));
    assert_eq!(decimal(&invoice["subtotal"]), dec!(100.00));
    assert!(invoice["invoiceNumber"].as_str().unwrap().starts_with("INV-"));

    let sent = app.email.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "buyer@example.com");
    assert_eq!(sent[0].agent_title, "Research Agent");
    assert!(sent[0]
        .download_url
        .starts_with("https://agents.test/api/v1/templates/download/agent-alpha?orderId="));

    // Replays and a second success event for the same session are no-ops.
    let replay = response_json(send_signed(&app, webhook_body("evt_1", "pay_123", "succeeded")).await).await;
    assert_eq!(replay["duplicate"], true);
    assert_eq!(replay["processed"], false);

    let second = response_json(send_signed(&app, webhook_body("evt_2", "pay_123", "succeeded")).await).await;
    assert_eq!(second["duplicate"], false);
    assert_eq!(second["processed"], true);

    assert_eq!(app.email.sent().len(), 1);
    let invoices = response_json(
        app.request(Method::GET, &format!("/api/v1/invoices?orderId={order_id}"), None)
            .await,
    )
    .await;
    assert_eq!(invoices["data"]["total"], 1);
}

#[tokio::test]
async fn unsigned_or_tampered_webhooks_are_rejected() {
    let server = gateway_server("pay_sig").await;
    let app = TestApp::with_mock_providers(&server).await;
    app.seed_agent("agent-alpha", "Research Agent", "prompt").await;
    create_gateway_session(&app, "EUR", "DE").await;

    let body = webhook_body("evt_sig", "pay_sig", "succeeded");
    let unsigned = app
        .post_raw("/api/v1/payments/gateway/webhook", body.clone(), &[])
        .await;
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let now = Utc::now().timestamp();
    let wrong = format!("t={},v1={}", now, sign_payload("some-other-secret-value", now, &body));
    let tampered = app
        .post_raw(
            "/api/v1/payments/gateway/webhook",
            body,
            &[(SIGNATURE_HEADER, wrong)],
        )
        .await;
    assert_eq!(tampered.status(), StatusCode::UNAUTHORIZED);

    let session = response_json(
        app.request(Method::GET, "/api/v1/payments/status/pay_sig", None)
            .await,
    )
    .await;
    assert_eq!(session["data"]["session"]["status"], "created");
}

#[tokio::test]
async fn failed_session_is_never_settled_by_a_late_success() {
    let server = gateway_server("pay_fail").await;
    let app = TestApp::with_mock_providers(&server).await;
    app.seed_agent("agent-alpha", "Research Agent", "prompt").await;
    let session = create_gateway_session(&app, "EUR", "DE").await;
    let order_id = session["orderId"].as_str().unwrap().to_string();

    let failed = response_json(send_signed(&app, webhook_body("evt_f1", "pay_fail", "failed")).await).await;
    assert_eq!(failed["outcome"], "failed");
    assert_eq!(failed["processed"], true);

    let late = response_json(send_signed(&app, webhook_body("evt_f2", "pay_fail", "succeeded")).await).await;
    assert_eq!(late["received"], true);
    assert_eq!(late["processed"], false);

    let status = response_json(
        app.request(Method::GET, "/api/v1/payments/status/pay_fail", None)
            .await,
    )
    .await;
    assert_eq!(status["data"]["session"]["status"], "failed");

    let order = app
        .request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
        .await;
    assert_eq!(order.status(), StatusCode::NOT_FOUND);
    assert!(app.email.sent().is_empty());
}

#[tokio::test]
async fn admin_refund_revokes_access_and_refunds_the_invoice() {
    let server = gateway_server("pay_ref").await;
    Mock::given(method("POST"))
        .and(path("/v1/payments/pay_ref/refunds"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "re_1", "status": "succeeded"})),
        )
        .mount(&server)
        .await;
    let app = TestApp::with_mock_providers(&server).await;
    app.seed_agent("agent-alpha", "Research Agent", "prompt").await;
    let session = create_gateway_session(&app, "EUR", "DE").await;
    let order_id = session["orderId"].as_str().unwrap().to_string();
    send_signed(&app, webhook_body("evt_r1", "pay_ref", "succeeded")).await;

    let refund_body = json!({"sessionId": "pay_ref", "amount": "119.00", "reason": "requested"});
    let anonymous = app
        .request(Method::POST, "/api/v1/payments/gateway/refund", Some(refund_body.clone()))
        .await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .request_admin(Method::POST, "/api/v1/payments/gateway/refund", Some(refund_body))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = response_json(response).await["data"].clone();
    assert_eq!(outcome["refundId"], "re_1");
    assert_eq!(outcome["tokensRevoked"], 1);
    assert_eq!(outcome["invoiceRefunded"], true);

    let download_url = app.email.sent()[0].download_url.clone();
    let path_and_query = download_url.trim_start_matches("https://agents.test");
    let denied = app.request(Method::GET, path_and_query, None).await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    let body = response_json(denied).await;
    assert_eq!(body["revokedReason"], "refunded");

    let details = response_json(
        app.request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
            .await,
    )
    .await;
    assert_eq!(details["data"]["invoice"]["status"], "refunded");
    assert_eq!(details["data"]["sessions"][0]["status"], "refunded");

    // Refunding twice is an invalid transition.
    let again = app
        .request_admin(
            Method::POST,
            "/api/v1/payments/gateway/refund",
            Some(json!({"sessionId": "pay_ref", "amount": "1.00"})),
        )
        .await;
    assert_eq!(again.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unconfigured_provider_is_a_bad_request() {
    let app = TestApp::new().await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-session",
            Some(json!({
                "provider": "wallet",
                "amount": "10.00",
                "currency": "EUR",
                "items": [{"id": "a", "title": "A", "price": "10.00"}],
                "customerInfo": {"email": "buyer@example.com"}
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn checkout_is_priced_from_the_listing() {
    let server = gateway_server("pay_priced").await;
    let app = TestApp::with_mock_providers(&server).await;
    app.seed_agent("agent-alpha", "Research Agent", "prompt").await;
    app.seed_listing("agent-retired", "Retired Agent", "prompt", dec!(100), "EUR")
        .await;
    {
        use marketplace_api::entities::agent;
        use sea_orm::{ActiveModelTrait, EntityTrait, Set};
        let retired = agent::Entity::find_by_id("agent-retired".to_string())
            .one(app.state.db.as_ref())
            .await
            .unwrap()
            .unwrap();
        let mut active: agent::ActiveModel = retired.into();
        active.is_active = Set(false);
        active.update(app.state.db.as_ref()).await.unwrap();
    }

    let mut underpaid = checkout_body("EUR", "DE");
    underpaid["amount"] = json!("0.01");
    assert_eq!(post_checkout(&app, underpaid).await.status(), StatusCode::BAD_REQUEST);

    let mut repriced = checkout_body("EUR", "DE");
    repriced["amount"] = json!("0.01");
    repriced["items"][0]["price"] = json!("0.01");
    let response = post_checkout(&app, repriced).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let message = response_json(response).await["message"].as_str().unwrap().to_string();
    assert!(message.contains("agent-alpha"));

    let mut unknown = checkout_body("EUR", "DE");
    unknown["items"][0]["id"] = json!("agent-missing");
    assert_eq!(post_checkout(&app, unknown).await.status(), StatusCode::BAD_REQUEST);

    let mut inactive = checkout_body("EUR", "DE");
    inactive["items"][0]["id"] = json!("agent-retired");
    assert_eq!(post_checkout(&app, inactive).await.status(), StatusCode::BAD_REQUEST);

    let wrong_currency = checkout_body("USD", "US");
    assert_eq!(post_checkout(&app, wrong_currency).await.status(), StatusCode::BAD_REQUEST);

    // Titles come from the listing, not the client.
    let mut renamed = checkout_body("EUR", "DE");
    renamed["items"][0]["title"] = json!("Free Agent");
    let response = post_checkout(&app, renamed).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let session = response_json(
        app.request(Method::GET, "/api/v1/payments/status/pay_priced", None)
            .await,
    )
    .await;
    let stored = &session["data"]["session"];
    assert_eq!(stored["items"][0]["title"], "Research Agent");
    assert_eq!(decimal(&stored["amount"]), dec!(119.00));
}

#[tokio::test]
async fn order_id_already_in_use_is_rejected() {
    let server = gateway_server("pay_owner").await;
    let app = TestApp::with_mock_providers(&server).await;
    app.seed_agent("agent-alpha", "Research Agent", "prompt").await;

    let mut first = checkout_body("EUR", "DE");
    first["metadata"]["orderId"] = json!("ord_victim");
    let response = post_checkout(&app, first.clone()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response_json(response).await["data"]["orderId"], "ord_victim");

    let mut reused = first;
    reused["customerInfo"]["email"] = json!("someone-else@example.com");
    let response = post_checkout(&app, reused).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // An order without any session is protected too.
    app.state
        .services
        .orders
        .create_if_absent(NewOrder {
            id: "ord_settled".into(),
            user_id: None,
            user_email: Some("owner@example.com".into()),
            items: vec![],
            total: dec!(119),
            currency: "EUR".into(),
            payment_id: None,
            payment_method: None,
            provider: None,
            delivery_status: DeliveryStatus::Pending,
        })
        .await
        .unwrap();
    let mut onto_order = checkout_body("EUR", "DE");
    onto_order["metadata"]["orderId"] = json!("ord_settled");
    assert_eq!(post_checkout(&app, onto_order).await.status(), StatusCode::CONFLICT);

    let sessions = response_json(
        app.request(Method::GET, "/api/v1/payments/status/ord_victim?type=order", None)
            .await,
    )
    .await;
    assert_eq!(sessions["data"]["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn checkout_without_any_email_is_rejected() {
    let server = gateway_server("pay_anon").await;
    let app = TestApp::with_mock_providers(&server).await;
    app.seed_agent("agent-alpha", "Research Agent", "prompt").await;

    let mut anonymous = checkout_body("EUR", "DE");
    anonymous["customerInfo"] = json!({"name": "Ada Buyer", "countryCode": "DE"});
    assert_eq!(post_checkout(&app, anonymous.clone()).await.status(), StatusCode::BAD_REQUEST);

    anonymous["metadata"]["email"] = json!("buyer@example.com");
    assert_eq!(post_checkout(&app, anonymous).await.status(), StatusCode::CREATED);
}
