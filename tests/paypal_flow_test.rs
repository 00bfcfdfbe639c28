//! PayPal checkout: approval redirect, capture on callback, verified webhooks.

mod common;

use axum::http::{Method, StatusCode};
use common::{decimal, mock_provider_config, response_json, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PAYPAL_ORDER: &str = "5O190127TN364715T";

async fn paypal_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "A21AAF", "expires_in": 32400})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/checkout/orders"))
        .and(header("authorization", "Bearer A21AAF"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": PAYPAL_ORDER,
            "status": "CREATED",
            "links": [
                {"href": format!("https://api-m.sandbox.paypal.com/v2/checkout/orders/{PAYPAL_ORDER}"), "rel": "self"},
                {"href": format!("https://www.sandbox.paypal.com/checkoutnow?token={PAYPAL_ORDER}"), "rel": "approve"}
            ]
        })))
        .mount(&server)
        .await;
    server
}

/// Lists `agent-beta` at 50 EUR and opens a PayPal checkout for it.
async fn create_paypal_session(app: &TestApp) -> String {
    app.seed_listing(
        "agent-beta",
        "Support Agent",
        "You answer support tickets.",
        dec!(50),
        "EUR",
    )
    .await;
    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/create-session",
            Some(json!({
                "provider": "paypal",
                "amount": "50.00",
                "currency": "eur",
                "items": [{"id": "agent-beta", "title": "Support Agent", "price": "50.00"}],
                "customerInfo": {"email": "payer@example.com", "countryCode": "FR"}
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["data"]["sessionId"], PAYPAL_ORDER);
    assert_eq!(
        body["data"]["paymentUrl"],
        format!("https://www.sandbox.paypal.com/checkoutnow?token={PAYPAL_ORDER}")
    );
    assert_eq!(decimal(&body["data"]["amount"]), dec!(60.00));
    assert_eq!(body["data"]["currency"], "EUR");
    body["data"]["orderId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn approved_callback_captures_and_settles() {
    let server = paypal_server().await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/checkout/orders/{PAYPAL_ORDER}")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": PAYPAL_ORDER, "status": "APPROVED"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v2/checkout/orders/{PAYPAL_ORDER}/capture")))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": PAYPAL_ORDER,
            "status": "COMPLETED",
            "purchase_units": [{
                "payments": {"captures": [{"id": "3C679366HH908993F", "status": "COMPLETED"}]}
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::with_mock_providers(&server).await;
    let order_id = create_paypal_session(&app).await;

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/paypal/callback?token={PAYPAL_ORDER}&PayerID=QYR5Z8XDVJNXQ"),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = response_json(response).await["data"].clone();
    assert_eq!(outcome["outcome"], "success");
    assert_eq!(outcome["sessionStatus"], "success");
    assert_eq!(outcome["orderId"], order_id.as_str());
    assert_eq!(outcome["settlement"]["deliveryStatus"], "completed");
    assert!(outcome["settlement"]["invoiceNumber"]
        .as_str()
        .unwrap()
        .starts_with("INV-"));
    assert_eq!(outcome["settlement"]["templates"][0]["agentId"], "agent-beta");

    // Returning to the callback page again does not capture twice.
    let again = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/paypal/callback?token={PAYPAL_ORDER}"),
            None,
        )
        .await;
    assert_eq!(again.status(), StatusCode::OK);
    assert_eq!(response_json(again).await["data"]["outcome"], "success");
    assert_eq!(app.email.sent().len(), 1);

    let order = response_json(
        app.request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
            .await,
    )
    .await;
    assert_eq!(order["data"]["order"]["paymentId"], "3C679366HH908993F");
}

#[tokio::test]
async fn cancel_callback_marks_session_cancelled() {
    let server = paypal_server().await;
    let app = TestApp::with_mock_providers(&server).await;
    create_paypal_session(&app).await;

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/payments/paypal/callback?token={PAYPAL_ORDER}&status=cancelled"),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = response_json(response).await["data"].clone();
    assert_eq!(outcome["outcome"], "cancelled");
    assert_eq!(outcome["sessionStatus"], "cancelled");
    assert!(outcome.get("settlement").is_none());
}

fn transmission_headers() -> [(&'static str, String); 5] {
    [
        ("paypal-auth-algo", "SHA256withRSA".to_string()),
        ("paypal-cert-url", "https://api.sandbox.paypal.com/v1/notifications/certs/CERT".to_string()),
        ("paypal-transmission-id", "69cd13f0-d67a-11e5-baa3-778b53f4ae55".to_string()),
        ("paypal-transmission-sig", "c2lnbmF0dXJl".to_string()),
        ("paypal-transmission-time", "2016-02-18T20:01:35Z".to_string()),
    ]
}

/// App whose PayPal webhooks pass verification.
async fn verified_webhook_app(server: &MockServer) -> TestApp {
    Mock::given(method("POST"))
        .and(path("/v1/notifications/verify-webhook-signature"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"verification_status": "SUCCESS"})),
        )
        .mount(server)
        .await;

    let mut cfg = mock_provider_config(server);
    if let Some(paypal) = cfg.paypal.as_mut() {
        paypal.webhook_id = Some("WH-TEST".into());
    }
    TestApp::with_config(cfg).await
}

fn capture_completed(capture_id: &str) -> Vec<u8> {
    json!({
        "id": format!("WH-CAPTURE-{capture_id}"),
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "resource": {
            "id": capture_id,
            "status": "COMPLETED",
            "amount": {"currency_code": "EUR", "value": "60.00"},
            "supplementary_data": {"related_ids": {"order_id": PAYPAL_ORDER}}
        }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn verified_capture_webhook_settles_the_order() {
    let server = paypal_server().await;
    let app = verified_webhook_app(&server).await;
    let order_id = create_paypal_session(&app).await;

    let response = app
        .post_raw(
            "/api/v1/payments/paypal/webhook",
            capture_completed("CAPTURE-1"),
            &transmission_headers(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack = response_json(response).await;
    assert_eq!(ack["processed"], true);
    assert_eq!(ack["orderId"], order_id.as_str());

    let order = response_json(
        app.request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
            .await,
    )
    .await;
    assert_eq!(order["data"]["order"]["status"], "completed");
    assert_eq!(order["data"]["order"]["paymentId"], "CAPTURE-1");
}

#[tokio::test]
async fn refund_webhook_finds_the_session_through_its_capture() {
    let server = paypal_server().await;
    let app = verified_webhook_app(&server).await;
    let order_id = create_paypal_session(&app).await;

    let settled = app
        .post_raw(
            "/api/v1/payments/paypal/webhook",
            capture_completed("0KG5963426578311J"),
            &transmission_headers(),
        )
        .await;
    assert_eq!(response_json(settled).await["processed"], true);
    let download_url = app.email.sent()[0].download_url.clone();

    // Refund resources carry no order reference, only a link to the capture.
    let refund = json!({
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
    })
    .to_string()
    .into_bytes();
    let response = app
        .post_raw("/api/v1/payments/paypal/webhook", refund, &transmission_headers())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let ack = response_json(response).await;
    assert_eq!(ack["outcome"], "refunded");
    assert_eq!(ack["processed"], true);
    assert_eq!(ack["orderId"], order_id.as_str());

    let details = response_json(
        app.request(Method::GET, &format!("/api/v1/orders/{order_id}"), None)
            .await,
    )
    .await;
    assert_eq!(details["data"]["sessions"][0]["status"], "refunded");
    assert_eq!(details["data"]["invoice"]["status"], "refunded");

    let denied = app
        .request(Method::GET, download_url.trim_start_matches("https://agents.test"), None)
        .await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    assert_eq!(response_json(denied).await["revokedReason"], "refunded");
}

#[tokio::test]
async fn webhook_without_configured_webhook_id_is_rejected() {
    let server = paypal_server().await;
    let app = TestApp::with_mock_providers(&server).await;
    let response = app
        .post_raw(
            "/api/v1/payments/paypal/webhook",
            br#"{"id":"WH-1","event_type":"PAYMENT.CAPTURE.COMPLETED","resource":{}}"#.to_vec(),
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn provider_health_reports_authentication() {
    let server = paypal_server().await;
    let app = TestApp::with_mock_providers(&server).await;

    let response = app
        .request(Method::GET, "/api/v1/payments/paypal/health", None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["authenticated"], true);
    assert_eq!(body["data"]["environment"], "sandbox");
}
