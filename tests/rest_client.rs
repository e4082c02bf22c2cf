// Integration tests for `RestClient` against a mocked controller.

use std::time::Duration;

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use touchwand::{GatewayError, RestClient, UnitCommand};

// ── Helpers ─────────────────────────────────────────────────────────

fn host_port(server: &MockServer) -> (String, u16) {
    let url = Url::parse(&server.uri()).unwrap();
    (url.host_str().unwrap().to_string(), url.port().unwrap())
}

async fn mount_login(server: &MockServer, status: u16, body: &str) {
    Mock::given(method("GET"))
        .and(path("/auth/login"))
        .and(query_param("user", "admin"))
        .and(query_param("psw", "secret"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(server)
        .await;
}

async fn logged_in() -> (MockServer, RestClient) {
    let server = MockServer::start().await;
    mount_login(&server, 200, "Success").await;

    let client = RestClient::new().unwrap();
    let (host, port) = host_port(&server);
    assert!(client.connect("admin", "secret", &host, port).await);
    (server, client)
}

// ── Login ───────────────────────────────────────────────────────────

#[tokio::test]
async fn login_success_connects() {
    let (_server, client) = logged_in().await;
    assert!(client.is_connected().await);
}

#[tokio::test]
async fn login_body_unauthorized_is_rejected() {
    let server = MockServer::start().await;
    mount_login(&server, 200, "Unauthorized").await;

    let client = RestClient::new().unwrap();
    let (host, port) = host_port(&server);
    assert!(!client.connect("admin", "secret", &host, port).await);
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn login_http_401_is_rejected() {
    let server = MockServer::start().await;
    mount_login(&server, 401, "").await;

    let client = RestClient::new().unwrap();
    let (host, port) = host_port(&server);
    assert!(!client.connect("admin", "secret", &host, port).await);
}

// ── Units ───────────────────────────────────────────────────────────

#[tokio::test]
async fn list_units_returns_raw_body() {
    let (server, client) = logged_in().await;
    let body = json!([{ "id": 1, "name": "Lamp", "type": "Switch" }]);

    Mock::given(method("GET"))
        .and(path("/units/listUnits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .mount(&server)
        .await;

    let response = client.list_units().await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed, body);
}

#[tokio::test]
async fn get_unit_by_id_passes_the_id() {
    let (server, client) = logged_in().await;

    Mock::given(method("GET"))
        .and(path("/units/getUnitByID"))
        .and(query_param("id", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"id":42}"#))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(client.get_unit_by_id("42").await.unwrap(), r#"{"id":42}"#);
}

#[tokio::test]
async fn send_command_posts_the_action_body() {
    let (server, client) = logged_in().await;

    Mock::given(method("POST"))
        .and(path("/units/action"))
        .and(body_json(json!({ "id": 7, "value": 0, "type": "stop" })))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    client.send_command("7", UnitCommand::ShutterStop).await.unwrap();
}

#[tokio::test]
async fn server_error_is_reported() {
    let (server, client) = logged_in().await;

    Mock::given(method("GET"))
        .and(path("/units/listUnits"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = client.list_units().await;
    assert!(
        matches!(result, Err(GatewayError::InvalidResponse(_))),
        "expected InvalidResponse, got: {result:?}"
    );
}

#[tokio::test]
async fn slow_controller_times_out() {
    let server = MockServer::start().await;
    mount_login(&server, 200, "Success").await;
    Mock::given(method("GET"))
        .and(path("/units/listUnits"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]").set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let client = RestClient::with_timeout(Duration::from_millis(200)).unwrap();
    let (host, port) = host_port(&server);
    assert!(client.connect("admin", "secret", &host, port).await);

    let result = client.list_units().await;
    assert!(
        matches!(result, Err(GatewayError::Timeout)),
        "expected Timeout, got: {result:?}"
    );
}
