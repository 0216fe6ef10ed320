//! Control API over `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use portico::api::{create_router, AppState};
use portico::config::Config;
use portico::dns::UdpResolver;
use portico::hub::Hub;
use portico::listener::IngressReceivers;
use portico_events::{LogEvent, LogLevel};
use rstest::rstest;
use serde_json::Value;
use tower::ServiceExt;

use common::{free_port, hub};

struct TestApi {
    app: Router,
    hub: Arc<Hub>,
    _receivers: IngressReceivers,
}

async fn api(secret: &str) -> TestApi {
    let (hub, receivers) = hub();
    if !secret.is_empty() {
        let config = Config::parse(&format!("secret: {secret}")).unwrap();
        hub.apply_config(config).await;
    }
    TestApi {
        app: create_router(AppState::new(hub.clone())),
        hub,
        _receivers: receivers,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[rstest]
#[case("", None, StatusCode::OK)]
#[case("", Some("Bearer anything"), StatusCode::OK)]
#[case("s3cret", None, StatusCode::UNAUTHORIZED)]
#[case("s3cret", Some("Bearer wrong"), StatusCode::UNAUTHORIZED)]
#[case("s3cret", Some("s3cret"), StatusCode::UNAUTHORIZED)]
#[case("s3cret", Some("Bearer s3cret"), StatusCode::OK)]
#[tokio::test]
async fn auth_matrix(#[case] secret: &str, #[case] authorization: Option<&str>, #[case] expected: StatusCode) {
    let TestApi { app, _receivers, .. } = api(secret).await;
    let mut request = Request::builder().uri("/version");
    if let Some(value) = authorization {
        request = request.header(header::AUTHORIZATION, value);
    }

    let response = app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), expected);
    if expected == StatusCode::UNAUTHORIZED {
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/problem+json"
        );
        assert_eq!(json_body(response).await["code"], "unauthorized");
    }
}

#[tokio::test]
async fn token_query_only_counts_on_upgrade() {
    let TestApi { app, _receivers, .. } = api("s3cret").await;

    let plain = app.clone().oneshot(get("/version?token=s3cret")).await.unwrap();
    assert_eq!(plain.status(), StatusCode::UNAUTHORIZED);

    let upgrade = Request::builder()
        .uri("/version?token=s3cret")
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(upgrade).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn version_reports_crate_version() {
    let TestApi { app, _receivers, .. } = api("").await;
    let response = app.oneshot(get("/version")).await.unwrap();
    assert_eq!(json_body(response).await["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn dns_probe_without_resolver_is_unavailable() {
    let TestApi { app, _receivers, .. } = api("").await;
    let response = app.oneshot(get("/dns/query?name=example.com&type=A")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["code"], "resolver_unavailable");
}

#[tokio::test]
async fn dns_probe_rejects_unknown_record_type() {
    let TestApi { app, hub, _receivers } = api("").await;
    let resolver = UdpResolver::new(vec!["127.0.0.1:9".parse().unwrap()], Duration::from_millis(10));
    hub.resolver().set(Some(Box::new(resolver)));

    let response = app.oneshot(get("/dns/query?name=example.com&type=BOGUS")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "invalid_record_type");
}

#[tokio::test]
async fn inbounds_replace_and_list() {
    let TestApi { app, hub, _receivers } = api("").await;
    let port = free_port();
    let body = format!(r#"[{{"type":"http","bind-address":"127.0.0.1:{port}"}}]"#);

    let request = Request::builder()
        .method("PUT")
        .uri("/inbounds")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report = json_body(response).await;
    assert_eq!(report["created"][0], format!("http://127.0.0.1:{port}"));

    let listed = json_body(app.oneshot(get("/inbounds")).await.unwrap()).await;
    assert_eq!(listed[0]["type"], "http");
    assert_eq!(listed[0]["bind-address"], format!("127.0.0.1:{port}"));

    hub.shutdown().await;
}

#[tokio::test]
async fn inbounds_reject_unknown_type() {
    let TestApi { app, _receivers, .. } = api("").await;
    let request = Request::builder()
        .method("PUT")
        .uri("/inbounds")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"[{"type":"tun","bind-address":":1"}]"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "invalid_inbound");
}

#[tokio::test]
async fn closing_unknown_connection_is_not_found() {
    let TestApi { app, _receivers, .. } = api("").await;
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/connections/{}", uuid::Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "connection_not_found");
}

#[tokio::test]
async fn connections_snapshot_is_empty() {
    let TestApi { app, _receivers, .. } = api("").await;
    let snapshot = json_body(app.oneshot(get("/connections")).await.unwrap()).await;
    assert_eq!(snapshot["connections"], Value::Array(Vec::new()));
    assert_eq!(snapshot["uploadTotal"], 0);
}

#[tokio::test]
async fn configs_patch_updates_general() {
    let TestApi { app, hub, _receivers } = api("").await;
    let request = Request::builder()
        .method("PATCH")
        .uri("/configs")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"allow-lan":true,"mode":"direct"}"#))
        .unwrap();
    let patched = json_body(app.clone().oneshot(request).await.unwrap()).await;
    assert_eq!(patched["allow-lan"], true);
    assert_eq!(patched["mode"], "direct");

    let current = json_body(app.oneshot(get("/configs")).await.unwrap()).await;
    assert_eq!(current["allow-lan"], true);
    assert!(hub.manager().legacy_binding().await.allow_lan);
}

#[tokio::test]
async fn logs_stream_as_ndjson() {
    let TestApi { app, hub, _receivers } = api("").await;
    let response = app.oneshot(get("/logs?level=warning")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/x-ndjson");

    let bus = hub.log().bus();
    assert_eq!(bus.subscriber_count(), 1);
    bus.publish(LogEvent::new(LogLevel::Info, "filtered out"));
    bus.publish(LogEvent::new(LogLevel::Error, "kept"));

    let mut body = response.into_body().into_data_stream();
    let chunk = tokio::time::timeout(Duration::from_secs(1), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let line: Value = serde_json::from_slice(&chunk).unwrap();
    assert_eq!(line["type"], "error");
    assert_eq!(line["payload"], "kept");

    drop(body);
    assert_eq!(bus.subscriber_count(), 0);
}

#[tokio::test]
async fn logs_reject_unknown_level() {
    let TestApi { app, _receivers, .. } = api("").await;
    let response = app.oneshot(get("/logs?level=loud")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
