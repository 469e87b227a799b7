//! End-to-end enforcement scenarios against a mock control plane.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{middleware, Router};
use mockito::Matcher;
use tower::ServiceExt;

use palisade_axum::{edl_access, EdlState};
use palisade_core::config::{IpStrategy, MiddlewareConfig};
use palisade_core::manager::Manager;

use crate::support::mount_control_plane;

fn router(state: EdlState) -> Router {
    Router::new()
        .route("/", get(|| async { "upstream ok" }))
        .layer(middleware::from_fn_with_state(state, edl_access))
}

fn request_from(peer: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let addr: SocketAddr = format!("{peer}:4711").parse().expect("peer address");
    let mut builder = Request::builder().uri("/").extension(ConnectInfo(addr));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).expect("request should build")
}

async fn connected(
    server: &mut mockito::ServerGuard,
    purpose: &str,
    prefixes: &[&str],
    mutate: impl FnOnce(&mut MiddlewareConfig),
) -> (Arc<Manager>, EdlState) {
    let token = mount_control_plane(server, purpose, prefixes).await;
    let mut config = MiddlewareConfig {
        bootstrap_token: token,
        machine_id: "machine-e2e".to_string(),
        ..MiddlewareConfig::default()
    };
    mutate(&mut config);

    let manager = Manager::connect(&config).await.expect("manager should connect");
    let state = EdlState::new(Some(Arc::clone(&manager)), &config);
    (manager, state)
}

#[tokio::test]
async fn test_blocklist_match_serves_block_page_and_ships_event() {
    let mut server = mockito::Server::new_async().await;
    let logs = server
        .mock("POST", "/v1/edl/logs")
        .match_header("authorization", "Bearer test-access-token")
        .match_body(Matcher::Regex("203\\.0\\.113\\.9".to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let (manager, state) =
        connected(&mut server, "blocklist", &["203.0.113.0/24"], |_| {}).await;

    let response = router(state).oneshot(request_from("203.0.113.9", &[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/html; charset=utf-8"
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("403"));

    // Shutdown drains the shipper, forcing the single event out immediately.
    manager.shutdown().await;
    logs.assert_async().await;
    assert_eq!(manager.shipper_stats(), Some((1, 0)));
}

#[tokio::test]
async fn test_blocklist_miss_passes_through_without_event() {
    let mut server = mockito::Server::new_async().await;
    let logs = server
        .mock("POST", "/v1/edl/logs")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let (manager, state) =
        connected(&mut server, "blocklist", &["203.0.113.0/24"], |_| {}).await;

    let response = router(state).oneshot(request_from("198.51.100.7", &[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    manager.shutdown().await;
    logs.assert_async().await;
    assert_eq!(manager.shipper_stats(), Some((0, 0)));
}

#[tokio::test]
async fn test_allowlist_inverts_decisions() {
    let mut server = mockito::Server::new_async().await;
    let _logs = server.mock("POST", "/v1/edl/logs").with_status(200).create_async().await;

    let (manager, state) =
        connected(&mut server, "allowlist", &["198.51.100.0/24"], |_| {}).await;

    let app = router(state);
    let blocked = app.clone().oneshot(request_from("203.0.113.9", &[])).await.unwrap();
    assert_eq!(blocked.status(), StatusCode::FORBIDDEN);

    let allowed = app.oneshot(request_from("198.51.100.7", &[])).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_untrusted_peer_headers_are_ignored() {
    let mut server = mockito::Server::new_async().await;
    let _logs = server.mock("POST", "/v1/edl/logs").with_status(200).create_async().await;

    let (manager, state) =
        connected(&mut server, "blocklist", &["203.0.113.0/24"], |config| {
            config.ip_strategy = IpStrategy::Xff;
            config.trusted_proxies = vec!["10.0.0.0/8".to_string()];
        })
        .await;

    // The peer is outside 10.0.0.0/8, so its forwarded header must not be
    // honored; the decision falls on the (unlisted) peer address.
    let response = router(state)
        .oneshot(request_from("192.0.2.1", &[("x-forwarded-for", "203.0.113.9")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_chained_xff_uses_first_entry() {
    let mut server = mockito::Server::new_async().await;
    let logs = server
        .mock("POST", "/v1/edl/logs")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("\"ip\":\"203\\.0\\.113\\.1\"".to_string()),
            Matcher::Regex("\"direct_ip\":\"10\\.0\\.0\\.1\"".to_string()),
        ]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let (manager, state) =
        connected(&mut server, "blocklist", &["203.0.113.0/24"], |config| {
            config.ip_strategy = IpStrategy::Xff;
            config.trusted_proxies = vec!["10.0.0.0/8".to_string()];
        })
        .await;

    let response = router(state)
        .oneshot(request_from("10.0.0.1", &[("x-forwarded-for", "203.0.113.1, 10.0.0.2")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    manager.shutdown().await;
    logs.assert_async().await;
}

#[tokio::test]
async fn test_unparseable_forwarded_ip_is_rejected_with_400() {
    let mut server = mockito::Server::new_async().await;
    let _logs = server.mock("POST", "/v1/edl/logs").with_status(200).create_async().await;

    let (manager, state) =
        connected(&mut server, "blocklist", &["203.0.113.0/24"], |config| {
            config.ip_strategy = IpStrategy::Xff;
            config.trusted_proxies = vec!["10.0.0.0/8".to_string()];
        })
        .await;

    let response = router(state)
        .oneshot(request_from("10.0.0.1", &[("x-forwarded-for", "not-an-ip")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_deleted_deployment_passes_everything_through() {
    let mut server = mockito::Server::new_async().await;
    let bootstrap = server
        .mock("POST", "/api/v1/edl/bootstrap")
        .with_status(410)
        .expect(1)
        .create_async()
        .await;

    let config = MiddlewareConfig {
        bootstrap_token: crate::support::bootstrap_token(&server.url(), "dep-test"),
        machine_id: "machine-e2e".to_string(),
        ..MiddlewareConfig::default()
    };
    let manager = Manager::connect(&config).await.expect("skeleton manager expected");
    let state = EdlState::new(Some(Arc::clone(&manager)), &config);

    let app = router(state);
    for peer in ["203.0.113.9", "198.51.100.7"] {
        let response = app.clone().oneshot(request_from(peer, &[])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "peer {peer} should pass through");
    }

    // Permanent deletion schedules no retry: exactly one bootstrap call.
    bootstrap.assert_async().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_custom_header_strategy_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let _logs = server.mock("POST", "/v1/edl/logs").with_status(200).create_async().await;

    let (manager, state) =
        connected(&mut server, "blocklist", &["203.0.113.0/24"], |config| {
            config.ip_strategy = IpStrategy::Custom;
            config.trusted_header = "x-client-ip".to_string();
            config.trusted_proxies = vec!["loopback".to_string()];
        })
        .await;

    let app = router(state);
    let blocked = app
        .clone()
        .oneshot(request_from("127.0.0.1", &[("x-client-ip", "203.0.113.9")]))
        .await
        .unwrap();
    assert_eq!(blocked.status(), StatusCode::FORBIDDEN);

    // Header absent: falls back to the loopback peer, which is not listed.
    let allowed = app.oneshot(request_from("127.0.0.1", &[])).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    manager.shutdown().await;
}
