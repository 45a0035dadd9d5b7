use axum::http::{self, Request, StatusCode};
use http_body_util::BodyExt;
use mock_server::{app, Echo, BASIC_CREDENTIALS, BEARER_TOKEN};
use tower::ServiceExt;

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn get(uri: &str) -> Request<String> {
    Request::builder().uri(uri).body(String::new()).unwrap()
}

// --- echo ---

#[tokio::test]
async fn echo_reports_method_query_headers_and_body() {
    let resp = app()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/echo/sub/path?wd=test&n=2")
                .header("x-custom", "1")
                .body("payload".to_string())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let echo: Echo = body_json(resp).await;
    assert_eq!(echo.method, "PUT");
    assert_eq!(echo.path, "/echo/sub/path");
    assert_eq!(echo.query_value("wd"), Some("test"));
    assert_eq!(echo.query_value("n"), Some("2"));
    assert_eq!(echo.header("X-Custom"), Some("1"));
    assert_eq!(echo.body, "payload");
}

#[tokio::test]
async fn echo_body_keeps_content_type() {
    let resp = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo_body")
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(r#"{"a":1}"#.to_string())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.headers()[http::header::CONTENT_TYPE], "application/json");
    assert_eq!(body_bytes(resp).await, r#"{"a":1}"#);
}

// --- cookies ---

#[tokio::test]
async fn cookies_are_echoed_as_pairs() {
    let resp = app()
        .oneshot(
            Request::builder()
                .uri("/cookies")
                .header(http::header::COOKIE, "a=1; b=2")
                .body(String::new())
                .unwrap(),
        )
        .await
        .unwrap();
    let pairs: Vec<(String, String)> = body_json(resp).await;
    assert_eq!(
        pairs,
        vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
    );
}

#[tokio::test]
async fn set_cookie_emits_header() {
    let resp = app().oneshot(get("/set_cookie?name=sid&value=abc&max_age=60")).await.unwrap();
    assert_eq!(
        resp.headers()[http::header::SET_COOKIE],
        "sid=abc; Path=/; Max-Age=60"
    );
}

// --- auth ---

#[tokio::test]
async fn basic_auth_requires_credentials() {
    let resp = app().oneshot(get("/basic_auth")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().contains_key(http::header::WWW_AUTHENTICATE));

    let resp = app()
        .oneshot(
            Request::builder()
                .uri("/basic_auth")
                .header(http::header::AUTHORIZATION, BASIC_CREDENTIALS)
                .body(String::new())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn bearer_requires_token() {
    let resp = app()
        .oneshot(
            Request::builder()
                .uri("/bearer")
                .header(http::header::AUTHORIZATION, format!("Bearer {BEARER_TOKEN}"))
                .body(String::new())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app().oneshot(get("/bearer")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// --- redirects ---

#[tokio::test]
async fn redirect_to_uses_requested_status() {
    let resp = app().oneshot(get("/redirect_to?url=/echo&status=307")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(resp.headers()[http::header::LOCATION], "/echo");

    let resp = app().oneshot(get("/redirect_to?url=/echo")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn redirect_chain_counts_down() {
    let resp = app().oneshot(get("/redirect_chain/2")).await.unwrap();
    assert_eq!(resp.headers()[http::header::LOCATION], "/redirect_chain/1");

    let resp = app().oneshot(get("/redirect_chain/0")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, "done");
}

// --- misc ---

#[tokio::test]
async fn status_returns_requested_code() {
    let resp = app().oneshot(get("/status/418")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn close_sets_connection_header() {
    let resp = app().oneshot(get("/close")).await.unwrap();
    assert_eq!(resp.headers()[http::header::CONNECTION], "close");
}

#[tokio::test]
async fn latin1_body_is_not_utf8() {
    let resp = app().oneshot(get("/latin1")).await.unwrap();
    assert_eq!(body_bytes(resp).await.as_ref(), b"caf\xe9");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let resp = app().oneshot(get("/nope")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// --- tls ---

#[test]
fn tls_server_exposes_ca() {
    let server = mock_server::tls::TlsServer::start("127.0.0.1").unwrap();
    assert!(server.ca_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    assert!(server.port() > 0);
}
