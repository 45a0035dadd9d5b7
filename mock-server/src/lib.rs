//! HTTP test server exercising the behaviors a client must get right:
//! echoing requests, cookies, authentication, redirects, slow and
//! connection-closing responses, and charsets.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

pub mod tls;

/// Credentials `/basic_auth` accepts: `test:password`.
pub const BASIC_CREDENTIALS: &str = "Basic dGVzdDpwYXNzd29yZA==";
pub const BEARER_TOKEN: &str = "secret-token";

/// What the server saw of a request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Echo {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Echo {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Deserialize)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub max_age: Option<i64>,
}

#[derive(Deserialize)]
pub struct RedirectTo {
    pub url: String,
    pub status: Option<u16>,
}

#[derive(Deserialize)]
pub struct Slow {
    pub ms: u64,
}

pub fn app() -> Router {
    Router::new()
        .route("/echo", any(echo))
        .route("/echo/{*rest}", any(echo))
        .route("/echo_body", post(echo_body))
        .route("/cookies", get(cookies))
        .route("/set_cookie", get(set_cookie))
        .route("/basic_auth", get(basic_auth))
        .route("/bearer", get(bearer))
        .route("/redirect_to", any(redirect_to))
        .route("/redirect_chain/{n}", get(redirect_chain))
        .route("/redirect_loop", get(redirect_loop))
        .route("/status/{code}", any(status))
        .route("/slow", get(slow))
        .route("/close", get(close))
        .route("/json", get(json_doc))
        .route("/latin1", get(latin1))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect()
}

async fn echo(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Json<Echo> {
    tracing::debug!(%method, %uri, "echo");
    Json(Echo {
        method: method.to_string(),
        path: uri.path().to_string(),
        query,
        headers: header_pairs(&headers),
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn echo_body(headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

async fn cookies(headers: HeaderMap) -> Json<Vec<(String, String)>> {
    let pairs = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect();
    Json(pairs)
}

async fn set_cookie(Query(params): Query<SetCookie>) -> Response {
    let mut value = format!("{}={}; Path={}", params.name, params.value, params.path.as_deref().unwrap_or("/"));
    if let Some(max_age) = params.max_age {
        value.push_str(&format!("; Max-Age={max_age}"));
    }
    ([(header::SET_COOKIE, value)], "cookie set").into_response()
}

async fn basic_auth(headers: HeaderMap) -> Response {
    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(BASIC_CREDENTIALS) => "authenticated".into_response(),
        _ => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"test\"")],
            "unauthorized",
        )
            .into_response(),
    }
}

async fn bearer(headers: HeaderMap) -> Response {
    let expected = format!("Bearer {BEARER_TOKEN}");
    match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(v) if v == expected => "authenticated".into_response(),
        _ => (StatusCode::UNAUTHORIZED, "unauthorized").into_response(),
    }
}

fn redirect(status: u16, location: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::FOUND);
    (status, [(header::LOCATION, location.to_string())], "redirecting").into_response()
}

async fn redirect_to(Query(params): Query<RedirectTo>) -> Response {
    redirect(params.status.unwrap_or(302), &params.url)
}

async fn redirect_chain(Path(n): Path<u32>) -> Response {
    if n == 0 {
        return "done".into_response();
    }
    redirect(302, &format!("/redirect_chain/{}", n - 1))
}

async fn redirect_loop() -> Response {
    redirect(302, "/redirect_loop")
}

async fn status(Path(code): Path<u16>) -> Response {
    StatusCode::from_u16(code)
        .unwrap_or(StatusCode::BAD_REQUEST)
        .into_response()
}

async fn slow(Query(params): Query<Slow>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    "slow"
}

async fn close() -> Response {
    ([(header::CONNECTION, "close")], "bye").into_response()
}

async fn json_doc() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "name": "requests", "items": [1, 2, 3] }))
}

/// `café` in ISO-8859-1.
async fn latin1() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=ISO-8859-1")],
        Bytes::from_static(b"caf\xe9"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_header_lookup_is_case_insensitive() {
        let echo = Echo {
            method: "GET".to_string(),
            path: "/echo".to_string(),
            query: vec![("wd".to_string(), "test".to_string())],
            headers: vec![("user-agent".to_string(), "x".to_string())],
            body: String::new(),
        };
        assert_eq!(echo.header("User-Agent"), Some("x"));
        assert_eq!(echo.header_count("user-agent"), 1);
        assert_eq!(echo.query_value("wd"), Some("test"));
    }

    #[test]
    fn set_cookie_params_are_optional() {
        let params: SetCookie = serde_json::from_str(r#"{"name":"a","value":"1"}"#).unwrap();
        assert!(params.path.is_none());
        assert!(params.max_age.is_none());
    }
}
