//! Blocking HTTP/1.1 client with connection pooling, redirects, cookies,
//! interceptors and configurable TLS trust.
//!
//! # Overview
//! Requests are described by an immutable `RequestDescriptor`, built with a
//! fluent `RequestBuilder` from a `Client`, a `Session` or the crate-level
//! helpers:
//!
//! ```no_run
//! let mut response = requests_core::get("http://example.com/")
//!     .param("q", "rust")
//!     .send()?;
//! let text = response.read_to_text()?;
//! # Ok::<(), requests_core::RequestError>(())
//! ```
//!
//! # Design
//! - `Client` is a shared handle over one executor, connection pool and TLS
//!   configuration cache; clone it freely across threads.
//! - `Session` adds a cookie jar and default headers on top of a client.
//! - Each hop of a request (including redirect follow-ups) runs through the
//!   interceptor chain before touching the network.
//! - Response bodies stream straight from the pooled socket; the connection
//!   returns to the pool once the body has been fully read.

pub mod auth;
pub mod body;
pub mod client;
pub mod config;
pub mod connection;
pub mod cookie;
pub mod error;
pub mod executor;
pub mod http;
pub mod interceptor;
pub mod pool;
pub mod redirect;
pub mod request;
pub mod response;
pub mod session;
pub mod tls;
pub mod types;
pub mod wire;

pub use auth::Auth;
pub use body::{Body, Part};
pub use client::{default_client, Client, ClientBuilder};
pub use config::ClientConfig;
pub use cookie::{Cookie, CookieJar};
pub use error::{RequestError, TimeoutPhase};
pub use http::{Headers, HttpMethod};
pub use interceptor::{Interceptor, InvocationTarget};
pub use pool::{PoolConfig, PoolKey, PoolStats};
pub use request::{RequestBuilder, RequestDescriptor};
pub use response::{RawResponse, Response};
pub use session::Session;
pub use tls::{TrustMode, TrustStore};
pub use types::{RedirectPolicy, Scheme, Timeouts};

pub fn get(url: impl Into<String>) -> RequestBuilder {
    default_client().get(url)
}

pub fn head(url: impl Into<String>) -> RequestBuilder {
    default_client().head(url)
}

pub fn post(url: impl Into<String>) -> RequestBuilder {
    default_client().post(url)
}

pub fn put(url: impl Into<String>) -> RequestBuilder {
    default_client().put(url)
}

pub fn delete(url: impl Into<String>) -> RequestBuilder {
    default_client().delete(url)
}

pub fn patch(url: impl Into<String>) -> RequestBuilder {
    default_client().patch(url)
}
