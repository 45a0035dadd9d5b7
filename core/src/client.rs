//! Client handle and its builder.
//!
//! # Design
//! `Client` is a cheap `Arc` handle around one `Executor`: clones share the
//! connection pool, TLS configurations and interceptors, and the handle can
//! be moved freely between threads. The client itself holds no cookies;
//! `Session` adds a jar on top of a client.
//!
//! Requests built from the crate-level functions go through a lazily
//! created process-wide default client.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::RequestError;
use crate::executor::Executor;
use crate::http::HttpMethod;
use crate::interceptor::Interceptor;
use crate::pool::{ConnectionPool, PoolStats};
use crate::request::{Dispatcher, RequestBuilder, RequestDescriptor};
use crate::response::RawResponse;
use crate::session::Session;
use crate::tls::{TrustMode, TrustStore};

struct ClientInner {
    executor: Executor,
    config: ClientConfig,
    default_trust: TrustMode,
}

/// Shared, thread-safe HTTP client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

impl Client {
    pub fn new() -> Self {
        ClientBuilder::new().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(HttpMethod::Get, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(HttpMethod::Head, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(HttpMethod::Post, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(HttpMethod::Put, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(HttpMethod::Delete, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(HttpMethod::Patch, url)
    }

    pub fn request(&self, method: HttpMethod, url: impl Into<String>) -> RequestBuilder {
        self.builder_for(Dispatcher::Client(self.clone()), method, url.into())
    }

    pub(crate) fn builder_for(&self, dispatcher: Dispatcher, method: HttpMethod, url: String) -> RequestBuilder {
        RequestBuilder::new(
            dispatcher,
            method,
            url,
            &self.inner.config,
            self.inner.default_trust.clone(),
        )
    }

    /// Execute a prebuilt request without a cookie jar.
    pub fn execute(&self, request: &RequestDescriptor) -> Result<RawResponse, RequestError> {
        self.inner.executor.execute(request, None)
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// A new session with its own empty cookie jar, sharing this client's
    /// pool.
    pub fn session(&self) -> Session {
        Session::new(self.clone())
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.inner.executor.pool()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool().stats()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("trust", &self.inner.default_trust.id())
            .finish_non_exhaustive()
    }
}

/// The process-wide client used by `requests_core::get` and friends.
pub fn default_client() -> &'static Client {
    static DEFAULT: OnceLock<Client> = OnceLock::new();
    DEFAULT.get_or_init(Client::new)
}

/// Configures and creates a `Client`.
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    trust_store: Option<Arc<TrustStore>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every setting with `config`.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_per_host(mut self, max: usize) -> Self {
        self.config.max_per_host = max;
        self
    }

    pub fn max_total(mut self, max: usize) -> Self {
        self.config.max_total = max;
        self
    }

    pub fn max_idle(mut self, idle: Duration) -> Self {
        self.config.max_idle = idle;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.config.verify = verify;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Trust only the certificates in `store` (takes precedence over
    /// `verify`).
    pub fn trust_store(mut self, store: Arc<TrustStore>) -> Self {
        self.trust_store = Some(store);
        self
    }

    /// Add an interceptor; interceptors run in the order they were added.
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> Client {
        let default_trust = match self.trust_store {
            Some(store) => TrustMode::Custom(store),
            None if !self.config.verify => TrustMode::Insecure,
            None => TrustMode::Platform,
        };
        let executor = Executor::new(self.config.pool_config(), self.interceptors);
        Client {
            inner: Arc::new(ClientInner {
                executor,
                config: self.config,
                default_trust,
            }),
        }
    }
}
