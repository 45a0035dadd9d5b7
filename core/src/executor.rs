//! Request execution: interceptor chain, redirect loop and the network
//! exchange.
//!
//! # Design
//! `execute` drives one logical request. Every hop (the original request and
//! each redirect follow-up) runs through the full interceptor chain, client
//! interceptors outermost and the request's own inside them. `exchange` is
//! the end of the chain: it leases a connection, writes the request, reads
//! the response head and returns a `RawResponse` that still owns the lease.
//!
//! When a cookie jar is supplied, `Set-Cookie` headers of every hop are
//! stored before the next hop is built, and jar cookies for each hop's URL
//! are attached when it is sent.

use std::borrow::Cow;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::connection::Connection;
use crate::cookie::{Cookie, CookieJar};
use crate::error::{RequestError, TimeoutPhase};
use crate::interceptor::{Interceptor, InvocationTarget};
use crate::pool::{ConnectionPool, PoolConfig, PoolKey};
use crate::redirect;
use crate::request::RequestDescriptor;
use crate::response::RawResponse;
use crate::tls::TlsProvider;
use crate::types::Scheme;
use crate::wire::{self, BodyReader};

pub struct Executor {
    pool: Arc<ConnectionPool>,
    tls: TlsProvider,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Executor {
    pub fn new(pool: PoolConfig, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Executor {
            pool: Arc::new(ConnectionPool::new(pool)),
            tls: TlsProvider::new(),
            interceptors,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Run `request` to its final response, following redirects as its
    /// policy allows.
    pub fn execute(&self, request: &RequestDescriptor, jar: Option<&CookieJar>) -> Result<RawResponse, RequestError> {
        let chain: Cow<'_, [Arc<dyn Interceptor>]> = if request.interceptors().is_empty() {
            Cow::Borrowed(self.interceptors.as_slice())
        } else {
            Cow::Owned(
                self.interceptors
                    .iter()
                    .chain(request.interceptors())
                    .cloned()
                    .collect(),
            )
        };
        let exchange = |hop: &RequestDescriptor| self.exchange(hop, jar);
        let target = InvocationTarget::new(&chain, &exchange);

        let policy = request.redirect_policy();
        let mut current = Cow::Borrowed(request);
        let mut hops = 0;
        loop {
            let mut response = target.proceed(&current)?;
            if !policy.follow || !response.is_redirect() {
                return Ok(response);
            }
            let Some(next) = redirect::follow_up(&current, response.status(), response.header("location"))? else {
                return Ok(response);
            };
            if hops >= policy.max_hops {
                response.discard();
                debug!(url = %request.url(), max = policy.max_hops, "redirect limit reached");
                return Err(RequestError::TooManyRedirects {
                    url: request.url().to_string(),
                    max: policy.max_hops,
                    status: response.status(),
                });
            }
            response.drain(redirect::DRAIN_LIMIT);
            hops += 1;
            debug!(
                hop = hops,
                status = response.status(),
                from = %current.url(),
                to = %next.url(),
                "following redirect"
            );
            current = Cow::Owned(next);
        }
    }

    /// One request/response exchange on a pooled connection.
    fn exchange(&self, request: &RequestDescriptor, jar: Option<&CookieJar>) -> Result<RawResponse, RequestError> {
        let url = request.url();
        let key = PoolKey::from_url(url, request.trust())?;
        let tls_config = match key.scheme() {
            Scheme::Https => Some(self.tls.client_config(request.trust()).map_err(|e| match e {
                RequestError::TlsTrustError { key: None, reason } => RequestError::TlsTrustError {
                    key: Some(key.to_string()),
                    reason,
                },
                other => other,
            })?),
            Scheme::Http => None,
        };
        let timeouts = request.timeouts();
        let mut lease = self
            .pool
            .acquire(&key, || Connection::open(&key, &timeouts, tls_config.clone()))?;
        let conn = lease.connection();
        conn.set_timeout(timeouts.read)
            .map_err(|source| RequestError::Transport {
                url: url.to_string(),
                source,
            })?;

        let jar_cookies = jar.map(|j| j.cookies_for(url)).unwrap_or_default();
        let body = request.body().encode(request.charset());
        let headers = wire::request_headers(request, &jar_cookies, &body);
        debug!(method = %request.method(), url = %url, conn = conn.id(), "sending request");
        wire::write_request(conn.writer(), request.method(), &wire::request_target(url), &headers, &body)
            .map_err(|e| RequestError::from_io(url.as_str(), TimeoutPhase::Write, e))?;

        let head = wire::read_response_head(conn)
            .map_err(|e| RequestError::from_io(url.as_str(), TimeoutPhase::Read, e))?;
        let framing = wire::response_framing(request.method(), &head).map_err(|e| RequestError::MalformedResponse {
            url: url.to_string(),
            status: Some(head.status),
            reason: e.to_string(),
        })?;
        trace!(status = head.status, ?framing, "response head received");

        let reusable = request.keep_alive() && wire::server_keeps_alive(&head);
        let cookies: Vec<Cookie> = head
            .headers
            .get_all("set-cookie")
            .filter_map(|value| Cookie::parse(value, url))
            .collect();
        if let Some(jar) = jar {
            jar.store(cookies.iter().cloned());
        }

        let body = BodyReader::new(lease, framing, reusable);
        Ok(RawResponse::from_wire(url.clone(), head, cookies, request.charset(), body))
    }
}
