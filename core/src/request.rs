//! Request descriptors and the fluent builder that produces them.
//!
//! # Design
//! A `RequestDescriptor` is immutable once built and may be executed any
//! number of times, from any thread. Interceptors that want to change a
//! request derive a new one with `with_header` and friends.
//!
//! A `RequestBuilder` remembers where it came from (a `Client`, a `Session`
//! or neither) so `send` dispatches to the right place. Builder errors such as
//! a value that fails JSON serialization are held until `build`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use encoding_rs::Encoding;
use serde::Serialize;
use url::Url;

use crate::auth::Auth;
use crate::body::{Body, Part};
use crate::client::{default_client, Client};
use crate::config::ClientConfig;
use crate::cookie::Cookie;
use crate::error::RequestError;
use crate::http::{Headers, HttpMethod};
use crate::interceptor::Interceptor;
use crate::response::RawResponse;
use crate::session::Session;
use crate::tls::{TrustMode, TrustStore};
use crate::types::{RedirectPolicy, Scheme, Timeouts};

/// Everything needed to perform one logical request.
#[derive(Clone)]
pub struct RequestDescriptor {
    method: HttpMethod,
    url: Url,
    headers: Headers,
    cookies: Vec<Cookie>,
    auth: Option<Auth>,
    body: Body,
    timeouts: Timeouts,
    redirect: RedirectPolicy,
    charset: &'static Encoding,
    trust: TrustMode,
    keep_alive: bool,
    default_user_agent: String,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl RequestDescriptor {
    /// Builder not bound to any client; `send` uses the process-wide
    /// default client.
    pub fn builder(method: HttpMethod, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(Dispatcher::Default, method, url.into(), &ClientConfig::default(), TrustMode::Platform)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.redirect
    }

    pub fn charset(&self) -> &'static Encoding {
        self.charset
    }

    pub fn trust(&self) -> &TrustMode {
        &self.trust
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// `User-Agent` sent when neither the request nor a session default
    /// sets one.
    pub fn default_user_agent(&self) -> &str {
        &self.default_user_agent
    }

    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.interceptors
    }

    /// Copy of this request with `name` set to `value`, replacing any
    /// existing values.
    pub fn with_header(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.headers.set(name, value);
        next
    }

    pub fn with_url(&self, url: Url) -> Self {
        let mut next = self.clone();
        next.url = url;
        next
    }

    /// Copy with `defaults` added for every header the request does not set.
    pub(crate) fn with_default_headers(&self, defaults: &Headers) -> Self {
        let mut next = self.clone();
        let mut merged: Headers = defaults
            .iter()
            .filter(|(name, _)| !self.headers.contains(name))
            .collect();
        merged.extend(self.headers.iter());
        next.headers = merged;
        next
    }

    /// The follow-up request for a redirect hop.
    pub(crate) fn redirected(&self, url: Url, method: HttpMethod, keep_body: bool, same_host: bool) -> Self {
        let mut next = self.clone();
        next.url = url;
        next.method = method;
        if !keep_body {
            next.body = Body::Empty;
            next.headers.remove("content-type");
            next.headers.remove("content-length");
            next.headers.remove("transfer-encoding");
        }
        if !same_host {
            next.auth = None;
            next.cookies.clear();
            next.headers.remove("authorization");
            next.headers.remove("cookie");
            next.headers.remove("host");
        }
        next
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("auth", &self.auth)
            .field("body", &self.body)
            .field("timeouts", &self.timeouts)
            .field("redirect", &self.redirect)
            .field("charset", &self.charset.name())
            .field("trust", &self.trust.id())
            .field("keep_alive", &self.keep_alive)
            .field("default_user_agent", &self.default_user_agent)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

#[derive(Clone)]
pub(crate) enum Dispatcher {
    Default,
    Client(Client),
    Session(Session),
}

/// Fluent construction of a `RequestDescriptor`.
pub struct RequestBuilder {
    dispatcher: Dispatcher,
    method: HttpMethod,
    url: String,
    params: Vec<(String, String)>,
    headers: Headers,
    cookies: Vec<Cookie>,
    auth: Option<Auth>,
    body: Body,
    timeouts: Timeouts,
    redirect: RedirectPolicy,
    charset: &'static Encoding,
    default_trust: TrustMode,
    trust: TrustMode,
    user_agent: Option<String>,
    default_user_agent: String,
    keep_alive: bool,
    interceptors: Vec<Arc<dyn Interceptor>>,
    error: Option<RequestError>,
}

impl RequestBuilder {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        method: HttpMethod,
        url: String,
        config: &ClientConfig,
        default_trust: TrustMode,
    ) -> Self {
        RequestBuilder {
            dispatcher,
            method,
            url,
            params: Vec::new(),
            headers: Headers::new(),
            cookies: Vec::new(),
            auth: None,
            body: Body::Empty,
            timeouts: config.timeouts(),
            redirect: config.redirect_policy(),
            charset: encoding_rs::UTF_8,
            trust: default_trust.clone(),
            default_trust,
            user_agent: None,
            default_user_agent: config.user_agent.clone(),
            keep_alive: config.keep_alive,
            interceptors: Vec::new(),
            error: None,
        }
    }

    /// Append query parameters to the URL.
    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    /// Append a header. Repeated names are all sent.
    pub fn header(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.headers.push(name, value.to_string());
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers.extend(headers);
        self
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push(Cookie::new(name, value));
        self
    }

    pub fn cookies<I, K, V>(mut self, cookies: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.cookies
            .extend(cookies.into_iter().map(|(k, v)| Cookie::new(k, v)));
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Auth::basic(user, password));
        self
    }

    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(Auth::bearer(token));
        self
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// `application/x-www-form-urlencoded` body, encoded with the request
    /// charset.
    pub fn form_body<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Body::Form(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn json_body<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match Body::json(value) {
            Ok(body) => self.body = body,
            Err(e) => self.error = Some(e),
        }
        self
    }

    pub fn text_body(mut self, text: impl Into<String>) -> Self {
        self.body = Body::Text(text.into());
        self
    }

    pub fn bytes_body(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(bytes.into());
        self
    }

    pub fn multipart_body(mut self, parts: Vec<Part>) -> Self {
        self.body = Body::Multipart(parts);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.read = Some(timeout);
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.redirect.follow = follow;
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.redirect.max_hops = max;
        self
    }

    /// Charset for text and form bodies, and the fallback for decoding the
    /// response.
    pub fn charset(mut self, charset: &'static Encoding) -> Self {
        self.charset = charset;
        self
    }

    /// `false` accepts any server certificate; `true` restores the client's
    /// default trust.
    pub fn verify(mut self, verify: bool) -> Self {
        self.trust = if verify {
            self.default_trust.clone()
        } else {
            TrustMode::Insecure
        };
        self
    }

    pub fn trust_store(mut self, store: Arc<TrustStore>) -> Self {
        self.trust = TrustMode::Custom(store);
        self
    }

    /// Add an interceptor that runs inside the client's interceptors.
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn build(self) -> Result<RequestDescriptor, RequestError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let invalid = |reason: String| RequestError::InvalidUrl {
            url: self.url.clone(),
            reason,
        };
        let mut url = Url::parse(&self.url).map_err(|e| invalid(e.to_string()))?;
        if Scheme::parse(url.scheme()).is_none() {
            return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }
        if !self.params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (name, value) in &self.params {
                query.append_pair(name, value);
            }
        }

        let mut headers = self.headers;
        if let Some(user_agent) = self.user_agent.filter(|_| !headers.contains("user-agent")) {
            headers.push("User-Agent", user_agent);
        }

        Ok(RequestDescriptor {
            method: self.method,
            url,
            headers,
            cookies: self.cookies,
            auth: self.auth,
            body: self.body,
            timeouts: self.timeouts,
            redirect: self.redirect,
            charset: self.charset,
            trust: self.trust,
            keep_alive: self.keep_alive,
            default_user_agent: self.default_user_agent,
            interceptors: self.interceptors,
        })
    }

    /// Build and execute.
    pub fn send(self) -> Result<RawResponse, RequestError> {
        let dispatcher = self.dispatcher.clone();
        let request = self.build()?;
        match dispatcher {
            Dispatcher::Default => default_client().execute(&request),
            Dispatcher::Client(client) => client.execute(&request),
            Dispatcher::Session(session) => session.execute(&request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_appended_to_existing_query() {
        let req = RequestDescriptor::builder(HttpMethod::Get, "http://h/s?x=1")
            .params([("wd", "test")])
            .param("n", 2)
            .build()
            .unwrap();
        assert_eq!(req.url().as_str(), "http://h/s?x=1&wd=test&n=2");
    }

    #[test]
    fn rejects_bad_urls() {
        for url in ["not a url", "ftp://h/file", "file:///etc/passwd"] {
            let err = RequestDescriptor::builder(HttpMethod::Get, url).build().unwrap_err();
            assert!(matches!(err, RequestError::InvalidUrl { .. }), "{url}");
        }
    }

    #[test]
    fn default_user_agent_unless_overridden() {
        let req = RequestDescriptor::builder(HttpMethod::Get, "http://h/").build().unwrap();
        assert!(req.headers().get("user-agent").is_none());
        assert!(req.default_user_agent().starts_with("requests-core/"));

        let req = RequestDescriptor::builder(HttpMethod::Get, "http://h/")
            .user_agent("my-agent")
            .build()
            .unwrap();
        assert_eq!(req.headers().get("user-agent"), Some("my-agent"));
    }

    #[test]
    fn json_encoding_failure_surfaces_at_build() {
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], "non-string keys are not valid JSON");
        let err = RequestDescriptor::builder(HttpMethod::Post, "http://h/")
            .json_body(&map)
            .build()
            .unwrap_err();
        assert!(matches!(err, RequestError::EncodeError(_)));
    }

    #[test]
    fn verify_toggles_trust() {
        let req = RequestDescriptor::builder(HttpMethod::Get, "https://h/")
            .verify(false)
            .build()
            .unwrap();
        assert!(req.trust().is_insecure());
        let req = RequestDescriptor::builder(HttpMethod::Get, "https://h/")
            .verify(false)
            .verify(true)
            .build()
            .unwrap();
        assert_eq!(req.trust(), &TrustMode::Platform);
    }

    #[test]
    fn default_headers_do_not_override_request_headers() {
        let req = RequestDescriptor::builder(HttpMethod::Get, "http://h/")
            .header("X-A", "request")
            .build()
            .unwrap();
        let defaults: Headers = [("X-A", "default"), ("X-B", "default")].into_iter().collect();
        let merged = req.with_default_headers(&defaults);
        assert_eq!(merged.headers().get("x-a"), Some("request"));
        assert_eq!(merged.headers().get("x-b"), Some("default"));
    }

    #[test]
    fn descriptor_is_reusable_and_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RequestDescriptor>();
        let req = RequestDescriptor::builder(HttpMethod::Get, "http://h/").build().unwrap();
        let copy = req.with_header("X", "1");
        assert!(!req.headers().contains("x"));
        assert_eq!(copy.headers().get("x"), Some("1"));
    }
}
