//! Sessions: a client plus a cookie jar and default headers.

use std::sync::Arc;

use crate::client::Client;
use crate::cookie::{Cookie, CookieJar};
use crate::error::RequestError;
use crate::http::{Headers, HttpMethod};
use crate::request::{Dispatcher, RequestBuilder, RequestDescriptor};
use crate::response::RawResponse;

/// Requests sent through a session share one cookie jar.
///
/// Clones share the jar. The underlying client (and so the connection pool)
/// may be shared by any number of sessions.
#[derive(Clone)]
pub struct Session {
    client: Client,
    jar: Arc<CookieJar>,
    default_headers: Arc<Headers>,
}

impl Session {
    pub fn new(client: Client) -> Self {
        Session {
            client,
            jar: Arc::new(CookieJar::new()),
            default_headers: Arc::new(Headers::new()),
        }
    }

    /// Header added to every request that does not set it itself.
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.default_headers).set(name, value);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn jar(&self) -> &CookieJar {
        &self.jar
    }

    /// Snapshot of every stored cookie.
    pub fn cookies(&self) -> Vec<Cookie> {
        self.jar.all()
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
        self.client
            .builder_for(Dispatcher::Session(self.clone()), method, url.into())
    }

    /// Execute with the session's default headers and cookie jar.
    pub fn execute(&self, request: &RequestDescriptor) -> Result<RawResponse, RequestError> {
        if self.default_headers.is_empty() {
            return self.client.executor().execute(request, Some(&self.jar));
        }
        let request = request.with_default_headers(&self.default_headers);
        self.client.executor().execute(&request, Some(&self.jar))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cookies", &self.jar.len())
            .field("default_headers", &self.default_headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_jar() {
        let session = Client::new().session();
        let clone = session.clone();
        let url = url::Url::parse("http://h/").unwrap();
        session.jar().store(Cookie::parse("a=1", &url));
        assert_eq!(clone.cookies().len(), 1);
    }

    #[test]
    fn sessions_from_one_client_have_separate_jars() {
        let client = Client::new();
        let a = client.session();
        let b = client.session();
        let url = url::Url::parse("http://h/").unwrap();
        a.jar().store(Cookie::parse("a=1", &url));
        assert!(b.cookies().is_empty());
        assert!(Arc::ptr_eq(a.client().pool(), b.client().pool()));
    }

    #[test]
    fn default_headers_are_recorded() {
        let session = Client::new().session().with_default_header("X-App", "demo");
        assert_eq!(session.default_headers.get("x-app"), Some("demo"));
    }
}
