//! Cookies and the session cookie jar.
//!
//! # Design
//! `Cookie::parse` applies the RFC 6265 storage rules that matter for a
//! client: domain scoping (host-only unless a matching `Domain` attribute is
//! present), default-path, `Max-Age` over `Expires`, and `Secure`.
//!
//! `CookieJar` is the only mutable state a session shares between threads. A
//! whole response's cookies are applied under one lock acquisition, so a
//! concurrent reader sees either none or all of them.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use url::Url;

/// A single cookie, either supplied by the caller or received via
/// `Set-Cookie`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    host_only: bool,
    secure: bool,
    http_only: bool,
    expires: Option<SystemTime>,
}

impl Cookie {
    /// Caller-supplied cookie, sent with the request it is attached to.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            domain: String::new(),
            path: "/".to_string(),
            host_only: false,
            secure: false,
            http_only: false,
            expires: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Domain the cookie is scoped to; empty for caller-supplied cookies.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// True when no `Domain` attribute was given: the cookie only goes back
    /// to the exact issuing host.
    pub fn is_host_only(&self) -> bool {
        self.host_only
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_http_only(&self) -> bool {
        self.http_only
    }

    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    /// Parse a `Set-Cookie` value received in response to `request_url`.
    ///
    /// Returns `None` for malformed values and for cookies whose `Domain`
    /// does not cover the issuing host.
    pub fn parse(set_cookie: &str, request_url: &Url) -> Option<Cookie> {
        let host = request_url.host_str()?.to_ascii_lowercase();
        let mut attrs = set_cookie.split(';');
        let (name, value) = attrs.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: host.clone(),
            path: default_path(request_url.path()),
            host_only: true,
            secure: false,
            http_only: false,
            expires: None,
        };
        let mut max_age_seen = false;

        for attr in attrs {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "max-age" => {
                    if let Ok(secs) = val.parse::<i64>() {
                        max_age_seen = true;
                        // An expiry past what SystemTime can hold never expires.
                        cookie.expires = if secs <= 0 {
                            Some(UNIX_EPOCH)
                        } else {
                            SystemTime::now().checked_add(Duration::from_secs(secs as u64))
                        };
                    }
                }
                "expires" if !max_age_seen => {
                    if let Ok(at) = httpdate::parse_http_date(val) {
                        cookie.expires = Some(at);
                    }
                }
                "domain" => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    if domain.is_empty() {
                        continue;
                    }
                    if !domain_match(&host, &domain) {
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }
        Some(cookie)
    }

    /// Whether a jar cookie should be sent to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let host_ok = if self.host_only {
            host == self.domain
        } else {
            domain_match(&host, &self.domain)
        };
        host_ok && path_match(url.path(), &self.path) && (!self.secure || url.scheme() == "https")
    }

    fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

fn is_ip_literal(host: &str) -> bool {
    host.parse::<std::net::IpAddr>().is_ok() || host.starts_with('[')
}

fn domain_match(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    !is_ip_literal(host)
        && host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

fn path_match(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_string();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}

/// Fold jar cookies and per-request cookies into one `Cookie` header value.
/// Per-request cookies replace jar cookies with the same name.
pub(crate) fn cookie_header(jar: &[Cookie], request: &[Cookie]) -> Option<String> {
    let pairs: Vec<String> = jar
        .iter()
        .filter(|c| !request.iter().any(|r| r.name == c.name))
        .chain(request.iter())
        .map(|c| format!("{}={}", c.name, c.value))
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

/// Thread-safe cookie store owned by a session.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<Cookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Cookie>> {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one response's cookies atomically. Expired cookies delete the
    /// matching stored cookie.
    pub fn store<I: IntoIterator<Item = Cookie>>(&self, cookies: I) {
        let now = SystemTime::now();
        let mut stored = self.lock();
        for cookie in cookies {
            stored.retain(|c| !c.same_slot(&cookie));
            if !cookie.is_expired(now) {
                stored.push(cookie);
            }
        }
    }

    /// Cookies to send to `url`, longest path first.
    pub fn cookies_for(&self, url: &Url) -> Vec<Cookie> {
        let now = SystemTime::now();
        let mut stored = self.lock();
        stored.retain(|c| !c.is_expired(now));
        let mut matching: Vec<Cookie> = stored.iter().filter(|c| c.matches(url)).cloned().collect();
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        matching
    }

    pub fn all(&self) -> Vec<Cookie> {
        self.lock().clone()
    }

    pub fn get(&self, name: &str) -> Option<Cookie> {
        self.lock().iter().find(|c| c.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn host_only_without_domain_attribute() {
        let c = Cookie::parse("sid=abc; Path=/", &url("http://www.example.com/login")).unwrap();
        assert!(c.is_host_only());
        assert!(c.matches(&url("http://www.example.com/x")));
        assert!(!c.matches(&url("http://api.example.com/x")));
    }

    #[test]
    fn domain_attribute_covers_subdomains() {
        let c = Cookie::parse("sid=abc; Domain=.example.com", &url("http://www.example.com/")).unwrap();
        assert!(!c.is_host_only());
        assert_eq!(c.domain(), "example.com");
        assert!(c.matches(&url("http://api.example.com/")));
        assert!(!c.matches(&url("http://example.org/")));
    }

    #[test]
    fn foreign_domain_is_rejected() {
        assert!(Cookie::parse("a=b; Domain=other.com", &url("http://www.example.com/")).is_none());
        assert!(Cookie::parse("a=b; Domain=0.0.1", &url("http://127.0.0.1/")).is_none());
    }

    #[test]
    fn default_path_is_request_directory() {
        let c = Cookie::parse("a=b", &url("http://h/docs/page")).unwrap();
        assert_eq!(c.path(), "/docs");
        assert!(c.matches(&url("http://h/docs/other")));
        assert!(c.matches(&url("http://h/docs")));
        assert!(!c.matches(&url("http://h/docsx")));
        assert!(!c.matches(&url("http://h/")));
    }

    #[test]
    fn secure_cookies_need_https() {
        let c = Cookie::parse("a=b; Secure; HttpOnly", &url("https://h/")).unwrap();
        assert!(c.is_secure());
        assert!(c.is_http_only());
        assert!(c.matches(&url("https://h/")));
        assert!(!c.matches(&url("http://h/")));
    }

    #[test]
    fn max_age_wins_over_expires() {
        let c = Cookie::parse(
            "a=b; Max-Age=3600; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
            &url("http://h/"),
        )
        .unwrap();
        assert!(!c.is_expired(SystemTime::now()));
    }

    #[test]
    fn huge_max_age_never_expires() {
        let c = Cookie::parse("a=b; Max-Age=9223372036854775807", &url("http://h/")).unwrap();
        assert_eq!(c.expires(), None);
        assert!(!c.is_expired(SystemTime::now()));

        let c = Cookie::parse(
            "a=b; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=9223372036854775807",
            &url("http://h/"),
        )
        .unwrap();
        assert!(!c.is_expired(SystemTime::now()));
    }

    #[test]
    fn malformed_values_are_ignored() {
        assert!(Cookie::parse("novalue", &url("http://h/")).is_none());
        assert!(Cookie::parse("=v", &url("http://h/")).is_none());
    }

    #[test]
    fn jar_replaces_and_deletes() {
        let jar = CookieJar::new();
        let u = url("http://h/");
        jar.store(Cookie::parse("a=1", &u));
        jar.store(Cookie::parse("a=2", &u));
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.get("a").unwrap().value(), "2");

        jar.store(Cookie::parse("a=gone; Max-Age=0", &u));
        assert!(jar.is_empty());
    }

    #[test]
    fn jar_orders_longer_paths_first() {
        let jar = CookieJar::new();
        jar.store([
            Cookie::parse("root=1; Path=/", &url("http://h/")).unwrap(),
            Cookie::parse("deep=2; Path=/a/b", &url("http://h/")).unwrap(),
        ]);
        let names: Vec<String> = jar
            .cookies_for(&url("http://h/a/b/c"))
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["deep", "root"]);
    }

    #[test]
    fn request_cookies_override_jar_by_name() {
        let jar = vec![Cookie::new("a", "jar"), Cookie::new("b", "jar")];
        let request = vec![Cookie::new("a", "req")];
        assert_eq!(cookie_header(&jar, &request).as_deref(), Some("b=jar; a=req"));
        assert_eq!(cookie_header(&[], &[]), None);
    }
}
