//! Redirect follow-up computation.
//!
//! # Design
//! `follow_up` is pure: given the request that produced a 3xx and the
//! response's `Location`, it returns the next hop's request (or `None` when
//! the response is not followable). Method rewriting follows browser
//! practice: 303 always becomes GET (HEAD stays HEAD), 301/302 turn a POST
//! into a GET, and 307/308 resend the original method and body.
//!
//! Credentials and caller-supplied cookies never cross to a different host.

use url::Url;

use crate::error::RequestError;
use crate::http::HttpMethod;
use crate::request::RequestDescriptor;
use crate::types::Scheme;

/// Body bytes read off a redirect response so its connection can be reused.
pub const DRAIN_LIMIT: u64 = 64 * 1024;

/// The request for the next hop, or `None` when `status` is not a
/// followable redirect or no `Location` was sent.
pub fn follow_up(
    request: &RequestDescriptor,
    status: u16,
    location: Option<&str>,
) -> Result<Option<RequestDescriptor>, RequestError> {
    let Some(location) = location.map(str::trim).filter(|l| !l.is_empty()) else {
        return Ok(None);
    };
    let method = request.method();
    let (next_method, keep_body) = match status {
        301 | 302 if method == HttpMethod::Post => (HttpMethod::Get, false),
        301 | 302 => (method, true),
        303 if method == HttpMethod::Head => (HttpMethod::Head, false),
        303 => (HttpMethod::Get, false),
        307 | 308 => (method, true),
        _ => return Ok(None),
    };

    let target = resolve_location(request.url(), location)?;
    let same_host = target.host_str() == request.url().host_str()
        && target.port_or_known_default() == request.url().port_or_known_default();
    Ok(Some(request.redirected(target, next_method, keep_body, same_host)))
}

/// Resolve `location` against `base`. Only http and https targets are
/// allowed.
pub fn resolve_location(base: &Url, location: &str) -> Result<Url, RequestError> {
    let target = base.join(location).map_err(|e| RequestError::InvalidUrl {
        url: location.to_string(),
        reason: e.to_string(),
    })?;
    if Scheme::parse(target.scheme()).is_none() {
        return Err(RequestError::InvalidUrl {
            url: target.to_string(),
            reason: format!("redirect to unsupported scheme {:?}", target.scheme()),
        });
    }
    Ok(target)
}
