//! Responses: the raw, streaming form returned by the executor and the
//! decoded `Response<T>` produced from it.
//!
//! # Design
//! The body of a `RawResponse` can be taken exactly once. Reading it to the
//! end hands the connection back to the pool; dropping the response first
//! closes the connection instead, so an abandoned body never leaves unread
//! bytes on a pooled socket.

use std::fmt;
use std::io::{self, Cursor, Read};
use std::mem;

use bytes::Bytes;
use encoding_rs::Encoding;
use serde::de::DeserializeOwned;
use url::Url;

use crate::cookie::Cookie;
use crate::error::{RequestError, TimeoutPhase};
use crate::http::Headers;
use crate::wire::{BodyReader, ResponseHead};

enum BodySource {
    Wire(BodyReader),
    Buffered(Cursor<Bytes>),
}

impl Read for BodySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodySource::Wire(r) => r.read(buf),
            BodySource::Buffered(c) => c.read(buf),
        }
    }
}

enum BodyState {
    Unread(BodySource),
    Consumed,
}

/// Status, headers and an unread body.
pub struct RawResponse {
    url: Url,
    status: u16,
    status_line: String,
    headers: Headers,
    cookies: Vec<Cookie>,
    charset: &'static Encoding,
    body: BodyState,
}

impl RawResponse {
    pub(crate) fn from_wire(
        url: Url,
        head: ResponseHead,
        cookies: Vec<Cookie>,
        charset: &'static Encoding,
        body: BodyReader,
    ) -> Self {
        RawResponse {
            url,
            status: head.status,
            status_line: head.status_line,
            headers: head.headers,
            cookies,
            charset,
            body: BodyState::Unread(BodySource::Wire(body)),
        }
    }

    /// A response that never touched the network, for interceptors that
    /// answer on their own.
    pub fn synthetic(url: Url, status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        RawResponse {
            url,
            status,
            status_line: format!("HTTP/1.1 {status} {}", reason_phrase(status)),
            headers,
            cookies: Vec::new(),
            charset: encoding_rs::UTF_8,
            body: BodyState::Unread(BodySource::Buffered(Cursor::new(body.into()))),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// The status line exactly as received, e.g. `HTTP/1.1 200 OK`.
    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Cookies set by this response.
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// URL of the request that produced this response (the last hop when
    /// redirects were followed).
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Charset from `Content-Type`, falling back to the request's charset.
    pub fn charset(&self) -> &'static Encoding {
        self.headers
            .get("content-type")
            .and_then(charset_param)
            .unwrap_or(self.charset)
    }

    fn take_body(&mut self) -> Result<BodySource, RequestError> {
        match mem::replace(&mut self.body, BodyState::Consumed) {
            BodyState::Unread(source) => Ok(source),
            BodyState::Consumed => Err(RequestError::BodyAlreadyConsumed {
                url: self.url.to_string(),
            }),
        }
    }

    fn read_error(&self, err: io::Error) -> RequestError {
        RequestError::from_io(self.url.as_str(), TimeoutPhase::Read, err)
    }

    pub fn read_to_bytes(&mut self) -> Result<Bytes, RequestError> {
        let mut source = self.take_body()?;
        let mut buf = Vec::new();
        source.read_to_end(&mut buf).map_err(|e| self.read_error(e))?;
        Ok(Bytes::from(buf))
    }

    pub fn read_to_text(&mut self) -> Result<String, RequestError> {
        let charset = self.charset();
        self.read_to_text_with(charset)
    }

    /// Decode with an explicit charset, ignoring the one the server sent.
    pub fn read_to_text_with(&mut self, charset: &'static Encoding) -> Result<String, RequestError> {
        let bytes = self.read_to_bytes()?;
        let (text, _, _) = charset.decode(&bytes);
        Ok(text.into_owned())
    }

    pub fn read_to_json<T: DeserializeOwned>(&mut self) -> Result<T, RequestError> {
        let text = self.read_to_text()?;
        serde_json::from_str(&text).map_err(|e| RequestError::DecodeError {
            url: self.url.to_string(),
            status: self.status,
            message: e.to_string(),
            body: text,
        })
    }

    /// Stream the body through `f`. The connection is returned to the pool
    /// only if `f` reads to the end.
    pub fn with_body_reader<T, F>(&mut self, f: F) -> Result<T, RequestError>
    where
        F: FnOnce(&mut dyn Read) -> io::Result<T>,
    {
        let mut source = self.take_body()?;
        f(&mut source).map_err(|e| self.read_error(e))
    }

    /// Give up on the body; the connection is closed unless the body was
    /// already complete.
    pub fn discard(&mut self) {
        self.body = BodyState::Consumed;
    }

    /// Read and throw away up to `limit` body bytes so the connection can be
    /// reused, e.g. for a redirect response. Larger bodies close the
    /// connection.
    pub(crate) fn drain(&mut self, limit: u64) {
        if let Ok(source) = self.take_body() {
            let mut limited = source.take(limit);
            let _ = io::copy(&mut limited, &mut io::sink());
        }
    }

    pub fn to_bytes_response(mut self) -> Result<Response<Bytes>, RequestError> {
        let body = self.read_to_bytes()?;
        Ok(self.into_response(body))
    }

    pub fn to_text_response(mut self) -> Result<Response<String>, RequestError> {
        let body = self.read_to_text()?;
        Ok(self.into_response(body))
    }

    pub fn to_json_response<T: DeserializeOwned>(mut self) -> Result<Response<T>, RequestError> {
        let body = self.read_to_json()?;
        Ok(self.into_response(body))
    }

    fn into_response<T>(self, body: T) -> Response<T> {
        Response {
            url: self.url,
            status: self.status,
            status_line: self.status_line,
            headers: self.headers,
            cookies: self.cookies,
            body,
        }
    }
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field("url", &self.url.as_str())
            .field("status_line", &self.status_line)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A response whose body has been read and decoded.
#[derive(Debug, Clone)]
pub struct Response<T> {
    url: Url,
    status: u16,
    status_line: String,
    headers: Headers,
    cookies: Vec<Cookie>,
    body: T,
}

impl<T> Response<T> {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        Response {
            url: self.url,
            status: self.status,
            status_line: self.status_line,
            headers: self.headers,
            cookies: self.cookies,
            body: f(self.body),
        }
    }
}

fn charset_param(content_type: &str) -> Option<&'static Encoding> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        Encoding::for_label(value.trim().trim_matches('"').as_bytes())
    })
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}
