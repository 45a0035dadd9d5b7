//! HTTP/1.1 framing: request serialization, response head parsing and body
//! decoding.
//!
//! # Design
//! The parser is deliberately small. It reads the head line by line with a
//! hard size cap, skips interim `1xx` responses and decides body framing from
//! the method, status and headers. Bodies are decoded lazily by `BodyReader`,
//! which owns the pool lease and hands the connection back the moment the
//! last byte has been read.

use std::io::{self, BufRead, BufWriter, Read, Write};

use tracing::trace;
use url::Url;

use crate::body::EncodedBody;
use crate::cookie::{self, Cookie};
use crate::http::{Headers, HttpMethod};
use crate::pool::Lease;
use crate::request::RequestDescriptor;

/// Upper bound on status line plus headers.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 8 * 1024;

pub const DEFAULT_USER_AGENT: &str = concat!("requests-core/", env!("CARGO_PKG_VERSION"));

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Origin-form request target: path plus query, never the fragment.
pub fn request_target(url: &Url) -> String {
    let mut target = url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// `Host` header value; the port is omitted when it is the scheme default.
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn permits_body(method: HttpMethod) -> bool {
    matches!(method, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
}

/// Final header list for one hop.
///
/// A caller-supplied `Host` replaces the derived one. The `Cookie` header is
/// rebuilt from jar and request cookies, and the framing headers always
/// follow the encoded body.
pub fn request_headers(request: &RequestDescriptor, jar_cookies: &[Cookie], body: &EncodedBody) -> Headers {
    let mut headers = Headers::new();
    let user = request.headers();
    headers.push("Host", user.get("host").map(str::to_string).unwrap_or_else(|| host_header(request.url())));

    for (name, value) in user.iter() {
        let skip = ["host", "content-length", "transfer-encoding", "cookie"]
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h));
        if !skip {
            headers.push(name, value);
        }
    }

    if !headers.contains("user-agent") {
        headers.push("User-Agent", request.default_user_agent());
    }
    if !headers.contains("accept") {
        headers.push("Accept", "*/*");
    }
    if let Some(auth) = request.auth() {
        if !headers.contains("authorization") {
            headers.push("Authorization", auth.encode());
        }
    }

    let mut request_cookies: Vec<Cookie> = request.cookies().to_vec();
    for raw in user.get_all("cookie") {
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                request_cookies.push(Cookie::new(name.trim(), value.trim()));
            }
        }
    }
    if let Some(value) = cookie::cookie_header(jar_cookies, &request_cookies) {
        headers.push("Cookie", value);
    }

    if let Some(content_type) = &body.content_type {
        if !headers.contains("content-type") {
            headers.push("Content-Type", content_type.as_str());
        }
    }
    match body.payload.length() {
        Some(0) if !permits_body(request.method()) => {}
        Some(len) => headers.push("Content-Length", len.to_string()),
        None => headers.push("Transfer-Encoding", "chunked"),
    }
    if !request.keep_alive() {
        headers.set("Connection", "close");
    }
    headers
}

pub fn write_request_head(w: &mut dyn Write, method: HttpMethod, target: &str, headers: &Headers) -> io::Result<()> {
    write!(w, "{method} {target} HTTP/1.1\r\n")?;
    for (name, value) in headers.iter() {
        write!(w, "{name}: {value}\r\n")?;
    }
    w.write_all(b"\r\n")
}

/// Write head and body, then flush.
pub fn write_request<W: Write>(
    w: &mut W,
    method: HttpMethod,
    target: &str,
    headers: &Headers,
    body: &EncodedBody,
) -> io::Result<()> {
    let mut out = BufWriter::new(w);
    write_request_head(&mut out, method, target, headers)?;
    match body.payload.length() {
        Some(_) => body.payload.write_to(&mut out)?,
        None => {
            let mut chunked = ChunkedWriter::new(&mut out);
            body.payload.write_to(&mut chunked)?;
            chunked.finish()?;
        }
    }
    out.flush()
}

/// Frames every write as one chunk. `finish` writes the terminating chunk.
pub struct ChunkedWriter<W: Write> {
    inner: W,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        ChunkedWriter { inner }
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.inner.write_all(b"0\r\n\r\n")?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        write!(self.inner, "{:X}\r\n", buf.len())?;
        self.inner.write_all(buf)?;
        self.inner.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

/// Parsed status line and headers of a final response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub status_line: String,
    pub headers: Headers,
}

/// Read a response head, skipping interim `1xx` responses other than `101`.
pub fn read_response_head<R: BufRead>(r: &mut R) -> io::Result<ResponseHead> {
    loop {
        let head = read_one_head(r)?;
        if (100..200).contains(&head.status) && head.status != 101 {
            trace!(status = head.status, "skipping interim response");
            continue;
        }
        return Ok(head);
    }
}

fn read_one_head<R: BufRead>(r: &mut R) -> io::Result<ResponseHead> {
    let mut budget = MAX_HEAD_BYTES;
    let status_line = read_line(r, &mut budget, true)?;
    let (version, status, reason) = parse_status_line(&status_line)?;

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let line = read_line(r, &mut budget, false)?;
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(invalid("header continuation before first header")),
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(format!("header line without colon: {line:?}")))?;
        if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
            return Err(invalid(format!("invalid header name: {name:?}")));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        status_line,
        headers: headers.into_iter().collect(),
    })
}

/// One CRLF- or LF-terminated line. Header bytes that are not UTF-8 are
/// taken as ISO-8859-1.
fn read_line<R: BufRead>(r: &mut R, budget: &mut usize, first: bool) -> io::Result<String> {
    let mut buf = Vec::new();
    let n = r.by_ref().take(*budget as u64).read_until(b'\n', &mut buf)?;
    if n == 0 {
        let msg = if first {
            "connection closed before response"
        } else {
            "connection closed inside response head"
        };
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg));
    }
    if buf.last() != Some(&b'\n') {
        if n >= *budget {
            return Err(invalid(format!("response head exceeds {MAX_HEAD_BYTES} bytes")));
        }
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed inside response head"));
    }
    *budget -= n;
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(match String::from_utf8(buf) {
        Ok(s) => s,
        Err(e) => encoding_rs::mem::decode_latin1(e.as_bytes()).into_owned(),
    })
}

fn parse_status_line(line: &str) -> io::Result<(Version, u16, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::Http11,
        Some("HTTP/1.0") => Version::Http10,
        _ => return Err(invalid(format!("unsupported status line: {line:?}"))),
    };
    let code = parts.next().unwrap_or_default();
    let status = if code.len() == 3 && code.bytes().all(|b| b.is_ascii_digit()) {
        code.parse::<u16>().map_err(|e| invalid(e.to_string()))?
    } else {
        return Err(invalid(format!("invalid status code in {line:?}")));
    };
    if status < 100 {
        return Err(invalid(format!("invalid status code in {line:?}")));
    }
    Ok((version, status, parts.next().unwrap_or_default().to_string()))
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

pub fn response_framing(method: HttpMethod, head: &ResponseHead) -> io::Result<Framing> {
    if method == HttpMethod::Head || (100..200).contains(&head.status) || head.status == 204 || head.status == 304 {
        return Ok(Framing::Empty);
    }
    if head.headers.has_token("transfer-encoding", "chunked") {
        return Ok(Framing::Chunked);
    }
    match head.headers.get("content-length") {
        Some(value) => {
            let first = value.split(',').next().unwrap_or_default().trim();
            let len = first
                .parse::<u64>()
                .map_err(|_| invalid(format!("invalid Content-Length: {value:?}")))?;
            Ok(if len == 0 { Framing::Empty } else { Framing::Length(len) })
        }
        None => Ok(Framing::UntilClose),
    }
}

/// Whether the server lets the connection be reused after this response.
pub fn server_keeps_alive(head: &ResponseHead) -> bool {
    match head.version {
        Version::Http11 => !head.headers.has_token("connection", "close"),
        Version::Http10 => head.headers.has_token("connection", "keep-alive"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Length(u64),
    Chunked(ChunkState),
    UntilClose,
    Done,
}

/// Incremental body decoder over any buffered reader.
#[derive(Debug)]
pub struct Decoder {
    state: DecodeState,
}

impl Decoder {
    pub fn new(framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty => DecodeState::Done,
            Framing::Length(len) => DecodeState::Length(len),
            Framing::Chunked => DecodeState::Chunked(ChunkState::Size),
            Framing::UntilClose => DecodeState::UntilClose,
        };
        Decoder { state }
    }

    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    pub fn read<R: BufRead>(&mut self, r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                DecodeState::Done => return Ok(0),
                DecodeState::Length(remaining) => {
                    let max = remaining.min(buf.len() as u64) as usize;
                    let n = r.read(&mut buf[..max])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("connection closed with {remaining} body bytes outstanding"),
                        ));
                    }
                    let left = remaining - n as u64;
                    self.state = if left == 0 { DecodeState::Done } else { DecodeState::Length(left) };
                    return Ok(n);
                }
                DecodeState::UntilClose => {
                    let n = r.read(buf)?;
                    if n == 0 {
                        self.state = DecodeState::Done;
                    }
                    return Ok(n);
                }
                DecodeState::Chunked(ChunkState::Size) => {
                    let line = read_chunk_line(r)?;
                    let size_field = line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size_field, 16)
                        .map_err(|_| invalid(format!("invalid chunk size: {size_field:?}")))?;
                    self.state = DecodeState::Chunked(if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    });
                }
                DecodeState::Chunked(ChunkState::Data(remaining)) => {
                    let max = remaining.min(buf.len() as u64) as usize;
                    let n = r.read(&mut buf[..max])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside chunk",
                        ));
                    }
                    let left = remaining - n as u64;
                    self.state = DecodeState::Chunked(if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    });
                    return Ok(n);
                }
                DecodeState::Chunked(ChunkState::DataEnd) => {
                    if !read_chunk_line(r)?.is_empty() {
                        return Err(invalid("missing CRLF after chunk data"));
                    }
                    self.state = DecodeState::Chunked(ChunkState::Size);
                }
                DecodeState::Chunked(ChunkState::Trailers) => {
                    if read_chunk_line(r)?.is_empty() {
                        self.state = DecodeState::Done;
                        return Ok(0);
                    }
                }
            }
        }
    }
}

fn read_chunk_line<R: BufRead>(r: &mut R) -> io::Result<String> {
    let mut budget = MAX_CHUNK_LINE;
    read_line(r, &mut budget, false).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed inside chunked body")
        } else {
            e
        }
    })
}

/// Streaming response body bound to a pooled connection.
pub struct BodyReader {
    lease: Option<Lease>,
    decoder: Decoder,
    reusable: bool,
}

impl BodyReader {
    /// An already-complete body releases the lease immediately.
    pub fn new(lease: Lease, framing: Framing, reusable: bool) -> Self {
        let reusable = reusable && framing != Framing::UntilClose;
        let decoder = Decoder::new(framing);
        let mut reader = BodyReader {
            lease: Some(lease),
            decoder,
            reusable,
        };
        reader.release_if_done();
        reader
    }

    fn release_if_done(&mut self) {
        if self.decoder.is_done() {
            if let Some(lease) = self.lease.take() {
                lease.release(self.reusable);
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.decoder.is_done()
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(lease) = self.lease.as_mut() else {
            return Ok(0);
        };
        match self.decoder.read(lease.connection(), buf) {
            Ok(n) => {
                self.release_if_done();
                Ok(n)
            }
            Err(e) => {
                // Dropping the lease closes the connection.
                self.lease = None;
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader")
            .field("decoder", &self.decoder)
            .field("attached", &self.lease.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode(framing: Framing, wire: &[u8]) -> io::Result<Vec<u8>> {
        let mut cursor = Cursor::new(wire.to_vec());
        let mut decoder = Decoder::new(framing);
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = decoder.read(&mut cursor, &mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    #[test]
    fn parses_head_and_skips_continue() {
        let wire = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-A: 1\r\n\r\nhi";
        let mut cursor = Cursor::new(&wire[..]);
        let head = read_response_head(&mut cursor).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.status_line, "HTTP/1.1 200 OK");
        assert_eq!(head.reason, "OK");
        assert_eq!(head.headers.get("x-a"), Some("1"));
        assert_eq!(response_framing(HttpMethod::Get, &head).unwrap(), Framing::Length(2));
    }

    #[test]
    fn folded_header_lines_are_joined() {
        let wire = b"HTTP/1.1 200 OK\r\nX-Long: a\r\n  b\r\n\r\n";
        let head = read_response_head(&mut Cursor::new(&wire[..])).unwrap();
        assert_eq!(head.headers.get("x-long"), Some("a b"));
    }

    #[test]
    fn non_utf8_header_values_decode_as_latin1() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Disposition: attachment; filename=\"caf\xe9.txt\"\r\n\r\n";
        let head = read_response_head(&mut Cursor::new(&wire[..])).unwrap();
        assert_eq!(
            head.headers.get("content-disposition"),
            Some("attachment; filename=\"café.txt\"")
        );
    }

    #[test]
    fn rejects_garbage_status_line() {
        let err = read_response_head(&mut Cursor::new(&b"SSH-2.0-OpenSSH\r\n\r\n"[..])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = read_response_head(&mut Cursor::new(&b"HTTP/1.1 2x0 OK\r\n\r\n"[..])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_oversized_head() {
        let mut wire = b"HTTP/1.1 200 OK\r\nX-Big: ".to_vec();
        wire.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES));
        wire.extend_from_slice(b"\r\n\r\n");
        let err = read_response_head(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn eof_before_head_is_unexpected_eof() {
        let err = read_response_head(&mut Cursor::new(&b""[..])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn head_and_no_content_have_empty_bodies() {
        let head = read_response_head(&mut Cursor::new(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n"[..])).unwrap();
        assert_eq!(response_framing(HttpMethod::Head, &head).unwrap(), Framing::Empty);
        let head = read_response_head(&mut Cursor::new(&b"HTTP/1.1 204 No Content\r\n\r\n"[..])).unwrap();
        assert_eq!(response_framing(HttpMethod::Get, &head).unwrap(), Framing::Empty);
    }

    #[test]
    fn decodes_chunked_body_with_extensions_and_trailers() {
        let wire = b"4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: y\r\n\r\n";
        assert_eq!(decode(Framing::Chunked, wire).unwrap(), b"Wikipedia");
    }

    #[test]
    fn truncated_length_body_is_an_error() {
        let err = decode(Framing::Length(10), b"short").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn bad_chunk_size_is_invalid_data() {
        let err = decode(Framing::Chunked, b"zz\r\nabc\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn until_close_reads_everything() {
        assert_eq!(decode(Framing::UntilClose, b"all of it").unwrap(), b"all of it");
    }

    #[test]
    fn chunked_writer_frames_each_write() {
        let mut out = Vec::new();
        let mut w = ChunkedWriter::new(&mut out);
        w.write_all(b"hello").unwrap();
        w.write_all(b"").unwrap();
        w.write_all(&[b'x'; 16]).unwrap();
        w.finish().unwrap();
        let expected = format!("5\r\nhello\r\n10\r\n{}\r\n0\r\n\r\n", "x".repeat(16));
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn keep_alive_by_version() {
        let h11 = read_response_head(&mut Cursor::new(&b"HTTP/1.1 200 OK\r\n\r\n"[..])).unwrap();
        assert!(server_keeps_alive(&h11));
        let close = read_response_head(&mut Cursor::new(&b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n"[..])).unwrap();
        assert!(!server_keeps_alive(&close));
        let h10 = read_response_head(&mut Cursor::new(&b"HTTP/1.0 200 OK\r\n\r\n"[..])).unwrap();
        assert!(!server_keeps_alive(&h10));
    }

    #[test]
    fn request_target_keeps_query_and_drops_fragment() {
        let url = Url::parse("http://h:8080/a/b?x=1&y=2#frag").unwrap();
        assert_eq!(request_target(&url), "/a/b?x=1&y=2");
        assert_eq!(host_header(&url), "h:8080");
        assert_eq!(host_header(&Url::parse("https://h:443/").unwrap()), "h");
    }
}
