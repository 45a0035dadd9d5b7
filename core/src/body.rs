//! Request body encoders.
//!
//! # Design
//! A `Body` is the declarative description attached to a request; `encode`
//! turns it into a `Content-Type` plus a `Payload` the wire layer can write.
//! Payloads with a known size are sent with `Content-Length`; a multipart body
//! containing a streamed part has no known size and is sent chunked.
//!
//! Streamed parts hold a supplier instead of a reader so the same request can
//! be written more than once (a 307/308 redirect resends the body).

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use encoding_rs::Encoding;
use serde::Serialize;
use url::form_urlencoded::byte_serialize;

use crate::error::RequestError;

const OCTET_STREAM: &str = "application/octet-stream";

type OpenReader = dyn Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync;

/// Re-openable source of bytes for a streamed multipart part.
#[derive(Clone)]
pub struct StreamSupplier(Arc<OpenReader>);

impl StreamSupplier {
    pub fn new<F, R>(open: F) -> Self
    where
        F: Fn() -> io::Result<R> + Send + Sync + 'static,
        R: Read + Send + 'static,
    {
        StreamSupplier(Arc::new(move || {
            open().map(|r| Box::new(r) as Box<dyn Read + Send>)
        }))
    }

    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        (self.0)()
    }
}

impl fmt::Debug for StreamSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamSupplier(..)")
    }
}

/// Content of one multipart part.
#[derive(Debug, Clone)]
pub enum PartSource {
    Text(String),
    Bytes(Bytes),
    Stream(StreamSupplier),
}

/// One field of a `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    source: PartSource,
}

impl Part {
    /// Plain form field. No `Content-Type` line is written for it.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Part {
            name: name.into(),
            filename: None,
            content_type: None,
            source: PartSource::Text(value.into()),
        }
    }

    pub fn bytes(name: impl Into<String>, filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: None,
            source: PartSource::Bytes(data.into()),
        }
    }

    /// File part whose content is read from `open()` each time the body is
    /// written.
    pub fn file<F, R>(name: impl Into<String>, filename: impl Into<String>, open: F) -> Self
    where
        F: Fn() -> io::Result<R> + Send + Sync + 'static,
        R: Read + Send + 'static,
    {
        Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: None,
            source: PartSource::Stream(StreamSupplier::new(open)),
        }
    }

    /// File part streamed from disk; the filename is the path's last component.
    pub fn path(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Part::file(name, filename, move || File::open(&path))
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn effective_content_type(&self) -> Option<&str> {
        match (&self.content_type, &self.source) {
            (Some(ct), _) => Some(ct),
            (None, PartSource::Text(_)) => None,
            (None, _) => Some(OCTET_STREAM),
        }
    }

    fn content_len(&self) -> Option<u64> {
        match &self.source {
            PartSource::Text(t) => Some(t.len() as u64),
            PartSource::Bytes(b) => Some(b.len() as u64),
            PartSource::Stream(_) => None,
        }
    }
}

/// Declarative request body.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
    Form(Vec<(String, String)>),
    /// Already-serialized JSON document.
    Json(Bytes),
    Multipart(Vec<Part>),
}

impl Body {
    /// Serialize `value` to JSON now so encoding failures surface at build time.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, RequestError> {
        serde_json::to_vec(value)
            .map(|v| Body::Json(Bytes::from(v)))
            .map_err(|e| RequestError::EncodeError(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Produce the content type and wire payload for this body. Text and
    /// form bodies are encoded with `charset`.
    pub fn encode(&self, charset: &'static Encoding) -> EncodedBody {
        match self {
            Body::Empty => EncodedBody {
                content_type: None,
                payload: Payload::Empty,
            },
            Body::Text(text) => EncodedBody {
                content_type: Some(format!("text/plain; charset={}", charset.name())),
                payload: Payload::Buffered(Bytes::from(charset.encode(text).0.into_owned())),
            },
            Body::Bytes(bytes) => EncodedBody {
                content_type: Some(OCTET_STREAM.to_string()),
                payload: Payload::Buffered(bytes.clone()),
            },
            Body::Form(pairs) => EncodedBody {
                content_type: Some(format!(
                    "application/x-www-form-urlencoded; charset={}",
                    charset.name()
                )),
                payload: Payload::Buffered(Bytes::from(encode_form(pairs, charset))),
            },
            Body::Json(bytes) => EncodedBody {
                content_type: Some("application/json; charset=UTF-8".to_string()),
                payload: Payload::Buffered(bytes.clone()),
            },
            Body::Multipart(parts) => {
                let multipart = Multipart::new(parts.clone());
                EncodedBody {
                    content_type: Some(format!(
                        "multipart/form-data; boundary={}",
                        multipart.boundary()
                    )),
                    payload: Payload::Multipart(multipart),
                }
            }
        }
    }
}

/// Percent-encode pairs as `k=v&k=v`, each component encoded with `charset`.
pub fn encode_form(pairs: &[(String, String)], charset: &'static Encoding) -> String {
    let component = |s: &str| byte_serialize(&charset.encode(s).0).collect::<String>();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", component(k), component(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// A body ready to be written.
#[derive(Debug)]
pub struct EncodedBody {
    pub content_type: Option<String>,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum Payload {
    Empty,
    Buffered(Bytes),
    Multipart(Multipart),
}

impl Payload {
    /// Exact byte length, or `None` when the payload must be sent chunked.
    pub fn length(&self) -> Option<u64> {
        match self {
            Payload::Empty => Some(0),
            Payload::Buffered(b) => Some(b.len() as u64),
            Payload::Multipart(m) => m.content_length(),
        }
    }

    pub fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
        match self {
            Payload::Empty => Ok(()),
            Payload::Buffered(b) => w.write_all(b),
            Payload::Multipart(m) => m.write_to(w),
        }
    }
}

/// A `multipart/form-data` body with a freshly generated boundary.
#[derive(Debug)]
pub struct Multipart {
    boundary: String,
    parts: Vec<Part>,
}

impl Multipart {
    pub fn new(parts: Vec<Part>) -> Self {
        Multipart {
            boundary: format!("----------------requests{}", uuid::Uuid::new_v4().simple()),
            parts,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    fn part_head(&self, part: &Part) -> String {
        let mut head = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"",
            self.boundary,
            escape_quoted(&part.name)
        );
        if let Some(filename) = &part.filename {
            head.push_str(&format!("; filename=\"{}\"", escape_quoted(filename)));
        }
        head.push_str("\r\n");
        if let Some(ct) = part.effective_content_type() {
            head.push_str(&format!("Content-Type: {ct}\r\n"));
        }
        head.push_str("\r\n");
        head
    }

    fn closing(&self) -> String {
        format!("--{}--\r\n", self.boundary)
    }

    pub fn content_length(&self) -> Option<u64> {
        let mut total = self.closing().len() as u64;
        for part in &self.parts {
            total += self.part_head(part).len() as u64 + part.content_len()? + 2;
        }
        Some(total)
    }

    pub fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
        for part in &self.parts {
            w.write_all(self.part_head(part).as_bytes())?;
            match &part.source {
                PartSource::Text(text) => w.write_all(text.as_bytes())?,
                PartSource::Bytes(bytes) => w.write_all(bytes)?,
                PartSource::Stream(supplier) => {
                    let mut reader = supplier.open()?;
                    io::copy(&mut reader, w)?;
                }
            }
            w.write_all(b"\r\n")?;
        }
        w.write_all(self.closing().as_bytes())
    }
}

fn escape_quoted(s: &str) -> String {
    s.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}
