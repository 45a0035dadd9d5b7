//! Blocking client connections, plain or TLS.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::{debug, trace};

use crate::error::{RequestError, TimeoutPhase};
use crate::pool::PoolKey;
use crate::tls;
use crate::types::{Scheme, Timeouts};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Transport {
    fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => &s.sock,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

/// One open socket to a pool key.
pub struct Connection {
    id: u64,
    key: PoolKey,
    stream: BufReader<Transport>,
    opened_at: Instant,
}

impl Connection {
    /// Resolve, connect and (for https) complete the TLS handshake.
    pub fn open(
        key: &PoolKey,
        timeouts: &Timeouts,
        tls_config: Option<Arc<ClientConfig>>,
    ) -> Result<Self, RequestError> {
        let label = key.to_string();
        let tcp = connect_tcp(key, &label, timeouts.connect)?;
        tcp.set_nodelay(true)
            .and_then(|_| tcp.set_read_timeout(timeouts.read))
            .and_then(|_| tcp.set_write_timeout(timeouts.read))
            .map_err(|source| RequestError::ConnectFailed {
                key: label.clone(),
                source,
            })?;

        let transport = match key.scheme() {
            Scheme::Http => Transport::Plain(tcp),
            Scheme::Https => {
                let config = tls_config.ok_or_else(|| RequestError::TlsTrustError {
                    key: Some(label.clone()),
                    reason: "no TLS configuration supplied".to_string(),
                })?;
                Transport::Tls(Box::new(handshake(key, &label, config, tcp)?))
            }
        };

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(key = %label, conn = id, "connection opened");
        Ok(Connection {
            id,
            key: key.clone(),
            stream: BufReader::new(transport),
            opened_at: Instant::now(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Apply a request's read timeout to the socket. Writes use the same
    /// bound.
    pub(crate) fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let socket = self.stream.get_ref().socket();
        socket.set_read_timeout(timeout)?;
        socket.set_write_timeout(timeout)
    }

    pub(crate) fn writer(&mut self) -> &mut Transport {
        self.stream.get_mut()
    }

    /// An idle connection is healthy when the peer has neither sent
    /// anything nor closed it.
    pub(crate) fn is_idle_healthy(&mut self) -> bool {
        if !self.stream.buffer().is_empty() {
            return false;
        }
        let socket = self.stream.get_ref().socket();
        if socket.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let healthy = matches!(
            socket.peek(&mut probe),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
        );
        socket.set_nonblocking(false).is_ok() && healthy
    }

    pub(crate) fn close(self) {
        trace!(key = %self.key, conn = self.id, "closing connection");
        match self.stream.into_inner() {
            Transport::Plain(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            Transport::Tls(mut s) => {
                s.conn.send_close_notify();
                let _ = s.conn.write_tls(&mut s.sock);
                let _ = s.sock.shutdown(Shutdown::Both);
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

fn connect_tcp(key: &PoolKey, label: &str, timeout: Option<Duration>) -> Result<TcpStream, RequestError> {
    let addrs: Vec<SocketAddr> = (key.host(), key.port())
        .to_socket_addrs()
        .map_err(|source| RequestError::ConnectFailed {
            key: label.to_string(),
            source,
        })?
        .collect();

    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
    for addr in addrs {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                trace!(key = %label, %addr, error = %e, "connect attempt failed");
                last_err = e;
            }
        }
    }

    if matches!(last_err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) {
        return Err(RequestError::TimedOut {
            url: label.to_string(),
            phase: TimeoutPhase::Connect,
        });
    }
    Err(RequestError::ConnectFailed {
        key: label.to_string(),
        source: last_err,
    })
}

fn handshake(
    key: &PoolKey,
    label: &str,
    config: Arc<ClientConfig>,
    mut tcp: TcpStream,
) -> Result<StreamOwned<ClientConnection, TcpStream>, RequestError> {
    let name = ServerName::try_from(key.host().to_string()).map_err(|e| RequestError::InvalidUrl {
        url: label.to_string(),
        reason: e.to_string(),
    })?;
    let mut conn = ClientConnection::new(config, name).map_err(|e| RequestError::TlsTrustError {
        key: Some(label.to_string()),
        reason: e.to_string(),
    })?;
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp)
            .map_err(|e| tls::classify_handshake_error(label, e))?;
    }
    trace!(key = %label, "TLS handshake complete");
    Ok(StreamOwned::new(conn, tcp))
}

impl BufRead for Connection {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.stream.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.stream.consume(amt)
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}
