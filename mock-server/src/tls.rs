//! Minimal blocking HTTPS endpoint for trust tests.
//!
//! # Design
//! A throwaway CA signs one leaf certificate for the requested subject
//! (an IP literal or a DNS name). Each accepted socket gets its own thread
//! that reads one request head and answers `200 secure`, then closes.
//! Handshakes the client aborts simply end that thread.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection, StreamOwned};

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecure";

/// A running HTTPS endpoint and the CA that signed its certificate.
pub struct TlsServer {
    pub addr: SocketAddr,
    /// PEM of the signing CA, for building a client trust store.
    pub ca_pem: String,
    pub ca_der: CertificateDer<'static>,
}

impl TlsServer {
    /// Bind on `127.0.0.1:0` serving a certificate for `subject`.
    pub fn start(subject: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate()?;
        let ca = ca_params.self_signed(&ca_key)?;

        let leaf_key = KeyPair::generate()?;
        let leaf = CertificateParams::new(vec![subject.to_string()])?.signed_by(&leaf_key, &ca, &ca_key)?;

        let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(
                vec![leaf.der().clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
            )?;
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let config = Arc::clone(&config);
                thread::spawn(move || {
                    if let Err(e) = serve(config, stream) {
                        tracing::debug!(error = %e, "tls connection ended");
                    }
                });
            }
        });

        Ok(TlsServer {
            addr,
            ca_pem: ca.pem(),
            ca_der: ca.der().clone(),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

fn serve(config: Arc<ServerConfig>, tcp: TcpStream) -> io::Result<()> {
    let conn = ServerConnection::new(config).map_err(io::Error::other)?;
    let mut tls = StreamOwned::new(conn, tcp);
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = tls.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
    }
    tls.write_all(RESPONSE)?;
    tls.conn.send_close_notify();
    tls.flush()
}
