//! TLS trust configuration.
//!
//! # Design
//! A request names its trust as a `TrustMode`. Building a rustls
//! `ClientConfig` parses root certificates and is not free, so
//! `TlsProvider` builds each distinct configuration once and hands out the
//! cached `Arc` afterwards.
//!
//! Custom stores are identified by a SHA-256 digest of their DER contents.
//! The digest is part of the connection pool key, so a socket negotiated
//! under one trust configuration is never reused for a request that asked
//! for another.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{AlertDescription, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::RequestError;

/// SHA-256 over a store's certificates and identity.
pub type Fingerprint = [u8; 32];

fn trust_error(reason: impl Into<String>) -> RequestError {
    RequestError::TlsTrustError {
        key: None,
        reason: reason.into(),
    }
}

struct ClientIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

/// Caller-supplied trust anchors and optional client identity.
pub struct TrustStore {
    roots: Vec<CertificateDer<'static>>,
    identity: Option<ClientIdentity>,
    fingerprint: Fingerprint,
}

impl TrustStore {
    /// Load every certificate from PEM input. Fails when none is found.
    pub fn from_pem(reader: &mut dyn BufRead) -> Result<Self, RequestError> {
        let roots = rustls_pemfile::certs(reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| trust_error(format!("reading certificates: {e}")))?;
        Self::from_der(roots)
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, RequestError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| trust_error(format!("opening {}: {e}", path.display())))?;
        Self::from_pem(&mut BufReader::new(file))
    }

    pub fn from_der(roots: Vec<CertificateDer<'static>>) -> Result<Self, RequestError> {
        if roots.is_empty() {
            return Err(trust_error("trust store contains no certificates"));
        }
        let mut store = TrustStore {
            roots,
            identity: None,
            fingerprint: [0; 32],
        };
        store.fingerprint = store.compute_fingerprint();
        Ok(store)
    }

    /// Attach a client certificate chain and private key, both PEM.
    pub fn with_identity(
        mut self,
        chain_pem: &mut dyn BufRead,
        key_pem: &mut dyn BufRead,
    ) -> Result<Self, RequestError> {
        let chain = rustls_pemfile::certs(chain_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| trust_error(format!("reading client certificates: {e}")))?;
        if chain.is_empty() {
            return Err(trust_error("client identity contains no certificates"));
        }
        let key = rustls_pemfile::private_key(key_pem)
            .map_err(|e| trust_error(format!("reading client key: {e}")))?
            .ok_or_else(|| trust_error("client identity contains no private key"))?;
        self.identity = Some(ClientIdentity { chain, key });
        self.fingerprint = self.compute_fingerprint();
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn has_identity(&self) -> bool {
        self.identity.is_some()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Every item is length-prefixed and the sections are tagged, so no two
    /// different stores feed the same byte stream to the digest.
    fn compute_fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        let mut item = |tag: u8, der: &[u8]| {
            hasher.update([tag]);
            hasher.update((der.len() as u64).to_be_bytes());
            hasher.update(der);
        };
        for cert in &self.roots {
            item(b'r', cert.as_ref());
        }
        if let Some(identity) = &self.identity {
            for cert in &identity.chain {
                item(b'c', cert.as_ref());
            }
            item(b'k', identity.key.secret_der());
        }
        hasher.finalize().into()
    }
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStore")
            .field("roots", &self.roots.len())
            .field("identity", &self.identity.is_some())
            .field("fingerprint", &format_args!("{}", TrustId::Custom(self.fingerprint)))
            .finish()
    }
}

/// How the server certificate is checked.
#[derive(Debug, Clone, Default)]
pub enum TrustMode {
    /// Mozilla's root program, bundled.
    #[default]
    Platform,
    /// Accept any certificate for any host.
    Insecure,
    Custom(Arc<TrustStore>),
}

impl TrustMode {
    pub fn id(&self) -> TrustId {
        match self {
            TrustMode::Platform => TrustId::Platform,
            TrustMode::Insecure => TrustId::Insecure,
            TrustMode::Custom(store) => TrustId::Custom(store.fingerprint),
        }
    }

    pub fn is_insecure(&self) -> bool {
        matches!(self, TrustMode::Insecure)
    }
}

impl PartialEq for TrustMode {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

/// Comparable identity of a `TrustMode`, used in pool keys and the config
/// cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustId {
    Platform,
    Insecure,
    Custom(Fingerprint),
}

impl fmt::Display for TrustId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustId::Platform => f.write_str("platform"),
            TrustId::Insecure => f.write_str("insecure"),
            TrustId::Custom(fp) => {
                f.write_str("custom:")?;
                fp[..8].iter().try_for_each(|b| write!(f, "{b:02x}"))
            }
        }
    }
}

/// Builds and caches one rustls client configuration per trust identity.
#[derive(Default)]
pub struct TlsProvider {
    configs: Mutex<HashMap<TrustId, Arc<ClientConfig>>>,
}

impl TlsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_config(&self, mode: &TrustMode) -> Result<Arc<ClientConfig>, RequestError> {
        let id = mode.id();
        let mut configs = self.configs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(config) = configs.get(&id) {
            return Ok(Arc::clone(config));
        }
        let config = Arc::new(build_config(mode)?);
        debug!(trust = %id, "built TLS client configuration");
        configs.insert(id, Arc::clone(&config));
        Ok(config)
    }
}

fn build_config(mode: &TrustMode) -> Result<ClientConfig, RequestError> {
    let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| trust_error(e.to_string()))?;

    match mode {
        TrustMode::Platform => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Ok(builder.with_root_certificates(roots).with_no_client_auth())
        }
        TrustMode::Insecure => {
            warn!("certificate verification disabled, any server certificate will be accepted");
            Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier::new()))
                .with_no_client_auth())
        }
        TrustMode::Custom(store) => {
            let mut roots = RootCertStore::empty();
            for cert in &store.roots {
                roots
                    .add(cert.clone())
                    .map_err(|e| trust_error(format!("rejected root certificate: {e}")))?;
            }
            let builder = builder.with_root_certificates(roots);
            match &store.identity {
                Some(identity) => builder
                    .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())
                    .map_err(|e| trust_error(format!("rejected client identity: {e}"))),
                None => Ok(builder.with_no_client_auth()),
            }
        }
    }
}

/// Map a failed handshake to a trust failure when the peer's certificate
/// (or ours) was the problem, and to a connect failure otherwise.
pub(crate) fn classify_handshake_error(key: &str, err: io::Error) -> RequestError {
    if let Some(tls) = err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
        let trust_failure = matches!(
            tls,
            rustls::Error::InvalidCertificate(_)
                | rustls::Error::NoCertificatesPresented
                | rustls::Error::AlertReceived(
                    AlertDescription::BadCertificate
                        | AlertDescription::UnknownCA
                        | AlertDescription::CertificateUnknown
                        | AlertDescription::CertificateRequired
                )
        );
        if trust_failure {
            return RequestError::TlsTrustError {
                key: Some(key.to_string()),
                reason: tls.to_string(),
            };
        }
    }
    if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
        return RequestError::TimedOut {
            url: key.to_string(),
            phase: crate::error::TimeoutPhase::Connect,
        };
    }
    RequestError::ConnectFailed {
        key: key.to_string(),
        source: err,
    }
}

/// Server certificate verifier that accepts everything.
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

impl NoVerifier {
    fn new() -> Self {
        NoVerifier {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn self_signed_pem() -> String {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        cert.cert.pem()
    }

    #[test]
    fn empty_store_is_rejected() {
        let err = TrustStore::from_pem(&mut "".as_bytes()).unwrap_err();
        assert!(matches!(err, RequestError::TlsTrustError { key: None, .. }));
    }

    #[test]
    fn missing_file_is_a_trust_error() {
        let err = TrustStore::from_pem_file("/nonexistent/ca.pem").unwrap_err();
        assert!(matches!(err, RequestError::TlsTrustError { .. }));
    }

    #[test]
    fn identical_stores_share_an_identity() {
        let pem = self_signed_pem();
        let a = TrustStore::from_pem(&mut pem.as_bytes()).unwrap();
        let b = TrustStore::from_pem(&mut pem.as_bytes()).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(
            TrustMode::Custom(Arc::new(a)).id(),
            TrustMode::Custom(Arc::new(b)).id()
        );

        let other = TrustStore::from_pem(&mut self_signed_pem().as_bytes()).unwrap();
        assert_ne!(TrustId::Custom(other.fingerprint()), TrustMode::Platform.id());
    }

    #[test]
    fn distinct_stores_get_distinct_configs() {
        let a = TrustMode::Custom(Arc::new(TrustStore::from_pem(&mut self_signed_pem().as_bytes()).unwrap()));
        let b = TrustMode::Custom(Arc::new(TrustStore::from_pem(&mut self_signed_pem().as_bytes()).unwrap()));
        assert_ne!(a.id(), b.id());

        let provider = TlsProvider::new();
        let config_a = provider.client_config(&a).unwrap();
        let config_b = provider.client_config(&b).unwrap();
        assert!(!Arc::ptr_eq(&config_a, &config_b));
        assert!(Arc::ptr_eq(&config_a, &provider.client_config(&a).unwrap()));

        let shown = a.id().to_string();
        assert!(shown.starts_with("custom:"));
        assert_eq!(shown.len(), "custom:".len() + 16);
    }

    #[test]
    fn identity_changes_the_fingerprint() {
        let ca = self_signed_pem();
        let client = rcgen::generate_simple_self_signed(vec!["client".to_string()]).unwrap();
        let plain = TrustStore::from_pem(&mut ca.as_bytes()).unwrap();
        let before = plain.fingerprint();
        let with_id = plain
            .with_identity(
                &mut client.cert.pem().as_bytes(),
                &mut client.key_pair.serialize_pem().as_bytes(),
            )
            .unwrap();
        assert!(with_id.has_identity());
        assert_ne!(with_id.fingerprint(), before);
    }

    #[test]
    fn configs_are_cached_per_trust() {
        let provider = TlsProvider::new();
        let a = provider.client_config(&TrustMode::Platform).unwrap();
        let b = provider.client_config(&TrustMode::Platform).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let insecure = provider.client_config(&TrustMode::Insecure).unwrap();
        assert!(!Arc::ptr_eq(&a, &insecure));
    }

    #[traced_test]
    #[test]
    fn insecure_mode_logs_a_warning() {
        TlsProvider::new().client_config(&TrustMode::Insecure).unwrap();
        assert!(logs_contain("certificate verification disabled"));
    }

    #[test]
    fn certificate_errors_classify_as_trust_failures() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        let classified = classify_handshake_error("https://h:443", err);
        assert!(matches!(
            classified,
            RequestError::TlsTrustError { key: Some(ref k), .. } if k == "https://h:443"
        ));

        let refused = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(
            classify_handshake_error("https://h:443", refused),
            RequestError::ConnectFailed { .. }
        ));
    }
}
