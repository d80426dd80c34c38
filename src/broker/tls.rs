//! TLS acceptor setup for `ssl` and `wss` listeners
//!
//! Loads the certificate chain and key named in a listener's
//! `[listeners.tls]` table. A CA bundle enables client certificate
//! verification, mandatory when `require_client_cert` is set.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

#[derive(Debug)]
pub enum TlsError {
    /// A PEM file could not be opened
    Io { path: String, source: io::Error },
    /// No usable certificate in a PEM file
    Certificate(String),
    /// No usable private key in a PEM file
    PrivateKey(String),
    /// The listener's TLS settings are inconsistent
    Config(String),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Io { path, source } => write!(f, "cannot read {}: {}", path, source),
            TlsError::Certificate(msg) => write!(f, "certificate error: {}", msg),
            TlsError::PrivateKey(msg) => write!(f, "private key error: {}", msg),
            TlsError::Config(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<VerifierBuilderError> for TlsError {
    fn from(e: VerifierBuilderError) -> Self {
        TlsError::Config(format!("client verifier: {}", e))
    }
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Io {
        path: path.to_string(),
        source,
    })
}

fn read_chain(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let chain = CertificateDer::pem_reader_iter(open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("{}: {}", path, e)))?;
    if chain.is_empty() {
        return Err(TlsError::Certificate(format!("{} holds no certificates", path)));
    }
    Ok(chain)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_reader(open(path)?)
        .map_err(|e| TlsError::PrivateKey(format!("{}: {}", path, e)))
}

fn read_roots(path: &str) -> Result<Arc<RootCertStore>, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in read_chain(path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::Certificate(format!("CA in {}: {}", path, e)))?;
    }
    Ok(Arc::new(roots))
}

/// Build the acceptor for one listener
pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let chain = read_chain(&config.cert)?;
    let key = read_key(&config.key)?;

    let builder = ServerConfig::builder();
    let builder = match (&config.ca_cert, config.require_client_cert) {
        (None, true) => {
            return Err(TlsError::Config(
                "require_client_cert needs a ca_cert bundle".to_string(),
            ))
        }
        (None, false) => builder.with_no_client_auth(),
        (Some(ca), required) => {
            let verifier = WebPkiClientVerifier::builder(read_roots(ca)?);
            let verifier = if required {
                verifier.build()?
            } else {
                // Anonymous clients allowed, presented certificates still verified
                verifier.allow_unauthenticated().build()?
            };
            builder.with_client_cert_verifier(verifier)
        }
    };

    let server_config = builder
        .with_single_cert(chain, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
