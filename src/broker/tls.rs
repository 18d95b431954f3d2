//! TLS acceptor construction
//!
//! Turns the listener's certificate configuration into the acceptor shared
//! by the TLS and wss accept loops. Client authentication is a policy
//! derived from two knobs: a CA bundle makes client certificates checkable,
//! `verify` makes presenting one mandatory.

use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::{self, PemObject};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::danger::ClientCertVerifier;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use super::TlsConfig;

/// Errors from assembling the TLS acceptor.
#[derive(Debug)]
pub enum TlsError {
    /// A PEM file was missing, unreadable or held no usable material;
    /// carries the offending path
    Pem { path: String, detail: String },
    /// rustls rejected the assembled configuration
    Setup(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Pem { path, detail } => write!(f, "pem file {}: {}", path, detail),
            TlsError::Setup(detail) => write!(f, "tls setup: {}", detail),
        }
    }
}

impl std::error::Error for TlsError {}

fn pem_error(path: &str, err: pem::Error) -> TlsError {
    TlsError::Pem {
        path: path.to_string(),
        detail: err.to_string(),
    }
}

/// Every certificate in a PEM file, in file order.
fn certs_from(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let parsed = CertificateDer::pem_file_iter(path)
        .map_err(|e| pem_error(path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| pem_error(path, e))?;

    if parsed.is_empty() {
        return Err(TlsError::Pem {
            path: path.to_string(),
            detail: "no certificates in file".to_string(),
        });
    }
    Ok(parsed)
}

/// The client-certificate policy, or `None` for no client auth at all.
///
/// With a CA bundle configured, clients presenting a certificate are checked
/// against it; `verify` additionally refuses clients that present none.
/// `verify` without a CA bundle is a configuration error since there is
/// nothing to check against.
fn client_auth(config: &TlsConfig) -> Result<Option<Arc<dyn ClientCertVerifier>>, TlsError> {
    let Some(ca_path) = config.ca_file.as_deref() else {
        if config.verify {
            return Err(TlsError::Setup(
                "verify is set but no ca_file names a CA bundle".to_string(),
            ));
        }
        return Ok(None);
    };

    let mut trusted = RootCertStore::empty();
    for ca in certs_from(ca_path)? {
        trusted.add(ca).map_err(|e| TlsError::Pem {
            path: ca_path.to_string(),
            detail: format!("rejected CA certificate: {}", e),
        })?;
    }

    let policy = WebPkiClientVerifier::builder(Arc::new(trusted));
    let policy = if config.verify {
        policy
    } else {
        policy.allow_unauthenticated()
    };
    policy
        .build()
        .map(Some)
        .map_err(|e| TlsError::Setup(e.to_string()))
}

/// Build the acceptor from the listener configuration.
pub fn load_tls_config(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let chain = certs_from(&config.cert_file)?;
    let key = PrivateKeyDer::from_pem_file(&config.key_file)
        .map_err(|e| pem_error(&config.key_file, e))?;

    let builder = match client_auth(config)? {
        Some(verifier) => ServerConfig::builder().with_client_cert_verifier(verifier),
        None => ServerConfig::builder().with_no_client_auth(),
    };

    builder
        .with_single_cert(chain, key)
        .map(|server| TlsAcceptor::from(Arc::new(server)))
        .map_err(|e| TlsError::Setup(e.to_string()))
}
