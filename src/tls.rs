use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::{self, ServerConfig};
use pgwire::tokio::TlsAcceptor;
use tracing::info;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("both STAYGRID_TLS_CERT and STAYGRID_TLS_KEY must be set, or neither")]
    Incomplete,
    #[error("cannot read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("no certificate found in {0}")]
    NoCertificate(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("invalid certificate or key: {0}")]
    Rustls(#[from] rustls::Error),
}

/// TLS acceptor for the configured certificate pair, or `None` when TLS is off.
pub fn acceptor_from_config(config: &Config) -> Result<Option<TlsAcceptor>, TlsError> {
    load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())
}

pub fn load_tls_acceptor(cert_path: Option<&str>, key_path: Option<&str>) -> Result<Option<TlsAcceptor>, TlsError> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => return Err(TlsError::Incomplete),
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<_, _>>()
        .map_err(|source| read_error(cert_path, source))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(cert_path.to_string()));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|source| read_error(key_path, source))?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_string()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    info!("tls certificate loaded from {cert_path}");
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| read_error(path, source))
}

fn read_error(path: &str, source: io::Error) -> TlsError {
    TlsError::Read {
        path: path.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pem_file(name: &str, contents: &str) -> String {
        let dir = std::env::temp_dir().join("staygrid_test_tls");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn disabled_without_paths() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_rejected() {
        assert!(matches!(load_tls_acceptor(Some("cert.pem"), None), Err(TlsError::Incomplete)));
        assert!(matches!(load_tls_acceptor(None, Some("key.pem")), Err(TlsError::Incomplete)));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_tls_acceptor(Some("/nonexistent/staygrid.pem"), Some("/nonexistent/key.pem"))
            .err()
            .unwrap();
        assert!(matches!(err, TlsError::Read { ref path, .. } if path == "/nonexistent/staygrid.pem"));
    }

    #[test]
    fn empty_pem_has_no_certificate() {
        let cert = pem_file("empty_cert.pem", "");
        let key = pem_file("empty_key.pem", "");
        assert!(matches!(load_tls_acceptor(Some(&cert), Some(&key)), Err(TlsError::NoCertificate(_))));
    }
}
