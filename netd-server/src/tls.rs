//! TLS configuration, acceptor and the deadline-bounded handshake.

use crate::config::TlsConfig;
use crate::error::ServerError;
use crate::stream::NetStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// Loads TLS certificates and creates a TLS acceptor.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;

    let ca_path = match (&config.ca_path, config.verify_clients) {
        (Some(path), true) => Some(path),
        (None, true) => {
            return Err(ServerError::TlsConfig(
                "ca_path not set for client verification".into(),
            ))
        }
        (_, false) => None,
    };

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_config = match ca_path {
        Some(ca_path) => {
            let mut root_store = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                root_store
                    .add(cert)
                    .map_err(|e| ServerError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }

            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
                .build()
                .map_err(|e| {
                    ServerError::TlsConfig(format!("failed to build client verifier: {}", e))
                })?;

            rustls::ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?
        }
        None => rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?,
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Runs the server side of a TLS handshake under `deadline`.
///
/// When the deadline passes the handshake future is dropped, which closes
/// the socket; no stream is returned for that attempt.
pub async fn accept_with_deadline(
    acceptor: &TlsAcceptor,
    tcp: TcpStream,
    deadline: Duration,
) -> Result<NetStream, ServerError> {
    match tokio::time::timeout(deadline, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => Ok(NetStream::tls(stream)),
        Ok(Err(e)) => Err(ServerError::TlsHandshake(e.to_string())),
        Err(_) => Err(ServerError::TlsHandshakeTimeout(deadline)),
    }
}

/// Lazily resolved TLS acceptor shared by every clone of a [`Config`](crate::Config).
#[derive(Clone, Default)]
pub(crate) struct TlsContext(Arc<OnceLock<TlsAcceptor>>);

impl TlsContext {
    /// Returns the acceptor, building it from `config` on first use.
    /// Returns `None` when TLS is disabled.
    pub(crate) fn resolve(&self, config: &TlsConfig) -> Result<Option<TlsAcceptor>, ServerError> {
        if !config.enabled {
            return Ok(None);
        }
        if let Some(acceptor) = self.0.get() {
            return Ok(Some(acceptor.clone()));
        }
        let acceptor = create_tls_acceptor(config)?;
        Ok(Some(self.0.get_or_init(|| acceptor).clone()))
    }

    /// Installs a prebuilt acceptor. Returns false if one was already resolved.
    pub(crate) fn install(&self, acceptor: TlsAcceptor) -> bool {
        self.0.set(acceptor).is_ok()
    }

    /// Whether an acceptor was installed or already built.
    pub(crate) fn is_resolved(&self) -> bool {
        self.0.get().is_some()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("resolved", &self.0.get().is_some())
            .finish()
    }
}

impl crate::config::Config {
    /// Uses `acceptor` instead of loading certificates from `tls` paths, which
    /// then need not be set. Enables TLS. Returns false if an acceptor was
    /// already resolved.
    pub fn install_tls_acceptor(&mut self, acceptor: TlsAcceptor) -> bool {
        self.tls.enabled = true;
        self.tls_context.install(acceptor)
    }

    /// Resolves the TLS acceptor at most once; later calls return the same one.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ServerError> {
        self.tls_context.resolve(&self.tls)
    }
}

fn open_pem(path: &Path, what: &str) -> Result<BufReader<File>, ServerError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open {} {:?}: {}", what, path, e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut pem = open_pem(path, "certificate file")?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem)
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("bad PEM in {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig(format!("{:?} holds no certificates", path)));
    }
    Ok(certs)
}

/// First PKCS#1, PKCS#8 or SEC1 key in the file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut pem = open_pem(path, "key file")?;
    rustls_pemfile::private_key(&mut pem)
        .map_err(|e| ServerError::TlsConfig(format!("bad PEM in {:?}: {}", path, e)))?
        .ok_or_else(|| ServerError::TlsConfig(format!("{:?} holds no private key", path)))
}
