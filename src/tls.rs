use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

fn open(path: &str, what: &str) -> io::Result<BufReader<File>> {
    File::open(Path::new(path))
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("cannot open TLS {what} {path}: {e}")))
}

fn read_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open(path, "certificate")?).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(ErrorKind::InvalidInput, format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn read_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path, "key")?)?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no private key found in {path}")))
}

/// TLS acceptor for `TRAININGD_TLS_CERT` / `TRAININGD_TLS_KEY`, or `None`
/// when neither is set.
pub fn load_tls_acceptor(cert_path: Option<&str>, key_path: Option<&str>) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both TRAININGD_TLS_CERT and TRAININGD_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs = read_certs(cert_path)?;
    let chain_len = certs.len();
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, read_key(key_path)?)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    tracing::info!("TLS enabled with {chain_len} certificate(s) from {cert_path}");
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
