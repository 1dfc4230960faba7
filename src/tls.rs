use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {what} from '{path}': {source}")]
    Read {
        what: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[error("no PEM certificates found in '{0}'")]
    NoCerts(String),
    #[error("no PEM private key found in '{0}'")]
    NoKey(String),
    #[error("certificate and key are not usable together: {0}")]
    Rustls(#[from] rustls::Error),
}

fn read_pem(what: &'static str, path: &str) -> Result<BufReader<fs::File>, TlsError> {
    fs::File::open(Path::new(path))
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            what,
            path: path.to_string(),
            source,
        })
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut read_pem("certificate", path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            what: "certificate",
            path: path.to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCerts(path.to_string()));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut read_pem("private key", path)?)
        .map_err(|source| TlsError::Read {
            what: "private key",
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoKey(path.to_string()))
}

/// Builds the server-side TLS config for the webhook listener from PEM files.
pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str, contents: &str) -> String {
        let path = std::env::temp_dir().join(format!("label-webhook-{}-{name}", std::process::id()));
        fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_missing_cert_file() {
        let err = load_server_config("/nonexistent/tls.crt", "/nonexistent/tls.key").unwrap_err();
        assert!(matches!(err, TlsError::Read { what: "certificate", .. }));
    }

    #[test]
    fn test_file_without_pem_items() {
        let path = scratch_file("empty.crt", "not a certificate\n");
        let err = load_certs(&path).unwrap_err();
        assert!(matches!(err, TlsError::NoCerts(_)));

        let err = load_key(&path).unwrap_err();
        assert!(matches!(err, TlsError::NoKey(_)));
        fs::remove_file(path).unwrap();
    }
}
