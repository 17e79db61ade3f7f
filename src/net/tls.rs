// src/net/tls.rs - rustls server configuration from PEM files

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Build a server config from a PEM certificate chain and a PEM private key
/// (PKCS#1, PKCS#8 or SEC1).
pub fn load_server_config(certificate: &Path, private_key: &Path) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(certificate)?;
    let key = load_private_key(private_key)?;

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| material_error(path, e.to_string()))?;
    Ok(BufReader::new(file))
}

fn material_error(path: &Path, reason: impl Into<String>) -> Error {
    Error::TlsMaterial {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| material_error(path, e.to_string()))?;
    if certs.is_empty() {
        return Err(material_error(path, "no certificate found"));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| material_error(path, e.to_string()))?
        .ok_or_else(|| material_error(path, "no private key found"))
}
