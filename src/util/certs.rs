use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use thiserror::Error;

use crate::util::crypto::sha256_hex_digest;

#[derive(Debug, Error)]
pub enum CertsError {
    #[error("'{}' is not a readable certificate file: {}", .0.display(), .1)]
    Read(PathBuf, io::Error),

    #[error("no certificates found in '{}'", .0.display())]
    Empty(PathBuf),

    #[error("no private key found in '{}'", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("certificate rejected by trust store: {0}")]
    Rejected(#[from] rustls::Error),

    #[error("certificate rejected by http client: {0}")]
    HttpRejected(#[from] reqwest::Error),
}

/// Parse every certificate in a PEM file into DER form.
pub fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertsError> {
    let pem = fs::read(path).map_err(|e| CertsError::Read(path.to_owned(), e))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertsError::Read(path.to_owned(), e))?;

    if certs.is_empty() {
        return Err(CertsError::Empty(path.to_owned()));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM file.
pub fn read_pem_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertsError> {
    let pem = fs::read(path).map_err(|e| CertsError::Read(path.to_owned(), e))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| CertsError::Read(path.to_owned(), e))?
        .ok_or_else(|| CertsError::NoPrivateKey(path.to_owned()))
}

/// Registry thumbprint of a certificate: uppercase SHA-256 of the DER bytes.
pub fn thumbprint(cert: &CertificateDer<'_>) -> String {
    sha256_hex_digest(cert.as_ref()).to_uppercase()
}

/// Thumbprint of the first certificate in a PEM file.
pub fn file_thumbprint(path: &Path) -> Result<String, CertsError> {
    let certs = read_pem_certs(path)?;
    Ok(thumbprint(&certs[0]))
}

/// Trust anchors shared by every client in the harness.
///
/// The hub and the edge gateway are typically backed by a test CA during a
/// smoke run, so the anchor from `--trusted-ca-cert` is installed into both
/// the MQTT TLS root store and the reqwest client, alongside the regular
/// web roots.
#[derive(Debug, Clone, Default)]
pub struct TrustBundle {
    ca_certs: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    pub fn load(path: Option<&Path>) -> Result<Self, CertsError> {
        let ca_certs = match path {
            Some(path) => read_pem_certs(path)?,
            None => Vec::new(),
        };
        Ok(Self { ca_certs })
    }

    /// Root store for MQTT connections: web roots plus the trusted CA chain.
    pub fn root_store(&self) -> Result<RootCertStore, CertsError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in &self.ca_certs {
            roots.add(cert.clone())?;
        }
        Ok(roots)
    }

    /// Install the trusted CA chain into an HTTP client under construction.
    pub fn install_into(
        &self,
        mut builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, CertsError> {
        for cert in &self.ca_certs {
            builder = builder.add_root_certificate(reqwest::Certificate::from_der(cert.as_ref())?);
        }
        Ok(builder)
    }
}
