//! TLS acceptor/connector construction.
//!
//! The operator can hand the server PEM certificate material through the
//! config; when none is given a self-signed certificate is generated. Client
//! sides of the tunnel skip certificate verification, since the tunnel is
//! authenticated by the control-channel key rather than by PKI.

use std::{
    io::{Error, ErrorKind},
    sync::Arc,
};

use tokio_rustls::{TlsAcceptor, TlsConnector};

/// PEM-encoded certificate material, as configured or generated.
#[derive(Debug, Clone)]
pub struct CertMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

impl CertMaterial {
    /// Generates a throwaway self-signed certificate for the given hostnames.
    pub fn self_signed(hosts: Vec<String>) -> Result<CertMaterial, Error> {
        let cert = rcgen::generate_simple_self_signed(hosts).map_err(|e| Error::new(ErrorKind::Other, e))?;
        let cert_pem = cert.serialize_pem().map_err(|e| Error::new(ErrorKind::Other, e))?;
        let key_pem = cert.serialize_private_key_pem();
        Ok(CertMaterial { cert_pem, key_pem })
    }
}

pub fn make_acceptor(material: &CertMaterial) -> Result<TlsAcceptor, Error> {
    let certs = rustls_pemfile::certs(&mut material.cert_pem.as_bytes())?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(Error::new(ErrorKind::InvalidData, "no certificate found in PEM material"));
    }

    let key = read_private_key(&material.key_pem)?;
    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_private_key(key_pem: &str) -> Result<rustls::PrivateKey, Error> {
    for item in rustls_pemfile::read_all(&mut key_pem.as_bytes())? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(rustls::PrivateKey(key)),
            _ => continue,
        }
    }
    Err(Error::new(ErrorKind::InvalidData, "no private key found in PEM material"))
}

pub fn make_connector() -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Any parseable name works since the peer certificate is never verified.
pub fn server_name_for(host: &str) -> rustls::ServerName {
    rustls::ServerName::try_from(host)
        .unwrap_or_else(|_| rustls::ServerName::try_from("localhost").unwrap())
}

struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
