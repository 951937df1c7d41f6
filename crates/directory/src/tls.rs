//! TLS material loading and connector construction

use native_tls::{Certificate, Identity, Protocol, TlsConnector};

use crate::config::{DirectoryConfig, TlsVersion};
use crate::error::{DirectoryError, Result};

/// Parse a PEM bundle into certificates; at least one is required
pub fn parse_ca_bundle(pem: &str) -> Result<Vec<Certificate>> {
    let mut reader = pem.as_bytes();
    let mut certs = Vec::new();
    for der in rustls_pemfile::certs(&mut reader) {
        let der = der.map_err(|e| DirectoryError::Tls(format!("unreadable CA PEM: {e}")))?;
        let cert = Certificate::from_der(der.as_ref())
            .map_err(|e| DirectoryError::Tls(format!("invalid CA certificate: {e}")))?;
        certs.push(cert);
    }
    if certs.is_empty() {
        return Err(DirectoryError::Tls(
            "could not parse any PEM certificate from the CA bundle".to_string(),
        ));
    }
    Ok(certs)
}

/// Load the client certificate and PKCS#8 key into an identity
pub fn client_identity(cert_pem: &str, key_pem: &str) -> Result<Identity> {
    let mut reader = key_pem.as_bytes();
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Err(DirectoryError::Tls(
                "client_tls_key contains no private key".to_string(),
            ));
        }
        Err(e) => return Err(DirectoryError::Tls(format!("unreadable client key: {e}"))),
    }
    Identity::from_pkcs8(cert_pem.as_bytes(), key_pem.as_bytes())
        .map_err(|e| DirectoryError::Tls(format!("invalid client certificate/key pair: {e}")))
}

/// Lower protocol bound; the platform backends cannot pin TLS 1.3 as a
/// floor, so `tls13` falls back to the highest floor they accept.
fn min_protocol(version: TlsVersion) -> Protocol {
    match version {
        TlsVersion::Tls10 => Protocol::Tlsv10,
        TlsVersion::Tls11 => Protocol::Tlsv11,
        TlsVersion::Tls12 | TlsVersion::Tls13 => Protocol::Tlsv12,
    }
}

/// Upper protocol bound; `None` leaves the newest supported version enabled
fn max_protocol(version: TlsVersion) -> Option<Protocol> {
    match version {
        TlsVersion::Tls10 => Some(Protocol::Tlsv10),
        TlsVersion::Tls11 => Some(Protocol::Tlsv11),
        TlsVersion::Tls12 => Some(Protocol::Tlsv12),
        TlsVersion::Tls13 => None,
    }
}

/// Build the connector used for `ldaps://` and StartTLS
pub fn build_connector(config: &DirectoryConfig) -> Result<TlsConnector> {
    let mut builder = TlsConnector::builder();
    builder
        .min_protocol_version(Some(min_protocol(config.tls_min_version)))
        .max_protocol_version(max_protocol(config.tls_max_version));

    if config.insecure_tls {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    if !config.certificate.trim().is_empty() {
        for cert in parse_ca_bundle(&config.certificate)? {
            builder.add_root_certificate(cert);
        }
    }

    let key = config.client_tls_key.expose_secret();
    if !config.client_tls_cert.trim().is_empty() && !key.trim().is_empty() {
        builder.identity(client_identity(&config.client_tls_cert, key)?);
    }

    builder
        .build()
        .map_err(|e| DirectoryError::Tls(format!("building TLS connector: {e}")))
}
