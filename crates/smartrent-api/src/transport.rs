// Shared transport configuration for building reqwest::Client instances.
//
// The REST client, the credential store and the realtime socket share TLS
// settings through this module.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;

use crate::error::Error;

const USER_AGENT: &str = concat!("smartrent-rs/", env!("CARGO_PKG_VERSION"));

/// TLS verification mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Use the system certificate store.
    #[default]
    System,
    /// Additionally trust a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);

        if let TlsMode::CustomCa(path) = &self.tls {
            let cert_pem = std::fs::read(path)
                .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&cert_pem)
                .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    /// Rustls config for the realtime socket, or `None` to keep the
    /// connector's built-in webpki roots.
    ///
    /// A custom CA is trusted in addition to the webpki roots, matching
    /// what [`build_client`](Self::build_client) does for REST.
    pub fn socket_tls_config(&self) -> Result<Option<Arc<rustls::ClientConfig>>, Error> {
        let TlsMode::CustomCa(path) = &self.tls else {
            return Ok(None);
        };

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let certs = CertificateDer::pem_file_iter(path)
            .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
        let mut added = 0_usize;
        for cert in certs {
            let cert = cert.map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(Error::Tls(format!("no certificates in {}", path.display())));
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("failed to build socket TLS config: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Some(Arc::new(config)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn custom_ca(path: PathBuf) -> TransportConfig {
        TransportConfig {
            tls: TlsMode::CustomCa(path),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn system_mode_keeps_default_socket_roots() {
        assert!(TransportConfig::default().socket_tls_config().unwrap().is_none());
    }

    #[test]
    fn missing_ca_file_is_a_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = custom_ca(dir.path().join("absent.pem"));

        let err = config.socket_tls_config().unwrap_err();
        assert!(matches!(err, Error::Tls(_)), "{err:?}");
        let err = config.build_client().unwrap_err();
        assert!(matches!(err, Error::Tls(_)), "{err:?}");
    }

    #[test]
    fn ca_file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a certificate\n").unwrap();

        let err = custom_ca(path).socket_tls_config().unwrap_err();
        assert!(matches!(err, Error::Tls(ref m) if m.contains("no certificates")), "{err:?}");
    }
}
