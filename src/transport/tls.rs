//! rustls client configuration.
//!
//! Verification is on by default. The relaxed verifiers below exist only for
//! the `verify=no` and `verify_hostname=no` module options.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme,
};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

use crate::config::TlsConfig;
use crate::errors::{SmtpError, SmtpResult};

/// Builds a connector honoring the verification switches.
pub fn connector(config: &TlsConfig) -> SmtpResult<TlsConnector> {
    let roots = root_store(config.ca_cert_path.as_deref())?;

    let client_config = if !config.verify_certificate {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate::new()))
            .with_no_client_auth()
    } else if !config.verify_hostname {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| SmtpError::tls(format!("Failed to build certificate verifier: {}", e)))?;
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(IgnoreHostname { inner }))
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Converts a host into a TLS server name. IP literals are accepted.
pub fn server_name(host: &str) -> SmtpResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", host)))
}

/// Bundled web PKI roots plus any anchors from `ca_file`.
pub fn root_store(ca_file: Option<&Path>) -> SmtpResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_file {
        let added = add_pem_file(&mut roots, path)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(path = %path.display(), added, "Loaded extra trust anchors");

        #[cfg(not(feature = "tracing"))]
        let _ = added;
    }

    Ok(roots)
}

fn add_pem_file(roots: &mut RootCertStore, path: &Path) -> SmtpResult<usize> {
    let file = File::open(path).map_err(|e| {
        SmtpError::configuration(format!("Cannot open CA file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| {
            SmtpError::configuration(format!("Cannot read CA file {}: {}", path.display(), e))
        })?;
        roots.add(cert).map_err(|e| {
            SmtpError::configuration(format!("Invalid certificate in {}: {}", path.display(), e))
        })?;
        added += 1;
    }

    if added == 0 {
        return Err(SmtpError::configuration(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(added)
}

/// Accepts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: CryptoProvider,
}

impl AcceptAnyCertificate {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Full chain verification that tolerates a name mismatch.
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
