//! The narrow TLS interface: given a byte stream and a [`TlsConfig`], wrap it
//! in TLS and resolve once the handshake completes.
use std::sync::Arc;

use rustls::ClientConfig;
use rustls_pki_types::ServerName;

use crate::Result;

use super::Socket;

/// Which certificate verification mode to use when negotiating TLS.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Do not use TLS at all.
    #[default]
    Disable,
    /// Use TLS if the server offers it, but don't verify the certificate chain.
    Prefer,
    /// Require TLS and verify the certificate chain against the platform's
    /// native trust store, or `root_cert` if provided.
    Require,
}

/// TLS configuration for a connection.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub mode: TlsMode,
    /// PEM encoded root certificate, overriding the native trust store.
    pub root_cert: Option<Vec<u8>>,
}

impl TlsConfig {
    fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut roots = rustls::RootCertStore::empty();

        match &self.root_cert {
            Some(pem) => {
                for cert in rustls_pemfile::certs(&mut &pem[..]) {
                    let cert = cert.map_err(std::io::Error::from)?;
                    roots.add(cert).map_err(|e| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                    })?;
                }
            }
            None => {
                for cert in rustls_native_certs::load_native_certs().certs {
                    let _ = roots.add(cert);
                }
            }
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        if let TlsMode::Prefer = self.mode {
            config.dangerous().set_certificate_verifier(Arc::new(NoVerify));
        }

        Ok(Arc::new(config))
    }
}

/// A certificate verifier that accepts anything, used for [`TlsMode::Prefer`].
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

/// Wrap `socket` in TLS, resolving once the handshake completes.
pub async fn handshake(socket: Socket, host: &str, config: &TlsConfig) -> Result<Socket> {
    let connector = tokio_rustls::TlsConnector::from(config.client_config()?);
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;

    let stream = connector.connect(server_name, Box::new(socket)).await?;
    Ok(Socket::Tls(Box::new(stream)))
}
