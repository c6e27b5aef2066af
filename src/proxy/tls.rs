//! TLS client policy for proxy hops and tunneled targets
//!
//! Two trust models are used:
//! - the hop to a datacenter proxy instance is mutual TLS, with trust pinned to
//!   the connector certificate (it is both the CA and the client certificate)
//! - the session to the real target, layered over a tunnel, does not verify the
//!   certificate chain or name; egress trust belongs to the upstream proxy
//!
//! Handshake signatures are checked in both cases.

use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Result, RotaError};
use crate::models::CertificateInfo;
use crate::proxy::url::{is_dns_name, strip_brackets};

static PROVIDER: Lazy<Arc<CryptoProvider>> =
    Lazy::new(|| Arc::new(rustls::crypto::ring::default_provider()));

static TARGET_CONFIG: OnceCell<Arc<ClientConfig>> = OnceCell::new();

/// Crypto provider shared by every client config built here
pub fn crypto_provider() -> Arc<CryptoProvider> {
    PROVIDER.clone()
}

/// Server identity for a handshake, with the SNI decision made explicit.
///
/// SNI is only sent for DNS names. Literal IPs become `ServerName::IpAddress`,
/// for which no SNI extension is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetServerName {
    pub server_name: ServerName<'static>,
    pub sni: Option<String>,
}

impl TargetServerName {
    pub fn for_host(hostname: &str) -> Result<Self> {
        let host = strip_brackets(hostname);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| RotaError::InvalidUrl(format!("invalid server name {}: {}", host, e)))?;

        let sni = if is_dns_name(host) {
            Some(host.to_string())
        } else {
            None
        };

        Ok(Self { server_name, sni })
    }
}

/// Accepts exactly one end-entity certificate, whatever name it is presented for
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pinned: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    pub fn new(pinned: CertificateDer<'static>) -> Self {
        Self {
            pinned,
            provider: crypto_provider(),
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Skips chain and name checks for tunneled targets
#[derive(Debug)]
pub struct UnverifiedTargetVerifier {
    provider: Arc<CryptoProvider>,
}

impl UnverifiedTargetVerifier {
    pub fn new() -> Self {
        Self {
            provider: crypto_provider(),
        }
    }
}

impl Default for UnverifiedTargetVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for UnverifiedTargetVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Parse a PEM certificate chain and its private key
pub fn load_certificate(
    info: &CertificateInfo,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs = rustls_pemfile::certs(&mut info.cert.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RotaError::InvalidConfig(format!("unreadable certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(RotaError::InvalidConfig(
            "certificate PEM contains no certificate".to_string(),
        ));
    }

    let key = rustls_pemfile::private_key(&mut info.key.as_bytes())
        .map_err(|e| RotaError::InvalidConfig(format!("unreadable private key: {}", e)))?
        .ok_or_else(|| {
            RotaError::InvalidConfig("certificate PEM contains no private key".to_string())
        })?;

    Ok((certs, key))
}

/// Mutual TLS config for a datacenter proxy hop.
///
/// The connector certificate is presented as the client certificate and is
/// the only server certificate accepted.
pub fn pinned_client_config(info: &CertificateInfo) -> Result<Arc<ClientConfig>> {
    let (certs, key) = load_certificate(info)?;
    let verifier = Arc::new(PinnedCertVerifier::new(certs[0].clone()));

    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Client config for TLS to a tunneled target, built once per process
pub fn target_client_config() -> Result<Arc<ClientConfig>> {
    TARGET_CONFIG
        .get_or_try_init(|| -> Result<Arc<ClientConfig>> {
            let config = ClientConfig::builder_with_provider(crypto_provider())
                .with_safe_default_protocol_versions()?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(UnverifiedTargetVerifier::new()))
                .with_no_client_auth();
            Ok(Arc::new(config))
        })
        .cloned()
}

/// Run a client handshake over an established stream
pub async fn connect_tls<S>(
    config: Arc<ClientConfig>,
    name: &TargetServerName,
    stream: S,
) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(sni = ?name.sni, "Starting TLS handshake");
    let stream = TlsConnector::from(config)
        .connect(name.server_name.clone(), stream)
        .await?;
    Ok(stream)
}
