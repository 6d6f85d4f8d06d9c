//! Ephemeral certificates and TLS configuration for automatic mTLS
//!
//! Both sides of an auto-mTLS session generate a throwaway self-signed
//! certificate, hand the other side its public half, and then pin the peer's
//! certificate as the only trusted root.
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fmt;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::error::{PluginError, Result};

/// Name every ephemeral certificate is issued for and verified against.
pub const TLS_SERVER_NAME: &str = "localhost";

const CERT_ORGANIZATION: &str = "etxe plugin";

/// A freshly generated certificate and its private key.
pub struct CertificateBundle {
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_der: PrivatePkcs8KeyDer<'static>,
}

impl CertificateBundle {
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("cert_der_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

/// Generate an ECDSA P-256 self-signed leaf certificate for `localhost`.
pub fn generate_cert() -> Result<CertificateBundle> {
    let mut params = CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])?;
    params
        .distinguished_name
        .push(DnType::OrganizationName, CERT_ORGANIZATION);
    params
        .distinguished_name
        .push(DnType::CommonName, TLS_SERVER_NAME);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(CertificateBundle {
        cert_der: cert.der().clone(),
        cert_pem: cert.pem(),
        key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
    })
}

/// Parse the first PEM certificate in `pem`.
pub fn parse_pem_certificate(pem: &str) -> Result<CertificateDer<'static>> {
    CertificateDer::pem_slice_iter(pem.as_bytes())
        .next()
        .ok_or_else(|| PluginError::Certificate("no certificate found in PEM data".into()))?
        .map_err(|e| PluginError::Certificate(format!("failed to parse certificate: {e}")))
}

/// Encode a DER certificate for the handshake line: unpadded base64, since
/// the line cannot carry PEM newlines.
pub fn encode_handshake_cert(der: &[u8]) -> String {
    STANDARD_NO_PAD.encode(der)
}

/// Decode and sanity check the certificate field of a handshake line.
pub fn decode_handshake_cert(encoded: &str) -> Result<CertificateDer<'static>> {
    let encoded = encoded.trim();
    let der = STANDARD_NO_PAD
        .decode(encoded)
        .or_else(|_| STANDARD.decode(encoded))
        .map_err(|e| PluginError::InvalidServerCert(e.to_string()))?;
    let cert = CertificateDer::from(der);

    // Make sure this is a certificate we could actually trust later on
    RootCertStore::empty()
        .add(cert.clone())
        .map_err(|e| PluginError::InvalidServerCert(e.to_string()))?;

    Ok(cert)
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client and server TLS configuration for one side of a session.
///
/// The same settings are used to serve the main listener, to serve broker
/// listeners opened by `Accept`, and to dial broker connections.
#[derive(Clone)]
pub struct TlsSettings {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl TlsSettings {
    pub fn new(client: Arc<ClientConfig>, server: Arc<ServerConfig>) -> Self {
        Self { client, server }
    }

    /// Present `own` and require-and-verify `peer` in both directions.
    pub fn mutual(own: &CertificateBundle, peer: CertificateDer<'static>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots
            .add(peer)
            .map_err(|e| PluginError::Certificate(format!("failed to add peer certificate: {e}")))?;
        let roots = Arc::new(roots);
        let provider = crypto_provider();

        let client = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(vec![own.cert_der.clone()], own.private_key())?;

        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
            .build()
            .map_err(|e| PluginError::Tls(format!("client verifier error: {e}")))?;

        let server = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![own.cert_der.clone()], own.private_key())?;

        Ok(Self::new(Arc::new(client), Arc::new(server)))
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server.clone())
    }

    pub fn server_name() -> Result<ServerName<'static>> {
        ServerName::try_from(TLS_SERVER_NAME).map_err(|e| PluginError::Tls(e.to_string()))
    }
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_cert_round_trips_through_pem() {
        let bundle = generate_cert().unwrap();
        assert!(bundle.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));

        let parsed = parse_pem_certificate(bundle.cert_pem()).unwrap();
        assert_eq!(&parsed, bundle.cert_der());
    }

    #[test]
    fn handshake_encoding_has_no_padding_or_newlines() {
        let bundle = generate_cert().unwrap();
        let encoded = encode_handshake_cert(bundle.cert_der());
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('\n'));
        assert!(encoded.len() > 50);

        let decoded = decode_handshake_cert(&encoded).unwrap();
        assert_eq!(&decoded, bundle.cert_der());
    }

    #[test]
    fn rejects_non_certificate_pem() {
        assert!(parse_pem_certificate("not a pem").is_err());
    }

    #[test]
    fn builds_mutual_settings() {
        let host = generate_cert().unwrap();
        let plugin = generate_cert().unwrap();
        let settings = TlsSettings::mutual(&host, plugin.cert_der().clone());
        assert!(settings.is_ok());
    }
}
