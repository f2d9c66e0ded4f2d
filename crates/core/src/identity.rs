//! Node identity: the TLS certificate whose SHA-256 is this node's
//! NodeId, and the rustls configurations built around it.
//!
//! Certificate verification is deliberately permissive at the TLS layer.
//! Peers present self-signed certificates, so there is no chain to
//! verify; authenticity is established after the handshake by hashing
//! the presented leaf certificate and comparing it against the
//! configured NodeId.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::path::Path;
use std::sync::Arc;
use weft_api::{protocol::ALPN_TOKEN, NodeId, WeftError, WeftResult};

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// This node's identity material.
#[derive(Debug)]
pub struct Identity {
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
    node_id: NodeId,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl Identity {
    /// Load the certificate and key from `conf_dir`, generating a fresh
    /// self-signed pair on first run.
    pub fn load_or_generate(conf_dir: &Path) -> WeftResult<Self> {
        let cert_path = conf_dir.join(CERT_FILE);
        let key_path = conf_dir.join(KEY_FILE);

        if !cert_path.exists() || !key_path.exists() {
            generate(&cert_path, &key_path)?;
        }
        Self::load(&cert_path, &key_path)
    }

    fn load(cert_path: &Path, key_path: &Path) -> WeftResult<Self> {
        let mut reader = std::io::BufReader::new(
            std::fs::File::open(cert_path).map_err(|e| {
                WeftError::fatal_src("open certificate file", e)
            })?,
        );
        let cert = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| WeftError::fatal("certificate file is empty"))?
            .map_err(|e| WeftError::fatal_src("parse certificate", e))?;

        let mut reader = std::io::BufReader::new(
            std::fs::File::open(key_path)
                .map_err(|e| WeftError::fatal_src("open key file", e))?,
        );
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| WeftError::fatal_src("parse key", e))?
            .ok_or_else(|| WeftError::fatal("key file holds no key"))?;

        let node_id = NodeId::from_cert_der(cert.as_ref());
        Ok(Self {
            cert,
            key,
            node_id,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// The NodeId derived from the certificate.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The rustls configuration for the listen side: TLS 1.2 minimum,
    /// client certificate required, ALPN fixed, session tickets off.
    pub fn server_config(&self) -> WeftResult<rustls::ServerConfig> {
        let verifier = Arc::new(AcceptAnyCert {
            provider: self.provider.clone(),
        });
        let mut config = rustls::ServerConfig::builder_with_provider(
            self.provider.clone(),
        )
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| WeftError::fatal_src("tls protocol versions", e))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![self.cert.clone()], self.key.clone_key())
        .map_err(|e| WeftError::fatal_src("tls server config", e))?;

        config.alpn_protocols = vec![ALPN_TOKEN.to_vec()];
        config.send_tls13_tickets = 0;
        config.session_storage =
            Arc::new(rustls::server::NoServerSessionStorage {});
        Ok(config)
    }

    /// The rustls configuration for the dial side.
    pub fn client_config(&self) -> WeftResult<rustls::ClientConfig> {
        let verifier = Arc::new(AcceptAnyCert {
            provider: self.provider.clone(),
        });
        let mut config = rustls::ClientConfig::builder_with_provider(
            self.provider.clone(),
        )
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| WeftError::fatal_src("tls protocol versions", e))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(
            vec![self.cert.clone()],
            self.key.clone_key(),
        )
        .map_err(|e| WeftError::fatal_src("tls client config", e))?;

        config.alpn_protocols = vec![ALPN_TOKEN.to_vec()];
        config.resumption = rustls::client::Resumption::disabled();
        Ok(config)
    }
}

fn generate(cert_path: &Path, key_path: &Path) -> WeftResult<()> {
    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| WeftError::fatal_src("generate key pair", e))?;
    let mut params = rcgen::CertificateParams::new(vec!["weft".to_string()])
        .map_err(|e| WeftError::fatal_src("certificate params", e))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "weft");
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| WeftError::fatal_src("self-sign certificate", e))?;

    std::fs::write(cert_path, cert.pem())
        .map_err(|e| WeftError::fatal_src("write certificate", e))?;
    std::fs::write(key_path, key_pair.serialize_pem())
        .map_err(|e| WeftError::fatal_src("write key", e))?;
    Ok(())
}

/// Accepts any presented certificate. Authenticity is the NodeId check
/// performed on the leaf hash after the handshake.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::server::danger::ClientCertVerifier for AcceptAnyCert {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error>
    {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
    {
        rustls::crypto::verify_tls12_signature(
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
    {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error>
    {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
    {
        rustls::crypto::verify_tls12_signature(
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
    {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
