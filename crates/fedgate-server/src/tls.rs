//! TLS material: server cert/key loading, the outbound connector, and
//! self-signed certificate generation for development.

use fedgate_core::{FedError, FedResult};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Install the process-wide crypto provider. Safe to call more than once.
pub fn init_crypto() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Load TLS certificate and key from PEM files into an acceptor for the
/// inbound listener.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> FedResult<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| FedError::Tls(format!("cannot read cert {}: {e}", cert_path.display())))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| FedError::Tls(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FedError::Tls(format!("bad cert PEM: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| FedError::Tls(format!("bad key PEM: {e}")))?
        .ok_or_else(|| FedError::Tls("no private key found in PEM".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| FedError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the connector for outbound TLS upgrades.
///
/// Uses the system root store, or a verifier that accepts any certificate
/// when `accept_self_signed` is set (closed federation networks run on
/// self-signed material).
pub fn build_connector(accept_self_signed: bool) -> FedResult<TlsConnector> {
    let config = if accept_self_signed {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        if native.certs.is_empty() {
            return Err(FedError::Tls(
                "no system root certificates found; install CA certificates \
                 or set accept_self_signed"
                    .into(),
            ));
        }
        for cert in native.certs {
            root_store
                .add(cert)
                .map_err(|e| FedError::Tls(format!("failed to add root cert: {e}")))?;
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parse the SNI name for an outbound connection.
pub fn server_name(host: &str) -> FedResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| FedError::Tls(format!("invalid server name {host}: {e}")))
}

/// Generate a self-signed certificate for development use.
pub fn generate_self_signed() -> FedResult<(PathBuf, PathBuf)> {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".fedgate");
    std::fs::create_dir_all(&dir)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(|e| FedError::Tls(e.to_string()))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "fedgate dev cert");

    let key_pair = rcgen::KeyPair::generate().map_err(|e| FedError::Tls(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| FedError::Tls(e.to_string()))?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Certificate verifier that accepts anything. Only wired up behind the
/// `accept_self_signed` config flag.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: rustls::crypto::CryptoProvider,
}

impl AcceptAnyCert {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
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
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
