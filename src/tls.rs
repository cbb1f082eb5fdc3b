//! TLS for the control connection
//!
//! TLS is optional on both sides. When it is off the session runs over
//! plain TCP; either way the session code only sees a [`BoxedStream`].
//!
//! Configs are pinned to the `ring` provider, so no process-wide default
//! provider has to be installed first.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::config::{ClientSettings, ServerTlsSettings};

/// Byte stream a session runs over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

pub struct ServerTlsConfig {
    pub config: Arc<ServerConfig>,
}

pub struct ClientTlsConfig {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

pub struct GeneratedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

impl ServerTlsConfig {
    /// Load a certificate chain and private key from PEM files
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let certs = load_certs(cert_path)?;
        info!("Loaded {} certificate(s) from {:?}", certs.len(), cert_path);
        let key = load_private_key(key_path)?;

        Self::build(certs, key).with_context(|| format!("Invalid certificate/key in {:?}", cert_path))
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let certs = load_certs_from_pem(cert_pem)?;
        let key = load_private_key_from_pem(key_pem)?;
        Self::build(certs, key)
    }

    /// `None` when TLS is disabled in the settings
    pub fn from_settings(settings: &ServerTlsSettings) -> Result<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }
        match (&settings.cert, &settings.key) {
            (Some(cert), Some(key)) => Self::from_files(cert, key).map(Some),
            _ => anyhow::bail!("TLS is enabled but cert or key is not configured"),
        }
    }

    fn build(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .context("No usable TLS protocol versions")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Failed to build server TLS config")?;

        Ok(Self {
            config: Arc::new(config),
        })
    }
}

impl ClientTlsConfig {
    /// Trust only the certificates in `ca_cert_path`
    pub fn new(ca_cert_path: &Path, server_name: &str) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        for cert in load_certs(ca_cert_path)? {
            root_store
                .add(cert)
                .context("Failed to add CA certificate to root store")?;
        }
        info!("Loaded CA certificate from {:?}", ca_cert_path);

        Self::with_roots(root_store, server_name)
    }

    pub fn from_ca_pem(ca_pem: &str, server_name: &str) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        for cert in load_certs_from_pem(ca_pem)? {
            root_store
                .add(cert)
                .context("Failed to add CA certificate to root store")?;
        }

        Self::with_roots(root_store, server_name)
    }

    /// Accept any server certificate. Only for talking to test servers.
    pub fn insecure(server_name: &str) -> Result<Self> {
        warn!("⚠️  TLS certificate verification DISABLED");

        let provider = provider();
        let verifier = InsecureCertVerifier {
            algorithms: provider.signature_verification_algorithms,
        };
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("No usable TLS protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
            server_name: parse_server_name(server_name)?,
        })
    }

    /// `None` when TLS is disabled in the settings
    pub fn from_settings(settings: &ClientSettings) -> Result<Option<Self>> {
        let tls = &settings.tls;
        if !tls.enabled {
            return Ok(None);
        }

        let hostname = settings.tls_hostname();
        let config = match (&tls.ca, tls.insecure) {
            (_, true) => Self::insecure(hostname)?,
            (Some(ca), false) => Self::new(ca, hostname)?,
            (None, false) => anyhow::bail!("TLS is enabled but no CA certificate is configured"),
        };
        Ok(Some(config))
    }

    fn with_roots(root_store: RootCertStore, server_name: &str) -> Result<Self> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .context("No usable TLS protocol versions")?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
            server_name: parse_server_name(server_name)?,
        })
    }
}

fn parse_server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_owned()).context("Invalid server name for TLS")
}

/// Server side of the optional TLS layer
#[derive(Clone, Default)]
pub struct ServerTransport {
    acceptor: Option<TlsAcceptor>,
}

impl ServerTransport {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn tls(config: ServerTlsConfig) -> Self {
        Self {
            acceptor: Some(TlsAcceptor::from(config.config)),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.acceptor.is_some()
    }

    pub async fn accept<S>(&self, stream: S) -> io::Result<BoxedStream>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match &self.acceptor {
            Some(acceptor) => {
                let tls = acceptor.accept(stream).await?;
                debug!("TLS handshake complete");
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

/// Client side of the optional TLS layer
#[derive(Clone, Default)]
pub struct ClientTransport {
    connector: Option<(TlsConnector, ServerName<'static>)>,
}

impl ClientTransport {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn tls(config: ClientTlsConfig) -> Self {
        Self {
            connector: Some((TlsConnector::from(config.config), config.server_name)),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.connector.is_some()
    }

    pub async fn connect<S>(&self, stream: S) -> io::Result<BoxedStream>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match &self.connector {
            Some((connector, server_name)) => {
                let tls = connector.connect(server_name.clone(), stream).await?;
                let (_, conn) = tls.get_ref();
                if let (Some(version), Some(suite)) =
                    (conn.protocol_version(), conn.negotiated_cipher_suite())
                {
                    debug!("🔐 TLS established: {:?}, {:?}", version, suite.suite());
                }
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

/// Accepts any certificate but still checks handshake signatures
#[derive(Debug)]
struct InsecureCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Generate a self-signed certificate for test deployments
pub fn generate_self_signed_cert(
    common_name: &str,
    san_dns_names: &[&str],
    san_ips: &[std::net::IpAddr],
) -> Result<GeneratedCert> {
    info!("Generating self-signed certificate for: {}", common_name);

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;

    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Gated File Transfer");

    let mut sans = Vec::new();
    for dns_name in san_dns_names {
        sans.push(SanType::DnsName((*dns_name).try_into()?));
    }
    sans.extend(san_ips.iter().copied().map(SanType::IpAddress));
    params.subject_alt_names = sans;

    let cert = params
        .self_signed(&key_pair)
        .context("Failed to generate self-signed certificate")?;

    info!("✓ Generated certificate CN={} SANs: {:?}, {:?}", common_name, san_dns_names, san_ips);

    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file: {:?}", path))?;
    let certs: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", path);
    }
    Ok(certs)
}

fn load_certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates from PEM")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in PEM data");
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open private key file: {:?}", path))?;

    private_key(&mut BufReader::new(file))
        .context("Failed to read private key")?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {:?}", path))
}

fn load_private_key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    private_key(&mut pem.as_bytes())
        .context("Failed to read private key from PEM")?
        .ok_or_else(|| anyhow::anyhow!("No private key found in PEM data"))
}

/// Write the certificate and key; the key file is made owner-only on Unix
pub fn save_cert_and_key(
    cert_pem: &str,
    key_pem: &str,
    cert_path: &Path,
    key_path: &Path,
) -> Result<()> {
    std::fs::write(cert_path, cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_path))?;
    std::fs::write(key_path, key_pem)
        .with_context(|| format!("Failed to write private key to {:?}", key_path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on {:?}", key_path))?;
    }

    info!("Saved certificate to {:?} and key to {:?}", cert_path, key_path);
    Ok(())
}
