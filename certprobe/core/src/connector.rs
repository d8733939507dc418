use std::fmt;
use std::io;
use std::iter;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::version::{TLS12, TLS13};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme,
    SupportedProtocolVersion,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tokio_rustls::TlsConnector;

use crate::certificate;

/// TLS protocol version
#[derive(
    Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, strum::Display, strum::EnumString,
)]
pub enum TlsVersion {
    /// TLS 1.0
    #[strum(to_string = "1.0", serialize = "tls1.0")]
    Tls10,
    /// TLS 1.1
    #[strum(to_string = "1.1", serialize = "tls1.1")]
    Tls11,
    /// TLS 1.2
    #[strum(to_string = "1.2", serialize = "tls1.2")]
    Tls12,
    /// TLS 1.3
    #[strum(to_string = "1.3", serialize = "tls1.3")]
    Tls13,
}

/// Inclusive range of protocol versions offered in the handshake
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProtocolRange {
    /// Lowest version offered
    pub min: TlsVersion,
    /// Highest version offered
    pub max: TlsVersion,
}

impl TlsVersion {
    fn openssl(self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }
}

/// Offers every version a server under test may still speak
impl Default for ProtocolRange {
    fn default() -> Self {
        ProtocolRange {
            min: TlsVersion::Tls10,
            max: TlsVersion::Tls13,
        }
    }
}

impl ProtocolRange {
    fn check(&self) -> Result<(), ConfigError> {
        if self.min > self.max {
            return Err(ConfigError::ProtocolRange {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    /// rustls speaks nothing older than TLS 1.2
    fn is_modern(&self) -> bool {
        self.min >= TlsVersion::Tls12
    }

    fn versions(&self) -> Result<Vec<&'static SupportedProtocolVersion>, ConfigError> {
        self.check()?;
        let versions = [(TlsVersion::Tls12, &TLS12), (TlsVersion::Tls13, &TLS13)]
            .into_iter()
            .filter(|(v, _)| (self.min..=self.max).contains(v))
            .map(|(_, v)| v)
            .collect();
        Ok(versions)
    }
}

/// Invalid prober or connector settings
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Minimum protocol version is above the maximum
    #[error("minimum TLS version {min} is above maximum TLS version {max}")]
    ProtocolRange {
        /// Requested minimum
        min: TlsVersion,
        /// Requested maximum
        max: TlsVersion,
    },
    /// Error from [`rustls`] crate
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    /// Error from [`openssl`] crate
    #[error("OpenSSL configuration error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// Failure to reach the point where certificates are presented
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ConnectError {
    /// Dial or handshake did not finish in time
    #[error("IO timeout")]
    Timeout,
    /// Refused, reset, unresolvable or any other I/O failure
    #[error("{0}")]
    Connect(String),
}

/// Accepts whatever the server presents so the chain can be inspected afterwards.
/// Only certificates that cannot be parsed at all abort the handshake.
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = iter::once(&end_entity[..]).chain(intermediates.iter().map(|c| &c[..]));
        for der in presented {
            certificate::parse(der)
                .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Opens TCP and TLS sessions without judging the presented certificates.
///
/// Ranges starting at TLS 1.2 or later are handled by rustls, anything older
/// goes through OpenSSL.
#[derive(Clone)]
pub struct Connector {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Rustls(Arc<ClientConfig>),
    OpenSsl(SslConnector),
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match self.backend {
            Backend::Rustls(_) => "rustls",
            Backend::OpenSsl(_) => "openssl",
        };
        f.debug_struct("Connector")
            .field("backend", &backend)
            .finish()
    }
}

impl Connector {
    /// Create a connector offering the given protocol versions
    ///
    /// ```
    /// # use certprobe::{Connector, ProtocolRange, TlsVersion};
    /// assert!(Connector::new(ProtocolRange::default()).is_ok());
    /// let inverted = ProtocolRange { min: TlsVersion::Tls13, max: TlsVersion::Tls12 };
    /// assert!(Connector::new(inverted).is_err());
    /// ```
    pub fn new(protocols: ProtocolRange) -> Result<Self, ConfigError> {
        protocols.check()?;
        let backend = if protocols.is_modern() {
            Backend::Rustls(Arc::new(rustls_config(protocols)?))
        } else {
            Backend::OpenSsl(openssl_connector(protocols)?)
        };
        Ok(Connector { backend })
    }

    /// Connect to `host:port` sending `hostname` as SNI and return the
    /// certificates presented by the server, in order.
    ///
    /// `timeout` bounds the TCP connect and the TLS handshake together.
    /// The connection is closed before this returns.
    pub async fn fetch_certificates(
        &self,
        hostname: &str,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Vec<CertificateDer<'static>>, ConnectError> {
        debug!("connect to {host}:{port} as {hostname} within {timeout:?}");
        let handshake = async {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(io_error)?;
            match &self.backend {
                Backend::Rustls(config) => {
                    rustls_handshake(config.clone(), hostname, host, stream).await
                }
                Backend::OpenSsl(connector) => {
                    openssl_handshake(connector, hostname, host, stream).await
                }
            }
        };
        match tokio::time::timeout(timeout, handshake).await {
            Ok(certificates) => certificates,
            Err(_) => Err(ConnectError::Timeout),
        }
    }
}

fn rustls_config(protocols: ProtocolRange) -> Result<ClientConfig, ConfigError> {
    let provider = Arc::new(ring::default_provider());
    let verifier = AcceptAnyCertificate {
        algorithms: provider.signature_verification_algorithms,
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&protocols.versions()?)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

fn openssl_connector(protocols: ProtocolRange) -> Result<SslConnector, ConfigError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_min_proto_version(Some(protocols.min.openssl()))?;
    builder.set_max_proto_version(Some(protocols.max.openssl()))?;
    // OpenSSL 3 refuses TLS 1.0 and 1.1 above security level 0
    builder.set_cipher_list("ALL:@SECLEVEL=0")?;
    Ok(builder.build())
}

async fn rustls_handshake(
    config: Arc<ClientConfig>,
    hostname: &str,
    host: &str,
    stream: TcpStream,
) -> Result<Vec<CertificateDer<'static>>, ConnectError> {
    let server_name = server_name(hostname, host)?;
    let stream = TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(io_error)?;

    let (_, session) = stream.get_ref();
    debug!("{host} negotiated {:?}", session.protocol_version());
    let certificates = session
        .peer_certificates()
        .map(<[CertificateDer<'static>]>::to_vec)
        .unwrap_or_default();
    Ok(certificates)
}

async fn openssl_handshake(
    connector: &SslConnector,
    hostname: &str,
    host: &str,
    stream: TcpStream,
) -> Result<Vec<CertificateDer<'static>>, ConnectError> {
    let name = if hostname.is_empty() { host } else { hostname };
    let mut config = connector.configure().map_err(setup_error)?;
    config.set_verify_hostname(false);
    let ssl = config.into_ssl(name).map_err(setup_error)?;

    let mut stream = SslStream::new(ssl, stream).map_err(setup_error)?;
    if let Err(e) = Pin::new(&mut stream).connect().await {
        return Err(match e.io_error() {
            Some(io) if io.kind() == io::ErrorKind::TimedOut => ConnectError::Timeout,
            _ => ConnectError::Connect(e.to_string()),
        });
    }

    let ssl = stream.ssl();
    debug!("{host} negotiated {}", ssl.version_str());
    let certificates = match ssl.peer_cert_chain() {
        Some(chain) => chain
            .iter()
            .map(|cert| cert.to_der().map(CertificateDer::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(setup_error)?,
        None => vec![],
    };
    Ok(certificates)
}

fn io_error(e: io::Error) -> ConnectError {
    match e.kind() {
        io::ErrorKind::TimedOut => ConnectError::Timeout,
        _ => ConnectError::Connect(e.to_string()),
    }
}

fn setup_error(e: openssl::error::ErrorStack) -> ConnectError {
    ConnectError::Connect(e.to_string())
}

/// Prefer the hostname for SNI, fall back to the connection host
fn server_name(hostname: &str, host: &str) -> Result<ServerName<'static>, ConnectError> {
    ServerName::try_from(hostname)
        .or_else(|_| ServerName::try_from(host))
        .map(|name| name.to_owned())
        .map_err(|e| ConnectError::Connect(format!("invalid server name {hostname:?}: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn t_parse_tls_version() {
        assert_eq!(TlsVersion::Tls10, "1.0".parse().unwrap());
        assert_eq!(TlsVersion::Tls11, "tls1.1".parse().unwrap());
        assert_eq!(TlsVersion::Tls12, "1.2".parse().unwrap());
        assert_eq!(TlsVersion::Tls13, "tls1.3".parse().unwrap());
        assert!("3.0".parse::<TlsVersion>().is_err());
        assert_eq!("1.3", TlsVersion::Tls13.to_string());
        assert_eq!("1.0", TlsVersion::Tls10.to_string());
    }

    #[test]
    fn t_protocol_versions() {
        let range = ProtocolRange {
            min: TlsVersion::Tls12,
            max: TlsVersion::Tls13,
        };
        assert_eq!(2, range.versions().unwrap().len());

        let range = ProtocolRange {
            min: TlsVersion::Tls10,
            max: TlsVersion::Tls11,
        };
        assert!(range.versions().unwrap().is_empty());

        let range = ProtocolRange {
            min: TlsVersion::Tls12,
            max: TlsVersion::Tls12,
        };
        let versions = range.versions().unwrap();
        assert_eq!(1, versions.len());
        assert_eq!(TLS12.version, versions[0].version);
    }

    #[test]
    fn t_inverted_protocol_range() {
        let range = ProtocolRange {
            min: TlsVersion::Tls13,
            max: TlsVersion::Tls12,
        };
        assert!(matches!(
            range.versions(),
            Err(ConfigError::ProtocolRange { .. })
        ));
    }

    #[test]
    fn t_backend_follows_range() {
        let legacy = Connector::new(ProtocolRange::default()).unwrap();
        assert!(matches!(legacy.backend, Backend::OpenSsl(_)));

        let modern = Connector::new(ProtocolRange {
            min: TlsVersion::Tls12,
            max: TlsVersion::Tls13,
        })
        .unwrap();
        assert!(matches!(modern.backend, Backend::Rustls(_)));
    }

    #[test]
    fn t_server_name_fallback() {
        assert!(server_name("example.com", "1.2.3.4").is_ok());
        assert!(server_name("", "1.2.3.4").is_ok());
        assert!(matches!(server_name("", ""), Err(ConnectError::Connect(_))));
    }

    #[tokio::test]
    async fn t_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        for min in [TlsVersion::Tls10, TlsVersion::Tls12] {
            let connector = Connector::new(ProtocolRange {
                min,
                max: TlsVersion::Tls13,
            })
            .unwrap();
            let result = connector
                .fetch_certificates("localhost", "127.0.0.1", port, Duration::from_secs(2))
                .await;
            assert!(matches!(result, Err(ConnectError::Connect(_))));
        }
    }
}
