//! Plain/TLS transport and the STARTTLS upgrade.

use std::sync::Arc;

use bulkmail_common::error::{Error, ErrorKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

pub(crate) enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection {
    pub(crate) async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        let result = match self {
            Self::Plain(stream) => stream.write_all(data).await,
            Self::Tls(stream) => stream.write_all(data).await,
        };
        result.map_err(|e| Error::transport(ErrorKind::Network, e.to_string()))
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
        }
        .map_err(|e| Error::transport(ErrorKind::Network, e.to_string()))?;

        if n == 0 {
            return Err(Error::ConnectionStale("peer closed the connection".into()));
        }
        Ok(n)
    }

    /// Upgrades a plain connection after a successful STARTTLS response.
    pub(crate) async fn upgrade_to_tls(self, domain: &str, skip_verify: bool) -> Result<Self, Error> {
        let Self::Plain(stream) = self else {
            return Err(Error::Internal("connection is already TLS".into()));
        };

        let mut root_store = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            root_store
                .add(cert)
                .map_err(|e| Error::Internal(format!("failed to add certificate: {e}")))?;
        }
        if !certs.errors.is_empty() {
            tracing::warn!(errors = ?certs.errors, "some native certificates could not be loaded");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureVerifier));
        }

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| Error::Configuration(format!("invalid TLS server name {domain:?}: {e}")))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::transport(ErrorKind::Network, format!("TLS handshake failed: {e}")))?;

        Ok(Self::Tls(Box::new(tls_stream)))
    }
}

/// Accepts any certificate. Only wired up when `insecure_skip_verify` is
/// explicitly set in `SmtpConfig`.
#[derive(Debug)]
struct InsecureVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<tokio_rustls::rustls::client::danger::ServerCertVerified, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}
