use std::sync::Arc;

use anyhow::{bail, Error};
use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        ClientSessionMemoryCache, Resumption,
    },
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme,
};

use crate::request::SNDBUF;

/// Process-wide TLS context, initialized once before any worker starts.
///
/// Two client configurations are kept: one with an in-memory session store
/// for templates requesting session resumption, one with resumption
/// disabled. Certificate verification is off; a load generator routinely
/// points at self-signed test targets.
pub struct TlsContext {
    resume: Arc<ClientConfig>,
    no_resume: Arc<ClientConfig>,
}

impl TlsContext {
    /// Builds the context for the requested protocol floor.
    ///
    /// `0` selects every protocol rustls implements and `4` selects
    /// TLS 1.2 or newer; the legacy values `1..=3` (SSLv3 to TLS 1.1) have
    /// no rustls implementation and are rejected.
    pub fn new(ssl_version: u8) -> Result<Self, Error> {
        let versions: &[&rustls::SupportedProtocolVersion] = match ssl_version {
            0 => rustls::ALL_VERSIONS,
            4 => &[&rustls::version::TLS12, &rustls::version::TLS13],
            1..=3 => bail!("ssl-version {ssl_version}: protocols below TLS 1.2 are not supported"),
            v => bail!("ssl-version must be >= 0 and <= 4, got {v}"),
        };

        let provider = Arc::new(ring::default_provider());
        let base = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify { provider }))
            .with_no_client_auth();

        let mut resume = base.clone();
        resume.resumption = Resumption::store(Arc::new(ClientSessionMemoryCache::new(256)));
        let mut no_resume = base;
        no_resume.resumption = Resumption::disabled();

        Ok(Self {
            resume: Arc::new(resume),
            no_resume: Arc::new(no_resume),
        })
    }

    /// Creates the per-connection session object.
    ///
    /// With `reuse` set, handshakes after the first completed one resume
    /// from the shared session store instead of running in full.
    pub fn session(&self, host: &str, reuse: bool) -> Result<ClientConnection, Error> {
        let name = ServerName::try_from(host.to_owned())?;
        let config = if reuse { &self.resume } else { &self.no_resume };

        let mut conn = ClientConnection::new(config.clone(), name)?;
        conn.set_buffer_limit(Some(2 * SNDBUF));

        Ok(conn)
    }
}

#[derive(Debug)]
struct NoVerify {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerify {
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
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_and_tls12_floor_build() {
        assert!(TlsContext::new(0).is_ok());
        assert!(TlsContext::new(4).is_ok());
    }

    #[test]
    fn legacy_protocols_are_rejected() {
        for v in 1..=3 {
            assert!(TlsContext::new(v).is_err());
        }
        assert!(TlsContext::new(9).is_err());
    }

    #[test]
    fn sessions_accept_dns_names_and_ips() {
        let ctx = TlsContext::new(0).unwrap();

        assert!(ctx.session("example.com", true).is_ok());
        assert!(ctx.session("192.0.2.1", false).is_ok());
    }
}
