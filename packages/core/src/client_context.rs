//! Client-side TLS contexts for connections to upstream origins

use std::sync::Arc;

use rustls::client::Resumption;
use rustls::crypto::{CryptoProvider, ring as ring_provider};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::errors::{ConfigurationError, TlsError};
use crate::trust_store::TrustStore;
use crate::verifier::{HostnamePolicy, HostnameVerifier};

/// Builds one verifying client context per outbound connection attempt
#[derive(Debug, Clone)]
pub struct ClientTlsContextFactory {
    trust_store: Arc<TrustStore>,
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl ClientTlsContextFactory {
    pub fn new(trust_store: Arc<TrustStore>) -> Self {
        let roots = Arc::new(trust_store.root_cert_store());
        tracing::debug!("Client TLS factory seeded with {} trust anchors", roots.len());
        Self {
            trust_store,
            roots,
            provider: Arc::new(ring_provider::default_provider()),
        }
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust_store
    }

    /// TLS 1.2+ context whose verifier applies `policy` to the peer chain.
    ///
    /// Resumption is disabled so every connection runs full verification.
    pub fn build_client_context(
        &self,
        policy: HostnamePolicy,
    ) -> Result<Arc<ClientConfig>, ConfigurationError> {
        let verifier = Arc::new(HostnameVerifier::new(
            policy,
            Arc::clone(&self.roots),
            Arc::clone(&self.provider),
        ));

        let mut config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        config.resumption = Resumption::disabled();
        config.enable_early_data = false;

        Ok(Arc::new(config))
    }

    pub fn connector(&self, policy: HostnamePolicy) -> Result<TlsConnector, ConfigurationError> {
        Ok(TlsConnector::from(self.build_client_context(policy)?))
    }

    /// Handshake over an established transport.
    ///
    /// A rejected certificate comes back as [`TlsError::Verification`].
    pub async fn connect<IO>(
        &self,
        policy: HostnamePolicy,
        stream: IO,
    ) -> Result<TlsStream<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let hostname = policy.hostname().to_string();
        let server_name =
            ServerName::try_from(hostname.clone()).map_err(|e| TlsError::InvalidHostname {
                hostname: hostname.clone(),
                reason: e.to_string(),
            })?;

        let connector = self.connector(policy)?;
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(TlsError::from_handshake)?;

        tracing::info!("TLS connection established to {}", hostname);
        Ok(tls_stream)
    }
}
