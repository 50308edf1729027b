//! Veilgate trust layer public API
//!
//! [`TlsRuntime`] owns the process-wide TLS state: the trust store loaded at
//! startup, the single hardened server context and the TOFU pin store. Each
//! outbound connection gets its own verifying client context from it.

#![deny(unsafe_code)]
#![warn(clippy::all)]

use std::sync::Arc;

use rustls::{ClientConfig, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::client::TlsStream;

pub use veilgate_tls::*;

/// Process-wide TLS state, shared by every connection
#[derive(Debug, Clone)]
pub struct TlsRuntime {
    clients: ClientTlsContextFactory,
    server: Option<Arc<ServerTlsContextFactory>>,
    pins: Option<Arc<TofuPinStore>>,
    warnings: Arc<[TrustLoadWarning]>,
}

impl TlsRuntime {
    /// Load every long-lived piece of TLS state.
    ///
    /// Unusable trust files are skipped with a warning; server context
    /// problems abort startup.
    pub fn bootstrap(settings: &TlsSettings) -> Result<Self, ConfigurationError> {
        let TrustStoreLoad { store, warnings } = TrustStore::load(&settings.trust);
        tracing::info!(
            "Trust store ready: {} authorities from {}",
            store.len(),
            settings.trust.directory.display()
        );

        let server = match &settings.server {
            Some(server) => Some(Arc::new(ServerTlsContextFactory::from_settings(server)?)),
            None => {
                tracing::debug!("No server TLS settings; terminating side disabled");
                None
            }
        };

        let pins = settings.tofu.then(|| Arc::new(TofuPinStore::new()));

        Ok(Self {
            clients: ClientTlsContextFactory::new(Arc::new(store)),
            server,
            pins,
            warnings: warnings.into(),
        })
    }

    /// Verification policy for `hostname`, with the pin store as fallback when enabled.
    pub fn policy(&self, hostname: &str) -> HostnamePolicy {
        let policy = HostnamePolicy::new(hostname);
        match &self.pins {
            Some(pins) => policy.with_tofu(Arc::clone(pins) as Arc<dyn TofuVerifier>),
            None => policy,
        }
    }

    pub fn client_context(&self, hostname: &str) -> Result<Arc<ClientConfig>, ConfigurationError> {
        self.clients.build_client_context(self.policy(hostname))
    }

    pub async fn connect<IO>(&self, hostname: &str, stream: IO) -> Result<TlsStream<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        self.clients.connect(self.policy(hostname), stream).await
    }

    /// The shared server context, or `None` when no server settings were given.
    pub fn server_context(&self) -> Option<Result<Arc<ServerConfig>, ConfigurationError>> {
        self.server.as_ref().map(|server| server.context())
    }

    pub fn acceptor(&self) -> Option<Result<TlsAcceptor, ConfigurationError>> {
        self.server.as_ref().map(|server| server.acceptor())
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        self.clients.trust_store()
    }

    pub fn pins(&self) -> Option<&Arc<TofuPinStore>> {
        self.pins.as_ref()
    }

    /// Files skipped while loading the trust store
    pub fn trust_warnings(&self) -> &[TrustLoadWarning] {
        &self.warnings
    }
}
