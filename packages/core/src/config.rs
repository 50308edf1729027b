//! Trust Layer Configuration
//!
//! Settings for the trust directory, the inbound TLS listener, exception
//! notification and TOFU pinning. Loading only parses; values are validated
//! by the components that consume them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigurationError;

/// Default ECDHE-only AEAD cipher selection for the inbound listener
pub const DEFAULT_CIPHER_LIST: &str = "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:\
ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256";

/// Where trusted certificate authorities are read from at process start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustStoreSettings {
    pub directory: PathBuf,
    pub pattern: String,
}

impl Default for TrustStoreSettings {
    fn default() -> Self {
        Self::system()
    }
}

impl TrustStoreSettings {
    /// The distribution-wide certificate directory
    #[must_use]
    pub fn system() -> Self {
        Self {
            directory: PathBuf::from("/etc/ssl/certs"),
            pattern: "*.pem".to_string(),
        }
    }

    #[must_use]
    pub fn directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::system()
        }
    }
}

/// Key material and cipher selection for the inbound listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTlsSettings {
    pub private_key: PathBuf,
    pub certificate_chain: PathBuf,
    pub dh_params: PathBuf,
    #[serde(default = "default_cipher_list")]
    pub cipher_list: String,
}

fn default_cipher_list() -> String {
    DEFAULT_CIPHER_LIST.to_string()
}

/// Exception mail settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub node_name: String,
    pub base_host: String,
    pub sender: String,
    pub exceptions_recipient: String,
    #[serde(default)]
    pub listen_ipv4: String,
    #[serde(default)]
    pub listen_ipv6: String,
    pub smtp_user: String,
    pub smtp_password: String,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
}

fn default_smtp_port() -> u16 {
    25
}

impl std::fmt::Debug for NotificationSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSettings")
            .field("node_name", &self.node_name)
            .field("base_host", &self.base_host)
            .field("sender", &self.sender)
            .field("exceptions_recipient", &self.exceptions_recipient)
            .field("listen_ipv4", &self.listen_ipv4)
            .field("listen_ipv6", &self.listen_ipv6)
            .field("smtp_user", &self.smtp_user)
            .field("smtp_password", &"<redacted>")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .finish()
    }
}

/// Complete trust layer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub trust: TrustStoreSettings,
    pub server: Option<ServerTlsSettings>,
    pub notification: Option<NotificationSettings>,
    /// Fall back to trust-on-first-use pinning when hostname matching fails
    pub tofu: bool,
}

impl TlsSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::Settings(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigurationError> {
        let json = std::fs::read_to_string(path).map_err(|e| ConfigurationError::io(path, e))?;
        Self::from_json_str(&json)
    }
}
