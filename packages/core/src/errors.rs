//! Error types for TLS context construction and peer verification

use std::path::PathBuf;
use std::sync::Arc;

use rustls::{CertificateError, OtherError};

use crate::certificate::Fingerprint;

/// Fatal, startup-time errors. The only class allowed to stop the process.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Invalid private key {path}: {reason}")]
    PrivateKey { path: PathBuf, reason: String },
    #[error("Invalid certificate chain {path}: {reason}")]
    CertificateChain { path: PathBuf, reason: String },
    #[error("Invalid Diffie-Hellman parameters {path}: {reason}")]
    DhParameters { path: PathBuf, reason: String },
    #[error("Invalid cipher list: {0}")]
    CipherList(String),
    #[error("Invalid settings: {0}")]
    Settings(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TLS context rejected: {0}")]
    Tls(#[from] rustls::Error),
}

impl ConfigurationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Per-file problems met while loading the trust directory. Never fatal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TrustLoadWarning {
    #[error("Skipping unreadable trust file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("Skipping unparsable trust file {path}: {reason}")]
    Unparsable { path: PathBuf, reason: String },
    #[error("Invalid trust directory pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },
}

/// Per-handshake verification failures.
///
/// Only the connection attempt that produced one is affected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerificationError {
    #[error("Peer presented no certificate")]
    NoPeerCertificate,
    #[error("Certificate at depth {depth} could not be decoded: {reason}")]
    MalformedCertificate { depth: usize, reason: String },
    #[error("Chain validation failed at depth {depth}: {reason:?}")]
    ChainValidation {
        depth: usize,
        reason: CertificateError,
    },
    #[error("Malformed subjectAltName extension: {0}")]
    SanDecode(String),
    #[error("Certificate does not match hostname {hostname}")]
    HostnameMismatch { hostname: String },
    #[error("Certificate for {hostname} does not match pinned fingerprint {pinned} (presented {presented})")]
    TofuPinMismatch {
        hostname: String,
        pinned: Fingerprint,
        presented: Fingerprint,
    },
    #[error("Trust-on-first-use callback refused certificate for {hostname}")]
    TofuRefused { hostname: String },
}

impl VerificationError {
    pub fn classification(&self) -> &'static str {
        match self {
            Self::NoPeerCertificate | Self::MalformedCertificate { .. } => "PeerCertificate",
            Self::ChainValidation { .. } => "ChainValidationFailure",
            Self::SanDecode(_) => "SanDecodeFailure",
            Self::HostnameMismatch { .. } | Self::TofuRefused { .. } => "HostnameMismatch",
            Self::TofuPinMismatch { .. } => "TofuPinMismatch",
        }
    }

    /// Recover a verification error carried through a rustls error.
    ///
    /// Plain certificate errors only ever come from chain validation; their
    /// depth is not carried and is reported as 0.
    pub fn from_rustls(error: &rustls::Error) -> Option<Self> {
        let rustls::Error::InvalidCertificate(reason) = error else {
            return None;
        };
        if let CertificateError::Other(other) = reason {
            if let Some(carried) = other.0.downcast_ref::<Self>() {
                return Some(carried.clone());
            }
        }
        Some(Self::ChainValidation {
            depth: 0,
            reason: reason.clone(),
        })
    }
}

impl From<VerificationError> for rustls::Error {
    fn from(error: VerificationError) -> Self {
        match error {
            VerificationError::ChainValidation { reason, .. } => {
                rustls::Error::InvalidCertificate(reason)
            }
            other => rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(
                Arc::new(other),
            ))),
        }
    }
}

/// Umbrella error for connection helpers
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("Invalid hostname '{hostname}': {reason}")]
    InvalidHostname { hostname: String, reason: String },
    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),
}

impl TlsError {
    /// Map a failed handshake back to the verifier's decision when there is one.
    pub fn from_handshake(error: std::io::Error) -> Self {
        let verification = error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .and_then(VerificationError::from_rustls);
        match verification {
            Some(verification) => Self::Verification(verification),
            None => Self::Handshake(error),
        }
    }

    pub fn classification(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Verification(e) => e.classification(),
            Self::InvalidHostname { .. } => "InvalidHostname",
            Self::Handshake(_) => "HandshakeFailure",
        }
    }
}
