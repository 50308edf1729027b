//! # Veilgate TLS
//!
//! Trust establishment for a TLS-terminating reverse proxy.
//!
//! - **Trust store** loaded once from the system certificate directory
//! - **Server contexts** hardened for forward secrecy and built exactly once
//! - **Client contexts** verifying upstream chains against the trust store,
//!   then the target hostname (wildcard CN, exact CN, subjectAltName)
//! - **TOFU pinning** as an opt-in fallback when hostname matching fails
//!
//! Verification runs synchronously inside the rustls handshake and performs
//! no I/O.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod certificate;
pub mod client_context;
pub mod config;
pub mod errors;
pub mod notify;
pub mod server_context;
pub mod tofu;
pub mod trust_store;
pub mod verifier;

pub use certificate::{CertDigest, Fingerprint, PeerCertificate};
pub use client_context::ClientTlsContextFactory;
pub use config::{NotificationSettings, ServerTlsSettings, TlsSettings, TrustStoreSettings};
pub use errors::{ConfigurationError, TlsError, TrustLoadWarning, VerificationError};
pub use server_context::{CipherSelection, DhParams, ServerTlsConfig, ServerTlsContextFactory};
pub use tofu::{TofuDecision, TofuPin, TofuPinStore, TofuVerifier};
pub use trust_store::{CertificateAuthority, TrustStore, TrustStoreLoad};
pub use verifier::{
    CertificateVerifier, HostnameMatch, HostnamePolicy, PeerIdentity, VerificationOutcome,
    VerifiedPeer,
};
