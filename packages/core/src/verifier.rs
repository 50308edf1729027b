//! Peer certificate verification for outbound connections
//!
//! rustls hands the whole presented chain to [`HostnameVerifier`] once per
//! handshake. It validates the chain against the trust store, then replays
//! the result through [`CertificateVerifier::verify_certificate`] for every
//! certificate, leaf first, the way a per-depth verify callback would see it:
//!
//! 1. a failed chain validation rejects, whatever the depth
//! 2. issuers (depth > 0) are accepted on chain validation alone
//! 3. the leaf must match the hostname: wildcard CN, then exact CN, then SAN
//! 4. a leaf that matches nothing is rejected, or deferred to the TOFU hook
//!    when one is configured
//!
//! Hostname comparison is case-sensitive. TOFU is never consulted for a chain
//! that failed validation.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{CertificateError, DigitallySignedStruct, OtherError, RootCertStore, SignatureScheme};

use crate::certificate::{Fingerprint, PeerCertificate, SanError};
use crate::errors::VerificationError;
use crate::tofu::{TofuDecision, TofuVerifier};

/// Library chain-validation verdict handed to every per-certificate call
pub type ChainStatus = Result<(), CertificateError>;

/// Which rule matched the leaf against the target hostname
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostnameMatch {
    Wildcard,
    Exact,
    SubjectAltName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// An issuer certificate covered by chain validation
    Issuer,
    /// The leaf matched the target hostname
    Leaf(HostnameMatch),
}

/// Decision for one certificate of the presented chain
#[derive(Debug, Clone)]
pub enum VerificationOutcome {
    Accept(Acceptance),
    Reject(VerificationError),
    /// The leaf matched nothing; the TOFU hook decides.
    DeferToPin,
}

/// How an accepted peer was identified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    Hostname(HostnameMatch),
    Pinned(TofuDecision),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    pub hostname: String,
    pub identity: PeerIdentity,
    pub fingerprint: Fingerprint,
}

/// Target hostname plus optional TOFU fallback for one connection attempt
#[derive(Clone)]
pub struct HostnamePolicy {
    hostname: String,
    tofu: Option<Arc<dyn TofuVerifier>>,
}

impl fmt::Debug for HostnamePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostnamePolicy")
            .field("hostname", &self.hostname)
            .field("tofu", &self.tofu.is_some())
            .finish()
    }
}

impl HostnamePolicy {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            tofu: None,
        }
    }

    #[must_use]
    pub fn with_tofu(mut self, tofu: Arc<dyn TofuVerifier>) -> Self {
        self.tofu = Some(tofu);
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn has_tofu(&self) -> bool {
        self.tofu.is_some()
    }
}

/// `*.suffix` matches exactly one extra leading label.
///
/// Neither the label nor the suffix may be empty.
pub fn wildcard_matches(hostname: &str, common_name: &str) -> bool {
    let Some(suffix) = common_name.strip_prefix("*.") else {
        return false;
    };
    let Some((first_label, rest)) = hostname.split_once('.') else {
        return false;
    };
    !suffix.is_empty() && !first_label.is_empty() && rest == suffix
}

/// Apply wildcard, exact and SAN matching, in that order.
pub fn match_hostname(
    hostname: &str,
    cert: &PeerCertificate,
) -> Result<Option<HostnameMatch>, SanError> {
    if let Some(cn) = cert.common_name() {
        if wildcard_matches(hostname, &cn) {
            return Ok(Some(HostnameMatch::Wildcard));
        }
        if hostname == cn {
            return Ok(Some(HostnameMatch::Exact));
        }
    }
    let alt_names = cert.subject_alt_dns_names()?;
    if alt_names.iter().any(|name| name == hostname) {
        return Ok(Some(HostnameMatch::SubjectAltName));
    }
    Ok(None)
}

/// The synchronous, I/O-free verification core
#[derive(Debug, Clone)]
pub struct CertificateVerifier {
    policy: HostnamePolicy,
}

impl CertificateVerifier {
    pub fn new(policy: HostnamePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &HostnamePolicy {
        &self.policy
    }

    /// Per-certificate decision. Never calls the TOFU hook.
    pub fn verify_certificate(
        &self,
        depth: usize,
        preverify: &ChainStatus,
        cert: &PeerCertificate,
    ) -> VerificationOutcome {
        if let Err(reason) = preverify {
            return VerificationOutcome::Reject(VerificationError::ChainValidation {
                depth,
                reason: reason.clone(),
            });
        }
        if depth > 0 {
            return VerificationOutcome::Accept(Acceptance::Issuer);
        }

        let hostname = self.policy.hostname();
        let failure = match match_hostname(hostname, cert) {
            Ok(Some(matched)) => {
                tracing::debug!("Leaf certificate matches {} ({:?})", hostname, matched);
                return VerificationOutcome::Accept(Acceptance::Leaf(matched));
            }
            Ok(None) => VerificationError::HostnameMismatch {
                hostname: hostname.to_string(),
            },
            Err(e) => {
                tracing::warn!("Unusable subjectAltName in certificate for {}: {}", hostname, e);
                VerificationError::SanDecode(e.to_string())
            }
        };

        if self.policy.has_tofu() {
            tracing::debug!("No hostname match for {}, deferring to pin", hostname);
            VerificationOutcome::DeferToPin
        } else {
            VerificationOutcome::Reject(failure)
        }
    }

    /// Run the per-certificate decision leaf to root, then settle a deferred
    /// leaf through the TOFU hook.
    pub fn verify_chain(
        &self,
        chain: &[CertificateDer<'_>],
        preverify: &ChainStatus,
    ) -> Result<VerifiedPeer, VerificationError> {
        let mut certs = chain.iter().enumerate().map(|(depth, der)| {
            PeerCertificate::from_der(der.clone()).map_err(|e| {
                VerificationError::MalformedCertificate {
                    depth,
                    reason: e.to_string(),
                }
            })
        });

        let leaf = certs.next().ok_or(VerificationError::NoPeerCertificate)??;
        let leaf_outcome = self.verify_certificate(0, preverify, &leaf);
        if let VerificationOutcome::Reject(e) = leaf_outcome {
            return Err(e);
        }

        for (depth, cert) in (1..).zip(certs) {
            if let VerificationOutcome::Reject(e) = self.verify_certificate(depth, preverify, &cert?) {
                return Err(e);
            }
        }

        let hostname = self.policy.hostname().to_string();
        let fingerprint = leaf.fingerprint();
        let identity = match leaf_outcome {
            VerificationOutcome::Accept(Acceptance::Leaf(matched)) => PeerIdentity::Hostname(matched),
            VerificationOutcome::DeferToPin => match &self.policy.tofu {
                Some(tofu) => self.resolve_pin(tofu.as_ref(), &leaf)?,
                None => return Err(VerificationError::HostnameMismatch { hostname }),
            },
            // Depth 0 never yields an issuer acceptance; fail closed regardless.
            VerificationOutcome::Accept(Acceptance::Issuer) | VerificationOutcome::Reject(_) => {
                return Err(VerificationError::HostnameMismatch { hostname });
            }
        };

        Ok(VerifiedPeer {
            hostname,
            identity,
            fingerprint,
        })
    }

    fn resolve_pin(
        &self,
        tofu: &dyn TofuVerifier,
        leaf: &PeerCertificate,
    ) -> Result<PeerIdentity, VerificationError> {
        let hostname = self.policy.hostname();
        match tofu.verify_tofu(hostname, &leaf.to_pem()) {
            TofuDecision::PinMismatch { pinned, presented } => {
                Err(VerificationError::TofuPinMismatch {
                    hostname: hostname.to_string(),
                    pinned,
                    presented,
                })
            }
            decision if decision.is_accepted() => Ok(PeerIdentity::Pinned(decision)),
            _ => Err(VerificationError::TofuRefused {
                hostname: hostname.to_string(),
            }),
        }
    }
}

/// rustls adapter: trust store chain validation plus [`CertificateVerifier`]
#[derive(Debug)]
pub struct HostnameVerifier {
    verifier: CertificateVerifier,
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl HostnameVerifier {
    pub fn new(
        policy: HostnamePolicy,
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            verifier: CertificateVerifier::new(policy),
            roots,
            provider,
        }
    }

    fn validate_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> ChainStatus {
        let library_error = |error: rustls::Error| match error {
            rustls::Error::InvalidCertificate(reason) => reason,
            other => CertificateError::Other(OtherError(Arc::new(other))),
        };
        let parsed = ParsedCertificate::try_from(end_entity).map_err(library_error)?;
        verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )
        .map_err(library_error)
    }
}

impl ServerCertVerifier for HostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let preverify = self.validate_chain(end_entity, intermediates, now);

        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());

        match self.verifier.verify_chain(&chain, &preverify) {
            Ok(peer) => {
                tracing::info!(
                    "Verified {} ({:?}, {})",
                    peer.hostname,
                    peer.identity,
                    peer.fingerprint
                );
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => {
                tracing::warn!(
                    "Rejected certificate for {}: {}",
                    self.verifier.policy().hostname(),
                    e
                );
                Err(e.into())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
