//! Trust-On-First-Use pinning
//!
//! Pins map a hostname, compared verbatim, to the fingerprint of the first
//! certificate accepted for it. Pins never expire; they live until removed
//! or the process exits.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::certificate::{Fingerprint, PeerCertificate};

/// Result of handing a leaf certificate to a TOFU verifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TofuDecision {
    /// No pin existed; the certificate is now pinned.
    FirstUse,
    /// The certificate matches the existing pin.
    PinMatched,
    /// A different certificate is pinned for this hostname.
    PinMismatch {
        pinned: Fingerprint,
        presented: Fingerprint,
    },
    /// An opaque caller callback accepted the certificate.
    Accepted,
    /// An opaque caller callback refused the certificate.
    Refused,
}

impl TofuDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::FirstUse | Self::PinMatched | Self::Accepted)
    }
}

/// Decision hook consulted when hostname matching fails on a validated chain.
///
/// Runs inside the handshake; implementations must not block.
pub trait TofuVerifier: Send + Sync {
    fn verify_tofu(&self, hostname: &str, certificate_pem: &str) -> TofuDecision;
}

impl<F> TofuVerifier for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn verify_tofu(&self, hostname: &str, certificate_pem: &str) -> TofuDecision {
        if self(hostname, certificate_pem) {
            TofuDecision::Accepted
        } else {
            TofuDecision::Refused
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TofuPin {
    pub fingerprint: Fingerprint,
    pub first_seen: DateTime<Utc>,
}

/// Process-wide hostname -> fingerprint pins
#[derive(Debug, Default)]
pub struct TofuPinStore {
    pins: DashMap<String, TofuPin>,
}

impl TofuPinStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, hostname: &str) -> Option<Fingerprint> {
        self.pins.get(hostname).map(|pin| pin.fingerprint)
    }

    pub fn pin(&self, hostname: &str) -> Option<TofuPin> {
        self.pins.get(hostname).map(|pin| *pin)
    }

    /// Insert or overwrite the pin for `hostname`.
    pub fn record(&self, hostname: &str, fingerprint: Fingerprint) {
        self.pins.insert(
            hostname.to_string(),
            TofuPin {
                fingerprint,
                first_seen: Utc::now(),
            },
        );
    }

    pub fn remove(&self, hostname: &str) -> Option<TofuPin> {
        self.pins.remove(hostname).map(|(_, pin)| pin)
    }

    pub fn clear(&self) {
        self.pins.clear();
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Pin on first use, otherwise compare against the existing pin.
    ///
    /// Lookup and insert happen under one shard lock.
    pub fn check_and_pin(&self, hostname: &str, presented: Fingerprint) -> TofuDecision {
        match self.pins.entry(hostname.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(TofuPin {
                    fingerprint: presented,
                    first_seen: Utc::now(),
                });
                tracing::info!("Pinned {} to {} on first use", hostname, presented);
                TofuDecision::FirstUse
            }
            Entry::Occupied(pin) if pin.get().fingerprint == presented => {
                tracing::debug!("Certificate for {} matches pin", hostname);
                TofuDecision::PinMatched
            }
            Entry::Occupied(pin) => {
                let pinned = pin.get().fingerprint;
                tracing::warn!(
                    "Pin mismatch for {}: pinned {}, presented {}",
                    hostname,
                    pinned,
                    presented
                );
                TofuDecision::PinMismatch { pinned, presented }
            }
        }
    }
}

impl TofuVerifier for TofuPinStore {
    fn verify_tofu(&self, hostname: &str, certificate_pem: &str) -> TofuDecision {
        match PeerCertificate::from_pem(certificate_pem) {
            Ok(cert) => self.check_and_pin(hostname, cert.fingerprint()),
            Err(e) => {
                tracing::warn!("Refusing unparsable certificate for {}: {}", hostname, e);
                TofuDecision::Refused
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_use_then_match_then_mismatch() {
        let store = TofuPinStore::new();
        let f1 = Fingerprint::from_bytes([1; 32]);
        let f2 = Fingerprint::from_bytes([2; 32]);

        assert_eq!(store.check_and_pin("h.example", f1), TofuDecision::FirstUse);
        let first = store.pin("h.example").unwrap();

        assert_eq!(store.check_and_pin("h.example", f1), TofuDecision::PinMatched);
        assert_eq!(store.pin("h.example"), Some(first));

        assert_eq!(
            store.check_and_pin("h.example", f2),
            TofuDecision::PinMismatch {
                pinned: f1,
                presented: f2
            }
        );
        assert_eq!(store.lookup("h.example"), Some(f1));
    }

    #[test]
    fn hostnames_are_case_sensitive() {
        let store = TofuPinStore::new();
        store.record("Host.Example", Fingerprint::from_bytes([7; 32]));
        assert!(store.lookup("host.example").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn record_overwrites_and_remove_clears() {
        let store = TofuPinStore::new();
        store.record("h", Fingerprint::from_bytes([1; 32]));
        store.record("h", Fingerprint::from_bytes([3; 32]));
        assert_eq!(store.lookup("h"), Some(Fingerprint::from_bytes([3; 32])));
        assert!(store.remove("h").is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_first_use_pins_once() {
        let store = Arc::new(TofuPinStore::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.check_and_pin("race.example", Fingerprint::from_bytes([i; 32]))
                })
            })
            .collect();
        let decisions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first_uses = decisions
            .iter()
            .filter(|d| **d == TofuDecision::FirstUse)
            .count();
        assert_eq!(first_uses, 1);
    }

    #[test]
    fn closures_act_as_verifiers() {
        let allow_internal = |hostname: &str, _pem: &str| hostname.ends_with(".internal");
        assert_eq!(
            allow_internal.verify_tofu("db.internal", ""),
            TofuDecision::Accepted
        );
        assert!(!allow_internal.verify_tofu("db.example", "").is_accepted());
    }

    #[test]
    fn pin_store_refuses_garbage_pem() {
        let store = TofuPinStore::new();
        assert_eq!(store.verify_tofu("h", "garbage"), TofuDecision::Refused);
        assert!(store.is_empty());
    }
}
