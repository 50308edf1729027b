//! Trusted certificate authorities loaded once at process start

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rustls::RootCertStore;
use rustls::pki_types::CertificateDer;

use crate::certificate::{CertDigest, PeerCertificate};
use crate::config::TrustStoreSettings;
use crate::errors::TrustLoadWarning;

/// An immutable trust anchor
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    der: CertificateDer<'static>,
    digest: CertDigest,
    common_name: Option<String>,
    source: Option<PathBuf>,
}

impl CertificateAuthority {
    pub fn from_certificate(cert: PeerCertificate, source: Option<PathBuf>) -> Self {
        let digest = cert.digest();
        let common_name = cert.common_name();
        Self {
            der: cert.into_der(),
            digest,
            common_name,
            source,
        }
    }

    pub fn from_pem_file(path: &Path) -> Result<Self, TrustLoadWarning> {
        let data = std::fs::read_to_string(path).map_err(|e| TrustLoadWarning::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let cert = PeerCertificate::from_pem(&data).map_err(|reason| {
            TrustLoadWarning::Unparsable {
                path: path.to_path_buf(),
                reason,
            }
        })?;
        Ok(Self::from_certificate(cert, Some(path.to_path_buf())))
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn digest(&self) -> CertDigest {
        self.digest
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// File the authority was first loaded from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

/// Trust anchors keyed by content digest.
///
/// Built once, then shared read-only as `Arc<TrustStore>` by every client
/// context factory.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    authorities: HashMap<CertDigest, CertificateAuthority>,
}

/// Result of a best-effort trust directory scan
#[derive(Debug)]
pub struct TrustStoreLoad {
    pub store: TrustStore,
    pub warnings: Vec<TrustLoadWarning>,
}

impl TrustStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_authorities(authorities: impl IntoIterator<Item = CertificateAuthority>) -> Self {
        let mut store = Self::new();
        for ca in authorities {
            store.insert(ca);
        }
        store
    }

    /// Scan `directory/pattern`. Unreadable and malformed files are skipped
    /// and reported; an empty result is not an error.
    pub fn load(settings: &TrustStoreSettings) -> TrustStoreLoad {
        let pattern = settings.directory.join(&settings.pattern);
        let pattern = pattern.to_string_lossy();
        let mut store = Self::new();
        let mut warnings = Vec::new();

        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                let warning = TrustLoadWarning::Pattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!("{}", warning);
                return TrustStoreLoad {
                    store,
                    warnings: vec![warning],
                };
            }
        };

        for entry in paths {
            let result = match entry {
                Ok(path) => CertificateAuthority::from_pem_file(&path),
                Err(e) => Err(TrustLoadWarning::Unreadable {
                    path: e.path().to_path_buf(),
                    reason: e.error().to_string(),
                }),
            };
            match result {
                Ok(ca) => {
                    tracing::debug!(
                        "Loaded trust anchor {} ({})",
                        ca.common_name().unwrap_or("<no CN>"),
                        ca.digest()
                    );
                    store.insert(ca);
                }
                Err(warning) => {
                    tracing::warn!("{}", warning);
                    warnings.push(warning);
                }
            }
        }

        tracing::info!(
            "Loaded {} trust anchors from {} ({} files skipped)",
            store.len(),
            settings.directory.display(),
            warnings.len()
        );
        TrustStoreLoad { store, warnings }
    }

    /// Insert or overwrite by digest. Returns true when the digest was new.
    pub fn insert(&mut self, ca: CertificateAuthority) -> bool {
        self.authorities.insert(ca.digest(), ca).is_none()
    }

    pub fn get(&self, digest: &CertDigest) -> Option<&CertificateAuthority> {
        self.authorities.get(digest)
    }

    pub fn contains(&self, digest: &CertDigest) -> bool {
        self.authorities.contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertificateAuthority> {
        self.authorities.values()
    }

    /// Build the anchor set handed to rustls chain validation
    pub fn root_cert_store(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        for ca in self.iter() {
            if let Err(e) = roots.add(ca.der().clone()) {
                tracing::warn!(
                    "Failed to add trust anchor {} ({}): {}",
                    ca.common_name().unwrap_or("<no CN>"),
                    ca.digest(),
                    e
                );
            }
        }
        roots
    }
}
