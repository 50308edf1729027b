//! Parsed certificate views used by the trust store and the verifier
//!
//! Certificates are decoded once with `x509-cert`; only the fields the
//! verifier needs are interpreted:
//! - subject common name
//! - `subjectAltName` DNS names
//! - SHA-1 trust store digest and SHA-256 pin fingerprint

pub mod san;

use std::fmt;

use der::asn1::{Any, BmpString, Ia5StringRef, ObjectIdentifier, PrintableStringRef, Utf8StringRef};
use der::{Decode, Tag, Tagged};
use ring::digest;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use x509_cert::Certificate;

pub use san::{SanError, decode_general_names};

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// SHA-256 fingerprint identifying a certificate in the TOFU pin store
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(der: &[u8]) -> Self {
        let hash = digest::digest(&digest::SHA256, der);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(hash.as_ref());
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// SHA-1 digest keying the trust store, as produced by legacy `c_rehash` style tooling
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertDigest([u8; 20]);

impl CertDigest {
    pub fn of(der: &[u8]) -> Self {
        let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, der);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(hash.as_ref());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for CertDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CertDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertDigest({self})")
    }
}

/// A certificate decoded from DER, keeping the original encoding alongside
#[derive(Debug, Clone)]
pub struct PeerCertificate {
    der: CertificateDer<'static>,
    parsed: Certificate,
}

impl PeerCertificate {
    pub fn from_der(der: CertificateDer<'_>) -> Result<Self, der::Error> {
        let parsed = Certificate::from_der(der.as_ref())?;
        Ok(Self {
            der: der.into_owned(),
            parsed,
        })
    }

    /// Decode the first `CERTIFICATE` block of a PEM document.
    pub fn from_pem(pem_data: &str) -> Result<Self, String> {
        let mut reader = pem_data.as_bytes();
        let der = rustls_pemfile::certs(&mut reader)
            .next()
            .ok_or_else(|| "no PEM certificate block found".to_string())?
            .map_err(|e| format!("invalid PEM: {e}"))?;
        Self::from_der(der).map_err(|e| format!("invalid X.509 certificate: {e}"))
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    pub fn into_der(self) -> CertificateDer<'static> {
        self.der
    }

    /// First common name in the subject that decodes as a directory string.
    ///
    /// PrintableString, UTF8String, IA5String, TeletexString and BMPString
    /// are understood. TeletexString bytes are read as Latin-1.
    pub fn common_name(&self) -> Option<String> {
        self.parsed
            .tbs_certificate
            .subject
            .0
            .iter()
            .flat_map(|rdn| rdn.0.iter())
            .filter(|atv| atv.oid == OID_COMMON_NAME)
            .find_map(|atv| directory_string(&atv.value))
    }

    /// DNS names from every `subjectAltName` extension, in certificate order.
    ///
    /// An absent extension yields an empty list.
    pub fn subject_alt_dns_names(&self) -> Result<Vec<String>, SanError> {
        san::subject_alt_dns_names(&self.parsed)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.der.as_ref())
    }

    pub fn digest(&self) -> CertDigest {
        CertDigest::of(self.der.as_ref())
    }

    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.to_vec()))
    }
}

fn directory_string(value: &Any) -> Option<String> {
    match value.tag() {
        Tag::PrintableString => PrintableStringRef::try_from(value).ok().map(|s| s.to_string()),
        Tag::Utf8String => Utf8StringRef::try_from(value).ok().map(|s| s.to_string()),
        Tag::Ia5String => Ia5StringRef::try_from(value).ok().map(|s| s.to_string()),
        Tag::TeletexString => Some(value.value().iter().copied().map(char::from).collect()),
        Tag::BmpString => value.decode_as::<BmpString>().ok().map(|s| s.to_string()),
        _ => None,
    }
}
