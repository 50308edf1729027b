//! subjectAltName DNS-name extraction
//!
//! Only the schema the verifier needs is decoded:
//!
//! ```text
//! GeneralNames ::= SEQUENCE SIZE (1..1024) OF GeneralName
//! GeneralName  ::= CHOICE { ..., dNSName [2] IMPLICIT IA5String, ... }
//! ```
//!
//! Every other `GeneralName` alternative is skipped by its TLV header; its
//! contents are never interpreted.

use der::asn1::{Any, Ia5StringRef, ObjectIdentifier};
use der::{Decode, Tag, TagNumber, Tagged};
use x509_cert::Certificate;

const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
const MAX_GENERAL_NAMES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SanError {
    #[error("DER decoding failed: {0}")]
    Der(String),
    #[error("GeneralNames holds {0} entries, outside 1..=1024")]
    Size(usize),
    #[error("dNSName entry is not an IA5String: {0}")]
    DnsName(String),
}

impl From<der::Error> for SanError {
    fn from(e: der::Error) -> Self {
        Self::Der(e.to_string())
    }
}

pub(crate) fn subject_alt_dns_names(cert: &Certificate) -> Result<Vec<String>, SanError> {
    let mut names = Vec::new();
    if let Some(extensions) = &cert.tbs_certificate.extensions {
        for ext in extensions.iter().filter(|ext| ext.extn_id == OID_SUBJECT_ALT_NAME) {
            names.extend(decode_general_names(ext.extn_value.as_bytes())?);
        }
    }
    Ok(names)
}

/// Decode a DER `GeneralNames` payload and keep its `dNSName` entries.
///
/// Order and duplicates are preserved.
pub fn decode_general_names(payload: &[u8]) -> Result<Vec<String>, SanError> {
    let general_names = Vec::<Any>::from_der(payload)?;
    if general_names.is_empty() || general_names.len() > MAX_GENERAL_NAMES {
        return Err(SanError::Size(general_names.len()));
    }

    let dns_tag = Tag::ContextSpecific {
        constructed: false,
        number: TagNumber::N2,
    };

    let mut dns_names = Vec::new();
    for name in general_names.iter().filter(|name| name.tag() == dns_tag) {
        let dns = Ia5StringRef::new(name.value()).map_err(|e| SanError::DnsName(e.to_string()))?;
        dns_names.push(dns.as_str().to_string());
    }
    Ok(dns_names)
}
