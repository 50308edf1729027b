//! Hardened server-side TLS context
//!
//! The inbound listener only ever negotiates TLS 1.2 or 1.3, prefers its own
//! cipher order, uses a fresh ECDHE (secp256r1) share per handshake and keeps
//! no resumption state: no session cache, no tickets, no early data. rustls
//! implements no record compression and no SSLv2/SSLv3.
//!
//! The configured Diffie-Hellman parameter file is decoded and checked at
//! startup. The ring provider has no finite-field key exchange, so ECDHE is
//! what delivers forward secrecy on every session.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use der::asn1::UintRef;
use der::{Decode, Sequence};
use once_cell::sync::OnceCell;
use rustls::crypto::{CryptoProvider, ring as ring_provider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::NoServerSessionStorage;
use rustls::{ServerConfig, SupportedCipherSuite};
use tokio_rustls::TlsAcceptor;

use crate::certificate::PeerCertificate;
use crate::config::ServerTlsSettings;
use crate::errors::ConfigurationError;

/// Smallest accepted DH prime
pub const MIN_DH_PRIME_BITS: usize = 2048;

const DH_PEM_TAG: &str = "DH PARAMETERS";

/// OpenSSL spellings of the suites the ring provider implements
const OPENSSL_SUITE_NAMES: &[(&str, &str)] = &[
    ("TLS_AES_256_GCM_SHA384", "TLS13_AES_256_GCM_SHA384"),
    ("TLS_AES_128_GCM_SHA256", "TLS13_AES_128_GCM_SHA256"),
    ("TLS_CHACHA20_POLY1305_SHA256", "TLS13_CHACHA20_POLY1305_SHA256"),
    ("ECDHE-ECDSA-AES256-GCM-SHA384", "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384"),
    ("ECDHE-ECDSA-AES128-GCM-SHA256", "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"),
    ("ECDHE-ECDSA-CHACHA20-POLY1305", "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"),
    ("ECDHE-RSA-AES256-GCM-SHA384", "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384"),
    ("ECDHE-RSA-AES128-GCM-SHA256", "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"),
    ("ECDHE-RSA-CHACHA20-POLY1305", "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"),
];

#[derive(Sequence)]
struct DhParameter<'a> {
    prime: UintRef<'a>,
    base: UintRef<'a>,
    #[asn1(optional = "true")]
    private_value_length: Option<u32>,
}

/// PKCS#3 Diffie-Hellman parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParams {
    prime_bits: usize,
    generator: u64,
    private_value_length: Option<u32>,
}

impl DhParams {
    pub fn from_pem(pem_data: &[u8]) -> Result<Self, String> {
        let blocks = pem::parse_many(pem_data).map_err(|e| format!("invalid PEM: {e}"))?;
        let block = blocks
            .iter()
            .find(|block| block.tag() == DH_PEM_TAG)
            .ok_or_else(|| format!("no {DH_PEM_TAG} block found"))?;
        Self::from_der(block.contents())
    }

    pub fn from_der(der_bytes: &[u8]) -> Result<Self, String> {
        let params = DhParameter::from_der(der_bytes).map_err(|e| format!("invalid DER: {e}"))?;

        let prime = params.prime.as_bytes();
        let prime_bits = match prime.first() {
            Some(first) => (prime.len() - 1) * 8 + (8 - first.leading_zeros() as usize),
            None => 0,
        };
        if prime_bits < MIN_DH_PRIME_BITS {
            return Err(format!(
                "prime is {prime_bits} bits, at least {MIN_DH_PRIME_BITS} required"
            ));
        }

        let base = params.base.as_bytes();
        if base.len() > 8 {
            return Err("generator is unreasonably large".to_string());
        }
        let generator = base.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        if generator < 2 {
            return Err(format!("generator {generator} is degenerate"));
        }

        Ok(Self {
            prime_bits,
            generator,
            private_value_length: params.private_value_length,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let data = std::fs::read(path).map_err(|e| ConfigurationError::DhParameters {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_pem(&data).map_err(|reason| ConfigurationError::DhParameters {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn prime_bits(&self) -> usize {
        self.prime_bits
    }

    pub fn generator(&self) -> u64 {
        self.generator
    }

    pub fn private_value_length(&self) -> Option<u32> {
        self.private_value_length
    }
}

/// Ordered cipher suites selected from an OpenSSL-style cipher string
#[derive(Debug, Clone)]
pub struct CipherSelection {
    suites: Vec<SupportedCipherSuite>,
}

/// Algorithm words that mark a token as an OpenSSL suite name
const OPENSSL_ALGORITHM_WORDS: &[&str] = &[
    "AES", "AES128", "AES256", "GCM", "CCM", "CCM8", "CBC", "CBC3", "CHACHA20", "POLY1305",
    "CAMELLIA", "CAMELLIA128", "CAMELLIA256", "ARIA128", "ARIA256", "DES", "3DES", "RC2",
    "RC4", "SEED", "IDEA", "NULL", "MD5", "SHA", "SHA256", "SHA384",
];

/// OpenSSL aliases that name only algorithms the ring provider lacks
const UNSUPPORTED_ALIASES: &[&str] = &[
    "DH", "DHE", "EDH", "kDHE", "kEDH", "kDHr", "kDHd", "ADH", "AECDH", "kRSA", "RSAPSK",
    "DSS", "aDSS", "aDH", "aNULL", "eNULL", "NULL", "COMPLEMENTOFALL", "COMPLEMENTOFDEFAULT",
    "EXPORT", "EXP", "LOW", "MEDIUM", "SSLv3", "TLSv1", "TLSv1.0", "SHA1", "SHA", "MD5", "DES",
    "3DES", "RC4", "RC2", "IDEA", "SEED", "CAMELLIA", "CAMELLIA128", "CAMELLIA256", "ARIA",
    "ARIAGCM", "CCM", "CCM8", "PSK", "kPSK", "kECDHEPSK", "kDHEPSK", "kRSAPSK", "aPSK", "SRP",
    "kSRP", "aSRP", "GOST", "kGOST", "aGOST", "CBC",
];

#[derive(Clone, Copy)]
enum CipherOp {
    Add,
    /// `-x`: drop now, may be added back later.
    Remove,
    /// `!x`: drop now and never add back.
    Ban,
    /// `+x`: move to the end, keeping relative order.
    Demote,
}

impl CipherSelection {
    /// Evaluate an OpenSSL cipher string against the ring provider.
    ///
    /// Tokens are `:`, `,` or whitespace separated. Each names a suite
    /// (OpenSSL or IANA spelling), one of `DEFAULT`, `HIGH`, `ALL`, or an
    /// alias combination such as `EECDH+AESGCM`, optionally prefixed by `!`,
    /// `-` or `+` with OpenSSL's meaning. Suite names and aliases the provider
    /// cannot serve select nothing and are logged. Anything unrecognised, or
    /// a list that ends up empty, is [`ConfigurationError::CipherList`].
    ///
    /// When no TLS 1.3 suite is selected the provider's TLS 1.3 suites are
    /// appended, unless banned.
    pub fn parse(list: &str) -> Result<Self, ConfigurationError> {
        let available = ring_provider::default_provider().cipher_suites;
        let mut suites: Vec<SupportedCipherSuite> = Vec::new();
        let mut banned: Vec<SupportedCipherSuite> = Vec::new();

        let tokens = list
            .split(|c: char| c == ':' || c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty());

        for token in tokens {
            let (op, body) = if let Some(rest) = token.strip_prefix('!') {
                (CipherOp::Ban, rest)
            } else if let Some(rest) = token.strip_prefix('-') {
                (CipherOp::Remove, rest)
            } else if let Some(rest) = token.strip_prefix('+') {
                (CipherOp::Demote, rest)
            } else {
                (CipherOp::Add, token)
            };
            let matched = resolve_cipher_token(body, &available)?;
            if matched.is_empty() {
                if matches!(op, CipherOp::Add) {
                    tracing::warn!("Cipher '{}' selects no suite this provider implements", token);
                } else {
                    tracing::debug!("Cipher operator '{}' matches nothing", token);
                }
                continue;
            }

            match op {
                CipherOp::Add => {
                    for suite in matched {
                        if !contains_suite(&banned, suite) && !contains_suite(&suites, suite) {
                            suites.push(suite);
                        }
                    }
                }
                CipherOp::Remove => suites.retain(|s| !contains_suite(&matched, *s)),
                CipherOp::Ban => {
                    suites.retain(|s| !contains_suite(&matched, *s));
                    banned.extend(matched);
                }
                CipherOp::Demote => {
                    let (demoted, kept): (Vec<_>, Vec<_>) = suites
                        .into_iter()
                        .partition(|s| contains_suite(&matched, *s));
                    suites = kept;
                    suites.extend(demoted);
                }
            }
        }

        if suites.is_empty() {
            return Err(ConfigurationError::CipherList(format!(
                "'{list}' selects no cipher suites"
            )));
        }

        if !suites.iter().any(|s| matches!(s, SupportedCipherSuite::Tls13(_))) {
            for suite in available
                .iter()
                .filter(|s| matches!(s, SupportedCipherSuite::Tls13(_)))
            {
                if !contains_suite(&banned, *suite) {
                    suites.push(*suite);
                }
            }
        }

        Ok(Self { suites })
    }

    pub fn suites(&self) -> &[SupportedCipherSuite] {
        &self.suites
    }

    pub fn names(&self) -> Vec<String> {
        self.suites.iter().map(suite_name).collect()
    }
}

/// Suites selected by one token, without its operator prefix.
fn resolve_cipher_token(
    token: &str,
    available: &[SupportedCipherSuite],
) -> Result<Vec<SupportedCipherSuite>, ConfigurationError> {
    if matches!(token, "DEFAULT" | "HIGH" | "ALL" | "AEAD") {
        return Ok(available.to_vec());
    }

    let canonical = OPENSSL_SUITE_NAMES
        .iter()
        .find(|(openssl, _)| *openssl == token)
        .map_or(token, |(_, canonical)| *canonical);
    if let Some(suite) = available.iter().find(|suite| suite_name(suite) == canonical) {
        return Ok(vec![*suite]);
    }
    if is_openssl_suite_name(token) {
        return Ok(Vec::new());
    }

    let mut selected = available.to_vec();
    for alias in token.split('+') {
        match alias_predicate(alias) {
            Some(keep) => selected.retain(|suite| keep(&suite_name(suite))),
            None => {
                return Err(ConfigurationError::CipherList(format!(
                    "unknown cipher or alias '{alias}' in '{token}'"
                )));
            }
        }
    }
    Ok(selected)
}

/// `DHE-RSA-AES256-GCM-SHA384`, `AES256-SHA`, `TLS_DHE_RSA_WITH_AES_128_GCM_SHA256`
fn is_openssl_suite_name(token: &str) -> bool {
    if token.starts_with("TLS_") && token.contains("_WITH_") {
        return true;
    }
    let parts: Vec<&str> = token.split('-').collect();
    parts.len() >= 2
        && parts.iter().all(|part| {
            !part.is_empty() && part.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        })
        && parts.iter().any(|part| OPENSSL_ALGORITHM_WORDS.contains(part))
}

/// Predicate over IANA suite names for one OpenSSL alias.
///
/// Aliases describe TLS 1.2 suites; TLS 1.3 suites are only reached by name,
/// by keyword or by the TLS 1.3 fallback.
fn alias_predicate(alias: &str) -> Option<fn(&str) -> bool> {
    let keep: fn(&str) -> bool = match alias {
        "DEFAULT" | "HIGH" | "ALL" | "AEAD" => |_| true,
        "ECDHE" | "EECDH" | "kECDHE" | "kEECDH" | "ECDH" => |name| name.contains("_ECDHE_"),
        "TLSv1.2" => |name| name.starts_with("TLS_"),
        "ECDSA" | "aECDSA" => |name| name.contains("_ECDSA_"),
        "RSA" | "aRSA" => |name| name.contains("_RSA_"),
        "AESGCM" => |name| name.contains("_WITH_AES_") && name.contains("_GCM_"),
        "AES" => |name| name.contains("_WITH_AES_"),
        "AES128" => |name| name.contains("_WITH_AES_128_"),
        "AES256" => |name| name.contains("_WITH_AES_256_"),
        "CHACHA20" => |name| name.contains("_WITH_CHACHA20_"),
        "SHA256" => |name| name.contains("_WITH_") && name.ends_with("_SHA256"),
        "SHA384" => |name| name.contains("_WITH_") && name.ends_with("_SHA384"),
        alias if UNSUPPORTED_ALIASES.contains(&alias) => |_| false,
        _ => return None,
    };
    Some(keep)
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

fn contains_suite(suites: &[SupportedCipherSuite], suite: SupportedCipherSuite) -> bool {
    suites.iter().any(|s| s.suite() == suite.suite())
}

/// Validated key material for the inbound listener
pub struct ServerTlsConfig {
    private_key_path: PathBuf,
    certificate_chain_path: PathBuf,
    dh_params_path: PathBuf,
    private_key: PrivateKeyDer<'static>,
    certificate_chain: Vec<CertificateDer<'static>>,
    dh_params: DhParams,
    ciphers: CipherSelection,
}

impl fmt::Debug for ServerTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTlsConfig")
            .field("private_key_path", &self.private_key_path)
            .field("certificate_chain_path", &self.certificate_chain_path)
            .field("dh_params_path", &self.dh_params_path)
            .field("chain_len", &self.certificate_chain.len())
            .field("dh_params", &self.dh_params)
            .field("ciphers", &self.ciphers.names())
            .finish_non_exhaustive()
    }
}

impl ServerTlsConfig {
    /// Load and validate every input now, so bad files fail at startup.
    ///
    /// The DH parameter file only has to decode and meet the size floor; the
    /// negotiated key exchange is always ECDHE and never uses it.
    pub fn new(
        private_key: impl Into<PathBuf>,
        certificate_chain: impl Into<PathBuf>,
        dh_params: impl Into<PathBuf>,
        cipher_list: &str,
    ) -> Result<Self, ConfigurationError> {
        let private_key_path = private_key.into();
        let certificate_chain_path = certificate_chain.into();
        let dh_params_path = dh_params.into();

        let certificate_chain = load_certificate_chain(&certificate_chain_path)?;
        let private_key = load_private_key(&private_key_path)?;
        let dh_params = DhParams::load(&dh_params_path)?;
        let ciphers = CipherSelection::parse(cipher_list)?;

        Ok(Self {
            private_key_path,
            certificate_chain_path,
            dh_params_path,
            private_key,
            certificate_chain,
            dh_params,
            ciphers,
        })
    }

    pub fn from_settings(settings: &ServerTlsSettings) -> Result<Self, ConfigurationError> {
        Self::new(
            &settings.private_key,
            &settings.certificate_chain,
            &settings.dh_params,
            &settings.cipher_list,
        )
    }

    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.certificate_chain
    }

    pub fn dh_params(&self) -> &DhParams {
        &self.dh_params
    }

    pub fn ciphers(&self) -> &CipherSelection {
        &self.ciphers
    }
}

fn load_certificate_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigurationError> {
    let chain_error = |reason: String| ConfigurationError::CertificateChain {
        path: path.to_path_buf(),
        reason,
    };

    let data = std::fs::read(path).map_err(|e| chain_error(e.to_string()))?;
    let chain = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| chain_error(format!("invalid PEM: {e}")))?;
    if chain.is_empty() {
        return Err(chain_error("no certificates found".to_string()));
    }
    for (depth, cert) in chain.iter().enumerate() {
        PeerCertificate::from_der(cert.clone())
            .map_err(|e| chain_error(format!("certificate {depth} is not valid X.509: {e}")))?;
    }
    Ok(chain)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigurationError> {
    let key_error = |reason: String| ConfigurationError::PrivateKey {
        path: path.to_path_buf(),
        reason,
    };

    let data = std::fs::read(path).map_err(|e| key_error(e.to_string()))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| key_error(format!("invalid PEM: {e}")))?
        .ok_or_else(|| key_error("no private key found".to_string()))
}

/// Builds the server context once and hands out the cached value
pub struct ServerTlsContextFactory {
    config: ServerTlsConfig,
    context: OnceCell<Arc<ServerConfig>>,
}

impl fmt::Debug for ServerTlsContextFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTlsContextFactory")
            .field("config", &self.config)
            .field("built", &self.context.get().is_some())
            .finish()
    }
}

impl ServerTlsContextFactory {
    /// Construct and immediately build the context.
    pub fn new(config: ServerTlsConfig) -> Result<Self, ConfigurationError> {
        let factory = Self {
            config,
            context: OnceCell::new(),
        };
        factory.context()?;
        Ok(factory)
    }

    pub fn from_settings(settings: &ServerTlsSettings) -> Result<Self, ConfigurationError> {
        Self::new(ServerTlsConfig::from_settings(settings)?)
    }

    /// The cached context. The first successful build wins.
    pub fn context(&self) -> Result<Arc<ServerConfig>, ConfigurationError> {
        self.context
            .get_or_try_init(|| self.build().map(Arc::new))
            .map(Arc::clone)
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, ConfigurationError> {
        Ok(TlsAcceptor::from(self.context()?))
    }

    pub fn config(&self) -> &ServerTlsConfig {
        &self.config
    }

    fn build(&self) -> Result<ServerConfig, ConfigurationError> {
        let provider = CryptoProvider {
            cipher_suites: self.config.ciphers.suites().to_vec(),
            kx_groups: vec![ring_provider::kx_group::SECP256R1],
            ..ring_provider::default_provider()
        };

        let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
            .with_no_client_auth()
            .with_single_cert(
                self.config.certificate_chain.clone(),
                self.config.private_key.clone_key(),
            )
            .map_err(|e| ConfigurationError::PrivateKey {
                path: self.config.private_key_path.clone(),
                reason: e.to_string(),
            })?;

        config.ignore_client_order = true;
        config.session_storage = Arc::new(NoServerSessionStorage {});
        config.send_tls13_tickets = 0;
        config.max_early_data_size = 0;

        tracing::info!(
            "Built server TLS context: {} certificates, {} cipher suites, DH prime {} bits",
            self.config.certificate_chain.len(),
            self.config.ciphers.suites().len(),
            self.config.dh_params.prime_bits()
        );
        Ok(config)
    }
}
