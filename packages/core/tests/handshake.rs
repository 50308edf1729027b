//! Loopback handshakes between the hardened server context and verifying
//! client contexts, using certificates minted per test.

use std::path::PathBuf;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::ServerName;
use rustls::{CertificateError, CipherSuite, ProtocolVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use veilgate_tls::config::DEFAULT_CIPHER_LIST;
use veilgate_tls::verifier::HostnameVerifier;
use veilgate_tls::{
    ClientTlsContextFactory, ConfigurationError, HostnamePolicy, PeerCertificate, ServerTlsConfig,
    ServerTlsContextFactory, TlsError, TofuPinStore, TofuVerifier, TrustStore, TrustStoreSettings,
    VerificationError,
};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "veilgate-handshake-{}-{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

/// 2048-bit PKCS#3 parameters; only the shape is checked by the server context.
fn dh_params_pem() -> String {
    let mut prime = vec![0x00];
    prime.extend(std::iter::repeat_n(0xFF, 256));
    let mut body = vec![0x02, 0x82];
    body.extend_from_slice(&(prime.len() as u16).to_be_bytes());
    body.extend(prime);
    body.extend_from_slice(&[0x02, 0x01, 0x02]);
    let mut der = vec![0x30, 0x82];
    der.extend_from_slice(&(body.len() as u16).to_be_bytes());
    der.extend(body);
    pem::encode(&pem::Pem::new("DH PARAMETERS", der))
}

/// A throwaway certificate authority rooted in its own scratch directory
struct TestPki {
    dir: PathBuf,
    ca_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

struct Leaf {
    cert_pem: String,
    key_pem: String,
}

impl TestPki {
    fn new(name: &str) -> Self {
        let dir = scratch_dir(name);
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = distinguished_name(&format!("Veilgate Test Root {name}"));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_pem = params.self_signed(&key).unwrap().pem();
        Self {
            dir,
            ca_pem,
            issuer: Issuer::new(params, key),
        }
    }

    fn leaf(&self, common_name: &str, sans: &[&str]) -> Leaf {
        let key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        params.distinguished_name = distinguished_name(common_name);
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        Leaf {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    /// Client factory trusting only this authority
    fn client_factory(&self) -> ClientTlsContextFactory {
        let trust_dir = self.dir.join("trust");
        std::fs::create_dir_all(&trust_dir).unwrap();
        std::fs::write(trust_dir.join("root.pem"), &self.ca_pem).unwrap();
        let load = TrustStore::load(&TrustStoreSettings::directory(&trust_dir));
        assert!(load.warnings.is_empty());
        assert_eq!(load.store.len(), 1);
        ClientTlsContextFactory::new(Arc::new(load.store))
    }

    fn server_config(&self, name: &str, leaf: &Leaf) -> Result<ServerTlsConfig, ConfigurationError> {
        let key_path = self.dir.join(format!("{name}.key"));
        let chain_path = self.dir.join(format!("{name}.crt"));
        let dh_path = self.dir.join("dh.pem");
        std::fs::write(&key_path, &leaf.key_pem).unwrap();
        std::fs::write(&chain_path, format!("{}{}", leaf.cert_pem, self.ca_pem)).unwrap();
        std::fs::write(&dh_path, dh_params_pem()).unwrap();
        ServerTlsConfig::new(key_path, chain_path, dh_path, DEFAULT_CIPHER_LIST)
    }

    fn server(&self, name: &str, leaf: &Leaf) -> ServerTlsContextFactory {
        ServerTlsContextFactory::new(self.server_config(name, leaf).unwrap()).unwrap()
    }

    fn cleanup(self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

async fn handshake(
    server: &ServerTlsContextFactory,
    client: &ClientTlsContextFactory,
    policy: HostnamePolicy,
) -> Result<(), TlsError> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let acceptor = server.acceptor().unwrap();
    let accept = async move { acceptor.accept(server_io).await.map(drop) };
    let (client_result, _server_result) = tokio::join!(client.connect(policy, client_io), accept);
    client_result.map(drop)
}

fn pinning(pins: &Arc<TofuPinStore>, hostname: &str) -> HostnamePolicy {
    HostnamePolicy::new(hostname).with_tofu(Arc::clone(pins) as Arc<dyn TofuVerifier>)
}

#[tokio::test]
async fn trusted_chain_with_matching_common_name_carries_data() {
    let pki = TestPki::new("exact");
    let server = pki.server("origin", &pki.leaf("secure.example.org", &[]));
    let client = pki.client_factory();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let acceptor = server.acceptor().unwrap();
    let serve = async move {
        let mut stream = acceptor.accept(server_io).await.unwrap();
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await.unwrap();
        stream.write_all(b"pong").await.unwrap();
        stream.flush().await.unwrap();
        request
    };
    let call = async {
        let mut stream = client
            .connect(HostnamePolicy::new("secure.example.org"), client_io)
            .await
            .unwrap();
        assert_eq!(stream.get_ref().1.protocol_version(), Some(ProtocolVersion::TLSv1_3));
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut response = [0u8; 4];
        stream.read_exact(&mut response).await.unwrap();
        response
    };
    let (request, response) = tokio::join!(serve, call);

    assert_eq!(&request, b"ping");
    assert_eq!(&response, b"pong");
    pki.cleanup();
}

#[tokio::test]
async fn wildcard_and_subject_alt_names_are_accepted() {
    let pki = TestPki::new("names");
    let client = pki.client_factory();

    let wildcard = pki.server("wildcard", &pki.leaf("*.example.org", &[]));
    handshake(&wildcard, &client, HostnamePolicy::new("www.example.org"))
        .await
        .unwrap();

    let alt = pki.server("alt", &pki.leaf("origin.internal", &["alt.example.org", "cdn.example.org"]));
    handshake(&alt, &client, HostnamePolicy::new("cdn.example.org"))
        .await
        .unwrap();
    pki.cleanup();
}

#[tokio::test]
async fn hostname_mismatch_without_tofu_is_rejected() {
    let pki = TestPki::new("mismatch");
    let server = pki.server("origin", &pki.leaf("secure.example.org", &["www.example.org"]));
    let client = pki.client_factory();

    let error = handshake(&server, &client, HostnamePolicy::new("unknown.example.org"))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        TlsError::Verification(VerificationError::HostnameMismatch { ref hostname })
            if hostname == "unknown.example.org"
    ));
    assert_eq!(error.classification(), "HostnameMismatch");
    pki.cleanup();
}

#[tokio::test]
async fn untrusted_chain_is_rejected_before_tofu() {
    let trusted = TestPki::new("trusted");
    let rogue = TestPki::new("rogue");
    let server = rogue.server("origin", &rogue.leaf("other.example.org", &[]));
    let client = trusted.client_factory();
    let pins = Arc::new(TofuPinStore::new());

    let error = handshake(&server, &client, pinning(&pins, "pinned.example.org"))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        TlsError::Verification(VerificationError::ChainValidation {
            reason: CertificateError::UnknownIssuer,
            ..
        })
    ));
    assert!(pins.is_empty());
    trusted.cleanup();
    rogue.cleanup();
}

#[tokio::test]
async fn tofu_pins_first_certificate_and_rejects_a_replacement() {
    let pki = TestPki::new("tofu");
    let client = pki.client_factory();
    let pins = Arc::new(TofuPinStore::new());

    let first_leaf = pki.leaf("other.example.org", &[]);
    let first = pki.server("first", &first_leaf);
    handshake(&first, &client, pinning(&pins, "pinned.example.org"))
        .await
        .unwrap();

    let expected = PeerCertificate::from_pem(&first_leaf.cert_pem)
        .unwrap()
        .fingerprint();
    assert_eq!(pins.lookup("pinned.example.org"), Some(expected));

    // Same certificate again: the pin matches.
    handshake(&first, &client, pinning(&pins, "pinned.example.org"))
        .await
        .unwrap();
    assert_eq!(pins.len(), 1);

    let second = pki.server("second", &pki.leaf("other.example.org", &[]));
    let error = handshake(&second, &client, pinning(&pins, "pinned.example.org"))
        .await
        .unwrap_err();
    match error {
        TlsError::Verification(VerificationError::TofuPinMismatch {
            hostname,
            pinned,
            presented,
        }) => {
            assert_eq!(hostname, "pinned.example.org");
            assert_eq!(pinned, expected);
            assert_ne!(presented, expected);
        }
        other => panic!("expected pin mismatch, got {other:?}"),
    }
    assert_eq!(pins.lookup("pinned.example.org"), Some(expected));
    pki.cleanup();
}

#[tokio::test]
async fn tofu_callback_refusal_fails_the_handshake() {
    let pki = TestPki::new("refuse");
    let server = pki.server("origin", &pki.leaf("other.example.org", &[]));
    let client = pki.client_factory();
    let refuse: Arc<dyn TofuVerifier> = Arc::new(|_hostname: &str, _pem: &str| false);

    let error = handshake(
        &server,
        &client,
        HostnamePolicy::new("pinned.example.org").with_tofu(refuse),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        error,
        TlsError::Verification(VerificationError::TofuRefused { .. })
    ));
    pki.cleanup();
}

#[tokio::test]
async fn tls12_client_gets_server_preferred_suite() {
    let pki = TestPki::new("tls12");
    let server = pki.server("origin", &pki.leaf("secure.example.org", &[]));
    let client_factory = pki.client_factory();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = HostnameVerifier::new(
        HostnamePolicy::new("secure.example.org"),
        Arc::new(client_factory.trust_store().root_cert_store()),
        Arc::clone(&provider),
    );
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let acceptor = server.acceptor().unwrap();
    let accept = async move { acceptor.accept(server_io).await.map(drop) };
    let connect = connector.connect(ServerName::try_from("secure.example.org").unwrap(), client_io);
    let (stream, accepted) = tokio::join!(connect, accept);
    let stream = stream.unwrap();
    accepted.unwrap();

    let (_, connection) = stream.get_ref();
    assert_eq!(connection.protocol_version(), Some(ProtocolVersion::TLSv1_2));
    assert_eq!(
        connection.negotiated_cipher_suite().map(|s| s.suite()),
        Some(CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384)
    );
    pki.cleanup();
}

#[test]
fn server_context_is_hardened_and_built_once() {
    let pki = TestPki::new("server");
    let server = pki.server("origin", &pki.leaf("secure.example.org", &[]));

    let first = server.context().unwrap();
    let second = server.context().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.ignore_client_order);
    assert_eq!(first.send_tls13_tickets, 0);
    assert_eq!(first.max_early_data_size, 0);
    assert!(!first.session_storage.can_cache());
    assert_eq!(server.config().certificate_chain().len(), 2);
    assert_eq!(server.config().dh_params().prime_bits(), 2048);
    pki.cleanup();
}

#[test]
fn missing_inputs_fail_at_startup() {
    let pki = TestPki::new("inputs");
    let leaf = pki.leaf("secure.example.org", &[]);
    pki.server_config("origin", &leaf).unwrap();

    let missing_dh = ServerTlsConfig::new(
        pki.dir.join("origin.key"),
        pki.dir.join("origin.crt"),
        pki.dir.join("absent-dh.pem"),
        DEFAULT_CIPHER_LIST,
    )
    .unwrap_err();
    assert!(matches!(missing_dh, ConfigurationError::DhParameters { .. }));

    let bad_key = pki.dir.join("bad.key");
    std::fs::write(&bad_key, "no key here").unwrap();
    let bad_key = ServerTlsConfig::new(
        &bad_key,
        pki.dir.join("origin.crt"),
        pki.dir.join("dh.pem"),
        DEFAULT_CIPHER_LIST,
    )
    .unwrap_err();
    assert!(matches!(bad_key, ConfigurationError::PrivateKey { .. }));

    let bad_ciphers = ServerTlsConfig::new(
        pki.dir.join("origin.key"),
        pki.dir.join("origin.crt"),
        pki.dir.join("dh.pem"),
        "RC4-MD5",
    )
    .unwrap_err();
    assert!(matches!(bad_ciphers, ConfigurationError::CipherList(_)));
    pki.cleanup();
}
