//! TLS material loading.
//!
//! Root certificates (cached native store or webpki roots), trust and key
//! store files (PEM, DER or PKCS12), and private keys from PEM.

use crate::config::TlsRootConfig;
use crate::error::HttpError;
use base64::Engine as _;
use p12_keystore::{KeyStore, KeyStoreEntry};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Cached native root certificates.
/// Always stores Ok; empty vec means no certs found (warned, not errored).
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

/// Counter for test verification that the loader only runs once.
#[cfg(test)]
static LOAD_COUNT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    LOAD_COUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    let certs: Vec<CertificateDer<'static>> = result.certs;
    if certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = certs.len(), "loaded native root certificates");
    }
    certs
}

/// Native root certificates, loaded from the OS store once per process.
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// Crypto provider for TLS connections.
///
/// Uses the process default when one is installed, otherwise a fresh
/// aws-lc-rs provider (without installing it globally).
pub fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Platform default trust anchors
pub(crate) fn default_root_store(source: TlsRootConfig) -> Result<rustls::RootCertStore, HttpError> {
    let mut store = rustls::RootCertStore::empty();
    match source {
        TlsRootConfig::WebPki => {
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        TlsRootConfig::Native => {
            let certs = native_root_certs();
            let (added, ignored) = store.add_parsable_certificates(certs.iter().cloned());
            if ignored > 0 {
                tracing::warn!(added, ignored, "some native root certificates could not be parsed");
            }
            if added == 0 {
                return Err(HttpError::Config(format!(
                    "no valid native root CA certificates (found {}, {} failed to parse)",
                    certs.len(),
                    ignored
                )));
            }
        }
    }
    Ok(store)
}

/// On-disk format of a trust or key store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreKind {
    Pem,
    Der,
    Pkcs12,
}

impl StoreKind {
    /// Explicit type wins; otherwise `.p12`/`.pfx` → PKCS12, `.der`/`.cer` → DER, else PEM
    pub(crate) fn infer(path: &Path, explicit: Option<&str>) -> Result<Self, HttpError> {
        if let Some(kind) = explicit {
            return match kind.to_ascii_lowercase().as_str() {
                "pem" => Ok(StoreKind::Pem),
                "der" => Ok(StoreKind::Der),
                "pkcs12" | "p12" | "pfx" => Ok(StoreKind::Pkcs12),
                other => Err(HttpError::Config(format!("unknown store type '{other}'"))),
            };
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        Ok(match ext.as_deref() {
            Some("p12" | "pfx") => StoreKind::Pkcs12,
            Some("der" | "cer") => StoreKind::Der,
            _ => StoreKind::Pem,
        })
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, HttpError> {
    std::fs::read(path).map_err(|e| HttpError::Config(format!("cannot read '{}': {e}", path.display())))
}

/// Open a PKCS12 store. A wrong password fails the MAC check.
fn open_pkcs12(path: &Path, password: Option<&str>) -> Result<KeyStore, HttpError> {
    let bytes = read_file(path)?;
    KeyStore::from_pkcs12(&bytes, password.unwrap_or_default()).map_err(|e| match e {
        p12_keystore::error::Error::MacError(_) => HttpError::Config(format!(
            "cannot open '{}': wrong password or corrupted store",
            path.display()
        )),
        other => HttpError::Config(format!("invalid PKCS12 store '{}': {other}", path.display())),
    })
}

/// Certificates from a trust store file.
///
/// `password` only applies to PKCS12 stores, whose trusted entries and
/// key-entry chains are all taken.
pub(crate) fn read_certificates(
    path: &Path,
    kind: StoreKind,
    password: Option<&str>,
) -> Result<Vec<CertificateDer<'static>>, HttpError> {
    let certs = match kind {
        StoreKind::Pkcs12 => {
            let store = open_pkcs12(path, password)?;
            let mut certs = Vec::new();
            for (alias, entry) in store.entries() {
                match entry {
                    KeyStoreEntry::Certificate(cert) => certs.push(to_der(cert)),
                    KeyStoreEntry::PrivateKeyChain(chain) => certs.extend(chain.chain().iter().map(to_der)),
                    KeyStoreEntry::Secret(_) => tracing::debug!(alias = %alias, "skipping secret entry"),
                }
            }
            certs
        }
        StoreKind::Der | StoreKind::Pem => {
            if password.is_some() {
                tracing::debug!(path = %path.display(), "store password ignored for PEM/DER stores");
            }
            let bytes = read_file(path)?;
            if kind == StoreKind::Der {
                vec![CertificateDer::from(bytes)]
            } else {
                CertificateDer::pem_slice_iter(&bytes)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| HttpError::Config(format!("invalid PEM in '{}': {e}", path.display())))?
            }
        }
    };
    non_empty(certs, path)
}

fn to_der(cert: &p12_keystore::Certificate) -> CertificateDer<'static> {
    CertificateDer::from(cert.as_der().to_vec())
}

fn non_empty(certs: Vec<CertificateDer<'static>>, path: &Path) -> Result<Vec<CertificateDer<'static>>, HttpError> {
    if certs.is_empty() {
        return Err(HttpError::Config(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

/// Algorithm named by a PEM private key header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyAlgorithm {
    Rsa,
    Ec,
}

/// One private key found in a PEM document
#[derive(Debug)]
pub(crate) struct KeyEntry {
    /// Hex SHA-256 of the decoded key bytes, or the PKCS12 entry name
    pub alias: String,
    pub algorithm: KeyAlgorithm,
    pub key: PrivateKeyDer<'static>,
}

const BEGIN_MARKER: &str = "-----BEGIN ";
const MARKER_TAIL: &str = "-----";
const KEY_LABEL: &str = "PRIVATE KEY";

/// Extract every `-----BEGIN ...PRIVATE KEY-----` block of `pem`.
///
/// `RSA` headers hold PKCS#1, `EC` headers SEC1, and a bare header PKCS#8
/// (taken as RSA unless stated otherwise).
pub(crate) fn parse_private_keys(pem: &str) -> Result<Vec<KeyEntry>, HttpError> {
    let mut entries = Vec::new();
    let mut rest = pem;

    while let Some(start) = rest.find(BEGIN_MARKER) {
        let after_begin = &rest[start + BEGIN_MARKER.len()..];
        let Some(label_end) = after_begin.find(MARKER_TAIL) else {
            break;
        };
        let label = &after_begin[..label_end];
        let body_start = &after_begin[label_end + MARKER_TAIL.len()..];

        let end_marker = format!("-----END {label}-----");
        let Some(body_end) = body_start.find(&end_marker) else {
            return Err(HttpError::Config(format!("unterminated PEM block '{label}'")));
        };
        let body = &body_start[..body_end];
        rest = &body_start[body_end + end_marker.len()..];

        let Some(prefix) = label.strip_suffix(KEY_LABEL) else {
            continue;
        };
        let prefix = prefix.trim();
        if prefix.contains("ENCRYPTED") || body.contains("ENCRYPTED") {
            return Err(HttpError::Config(
                "encrypted private keys are unsupported".to_owned(),
            ));
        }

        let encoded: String = body
            .lines()
            .filter(|line| !line.contains(':'))
            .flat_map(|line| line.chars().filter(|c| !c.is_whitespace()))
            .collect();
        let der = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| HttpError::Config(format!("invalid base64 in private key: {e}")))?;
        let alias = hex::encode(Sha256::digest(&der));

        let (algorithm, key) = match prefix {
            "RSA" => (KeyAlgorithm::Rsa, PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der))),
            "EC" => (KeyAlgorithm::Ec, PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der))),
            "" => (KeyAlgorithm::Rsa, PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der))),
            other => {
                return Err(HttpError::Config(format!(
                    "unsupported private key type '{other}'"
                )));
            }
        };
        tracing::debug!(alias = %alias, ?algorithm, "loaded private key");
        entries.push(KeyEntry { alias, algorithm, key });
    }

    Ok(entries)
}

/// Read private keys from a PEM file
pub(crate) fn read_private_keys(path: &Path) -> Result<Vec<KeyEntry>, HttpError> {
    let bytes = read_file(path)?;
    let text = String::from_utf8(bytes)
        .map_err(|_| HttpError::Config(format!("'{}' is not a PEM file", path.display())))?;
    parse_private_keys(&text)
}

/// Client identities of a key store: certificate chain plus candidate keys
pub(crate) type Identity = (Vec<CertificateDer<'static>>, Vec<KeyEntry>);

/// Identities of a key store file.
///
/// A PEM store holds one chain and its keys; a PKCS12 store yields one
/// identity per key entry, aliased by the entry name.
pub(crate) fn read_key_store(
    path: &Path,
    kind: StoreKind,
    password: Option<&str>,
) -> Result<Vec<Identity>, HttpError> {
    match kind {
        StoreKind::Pem => {
            if password.is_some() {
                tracing::debug!(path = %path.display(), "key store password ignored; encrypted PEM keys are unsupported");
            }
            Ok(vec![(read_certificates(path, kind, None)?, read_private_keys(path)?)])
        }
        StoreKind::Der => Err(HttpError::Config(format!(
            "key store '{}' must be PEM or PKCS12",
            path.display()
        ))),
        StoreKind::Pkcs12 => {
            let store = open_pkcs12(path, password)?;
            let identities: Vec<Identity> = store
                .entries()
                .filter_map(|(alias, entry)| match entry {
                    KeyStoreEntry::PrivateKeyChain(chain) => Some((alias, chain)),
                    _ => None,
                })
                .map(|(alias, chain)| {
                    let certs = chain.chain().iter().map(to_der).collect();
                    let key = KeyEntry {
                        alias: alias.clone(),
                        algorithm: KeyAlgorithm::Rsa,
                        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(chain.key().to_vec())),
                    };
                    (certs, vec![key])
                })
                .collect();
            if identities.is_empty() {
                return Err(HttpError::Config(format!(
                    "no private key entries in '{}'",
                    path.display()
                )));
            }
            Ok(identities)
        }
    }
}
