//! rustls client configuration from [`ClientConfig`] `ssl` options.

use crate::config::{ClientConfig, SslConfig, VerifyMode};
use crate::error::HttpError;
use crate::tls::{
    Identity, KeyEntry, StoreKind, default_root_store, get_crypto_provider, read_certificates,
    read_key_store, read_private_keys,
};
use crate::verifier::HydraVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{RootCertStore, SupportedProtocolVersion};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;

/// Build the TLS configuration shared by every HTTPS connection of a client.
///
/// # Errors
/// Returns `HttpError::Config` for unreadable or unsupported material,
/// unknown protocol or cipher names, and rustls builder failures.
pub(crate) fn build_tls_config(config: &ClientConfig) -> Result<Arc<rustls::ClientConfig>, HttpError> {
    let ssl = &config.ssl;
    let mode = config.verify_mode();
    let provider = restrict_cipher_suites(get_crypto_provider(), &ssl.cipher_suites)?;
    let versions = protocol_versions(&ssl.protocols)?;

    let roots = if mode == VerifyMode::Disable {
        tracing::warn!(
            target: "modkit_hydra::security",
            "TLS certificate verification disabled; connections are open to interception"
        );
        RootCertStore::empty()
    } else {
        trust_anchors(config)?
    };

    let verifier = HydraVerifier::new(mode, roots, ssl.trust_strategy.clone(), Arc::clone(&provider))
        .map_err(|e| HttpError::Config(format!("failed to build certificate verifier: {e}")))?;

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)
        .map_err(|e| HttpError::Config(format!("failed to set TLS protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));

    let mut tls = match client_identity(ssl, &provider)? {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| HttpError::Config(format!("invalid client certificate: {e}")))?,
        None => builder.with_no_client_auth(),
    };
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];

    tracing::debug!(verify = mode.as_str(), "built TLS client configuration");
    Ok(Arc::new(tls))
}

/// Trust store file and CA file combined; platform roots when neither is set
fn trust_anchors(config: &ClientConfig) -> Result<RootCertStore, HttpError> {
    let ssl = &config.ssl;
    if ssl.truststore.is_none() && ssl.ca_file.is_none() {
        return default_root_store(config.tls_roots);
    }

    let mut roots = RootCertStore::empty();
    if let Some(truststore) = &ssl.truststore {
        let path = Path::new(truststore);
        let kind = StoreKind::infer(path, ssl.truststore_type.as_deref())?;
        let certs = read_certificates(path, kind, ssl.truststore_password.as_deref())?;
        add_all(&mut roots, certs, truststore)?;
    }
    if let Some(ca_file) = &ssl.ca_file {
        add_all(&mut roots, read_certificates(Path::new(ca_file), StoreKind::Pem, None)?, ca_file)?;
    }
    Ok(roots)
}

fn add_all(roots: &mut RootCertStore, certs: Vec<CertificateDer<'static>>, source: &str) -> Result<(), HttpError> {
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        tracing::warn!(source, added, ignored, "some trust certificates could not be parsed");
    }
    if added == 0 {
        return Err(HttpError::Config(format!("no usable trust certificates in '{source}'")));
    }
    Ok(())
}

/// Client certificate chain and key.
///
/// Candidates come from the PEM `client_cert`/`client_key` pair first, then
/// from every identity of the key store; the first key the provider can
/// load wins.
fn client_identity(
    ssl: &SslConfig,
    provider: &CryptoProvider,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, HttpError> {
    let mut candidates: Vec<Identity> = Vec::new();
    match (&ssl.client_cert, &ssl.client_key) {
        (Some(cert), Some(key)) => candidates.push((
            read_certificates(Path::new(cert), StoreKind::Pem, None)?,
            read_private_keys(Path::new(key))?,
        )),
        (Some(_), None) | (None, Some(_)) => {
            return Err(HttpError::Config(
                "client_cert and client_key must be given together".to_owned(),
            ));
        }
        (None, None) => {}
    }
    if let Some(keystore) = &ssl.keystore {
        let path = Path::new(keystore);
        let kind = StoreKind::infer(path, ssl.keystore_type.as_deref())?;
        candidates.extend(read_key_store(path, kind, ssl.keystore_password.as_deref())?);
    }
    if candidates.is_empty() {
        return Ok(None);
    }

    let total: usize = candidates.iter().map(|(_, keys)| keys.len()).sum();
    for (chain, keys) in candidates {
        if let Some(key) = select_key(keys, provider) {
            return Ok(Some((chain, key)));
        }
    }
    Err(HttpError::Config(format!(
        "no usable private key found ({total} candidates)"
    )))
}

/// First key the provider can load
fn select_key(keys: Vec<KeyEntry>, provider: &CryptoProvider) -> Option<PrivateKeyDer<'static>> {
    let total = keys.len();
    for entry in keys {
        if provider.key_provider.load_private_key(entry.key.clone_key()).is_ok() {
            tracing::debug!(alias = %entry.alias, total, "selected client private key");
            return Some(entry.key);
        }
        tracing::warn!(alias = %entry.alias, algorithm = ?entry.algorithm, "skipping unusable private key");
    }
    None
}

fn protocol_versions(names: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>, HttpError> {
    if names.is_empty() {
        return Ok(rustls::DEFAULT_VERSIONS.to_vec());
    }
    names
        .iter()
        .map(|name| match name.to_ascii_lowercase().as_str() {
            "tlsv1.2" | "tls1.2" => Ok(&rustls::version::TLS12),
            "tlsv1.3" | "tls1.3" => Ok(&rustls::version::TLS13),
            other => Err(HttpError::Config(format!("unsupported TLS protocol '{other}'"))),
        })
        .collect()
}

/// Keep only allow-listed suites (matched by their IANA-style name)
fn restrict_cipher_suites(
    provider: Arc<CryptoProvider>,
    allowed: &[String],
) -> Result<Arc<CryptoProvider>, HttpError> {
    if allowed.is_empty() {
        return Ok(provider);
    }
    let mut restricted = CryptoProvider::clone(&provider);
    restricted.cipher_suites.retain(|suite| {
        let name = format!("{:?}", suite.suite());
        allowed.iter().any(|a| a.eq_ignore_ascii_case(&name))
    });
    if restricted.cipher_suites.is_empty() {
        return Err(HttpError::Config(format!(
            "none of the configured cipher suites are supported: {}",
            allowed.join(", ")
        )));
    }
    Ok(Arc::new(restricted))
}
