#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Verification modes and trust material against a local TLS server.

mod common;

use common::{fixture, mutual_tls_server, tls_server};
use modkit_hydra::{
    Certificate, ClientBuilder, HttpError, RequestOptions, SslConfig, TrustStrategy, VerifyMode,
};

fn fetch(client: &modkit_hydra::Client, url: &str) -> Result<String, HttpError> {
    client.get(url, RequestOptions::new())?.text()
}

fn self_signed_fingerprint() -> String {
    use rustls_pki_types::CertificateDer;
    use rustls_pki_types::pem::PemObject;

    let der = CertificateDer::from_pem_file(fixture("self-signed.pem")).unwrap();
    Certificate::from_der(der.to_vec()).sha256_fingerprint()
}

#[test]
fn test_strict_rejects_self_signed() {
    common::init_tracing();
    let addr = tls_server("self-signed.pem", "self-signed.key");
    let client = ClientBuilder::new().build().unwrap();

    let err = fetch(&client, &format!("https://localhost:{}/", addr.port())).unwrap_err();
    assert!(matches!(err, HttpError::ClientProtocol(_)), "got {err:?}");
}

#[test]
fn test_disable_accepts_self_signed() {
    let addr = tls_server("self-signed.pem", "self-signed.key");
    let client = ClientBuilder::new().verify(VerifyMode::Disable).build().unwrap();

    assert_eq!(fetch(&client, &format!("https://localhost:{}/", addr.port())).unwrap(), "secure");
}

#[test]
fn test_ignore_ssl_validation_flag() {
    let addr = tls_server("self-signed.pem", "self-signed.key");
    let client = modkit_hydra::Client::from_value(serde_json::json!({ "ignore_ssl_validation": true })).unwrap();

    assert_eq!(fetch(&client, &format!("https://127.0.0.1:{}/", addr.port())).unwrap(), "secure");
}

#[test]
fn test_ca_file_trusts_signed_certificate() {
    let addr = tls_server("localhost.pem", "localhost.key");
    let client = ClientBuilder::new()
        .ssl(SslConfig {
            ca_file: Some(fixture("ca.pem")),
            ..SslConfig::default()
        })
        .build()
        .unwrap();

    assert_eq!(fetch(&client, &format!("https://localhost:{}/", addr.port())).unwrap(), "secure");
}

#[test]
fn test_pkcs12_trust_store() {
    let addr = tls_server("localhost.pem", "localhost.key");
    let client = ClientBuilder::new()
        .ssl(SslConfig {
            truststore: Some(fixture("truststore.p12")),
            truststore_password: Some("test123".to_owned()),
            ..SslConfig::default()
        })
        .build()
        .unwrap();

    assert_eq!(fetch(&client, &format!("https://localhost:{}/", addr.port())).unwrap(), "secure");
}

#[test]
fn test_pkcs12_trust_store_with_wrong_password() {
    let result = ClientBuilder::new()
        .ssl(SslConfig {
            truststore: Some(fixture("truststore.p12")),
            truststore_password: Some("wrongpass".to_owned()),
            ..SslConfig::default()
        })
        .build();

    assert!(matches!(result, Err(HttpError::Config(_))));
}

#[test]
fn test_client_certificate_from_pem_pair() {
    let addr = mutual_tls_server("localhost.pem", "localhost.key", "ca.pem");
    let client = ClientBuilder::new()
        .ssl(SslConfig {
            ca_file: Some(fixture("ca.pem")),
            client_cert: Some(fixture("client.pem")),
            client_key: Some(fixture("client.key")),
            ..SslConfig::default()
        })
        .build()
        .unwrap();

    assert_eq!(fetch(&client, &format!("https://localhost:{}/", addr.port())).unwrap(), "secure");
}

#[test]
fn test_client_certificate_from_pkcs12_key_store() {
    let addr = mutual_tls_server("localhost.pem", "localhost.key", "ca.pem");
    let client = ClientBuilder::new()
        .ssl(SslConfig {
            truststore: Some(fixture("truststore.p12")),
            truststore_password: Some("test123".to_owned()),
            keystore: Some(fixture("client.p12")),
            keystore_password: Some("client123".to_owned()),
            ..SslConfig::default()
        })
        .build()
        .unwrap();

    assert_eq!(fetch(&client, &format!("https://localhost:{}/", addr.port())).unwrap(), "secure");
}

#[test]
fn test_missing_client_certificate_is_rejected() {
    let addr = mutual_tls_server("localhost.pem", "localhost.key", "ca.pem");
    let client = ClientBuilder::new()
        .ssl(SslConfig {
            ca_file: Some(fixture("ca.pem")),
            ..SslConfig::default()
        })
        .build()
        .unwrap();

    let err = fetch(&client, &format!("https://localhost:{}/", addr.port())).unwrap_err();
    assert!(matches!(err, HttpError::ClientProtocol(_)), "got {err:?}");
}

#[test]
fn test_hostname_mismatch_is_rejected() {
    let addr = tls_server("wildcard.pem", "wildcard.key");
    let client = ClientBuilder::new()
        .ssl(SslConfig {
            ca_file: Some(fixture("ca.pem")),
            ..SslConfig::default()
        })
        .build()
        .unwrap();

    let err = fetch(&client, &format!("https://localhost:{}/", addr.port())).unwrap_err();
    assert!(matches!(err, HttpError::ClientProtocol(_)), "got {err:?}");
}

#[test]
fn test_trust_strategy_pins_fingerprint() {
    let addr = tls_server("self-signed.pem", "self-signed.key");
    let pinned = self_signed_fingerprint();
    let client = ClientBuilder::new()
        .trust_strategy(TrustStrategy::from_fn(move |chain, _auth_type| {
            Ok(chain.first().is_some_and(|cert| cert.sha256_fingerprint() == pinned))
        }))
        .build()
        .unwrap();

    assert_eq!(fetch(&client, &format!("https://localhost:{}/", addr.port())).unwrap(), "secure");
}

#[test]
fn test_trust_strategy_declining_falls_back_to_roots() {
    let addr = tls_server("self-signed.pem", "self-signed.key");
    let client = ClientBuilder::new()
        .trust_strategy(TrustStrategy::from_fn(|_, _| Ok(false)))
        .build()
        .unwrap();

    let err = fetch(&client, &format!("https://localhost:{}/", addr.port())).unwrap_err();
    assert!(matches!(err, HttpError::ClientProtocol(_)), "got {err:?}");
}

#[test]
fn test_invalid_verify_value_is_a_config_error() {
    let err = modkit_hydra::Client::from_value(serde_json::json!({ "ssl": { "verify": "sometimes" } }))
        .unwrap_err();
    assert!(matches!(err, HttpError::Config(_)));
}
