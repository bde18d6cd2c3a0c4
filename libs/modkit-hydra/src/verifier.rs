use crate::config::VerifyMode;
use crate::trust::{Certificate, TrustStrategy, to_rustls_error};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{CertificateError, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, DnsName, ServerName, UnixTime};
use std::sync::Arc;

/// Authentication type reported to trust deciders; the negotiated key
/// exchange is not known while the chain is verified.
pub(crate) const AUTH_TYPE: &str = "UNKNOWN";

/// Label prepended to a suffix to find out whether a certificate carries a
/// wildcard for that suffix.
const WILDCARD_SAMPLE_LABEL: &str = "hydra-wildcard-sample";

/// Server certificate verifier implementing the `verify` modes and the
/// optional trust strategy override.
#[derive(Debug)]
pub(crate) struct HydraVerifier {
    mode: VerifyMode,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    trust_strategy: Option<TrustStrategy>,
    provider: Arc<CryptoProvider>,
}

impl HydraVerifier {
    pub(crate) fn new(
        mode: VerifyMode,
        roots: RootCertStore,
        trust_strategy: Option<TrustStrategy>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, Error> {
        let webpki = if mode == VerifyMode::Disable {
            None
        } else {
            Some(
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                    .build()
                    .map_err(|e| Error::General(e.to_string()))?,
            )
        };
        Ok(Self {
            mode,
            webpki,
            trust_strategy,
            provider,
        })
    }

    fn verify_hostname(&self, end_entity: &CertificateDer<'_>, server_name: &ServerName<'_>) -> Result<(), Error> {
        let cert = webpki::EndEntityCert::try_from(end_entity)
            .map_err(|_| Error::InvalidCertificate(CertificateError::BadEncoding))?;
        if cert.verify_is_valid_for_subject_name(server_name).is_ok() {
            return Ok(());
        }
        if self.mode == VerifyMode::Browser && matches_deep_wildcard(&cert, server_name) {
            return Ok(());
        }
        Err(Error::InvalidCertificate(CertificateError::NotValidForName))
    }
}

fn is_name_mismatch(err: &Error) -> bool {
    matches!(
        err,
        Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

/// Browser-style matching: `*.example.com` also covers `a.b.example.com`.
///
/// Every proper suffix of at least two labels is checked with a synthetic
/// leftmost label; the certificate matches if it carries a wildcard for one
/// of them.
fn matches_deep_wildcard(cert: &webpki::EndEntityCert<'_>, server_name: &ServerName<'_>) -> bool {
    let ServerName::DnsName(dns) = server_name else {
        return false;
    };
    let host = dns.as_ref();
    let labels: Vec<&str> = host.split('.').collect();

    (1..labels.len().saturating_sub(1)).any(|skip| {
        let sample = format!("{WILDCARD_SAMPLE_LABEL}.{}", labels[skip..].join("."));
        DnsName::try_from(sample.as_str())
            .ok()
            .is_some_and(|name| cert.verify_is_valid_for_subject_name(&ServerName::DnsName(name)).is_ok())
    })
}

impl ServerCertVerifier for HydraVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        if self.mode == VerifyMode::Disable {
            return Ok(ServerCertVerified::assertion());
        }

        if let Some(strategy) = &self.trust_strategy {
            let chain: Vec<Certificate> = std::iter::once(Certificate::from(end_entity))
                .chain(intermediates.iter().map(Certificate::from))
                .collect();
            match strategy.is_trusted(&chain, AUTH_TYPE) {
                Ok(true) => {
                    tracing::debug!(server = ?server_name, "certificate chain trusted by strategy");
                    self.verify_hostname(end_entity, server_name)?;
                    return Ok(ServerCertVerified::assertion());
                }
                Ok(false) => {}
                Err(err) => return Err(to_rustls_error(err)),
            }
        }

        let webpki = self
            .webpki
            .as_ref()
            .ok_or_else(|| Error::General("no trust anchors configured".to_owned()))?;

        // The chain is validated before the name, so a name mismatch means
        // the chain itself is trusted.
        match webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
            Err(err) if self.mode == VerifyMode::Browser && is_name_mismatch(&err) => {
                self.verify_hostname(end_entity, server_name)?;
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
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
    ) -> Result<HandshakeSignatureValid, Error> {
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
