//! Certificate trust strategies.
//!
//! A [`TrustStrategy`] lets callers short-circuit chain verification: when
//! it reports a server chain as trusted, the chain is accepted without
//! consulting the trust store (hostname verification still applies unless
//! `verify: disable`).
//!
//! # Example
//!
//! ```ignore
//! use modkit_hydra::{Certificate, CertificateError, TrustStrategy};
//!
//! const PINNED: &str = "324a87eebb19265ffb675dc345eb0f3b5d9de3f015159227a00fe552291d4cc4";
//!
//! let pinned = TrustStrategy::from_fn(|chain: &[Certificate], _auth_type: &str| {
//!     Ok(chain.iter().any(|cert| cert.sha256_fingerprint() == PINNED))
//! });
//! ```

use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Portable DER-encoded X.509 certificate handed to trust deciders.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    /// Wrap DER-encoded certificate bytes
    #[must_use]
    pub fn from_der(der: impl Into<Vec<u8>>) -> Self {
        Self { der: der.into() }
    }

    /// Raw DER bytes
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Lower-case hex SHA-256 digest of the DER encoding
    #[must_use]
    pub fn sha256_fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("sha256", &self.sha256_fingerprint())
            .finish()
    }
}

impl From<&rustls_pki_types::CertificateDer<'_>> for Certificate {
    fn from(der: &rustls_pki_types::CertificateDer<'_>) -> Self {
        Self::from_der(der.as_ref())
    }
}

/// Raised by a trust decider that considers the chain invalid.
///
/// Unlike returning `Ok(false)` (which falls back to regular verification),
/// an error aborts the handshake.
#[derive(Debug, Clone, thiserror::Error)]
#[error("certificate rejected: {message}")]
pub struct CertificateError {
    message: String,
}

impl CertificateError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Decides whether a peer certificate chain can be trusted without
/// verification against the trust store.
pub trait TrustDecider: Send + Sync {
    /// `chain` starts with the end-entity certificate.
    ///
    /// # Errors
    /// Returns `CertificateError` to reject the chain outright.
    fn is_trusted(&self, chain: &[Certificate], auth_type: &str) -> Result<bool, CertificateError>;
}

impl<F> TrustDecider for F
where
    F: Fn(&[Certificate], &str) -> Result<bool, CertificateError> + Send + Sync,
{
    fn is_trusted(&self, chain: &[Certificate], auth_type: &str) -> Result<bool, CertificateError> {
        self(chain, auth_type)
    }
}

/// Either side trusting the chain is sufficient.
struct AnyOf {
    lhs: TrustStrategy,
    rhs: TrustStrategy,
}

impl TrustDecider for AnyOf {
    fn is_trusted(&self, chain: &[Certificate], auth_type: &str) -> Result<bool, CertificateError> {
        match self.lhs.is_trusted(chain, auth_type) {
            Ok(true) => Ok(true),
            Ok(false) => self.rhs.is_trusted(chain, auth_type),
            // rhs may still vouch for the chain
            Err(err) => match self.rhs.is_trusted(chain, auth_type) {
                Ok(true) => Ok(true),
                _ => Err(err),
            },
        }
    }
}

/// Cloneable, shareable trust decider.
#[derive(Clone)]
pub struct TrustStrategy {
    decider: Arc<dyn TrustDecider>,
}

impl TrustStrategy {
    /// Wrap any [`TrustDecider`] implementation
    pub fn new(decider: impl TrustDecider + 'static) -> Self {
        Self {
            decider: Arc::new(decider),
        }
    }

    /// Wrap a predicate over `(chain, auth_type)`
    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&[Certificate], &str) -> Result<bool, CertificateError> + Send + Sync + 'static,
    {
        Self::new(predicate)
    }

    /// Pass strategies through unchanged and wrap predicates; `None` stays `None`.
    pub fn coerce<T: IntoTrustStrategy>(value: Option<T>) -> Option<TrustStrategy> {
        value.map(IntoTrustStrategy::into_trust_strategy)
    }

    /// Combine two optional strategies.
    ///
    /// An absent side yields the other side; otherwise the result trusts a
    /// chain when either side does.
    pub fn combine<L, R>(lhs: Option<L>, rhs: Option<R>) -> Option<TrustStrategy>
    where
        L: IntoTrustStrategy,
        R: IntoTrustStrategy,
    {
        match (Self::coerce(lhs), Self::coerce(rhs)) {
            (None, other) | (other, None) => other,
            (Some(lhs), Some(rhs)) => Some(Self::new(AnyOf { lhs, rhs })),
        }
    }

    /// Ask the underlying decider about `chain`.
    ///
    /// # Errors
    /// Propagates the decider's rejection.
    pub fn is_trusted(&self, chain: &[Certificate], auth_type: &str) -> Result<bool, CertificateError> {
        self.decider.is_trusted(chain, auth_type)
    }
}

impl fmt::Debug for TrustStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStrategy").finish_non_exhaustive()
    }
}

/// Values accepted by [`TrustStrategy::coerce`] and [`TrustStrategy::combine`].
pub trait IntoTrustStrategy {
    fn into_trust_strategy(self) -> TrustStrategy;
}

impl IntoTrustStrategy for TrustStrategy {
    fn into_trust_strategy(self) -> TrustStrategy {
        self
    }
}

impl<F> IntoTrustStrategy for F
where
    F: Fn(&[Certificate], &str) -> Result<bool, CertificateError> + Send + Sync + 'static,
{
    fn into_trust_strategy(self) -> TrustStrategy {
        TrustStrategy::from_fn(self)
    }
}

/// Convert a decider rejection into the error rustls expects from a verifier.
pub(crate) fn to_rustls_error(err: CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::Other(rustls::OtherError(
        Arc::new(err),
    )))
}
