//! Canned responses for tests.
//!
//! A client consults its stubs before touching the network: first the
//! one-shot response set with `respond_with`, then the URL stubs in
//! registration order.

use crate::cookie::Cookie;
use crate::error::HttpError;
use crate::request::OneOrMany;
use crate::response::Response;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// Description of a canned response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StubDescriptor {
    pub body: String,
    pub code: u16,
    /// Header name to value(s); several `Set-Cookie` values become several cookies
    pub headers: BTreeMap<String, OneOrMany>,
    /// Cookies reported in addition to those parsed from `Set-Cookie`
    pub cookies: Vec<Cookie>,
}

impl Default for StubDescriptor {
    fn default() -> Self {
        Self {
            body: String::new(),
            code: 200,
            headers: BTreeMap::new(),
            cookies: Vec::new(),
        }
    }
}

impl StubDescriptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    /// Add a header value; repeated names accumulate
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        self.headers
            .entry(name.into())
            .and_modify(|existing| {
                let mut values = existing.values().to_vec();
                values.push(value.clone());
                *existing = OneOrMany::Many(values);
            })
            .or_insert_with(|| OneOrMany::One(value.clone()));
        self
    }

    #[must_use]
    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// Parse a dynamic descriptor (`{"body": "...", "code": 404, ...}`)
    ///
    /// # Errors
    /// Returns `HttpError::Config` when the value has the wrong shape.
    pub fn from_value(value: serde_json::Value) -> Result<Self, HttpError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Builder of stand-alone canned responses
pub struct StubbedResponse;

impl StubbedResponse {
    /// A response that resolves from `descriptor` without any I/O.
    ///
    /// It has no request, so `final_url` is `None`.
    #[must_use]
    pub fn stub(descriptor: StubDescriptor) -> Response {
        Response::stubbed(None, descriptor)
    }
}

/// Which URLs a stub answers
#[derive(Clone)]
pub enum UrlPattern {
    /// Exact full request URL, compared after normalization
    Literal(String),
    /// Matched anywhere in the full request URL
    Regex(regex::Regex),
}

impl UrlPattern {
    /// Compile a regular expression pattern
    ///
    /// # Errors
    /// Returns `HttpError::Config` for an invalid expression.
    pub fn regex(pattern: &str) -> Result<Self, HttpError> {
        regex::Regex::new(pattern)
            .map(UrlPattern::Regex)
            .map_err(|e| HttpError::Config(format!("invalid stub pattern '{pattern}': {e}")))
    }

    fn matches(&self, url: &Url) -> bool {
        match self {
            UrlPattern::Literal(literal) => {
                literal == url.as_str() || Url::parse(literal).is_ok_and(|parsed| parsed == *url)
            }
            UrlPattern::Regex(re) => re.is_match(url.as_str()),
        }
    }

    fn same_pattern(&self, other: &UrlPattern) -> bool {
        match (self, other) {
            (UrlPattern::Literal(a), UrlPattern::Literal(b)) => a == b,
            (UrlPattern::Regex(a), UrlPattern::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl fmt::Debug for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlPattern::Literal(literal) => f.debug_tuple("Literal").field(literal).finish(),
            UrlPattern::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
        }
    }
}

impl From<&str> for UrlPattern {
    fn from(literal: &str) -> Self {
        UrlPattern::Literal(literal.to_owned())
    }
}

impl From<String> for UrlPattern {
    fn from(literal: String) -> Self {
        UrlPattern::Literal(literal)
    }
}

impl From<&Url> for UrlPattern {
    fn from(url: &Url) -> Self {
        UrlPattern::Literal(url.as_str().to_owned())
    }
}

impl From<regex::Regex> for UrlPattern {
    fn from(re: regex::Regex) -> Self {
        UrlPattern::Regex(re)
    }
}

/// Stubs of one client
#[derive(Debug, Default)]
pub(crate) struct StubRegistry {
    stubs: Vec<(UrlPattern, StubDescriptor)>,
    one_shot: Option<StubDescriptor>,
}

impl StubRegistry {
    /// Register or replace the stub for `pattern`
    pub(crate) fn insert(&mut self, pattern: UrlPattern, descriptor: StubDescriptor) {
        match self.stubs.iter_mut().find(|(p, _)| p.same_pattern(&pattern)) {
            Some(slot) => slot.1 = descriptor,
            None => self.stubs.push((pattern, descriptor)),
        }
    }

    pub(crate) fn remove(&mut self, pattern: &UrlPattern) -> bool {
        let before = self.stubs.len();
        self.stubs.retain(|(p, _)| !p.same_pattern(pattern));
        before != self.stubs.len()
    }

    pub(crate) fn clear(&mut self) {
        self.stubs.clear();
        self.one_shot = None;
    }

    pub(crate) fn set_one_shot(&mut self, descriptor: StubDescriptor) {
        self.one_shot = Some(descriptor);
    }

    /// Stub answering a request for `url`, consuming the one-shot stub
    pub(crate) fn resolve(&mut self, url: &Url) -> Option<StubDescriptor> {
        if let Some(descriptor) = self.one_shot.take() {
            return Some(descriptor);
        }
        self.stubs
            .iter()
            .find(|(pattern, _)| pattern.matches(url))
            .map(|(_, descriptor)| descriptor.clone())
    }
}
