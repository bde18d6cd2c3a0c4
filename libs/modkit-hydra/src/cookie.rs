//! Cookies and the cookie jar.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use url::Url;

/// One HTTP cookie.
///
/// `secure` and `persistent` are tri-state: `None` means the value was not
/// stated, which differs from an explicit `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default)]
    pub persistent: Option<bool>,
    #[serde(default, with = "expires_format")]
    pub expires: Option<SystemTime>,
}

/// Caller-supplied cookie attributes for [`Cookie::from_descriptor`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieDescriptor {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: Option<bool>,
    pub persistent: Option<bool>,
    /// Lifetime in seconds from now
    pub max_age: Option<u64>,
}

impl Cookie {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            secure: None,
            persistent: None,
            expires: None,
        }
    }

    #[must_use]
    pub fn from_descriptor(descriptor: CookieDescriptor) -> Self {
        let expires = descriptor
            .max_age
            .map(|secs| SystemTime::now() + Duration::from_secs(secs));
        Self {
            name: descriptor.name,
            value: descriptor.value,
            path: descriptor.path,
            domain: descriptor.domain.map(|d| normalize_domain(&d)),
            secure: descriptor.secure,
            persistent: descriptor.persistent.or(expires.map(|_| true)),
            expires,
        }
    }

    /// Parse one `Set-Cookie` header value.
    ///
    /// Unknown attributes are ignored. Domain and path default from
    /// `request_url` when it is given. Returns `None` when the header has no
    /// `name=value` pair.
    #[must_use]
    pub fn parse(header: &str, request_url: Option<&Url>) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie::new(name, value.trim().trim_matches('"'));
        let mut max_age: Option<i64> = None;
        let mut expires: Option<SystemTime> = None;
        let mut secure = false;

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (attr.trim(), None),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => {
                    if let Some(domain) = val.filter(|d| !d.is_empty()) {
                        cookie.domain = Some(normalize_domain(domain));
                    }
                }
                "path" => {
                    if let Some(path) = val.filter(|p| p.starts_with('/')) {
                        cookie.path = Some(path.to_owned());
                    }
                }
                "max-age" => max_age = val.and_then(|v| v.parse().ok()),
                "expires" => expires = val.and_then(|v| httpdate::parse_http_date(v).ok()),
                "secure" => secure = true,
                _ => {}
            }
        }

        // Max-Age wins over Expires
        cookie.expires = match max_age {
            Some(secs) if secs <= 0 => Some(SystemTime::UNIX_EPOCH),
            Some(secs) => Some(SystemTime::now() + Duration::from_secs(secs.unsigned_abs())),
            None => expires,
        };
        cookie.persistent = Some(cookie.expires.is_some());
        cookie.secure = Some(secure);

        if let Some(url) = request_url {
            if cookie.domain.is_none() {
                cookie.domain = url.host_str().map(normalize_domain);
            }
            if cookie.path.is_none() {
                cookie.path = Some(default_path(url));
            }
        }

        Some(cookie)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires.is_some_and(|at| at <= SystemTime::now())
    }

    /// Whether this cookie should be sent with a request to `url`
    #[must_use]
    pub fn matches(&self, url: &Url) -> bool {
        if self.is_expired() {
            return false;
        }
        if self.secure == Some(true) && url.scheme() != "https" {
            return false;
        }
        if let Some(domain) = &self.domain {
            let Some(host) = url.host_str() else {
                return false;
            };
            let host = host.to_ascii_lowercase();
            let domain_match = host == *domain
                || (host.ends_with(domain.as_str())
                    && host.as_bytes().get(host.len() - domain.len() - 1) == Some(&b'.'));
            if !domain_match {
                return false;
            }
        }
        match &self.path {
            Some(path) => path_matches(url.path(), path),
            None => true,
        }
    }

    fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_start_matches('.').to_ascii_lowercase()
}

/// Directory of the request path, per RFC 6265 section 5.1.4
fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => path[..idx].to_owned(),
    }
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

/// Group cookies by name, keeping every distinct path/domain entry
#[must_use]
pub fn group_by_name(cookies: &[Cookie]) -> HashMap<String, Vec<Cookie>> {
    let mut grouped: HashMap<String, Vec<Cookie>> = HashMap::new();
    for cookie in cookies {
        grouped.entry(cookie.name.clone()).or_default().push(cookie.clone());
    }
    grouped
}

/// Insert `cookie`, replacing an earlier cookie with the same name, domain and path
pub(crate) fn upsert(cookies: &mut Vec<Cookie>, cookie: Cookie) {
    match cookies.iter_mut().find(|c| c.same_slot(&cookie)) {
        Some(existing) => *existing = cookie,
        None => cookies.push(cookie),
    }
}

/// Thread-safe cookie store.
///
/// Concurrent requests sharing a jar mutate it under a lock; the order in
/// which concurrent responses land is up to the caller.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<Cookie>>,
}

impl CookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cookie; an already expired cookie deletes its slot
    pub fn store(&self, cookie: Cookie) {
        let mut cookies = self.cookies.lock();
        if cookie.is_expired() {
            cookies.retain(|c| !c.same_slot(&cookie));
        } else {
            upsert(&mut cookies, cookie);
        }
    }

    /// `Cookie` header value for a request to `url`, if any cookie applies.
    ///
    /// Longer paths are listed first.
    #[must_use]
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let mut cookies = self.cookies.lock();
        cookies.retain(|c| !c.is_expired());

        let mut matching: Vec<&Cookie> = cookies.iter().filter(|c| c.matches(url)).collect();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by_key(|c| std::cmp::Reverse(c.path.as_ref().map_or(0, String::len)));
        Some(
            matching
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Snapshot of the live cookies
    #[must_use]
    pub fn cookies(&self) -> Vec<Cookie> {
        self.cookies
            .lock()
            .iter()
            .filter(|c| !c.is_expired())
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.cookies.lock().clear();
    }
}

mod expires_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::SystemTime;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.serialize_str(&httpdate::fmt_http_date(*at)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<SystemTime>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| httpdate::parse_http_date(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_parse_minimal_cookie_defaults_from_request() {
        let cookie = Cookie::parse("x=1", Some(&url("http://Example.com/a/b"))).unwrap();
        assert_eq!(cookie.name, "x");
        assert_eq!(cookie.value, "1");
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
        assert_eq!(cookie.path.as_deref(), Some("/a"));
        assert_eq!(cookie.secure, Some(false));
        assert_eq!(cookie.persistent, Some(false));
    }

    #[test]
    fn test_parse_attributes() {
        let cookie = Cookie::parse(
            "session=abc; Domain=.example.com; Path=/api; Secure; HttpOnly; Max-Age=3600",
            None,
        )
        .unwrap();
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
        assert_eq!(cookie.path.as_deref(), Some("/api"));
        assert_eq!(cookie.secure, Some(true));
        assert_eq!(cookie.persistent, Some(true));
        assert!(!cookie.is_expired());
    }

    #[test]
    fn test_parse_expires_in_past() {
        let cookie = Cookie::parse("gone=1; Expires=Thu, 01 Jan 1970 00:00:10 GMT", None).unwrap();
        assert_eq!(cookie.persistent, Some(true));
        assert!(cookie.is_expired());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Cookie::parse("novalue", None).is_none());
        assert!(Cookie::parse("=1", None).is_none());
    }

    #[test]
    fn test_descriptor_leaves_flags_unspecified() {
        let cookie = Cookie::from_descriptor(CookieDescriptor {
            name: "a".into(),
            value: "b".into(),
            ..Default::default()
        });
        assert_eq!(cookie.secure, None);
        assert_eq!(cookie.persistent, None);
    }

    #[test]
    fn test_matching_rules() {
        let cookie = Cookie::parse("a=1; Domain=example.com; Path=/docs; Secure", None).unwrap();
        assert!(cookie.matches(&url("https://www.example.com/docs/x")));
        assert!(cookie.matches(&url("https://example.com/docs")));
        assert!(!cookie.matches(&url("http://example.com/docs")));
        assert!(!cookie.matches(&url("https://example.com/documents")));
        assert!(!cookie.matches(&url("https://badexample.com/docs")));
    }

    #[test]
    fn test_jar_replaces_same_slot_and_keeps_distinct_paths() {
        let jar = CookieJar::new();
        let origin = url("http://localhost/");
        jar.store(Cookie::parse("n=1; Path=/", Some(&origin)).unwrap());
        jar.store(Cookie::parse("n=2; Path=/", Some(&origin)).unwrap());
        jar.store(Cookie::parse("n=3; Path=/deep", Some(&origin)).unwrap());

        assert_eq!(jar.cookies().len(), 2);
        assert_eq!(jar.header_for(&url("http://localhost/")).as_deref(), Some("n=2"));
        assert_eq!(
            jar.header_for(&url("http://localhost/deep/x")).as_deref(),
            Some("n=3; n=2")
        );

        let grouped = group_by_name(&jar.cookies());
        assert_eq!(grouped["n"].len(), 2);
    }

    #[test]
    fn test_jar_expired_cookie_deletes() {
        let jar = CookieJar::new();
        let origin = url("http://localhost/");
        jar.store(Cookie::parse("n=1; Path=/", Some(&origin)).unwrap());
        jar.store(Cookie::parse("n=; Path=/; Max-Age=0", Some(&origin)).unwrap());
        assert!(jar.header_for(&origin).is_none());
    }

    #[test]
    fn test_cookie_serde_roundtrip_preserves_tristate() {
        let cookie = Cookie::new("a", "b");
        let json = serde_json::to_value(&cookie).unwrap();
        assert!(json["secure"].is_null());
        let back: Cookie = serde_json::from_value(json).unwrap();
        assert_eq!(back, cookie);
    }
}
