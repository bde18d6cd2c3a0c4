use crate::config::{ClientConfig, ProxyConfig, opt_duration_secs};
use crate::cookie::{Cookie, CookieJar, upsert};
use crate::error::HttpError;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http_body_util::Full;
use parking_lot::Mutex;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

/// HTTP verbs supported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Put,
    Head,
    Post,
    Delete,
    Options,
    Patch,
}

impl Verb {
    pub const ALL: [Verb; 7] = [
        Verb::Get,
        Verb::Put,
        Verb::Head,
        Verb::Post,
        Verb::Delete,
        Verb::Options,
        Verb::Patch,
    ];

    #[must_use]
    pub fn as_method(self) -> http::Method {
        match self {
            Verb::Get => http::Method::GET,
            Verb::Put => http::Method::PUT,
            Verb::Head => http::Method::HEAD,
            Verb::Post => http::Method::POST,
            Verb::Delete => http::Method::DELETE,
            Verb::Options => http::Method::OPTIONS,
            Verb::Patch => http::Method::PATCH,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Put => "PUT",
            Verb::Head => "HEAD",
            Verb::Post => "POST",
            Verb::Delete => "DELETE",
            Verb::Options => "OPTIONS",
            Verb::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|verb| verb.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| HttpError::invalid_argument(format!("unsupported verb '{s}'"), s.to_owned()))
    }
}

/// A parameter value: one string or a list (`a=1&a=2`).
///
/// Scalars of any JSON type are accepted and rendered as strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    #[must_use]
    pub fn values(&self) -> &[String] {
        match self {
            OneOrMany::One(value) => std::slice::from_ref(value),
            OneOrMany::Many(values) => values,
        }
    }
}

impl From<&str> for OneOrMany {
    fn from(value: &str) -> Self {
        OneOrMany::One(value.to_owned())
    }
}

impl From<String> for OneOrMany {
    fn from(value: String) -> Self {
        OneOrMany::One(value)
    }
}

impl From<Vec<String>> for OneOrMany {
    fn from(values: Vec<String>) -> Self {
        OneOrMany::Many(values)
    }
}

impl Serialize for OneOrMany {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            OneOrMany::One(value) => serializer.serialize_str(value),
            OneOrMany::Many(values) => values.serialize(serializer),
        }
    }
}

struct ScalarVisitor;

impl Visitor<'_> for ScalarVisitor {
    type Value = String;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string, number or boolean")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
        Ok(v.to_owned())
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
        Ok(v)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
        Ok(v.to_string())
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<String, E> {
        Ok(v.to_string())
    }
}

struct Scalar(String);

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ScalarVisitor).map(Scalar)
    }
}

impl<'de> Deserialize<'de> for OneOrMany {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OneOrManyVisitor;

        impl<'de> Visitor<'de> for OneOrManyVisitor {
            type Value = OneOrMany;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scalar or a list of scalars")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<OneOrMany, E> {
                ScalarVisitor.visit_str(v).map(OneOrMany::One)
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<OneOrMany, E> {
                Ok(OneOrMany::One(v))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<OneOrMany, E> {
                ScalarVisitor.visit_bool(v).map(OneOrMany::One)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<OneOrMany, E> {
                ScalarVisitor.visit_i64(v).map(OneOrMany::One)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<OneOrMany, E> {
                ScalarVisitor.visit_u64(v).map(OneOrMany::One)
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<OneOrMany, E> {
                ScalarVisitor.visit_f64(v).map(OneOrMany::One)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<OneOrMany, A::Error> {
                let mut values = Vec::new();
                while let Some(Scalar(value)) = seq.next_element()? {
                    values.push(value);
                }
                Ok(OneOrMany::Many(values))
            }
        }

        deserializer.deserialize_any(OneOrManyVisitor)
    }
}

/// Query to merge into the request URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Query {
    /// Key to value(s); keys replace the same keys already in the URL
    Map(BTreeMap<String, OneOrMany>),
    /// URL-encoded string, decoded before merging
    Encoded(String),
}

/// Pre-built opaque request body, passed through unmodified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl Entity {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Basic credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    #[serde(alias = "username")]
    pub user: String,
    #[serde(alias = "pass", default)]
    pub password: String,
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Per-call options.
///
/// Usable both as a fluent builder and as a serde type for dynamic options:
///
/// ```ignore
/// use modkit_hydra::RequestOptions;
///
/// let opts = RequestOptions::new()
///     .header("x-request-id", "abc")
///     .param("q", "rust")
///     .socket_timeout(std::time::Duration::from_secs(2));
///
/// let same = RequestOptions::from_value(serde_json::json!({
///     "headers": { "x-request-id": "abc" },
///     "params": { "q": "rust" },
///     "socket_timeout": 2
/// }))?;
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    pub params: Option<BTreeMap<String, OneOrMany>>,
    pub body: Option<String>,
    #[serde(skip)]
    pub entity: Option<Entity>,
    pub query: Option<Query>,
    pub proxy: Option<ProxyConfig>,
    #[serde(with = "opt_duration_secs")]
    pub connect_timeout: Option<Duration>,
    #[serde(with = "opt_duration_secs")]
    pub socket_timeout: Option<Duration>,
    #[serde(with = "opt_duration_secs")]
    pub request_timeout: Option<Duration>,
    pub max_redirects: Option<usize>,
    pub follow_redirects: Option<bool>,
    pub auth: Option<Auth>,
    #[serde(rename = "async")]
    pub run_async: bool,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse dynamic options
    ///
    /// # Errors
    /// Returns `HttpError::Config` for unknown shapes, e.g. a query that is
    /// neither a map nor a string.
    pub fn from_value(value: serde_json::Value) -> Result<Self, HttpError> {
        Ok(serde_json::from_value(value)?)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<OneOrMany>) -> Self {
        self.params
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn entity(mut self, entity: Entity) -> Self {
        self.entity = Some(entity);
        self
    }

    #[must_use]
    pub fn query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<OneOrMany>) -> Self {
        let mut map = match self.query.take() {
            Some(Query::Map(map)) => map,
            _ => BTreeMap::new(),
        };
        map.insert(name.into(), value.into());
        self.query = Some(Query::Map(map));
        self
    }

    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = Some(max);
        self
    }

    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = Some(follow);
        self
    }

    #[must_use]
    pub fn auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Auth {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    /// Queue the call instead of running it
    #[must_use]
    pub fn run_async(mut self) -> Self {
        self.run_async = true;
        self
    }
}

/// Request body after precedence has been applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    Text(String),
    Form(String),
    Entity(Entity),
}

impl RequestBody {
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Text(text) | RequestBody::Form(text) => Bytes::from(text.clone()),
            RequestBody::Entity(entity) => entity.body.clone(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Text(text) | RequestBody::Form(text) => text.is_empty(),
            RequestBody::Entity(entity) => entity.body.is_empty(),
        }
    }
}

/// Effective per-request settings after folding overrides into client defaults
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub request_timeout: Duration,
    pub proxy: Option<Arc<ProxyConfig>>,
    pub max_redirects: usize,
    pub follow_redirects: bool,
}

impl Settings {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            socket_timeout: config.socket_timeout,
            request_timeout: config.request_timeout,
            proxy: config.proxy.clone().map(Arc::new),
            max_redirects: config.max_redirects,
            follow_redirects: config.follow_redirects,
        }
    }
}

/// Immutable request descriptor
#[derive(Debug, Clone)]
pub struct Request {
    verb: Verb,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
    settings: Settings,
}

/// Narrowest charset able to carry `text` without transcoding
fn narrowest_charset(text: &str) -> &'static str {
    if text.is_ascii() { "ISO-8859-1" } else { "UTF-8" }
}

impl Request {
    /// Build a descriptor from a verb, URL and per-call options
    ///
    /// # Errors
    /// `InvalidArgument` for malformed URLs and headers, `Config` for
    /// unusable options.
    pub(crate) fn build(
        verb: Verb,
        url: &str,
        options: RequestOptions,
        defaults: &ClientConfig,
    ) -> Result<Self, HttpError> {
        let mut url = Url::parse(url)?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(HttpError::invalid_argument(
                    format!("unsupported scheme '{other}'"),
                    "only http:// and https:// URLs are supported",
                ));
            }
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(HttpError::invalid_argument(
                "missing host",
                format!("URL '{url}' has no host"),
            ));
        }

        if let Some(query) = options.query {
            merge_query(&mut url, query);
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }

        let supplied = [
            options.params.is_some(),
            options.body.is_some(),
            options.entity.is_some(),
        ];
        if supplied.iter().filter(|given| **given).count() > 1 {
            tracing::warn!(
                url = %url,
                "several of params, body and entity supplied; using params > body > entity"
            );
        }

        let body = if let Some(params) = options.params {
            let pairs: Vec<(&str, &str)> = params
                .iter()
                .flat_map(|(k, v)| v.values().iter().map(move |value| (k.as_str(), value.as_str())))
                .collect();
            let raw: String = pairs.iter().flat_map(|(k, v)| [*k, *v]).collect();
            let charset = narrowest_charset(&raw);
            set_default_header(
                &mut headers,
                header::CONTENT_TYPE,
                &format!("application/x-www-form-urlencoded; charset={charset}"),
            )?;
            RequestBody::Form(serde_urlencoded::to_string(&pairs)?)
        } else if let Some(text) = options.body {
            let charset = narrowest_charset(&text);
            set_default_header(
                &mut headers,
                header::CONTENT_TYPE,
                &format!("text/plain; charset={charset}"),
            )?;
            RequestBody::Text(text)
        } else if let Some(entity) = options.entity {
            if let Some(content_type) = &entity.content_type {
                set_default_header(&mut headers, header::CONTENT_TYPE, content_type)?;
            }
            RequestBody::Entity(entity)
        } else {
            RequestBody::Empty
        };

        if let Some(auth) = &options.auth
            && !headers.contains_key(header::AUTHORIZATION)
        {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", auth.user, auth.password));
            headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&format!("Basic {token}"))?);
        }

        if defaults.expect_continue && !body.is_empty() {
            headers.insert(header::EXPECT, HeaderValue::from_static("100-continue"));
        }

        let mut settings = Settings::from_config(defaults);
        if let Some(timeout) = options.connect_timeout {
            settings.connect_timeout = timeout;
        }
        if let Some(timeout) = options.socket_timeout {
            settings.socket_timeout = timeout;
        }
        if let Some(timeout) = options.request_timeout {
            settings.request_timeout = timeout;
        }
        if let Some(proxy) = options.proxy {
            settings.proxy = Some(Arc::new(proxy));
        }
        if let Some(max) = options.max_redirects {
            settings.max_redirects = max;
        }
        if let Some(follow) = options.follow_redirects {
            settings.follow_redirects = follow;
        }

        Ok(Self {
            verb,
            url,
            headers,
            body,
            settings,
        })
    }

    #[must_use]
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// Fully merged request URL
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Materialize an `http::Request` carrying the per-request context
    pub(crate) fn to_http(
        &self,
        cookie_jar: Option<Arc<CookieJar>>,
    ) -> Result<(http::Request<Full<Bytes>>, Arc<Exchange>), HttpError> {
        let exchange = Arc::new(Exchange::default());
        let mut builder = http::Request::builder()
            .method(self.verb.as_method())
            .uri(self.url.as_str());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers.clone());
        }
        let context = RequestContext {
            settings: self.settings.clone(),
            cookie_jar,
            exchange: Arc::clone(&exchange),
        };
        let request = builder
            .extension(context)
            .body(Full::new(self.body.to_bytes()))?;
        Ok((request, exchange))
    }
}

fn set_default_header(headers: &mut HeaderMap, name: HeaderName, value: &str) -> Result<(), HttpError> {
    if !headers.contains_key(&name) {
        headers.insert(name, HeaderValue::from_str(value)?);
    }
    Ok(())
}

/// Merge `query` into `url`; caller keys replace existing ones, new keys are appended
fn merge_query(url: &mut Url, query: Query) {
    let incoming: Vec<(String, String)> = match query {
        Query::Map(map) => map
            .into_iter()
            .flat_map(|(k, v)| v.values().iter().map(|value| (k.clone(), value.clone())).collect::<Vec<_>>())
            .collect(),
        Query::Encoded(encoded) => url::form_urlencoded::parse(encoded.trim_start_matches('?').as_bytes())
            .into_owned()
            .collect(),
    };
    if incoming.is_empty() {
        return;
    }

    let mut merged: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .filter(|(k, _)| !incoming.iter().any(|(key, _)| key == k))
        .collect();
    merged.extend(incoming);

    url.query_pairs_mut().clear().extend_pairs(merged);
}

/// Per-exchange observations shared between the transport stack and the response
#[derive(Debug, Default)]
pub(crate) struct Exchange {
    final_url: Mutex<Option<Url>>,
    retries: AtomicUsize,
    cookies: Mutex<Vec<Cookie>>,
}

impl Exchange {
    pub(crate) fn set_final_url(&self, url: Url) {
        *self.final_url.lock() = Some(url);
    }

    pub(crate) fn final_url(&self) -> Option<Url> {
        self.final_url.lock().clone()
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retries(&self) -> usize {
        self.retries.load(Ordering::Relaxed)
    }

    pub(crate) fn record_cookie(&self, cookie: Cookie) {
        upsert(&mut self.cookies.lock(), cookie);
    }

    pub(crate) fn cookies(&self) -> Vec<Cookie> {
        self.cookies.lock().clone()
    }
}

/// Request extension read by the layers and the pooled transport
#[derive(Debug, Clone)]
pub(crate) struct RequestContext {
    pub settings: Settings,
    pub cookie_jar: Option<Arc<CookieJar>>,
    pub exchange: Arc<Exchange>,
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(verb: Verb, url: &str, options: RequestOptions) -> Result<Request, HttpError> {
        Request::build(verb, url, options, &ClientConfig::default())
    }

    #[test]
    fn test_verb_mapping() {
        for verb in Verb::ALL {
            assert_eq!(verb.as_method().as_str(), verb.as_str());
            assert_eq!(verb.as_str().to_lowercase().parse::<Verb>().unwrap(), verb);
        }
        assert!("TRACE".parse::<Verb>().is_err());
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = build(Verb::Get, "ftp://example.com/file", RequestOptions::new()).unwrap_err();
        assert!(matches!(err, HttpError::InvalidArgument { .. }));

        let err = build(Verb::Get, "not a url", RequestOptions::new()).unwrap_err();
        assert!(matches!(err, HttpError::InvalidArgument { .. }));
    }

    #[test]
    fn test_query_map_overrides_existing_keys() {
        let req = build(
            Verb::Get,
            "http://localhost/search?a=1&b=2",
            RequestOptions::new().query_param("b", "3").query_param("c", "4"),
        )
        .unwrap();
        assert_eq!(req.url().query(), Some("a=1&b=3&c=4"));
    }

    #[test]
    fn test_query_string_is_decoded_before_merge() {
        let req = build(
            Verb::Get,
            "http://localhost/?a=1",
            RequestOptions::new().query(Query::Encoded("a=x%20y&d=1&d=2".to_owned())),
        )
        .unwrap();
        let pairs: Vec<(String, String)> = req.url().query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("a".to_owned(), "x y".to_owned()),
                ("d".to_owned(), "1".to_owned()),
                ("d".to_owned(), "2".to_owned()),
            ]
        );
    }

    #[test]
    fn test_non_map_query_is_config_error() {
        let err = RequestOptions::from_value(json!({ "query": 42 })).unwrap_err();
        assert!(matches!(err, HttpError::Config(_)));
    }

    #[test]
    fn test_params_are_form_encoded_with_narrow_charset() {
        let req = build(Verb::Post, "http://localhost/", RequestOptions::new().param("k", "v w")).unwrap();
        assert_eq!(req.body(), &RequestBody::Form("k=v+w".to_owned()));
        assert_eq!(
            req.headers()[header::CONTENT_TYPE],
            "application/x-www-form-urlencoded; charset=ISO-8859-1"
        );

        let req = build(Verb::Post, "http://localhost/", RequestOptions::new().param("k", "ü")).unwrap();
        assert_eq!(
            req.headers()[header::CONTENT_TYPE],
            "application/x-www-form-urlencoded; charset=UTF-8"
        );
    }

    #[test]
    fn test_text_body_charset() {
        let req = build(Verb::Put, "http://localhost/", RequestOptions::new().body("plain")).unwrap();
        assert_eq!(req.headers()[header::CONTENT_TYPE], "text/plain; charset=ISO-8859-1");

        let req = build(Verb::Put, "http://localhost/", RequestOptions::new().body("日本")).unwrap();
        assert_eq!(req.headers()[header::CONTENT_TYPE], "text/plain; charset=UTF-8");
        assert_eq!(req.body().to_bytes(), Bytes::from("日本"));
    }

    #[test]
    fn test_body_precedence() {
        let options = RequestOptions::new()
            .body("text")
            .entity(Entity::new("raw").with_content_type("application/octet-stream"))
            .param("p", "1");
        let req = build(Verb::Post, "http://localhost/", options).unwrap();
        assert!(matches!(req.body(), RequestBody::Form(_)));

        let options = RequestOptions::new()
            .body("text")
            .entity(Entity::new("raw"));
        let req = build(Verb::Post, "http://localhost/", options).unwrap();
        assert_eq!(req.body(), &RequestBody::Text("text".to_owned()));
    }

    #[test]
    fn test_entity_passes_through() {
        let entity = Entity::new(vec![0_u8, 159, 146, 150]).with_content_type("application/octet-stream");
        let req = build(Verb::Post, "http://localhost/", RequestOptions::new().entity(entity.clone())).unwrap();
        assert_eq!(req.body().to_bytes(), entity.body);
        assert_eq!(req.headers()[header::CONTENT_TYPE], "application/octet-stream");
    }

    #[test]
    fn test_caller_content_type_wins() {
        let options = RequestOptions::new()
            .header("content-type", "application/json")
            .body("{}");
        let req = build(Verb::Post, "http://localhost/", options).unwrap();
        assert_eq!(req.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_auth_aliases_and_header() {
        let options = RequestOptions::from_value(json!({
            "auth": { "username": "user", "pass": "secret" }
        }))
        .unwrap();
        let req = build(Verb::Get, "http://localhost/", options).unwrap();
        assert_eq!(req.headers()[header::AUTHORIZATION], "Basic dXNlcjpzZWNyZXQ=");
    }

    #[test]
    fn test_overrides_fold_into_defaults() {
        let options = RequestOptions::from_value(json!({
            "socket_timeout": 1.5,
            "max_redirects": 1,
            "follow_redirects": false,
            "proxy": "proxy:3128",
            "async": true
        }))
        .unwrap();
        assert!(options.run_async);

        let req = build(Verb::Get, "http://localhost/", options).unwrap();
        let settings = req.settings();
        assert_eq!(settings.socket_timeout, Duration::from_millis(1500));
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.max_redirects, 1);
        assert!(!settings.follow_redirects);
        assert_eq!(settings.proxy.as_deref(), Some(&ProxyConfig::new("proxy", 3128)));
    }

    #[test]
    fn test_expect_continue_only_with_body() {
        let config = ClientConfig {
            expect_continue: true,
            ..ClientConfig::default()
        };
        let req = Request::build(Verb::Post, "http://localhost/", RequestOptions::new().body("x"), &config).unwrap();
        assert_eq!(req.headers()[header::EXPECT], "100-continue");

        let req = Request::build(Verb::Get, "http://localhost/", RequestOptions::new(), &config).unwrap();
        assert!(!req.headers().contains_key(header::EXPECT));
    }

    #[test]
    fn test_params_accept_scalars_and_lists() {
        let options = RequestOptions::from_value(json!({
            "params": { "n": 1, "flag": true, "tags": ["a", "b"] }
        }))
        .unwrap();
        let req = build(Verb::Post, "http://localhost/", options).unwrap();
        assert_eq!(req.body(), &RequestBody::Form("flag=true&n=1&tags=a&tags=b".to_owned()));
    }

    #[test]
    fn test_to_http_carries_context() {
        let req = build(Verb::Delete, "http://localhost/x", RequestOptions::new()).unwrap();
        let (http_req, exchange) = req.to_http(None).unwrap();
        assert_eq!(http_req.method(), http::Method::DELETE);
        let ctx = http_req.extensions().get::<RequestContext>().unwrap();
        assert!(Arc::ptr_eq(&ctx.exchange, &exchange));
        assert_eq!(exchange.retries(), 0);
    }
}
