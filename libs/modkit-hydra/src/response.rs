use crate::client::{Client, WeakClient};
use crate::cookie::{Cookie, group_by_name};
use crate::error::{HttpError, from_boxed};
use crate::request::{Exchange, Request};
use crate::stub::StubDescriptor;
use bytes::Bytes;
use encoding_rs::Encoding;
use http::header;
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::fmt;
use url::Url;

/// Type alias for the boxed response body that supports decompression.
///
/// This type can hold either a raw body or a decompressed body (gzip/br/deflate).
/// The body is type-erased to allow the decompression layer to work transparently.
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Where an unresolved response gets its data from
pub(crate) enum Source {
    Network(Client),
    /// Queued on the client's batch; must not keep the client alive
    Queued(WeakClient),
    Stub(StubDescriptor),
}

/// Status line, headers and exchange facts, known once resolved
#[derive(Debug, Clone)]
struct Head {
    code: u16,
    headers: HashMap<String, String>,
    final_url: Option<Url>,
    cookies: HashMap<String, Vec<Cookie>>,
    retries: usize,
}

impl Head {
    fn from_network(response: &http::Response<ResponseBody>, exchange: &Exchange, request_url: &Url) -> Self {
        let mut headers = HashMap::with_capacity(response.headers().len());
        for (name, value) in response.headers() {
            headers.insert(
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }
        Self {
            code: response.status().as_u16(),
            headers,
            final_url: Some(exchange.final_url().unwrap_or_else(|| request_url.clone())),
            cookies: group_by_name(&exchange.cookies()),
            retries: exchange.retries(),
        }
    }

    fn from_stub(descriptor: &StubDescriptor, request_url: Option<&Url>) -> Self {
        let mut headers = HashMap::with_capacity(descriptor.headers.len() + 1);
        let mut cookies = descriptor.cookies.clone();
        for (name, values) in &descriptor.headers {
            let name = name.to_ascii_lowercase();
            if name == header::SET_COOKIE.as_str() {
                cookies.extend(
                    values
                        .values()
                        .iter()
                        .filter_map(|v| Cookie::parse(v, request_url)),
                );
            }
            if let Some(last) = values.values().last() {
                headers.insert(name, last.clone());
            }
        }
        headers
            .entry(header::CONTENT_LENGTH.as_str().to_owned())
            .or_insert_with(|| descriptor.body.len().to_string());

        Self {
            code: descriptor.code,
            headers,
            final_url: request_url.cloned(),
            cookies: group_by_name(&cookies),
            retries: 0,
        }
    }
}

/// Body side of the response state machine
enum State {
    /// Nothing fetched yet
    Unresolved(Source),
    /// Head received, body still on the wire (holds the pooled connection)
    Streaming { body: ResponseBody, client: Client },
    /// Body read and cached
    Resolved(Bytes),
    /// Body dropped unread or consumed by [`Response::each_chunk`]
    Released,
    /// Reading the body failed; later reads report the same fault
    Failed(HttpError),
}

/// Lazily resolved HTTP response.
///
/// Nothing touches the network until a result is observed (`code`,
/// `headers`, `body`, ...). The body is cached after the first read.
/// Responses handed to a handler release their connection when the handler
/// returns; reading the body afterwards fails with
/// [`HttpError::StreamClosed`] unless the handler read it.
pub struct Response {
    request: Option<Request>,
    stubbed: bool,
    head: Option<Head>,
    state: State,
}

impl Response {
    pub(crate) fn new(request: Request, source: Source) -> Self {
        Self {
            stubbed: matches!(source, Source::Stub(_)),
            request: Some(request),
            head: None,
            state: State::Unresolved(source),
        }
    }

    pub(crate) fn stubbed(request: Option<Request>, descriptor: StubDescriptor) -> Self {
        Self {
            request,
            stubbed: true,
            head: None,
            state: State::Unresolved(Source::Stub(descriptor)),
        }
    }

    /// Request descriptor this response answers; `None` for stand-alone stubs
    #[must_use]
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// Whether the response came from a stub instead of the network
    #[must_use]
    pub fn is_stubbed(&self) -> bool {
        self.stubbed
    }

    /// Whether the request has been executed
    #[must_use]
    pub fn is_called(&self) -> bool {
        !matches!(self.state, State::Unresolved(_))
    }

    fn resolve(&mut self) -> Result<&Head, HttpError> {
        if let State::Unresolved(source) = &self.state {
            let (head, state) = match source {
                Source::Stub(descriptor) => {
                    let url = self.request.as_ref().map(Request::url);
                    let head = Head::from_stub(descriptor, url);
                    (head, State::Resolved(Bytes::from(descriptor.body.clone())))
                }
                Source::Network(client) => self.fetch(client.clone())?,
                Source::Queued(weak) => self.fetch(weak.upgrade().ok_or(HttpError::ClientStopped)?)?,
            };
            tracing::trace!(code = head.code, stubbed = self.stubbed, "response resolved");
            self.head = Some(head);
            self.state = state;
        }
        self.head
            .as_ref()
            .ok_or_else(|| HttpError::Unknown("response head missing after resolution".into()))
    }

    fn fetch(&self, client: Client) -> Result<(Head, State), HttpError> {
        let request = self
            .request
            .as_ref()
            .ok_or_else(|| HttpError::Unknown("network response without a request".into()))?;
        let (response, exchange) = client.fetch(request)?;
        let head = Head::from_network(&response, &exchange, request.url());
        let state = State::Streaming {
            body: response.into_body(),
            client,
        };
        Ok((head, state))
    }

    /// Execute the request now, if it has not run yet
    ///
    /// # Errors
    /// The classified transport fault, if the request fails.
    pub fn call(&mut self) -> Result<&mut Self, HttpError> {
        self.resolve()?;
        Ok(self)
    }

    /// Execute the request and hand the response to `handler`.
    ///
    /// The connection is released when the handler returns, so a body the
    /// handler did not read can no longer be read.
    ///
    /// # Errors
    /// The classified transport fault, if the request fails; the handler
    /// then does not run.
    pub fn call_with<R>(&mut self, handler: impl FnOnce(&mut Response) -> R) -> Result<R, HttpError> {
        self.resolve()?;
        let result = handler(self);
        self.release();
        Ok(result)
    }

    /// Drop an unread body and its connection
    pub fn release(&mut self) {
        if matches!(self.state, State::Streaming { .. }) {
            tracing::trace!("releasing unread response body");
            self.state = State::Released;
        }
    }

    /// Status code
    ///
    /// # Errors
    /// The classified transport fault, if the request fails.
    pub fn code(&mut self) -> Result<u16, HttpError> {
        Ok(self.resolve()?.code)
    }

    /// Headers with lower-cased names; for repeated headers the last value wins
    ///
    /// # Errors
    /// The classified transport fault, if the request fails.
    pub fn headers(&mut self) -> Result<&HashMap<String, String>, HttpError> {
        Ok(&self.resolve()?.headers)
    }

    /// `Content-Length` value, or -1 when absent
    ///
    /// # Errors
    /// The classified transport fault, if the request fails.
    pub fn length(&mut self) -> Result<i64, HttpError> {
        Ok(self
            .resolve()?
            .headers
            .get(header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(-1))
    }

    /// URL of the last hop of the redirect chain
    ///
    /// # Errors
    /// The classified transport fault, if the request fails.
    pub fn final_url(&mut self) -> Result<Option<&Url>, HttpError> {
        Ok(self.resolve()?.final_url.as_ref())
    }

    /// Cookies set by the server, by name
    ///
    /// # Errors
    /// The classified transport fault, if the request fails.
    pub fn cookies(&mut self) -> Result<&HashMap<String, Vec<Cookie>>, HttpError> {
        Ok(&self.resolve()?.cookies)
    }

    /// How many times the request was transparently retried
    ///
    /// # Errors
    /// The classified transport fault, if the request fails.
    pub fn times_retried(&mut self) -> Result<usize, HttpError> {
        Ok(self.resolve()?.retries)
    }

    /// Full body, read once and cached
    ///
    /// # Errors
    /// `StreamClosed` if the body was released unread; otherwise the
    /// classified fault of the request or the body read.
    pub fn body(&mut self) -> Result<Bytes, HttpError> {
        self.resolve()?;
        match std::mem::replace(&mut self.state, State::Released) {
            State::Resolved(bytes) => {
                self.state = State::Resolved(bytes.clone());
                Ok(bytes)
            }
            State::Streaming { body, client } => {
                let read = client
                    .block_on(async move {
                        body.collect()
                            .await
                            .map(http_body_util::Collected::to_bytes)
                            .map_err(from_boxed)
                    })
                    .and_then(std::convert::identity);
                match read {
                    Ok(bytes) => {
                        self.state = State::Resolved(bytes.clone());
                        Ok(bytes)
                    }
                    Err(e) => Err(self.fail(e)),
                }
            }
            State::Released => Err(stream_closed("the response stream was already released")),
            State::Failed(fault) => Err(self.fail(fault)),
            unresolved @ State::Unresolved(_) => {
                self.state = unresolved;
                Err(HttpError::Unknown("response not resolved".into()))
            }
        }
    }

    /// Remember a body fault and hand it out again
    fn fail(&mut self, fault: HttpError) -> HttpError {
        self.state = State::Failed(fault.replay());
        fault
    }

    /// Body decoded with the charset named by `Content-Type`.
    ///
    /// `text/*` bodies without a known charset are taken as ISO-8859-1;
    /// anything else defaults to UTF-8.
    ///
    /// # Errors
    /// Same as [`Response::body`].
    pub fn text(&mut self) -> Result<String, HttpError> {
        let content_type = self
            .resolve()?
            .headers
            .get(header::CONTENT_TYPE.as_str())
            .cloned();
        let bytes = self.body()?;
        Ok(decode_text(content_type.as_deref(), &bytes))
    }

    /// Stream the body chunk by chunk without caching it.
    ///
    /// A cached body is handed over as a single chunk. A streamed body
    /// cannot be read again.
    ///
    /// # Errors
    /// Same as [`Response::body`].
    pub fn each_chunk(&mut self, mut on_chunk: impl FnMut(Bytes)) -> Result<(), HttpError> {
        self.resolve()?;
        match std::mem::replace(&mut self.state, State::Released) {
            State::Resolved(bytes) => {
                if !bytes.is_empty() {
                    on_chunk(bytes.clone());
                }
                self.state = State::Resolved(bytes);
                Ok(())
            }
            State::Streaming { mut body, client } => loop {
                let frame = match client.block_on(body.frame()) {
                    Ok(frame) => frame,
                    Err(e) => return Err(self.fail(e)),
                };
                match frame {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(self.fail(from_boxed(e))),
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            on_chunk(data);
                        }
                    }
                }
            },
            State::Released => Err(stream_closed("the response stream was already released")),
            State::Failed(fault) => Err(self.fail(fault)),
            unresolved @ State::Unresolved(_) => {
                self.state = unresolved;
                Err(HttpError::Unknown("response not resolved".into()))
            }
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Unresolved(_) => "unresolved",
            State::Streaming { .. } => "streaming",
            State::Resolved(_) => "resolved",
            State::Released => "released",
            State::Failed(_) => "failed",
        };
        f.debug_struct("Response")
            .field("url", &self.request.as_ref().map(|r| r.url().as_str()))
            .field("stubbed", &self.stubbed)
            .field("code", &self.head.as_ref().map(|h| h.code))
            .field("state", &state)
            .finish()
    }
}

fn stream_closed(message: &str) -> HttpError {
    HttpError::StreamClosed {
        message: message.to_owned(),
    }
}

fn charset_of(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

fn decode_text(content_type: Option<&str>, bytes: &[u8]) -> String {
    let label = content_type.and_then(charset_of);
    if let Some(encoding) = label.and_then(|l| Encoding::for_label(l.as_bytes())) {
        let (text, _, _) = encoding.decode(bytes);
        return text.into_owned();
    }
    let textual = content_type.is_some_and(|ct| {
        ct.trim_start()
            .get(..5)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("text/"))
    });
    if textual {
        if let Some(label) = label {
            tracing::debug!(charset = label, "unknown response charset, decoding as ISO-8859-1");
        }
        encoding_rs::mem::decode_latin1(bytes).into_owned()
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}
