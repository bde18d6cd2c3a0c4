use crate::cookie::Cookie;
use crate::error::HttpError;
use crate::response::ResponseBody;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, header};
use http_body_util::Full;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use url::Url;

/// Tower layer attaching jar cookies to requests and recording `Set-Cookie`
///
/// The jar comes from the per-request context, so shared, per-request and
/// disabled cookie modes all run through the same layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CookieLayer;

impl<S> Layer<S> for CookieLayer {
    type Service = CookieService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CookieService { inner }
    }
}

/// Service attaching and recording cookies
#[derive(Debug, Clone)]
pub struct CookieService<S> {
    inner: S,
}

impl<S> Service<Request<Full<Bytes>>> for CookieService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResponseBody>, Error = HttpError>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Full<Bytes>>) -> Self::Future {
        let context = super::context(&req).cloned();
        let url = Url::parse(&req.uri().to_string()).ok();

        if let (Some(ctx), Some(url)) = (&context, &url)
            && let Some(jar) = &ctx.cookie_jar
            && !req.headers().contains_key(header::COOKIE)
            && let Some(value) = jar.header_for(url)
        {
            match HeaderValue::from_str(&value) {
                Ok(value) => {
                    req.headers_mut().insert(header::COOKIE, value);
                }
                Err(e) => tracing::debug!(error = %e, "skipping unencodable cookie header"),
            }
        }

        let fut = self.inner.call(req);
        Box::pin(async move {
            let response = fut.await?;
            if let Some(ctx) = context {
                for value in response.headers().get_all(header::SET_COOKIE) {
                    let Ok(value) = value.to_str() else {
                        continue;
                    };
                    let Some(cookie) = Cookie::parse(value, url.as_ref()) else {
                        tracing::debug!(set_cookie = value, "ignoring malformed Set-Cookie");
                        continue;
                    };
                    if let Some(jar) = &ctx.cookie_jar {
                        jar.store(cookie.clone());
                    }
                    ctx.exchange.record_cookie(cookie);
                }
            }
            Ok(response)
        })
    }
}
