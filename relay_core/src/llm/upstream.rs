use crate::config::UpstreamConfig;
use crate::error::RelayError;
use crate::llm::adapter::{FragmentStream, UpstreamTransport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HeaderName, HeaderValue, LOCATION};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info, warn};
use url::Url;

/// Pooled HTTPS client bound to the configured upstream endpoint.
#[derive(Clone)]
pub struct HyperUpstream {
    url: Uri,
    headers: Vec<(HeaderName, HeaderValue)>,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, RelayError> {
        let url: Uri = config
            .url
            .parse()
            .map_err(|e| RelayError::Config(format!("upstream url {}: {}", config.url, e)))?;
        let headers = parse_headers(&config.headers)?;
        let roots = match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!("native tls roots unavailable ({}), using bundled roots", e);
                hyper_rustls::HttpsConnectorBuilder::new().with_webpki_roots()
            }
        };
        let connector = roots
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self {
            url,
            headers,
            client,
        })
    }
}

pub fn parse_headers(pairs: &[(String, String)]) -> Result<Vec<(HeaderName, HeaderValue)>, RelayError> {
    pairs
        .iter()
        .map(|(name, value)| {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RelayError::Config(format!("header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RelayError::Config(format!("header {} value: {}", name, e)))?;
            Ok((name, value))
        })
        .collect()
}

/// Redirect hops followed before giving up on an upstream request.
pub const MAX_REDIRECTS: usize = 10;

impl HyperUpstream {
    fn request(
        &self,
        method: &Method,
        uri: &Uri,
        body: Option<&Bytes>,
    ) -> Result<Request<Full<Bytes>>, RelayError> {
        let mut builder = Request::builder().method(method.clone()).uri(uri.clone());
        for (name, value) in &self.headers {
            if body.is_none() && *name == CONTENT_TYPE {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder
            .body(Full::new(body.cloned().unwrap_or_default()))
            .map_err(|e| RelayError::MalformedInput(e.to_string()))
    }
}

/// Resolves a `Location` header against the URI that produced it.
fn resolve_location(base: &Uri, location: &HeaderValue) -> Result<Uri, RelayError> {
    let location = location
        .to_str()
        .map_err(|e| RelayError::Transport(format!("redirect location: {}", e)))?;
    let base = Url::parse(&base.to_string())
        .map_err(|e| RelayError::Transport(format!("redirect base {}: {}", base, e)))?;
    let next = base
        .join(location)
        .map_err(|e| RelayError::Transport(format!("redirect location {}: {}", location, e)))?;
    next.as_str()
        .parse()
        .map_err(|e| RelayError::Transport(format!("redirect location {}: {}", next, e)))
}

#[async_trait]
impl UpstreamTransport for HyperUpstream {
    /// Redirects are followed up to [`MAX_REDIRECTS`] hops. 307 and 308 repeat the
    /// POST with the same body; 303, and 301/302 answering a POST, continue as a
    /// bodiless GET.
    async fn post_stream(&self, body: Bytes) -> Result<FragmentStream, RelayError> {
        let mut uri = self.url.clone();
        let mut method = Method::POST;
        let mut body = Some(body);
        let mut hops = 0;

        let res = loop {
            let req = self.request(&method, &uri, body.as_ref())?;
            info!("upstream request {} {}", method, uri);
            let res = self
                .client
                .request(req)
                .await
                .map_err(|e| RelayError::Transport(e.to_string()))?;
            let status = res.status();
            debug!("upstream responded {}", status);

            let location = match res.headers().get(LOCATION) {
                Some(location) if status.is_redirection() => location.clone(),
                _ => break res,
            };
            if hops == MAX_REDIRECTS {
                return Err(RelayError::Transport(format!(
                    "too many redirects, last was {} to {:?}",
                    status, location
                )));
            }
            hops += 1;
            let next = resolve_location(&uri, &location)?;
            if status == StatusCode::SEE_OTHER
                || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                    && method == Method::POST)
            {
                method = Method::GET;
                body = None;
            }
            info!("upstream redirected {} to {}", status, next);
            uri = next;
        };

        let status = res.status();
        if !status.is_success() {
            let body = res
                .into_body()
                .collect()
                .await
                .map_err(|e| RelayError::Transport(e.to_string()))?
                .to_bytes();
            return Err(RelayError::UpstreamHttp {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(res
            .into_body()
            .into_data_stream()
            .map_err(|e| RelayError::Transport(e.to_string()))
            .boxed())
    }
}
