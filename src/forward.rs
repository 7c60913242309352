use crate::body::{full, pipe_body, ProxyBody};
use crate::tls::install_crypto_provider;
use http::request::Parts;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HOST};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use tracing::warn;

/// Outbound client shared by the forward engine and the decoy.
///
/// Keeps idle connections for reuse, never follows redirects and speaks
/// both `http` and `https` targets.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

pub fn http_client() -> HttpClient {
    install_crypto_provider();
    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Client::builder(TokioExecutor::new()).build(https)
}

/// Forwards authorized non-CONNECT requests to the target named in their URI
#[derive(Clone)]
pub struct ForwardEngine {
    client: HttpClient,
}

impl ForwardEngine {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    /// Send `req` on and stream the answer back.
    ///
    /// Status and headers are copied verbatim; both bodies go through a
    /// bounded pipe. A transport failure becomes `502` with the error text.
    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        if parts.version == Version::HTTP_2 {
            if let Some(uri) = absolute_uri(&parts) {
                parts.uri = uri;
            }
        }
        // The outbound version is negotiated per connection, not inherited
        parts.version = Version::HTTP_11;

        let uri = parts.uri.clone();
        let outbound = Request::from_parts(parts, pipe_body(body, "request body"));

        match self.client.request(outbound).await {
            Ok(resp) => {
                let (parts, body) = resp.into_parts();
                let mut response = Response::new(pipe_body(body, "response body"));
                *response.status_mut() = parts.status;
                copy_headers(response.headers_mut(), &parts.headers);
                response
            }
            Err(e) => {
                let message = error_chain(&e);
                warn!("forward {} failed: {}", uri, message);
                let mut response = Response::new(full(message));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }
}

/// Rebuild an HTTP/2 request target as `http://{authority}{path}`
fn absolute_uri(parts: &Parts) -> Option<Uri> {
    let authority = match parts.uri.authority() {
        Some(authority) => authority.as_str().to_string(),
        None => parts.headers.get(HOST)?.to_str().ok()?.to_string(),
    };
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme("http")
        .authority(authority)
        .path_and_query(path)
        .build()
        .ok()
}

/// Append every value of every header, keeping repeated names
fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}

/// Render an error with its sources, `outer: inner: root`
pub(crate) fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
