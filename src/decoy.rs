use crate::body::{empty, ProxyBody};
use crate::forward::{error_chain, HttpClient};
use crate::headers::HopByHopHeaders;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::{Request, Response, StatusCode, Uri, Version};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Reverse proxy to the decoy site.
///
/// Anything that is not an authorized proxy request lands here, so from the
/// outside the listener is indistinguishable from the upstream website.
#[derive(Clone)]
pub struct DecoyForwarder {
    upstream: Uri,
    client: HttpClient,
    hop_by_hop: Arc<HopByHopHeaders>,
}

impl DecoyForwarder {
    pub fn new(upstream: Uri, client: HttpClient, hop_by_hop: Arc<HopByHopHeaders>) -> Self {
        Self {
            upstream,
            client,
            hop_by_hop,
        }
    }

    pub async fn forward(&self, req: Request<Incoming>, client_addr: SocketAddr) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        // HTTP/2 carries the host only in the URI, which the rewrite replaces
        if !parts.headers.contains_key(HOST) {
            if let Some(host) = parts
                .uri
                .authority()
                .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
            {
                parts.headers.insert(HOST, host);
            }
        }

        parts.uri = match rewrite_uri(&self.upstream, &parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                warn!("http: proxy error: {}", e);
                return bad_gateway();
            }
        };
        parts.version = Version::HTTP_11;
        self.hop_by_hop.strip_with_connection_tokens(&mut parts.headers);
        append_forwarded_for(&mut parts.headers, client_addr.ip());

        match self.client.request(Request::from_parts(parts, body.boxed())).await {
            Ok(resp) => {
                let (mut parts, body) = resp.into_parts();
                self.hop_by_hop.strip_with_connection_tokens(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!("http: proxy error: {}", error_chain(&e));
                bad_gateway()
            }
        }
    }
}

fn bad_gateway() -> Response<ProxyBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}

/// Point `uri` at the upstream: its scheme and authority, the two paths
/// joined with a single slash, and both query strings kept.
fn rewrite_uri(upstream: &Uri, uri: &Uri) -> Result<Uri, http::Error> {
    let path = join_paths(upstream.path(), uri.path());
    let path_and_query = match (upstream.query(), uri.query()) {
        (Some(base), Some(query)) if !base.is_empty() && !query.is_empty() => {
            format!("{}?{}&{}", path, base, query)
        }
        (Some(query), _) | (_, Some(query)) if !query.is_empty() => format!("{}?{}", path, query),
        _ => path,
    };

    let mut builder = Uri::builder().path_and_query(path_and_query);
    if let Some(scheme) = upstream.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = upstream.authority() {
        builder = builder.authority(authority.clone());
    }
    builder.build()
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Add the client to `X-Forwarded-For`, after any addresses already there
fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let chain = if prior.is_empty() {
        client.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client)
    };

    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
