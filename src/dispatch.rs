use crate::auth::{validate, AuthResult};
use crate::body::{empty, ProxyBody};
use crate::buffer_pool::BufferPool;
use crate::config::ProxyConfig;
use crate::connection::SessionTracker;
use crate::decoy::DecoyForwarder;
use crate::forward::{http_client, ForwardEngine};
use crate::headers::HopByHopHeaders;
use crate::tunnel::TunnelEngine;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Routes each request to the probe answer, the proxy engines or the decoy
pub struct Dispatcher {
    config: Arc<ProxyConfig>,
    hop_by_hop: Arc<HopByHopHeaders>,
    challenge: HeaderValue,
    tunnel: TunnelEngine,
    forward: ForwardEngine,
    decoy: DecoyForwarder,
}

impl Dispatcher {
    pub fn new(config: Arc<ProxyConfig>, pool: Arc<BufferPool>, sessions: SessionTracker) -> Self {
        let hop_by_hop = Arc::new(HopByHopHeaders::new());
        let client = http_client();

        let challenge = HeaderValue::from_str(&format!("Basic realm=\"{}\"", config.auth_realm))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"proxy\""));

        Self {
            tunnel: TunnelEngine::new(pool, sessions),
            forward: ForwardEngine::new(client.clone()),
            decoy: DecoyForwarder::new(config.upstream_addr.clone(), client, Arc::clone(&hop_by_hop)),
            config,
            hop_by_hop,
            challenge,
        }
    }

    pub async fn dispatch(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let auth = validate(
            req.headers()
                .get(PROXY_AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .unwrap_or(""),
            &self.config.auth,
        );

        if self.is_auth_probe(&req) {
            return Ok(self.probe_response(&auth));
        }

        match auth {
            AuthResult::Authorized(identity) => {
                debug!("[{}] {} {}", identity, req.method(), req.uri());
                self.hop_by_hop.strip(req.headers_mut());

                if req.method() == Method::CONNECT {
                    Ok(self.tunnel.open(req, &identity).await)
                } else {
                    Ok(self.forward.forward(req).await)
                }
            }
            AuthResult::NoCredentialPresented => {
                debug!("[normal] {} {}", req.method(), req.uri());
                Ok(self.decoy.forward(req, client_addr).await)
            }
            AuthResult::Unauthorized(reason) => {
                debug!("{{{}}} {} {}", reason, req.method(), req.uri());
                Ok(self.decoy.forward(req, client_addr).await)
            }
        }
    }

    /// A GET whose path ends with the trigger suffix
    fn is_auth_probe<B>(&self, req: &Request<B>) -> bool {
        req.method() == Method::GET && req.uri().path().ends_with(&self.config.auth_trigger_path)
    }

    fn probe_response(&self, auth: &AuthResult) -> Response<ProxyBody> {
        let mut resp = Response::new(empty());
        if !auth.is_authorized() {
            *resp.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
            resp.headers_mut()
                .insert(PROXY_AUTHENTICATE, self.challenge.clone());
        }
        resp
    }
}
