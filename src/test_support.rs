//! Helpers shared by the end-to-end tests: throwaway upstreams, echo targets
//! and a proxy instance listening on an ephemeral port.

use crate::auth::basic_header;
use crate::body::{full, ProxyBody};
use crate::config::ProxyConfig;
use crate::server::ProxyServer;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderMap, HeaderValue, PROXY_AUTHORIZATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const IDENTITY: &str = "alice";
pub const SECRET: &str = "wonderland";
pub const TRIGGER: &str = "/auth";

/// `Proxy-Authorization` value for the test identity
pub fn valid_auth() -> HeaderValue {
    HeaderValue::from_str(&basic_header(IDENTITY, SECRET)).unwrap()
}

/// TCP server that echoes every connection back until the peer half-closes
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// A request as the upstream saw it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What the upstream answers to every request
#[derive(Clone)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub headers: Vec<(&'static str, &'static str)>,
    pub body: &'static str,
}

impl Default for UpstreamReply {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: "Response Body",
        }
    }
}

pub struct Upstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl Upstream {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> RecordedRequest {
        self.requests().pop().expect("upstream saw no request")
    }
}

/// HTTP/1 origin server that records requests and answers with `reply`
pub async fn spawn_upstream(reply: UpstreamReply) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let recorded = Arc::clone(&requests);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let recorded = Arc::clone(&recorded);
            let reply = reply.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let recorded = Arc::clone(&recorded);
                    let reply = reply.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
                        recorded.lock().unwrap().push(RecordedRequest {
                            method: parts.method,
                            uri: parts.uri,
                            headers: parts.headers,
                            body,
                        });

                        let mut resp: Response<ProxyBody> = Response::new(full(reply.body));
                        *resp.status_mut() = reply.status;
                        for (name, value) in reply.headers {
                            resp.headers_mut().append(name, HeaderValue::from_static(value));
                        }
                        Ok::<_, Infallible>(resp)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Upstream { addr, requests }
}

/// Configuration pointing the decoy at `upstream`
pub fn test_config(upstream: SocketAddr) -> ProxyConfig {
    let raw = format!(
        "upstream_addr: http://{}\nlisten_addr: 127.0.0.1:0\nauth_trigger_path: {}\nauth:\n  {}: {}\n",
        upstream, TRIGGER, IDENTITY, SECRET
    );
    ProxyConfig::from_yaml(&raw).unwrap()
}

/// Start a proxy on an ephemeral port; it runs until the test ends
pub async fn spawn_proxy(config: ProxyConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(Arc::new(config)).unwrap();
    tokio::spawn(server.run(listener, std::future::pending::<()>()));
    addr
}

/// Plain HTTP/1 connection to `addr`, upgrades enabled
pub async fn http1_client(addr: SocketAddr) -> SendRequest<Full<Bytes>> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.with_upgrades().await;
    });
    sender
}

/// Send `req` on a fresh connection and buffer the whole response
pub async fn send(proxy: SocketAddr, req: Request<Full<Bytes>>) -> (StatusCode, HeaderMap, Bytes) {
    let mut sender = http1_client(proxy).await;
    let resp = sender.send_request(req).await.unwrap();
    let (parts, body) = resp.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, body)
}

/// GET `uri` with an optional `Proxy-Authorization` value
pub fn get(uri: &str, auth: Option<HeaderValue>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(Method::GET).uri(uri).header("host", "decoy.test");
    if let Some(auth) = auth {
        builder = builder.header(PROXY_AUTHORIZATION, auth);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}
