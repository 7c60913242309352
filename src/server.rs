use crate::buffer_pool::BufferPool;
use crate::config::ProxyConfig;
use crate::connection::SessionTracker;
use crate::dispatch::Dispatcher;
use crate::proxy_protocol::accept_proxy_header;
use crate::tls::load_acceptor;
use color_eyre::eyre::{Result, WrapErr};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Longest wait for open tunnels once shutdown begins
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Accept loop in front of the [`Dispatcher`]
pub struct ProxyServer {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<BufferPool>,
    tls: Option<TlsAcceptor>,
    proxy_protocol: bool,
    sessions: SessionTracker,
}

impl ProxyServer {
    pub fn new(config: Arc<ProxyConfig>) -> Result<Self> {
        let tls = match &config.tls {
            Some(settings) => Some(load_acceptor(settings).wrap_err("Failed to load TLS certificate")?),
            None => None,
        };

        let sessions = SessionTracker::new();
        let pool = Arc::new(BufferPool::new());
        let dispatcher = Dispatcher::new(Arc::clone(&config), Arc::clone(&pool), sessions.clone());

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            pool,
            tls,
            proxy_protocol: config.proxy_protocol,
            sessions,
        })
    }

    /// Tracker of the tunnels this server has open
    pub fn sessions(&self) -> SessionTracker {
        self.sessions.clone()
    }

    /// Serve connections from `listener` until `shutdown` resolves
    pub async fn run<F>(self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let server = Arc::new(self);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let server = Arc::clone(&server);
                        tokio::task::spawn(async move {
                            server.handle_connection(stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {} (continuing)", e);
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        let stats = server.pool.stats().await;
        debug!(
            "Buffer pool: {} buffers idle, {} bytes",
            stats.buffers_available, stats.total_memory_pooled
        );
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let client_addr = if self.proxy_protocol {
            match accept_proxy_header(&mut stream, peer_addr).await {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Connection from {} dropped: {}", peer_addr, e);
                    return;
                }
            }
        } else {
            peer_addr
        };

        match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => self.serve(tls_stream, client_addr).await,
                Err(e) => debug!("TLS handshake with {} failed: {}", client_addr, e),
            },
            None => self.serve(stream, client_addr).await,
        }
    }

    /// Speak HTTP/1.1 or HTTP/2 on one client connection
    async fn serve<I>(&self, io: I, client_addr: SocketAddr)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let dispatcher = Arc::clone(&self.dispatcher);
        let service = service_fn(move |req| Arc::clone(&dispatcher).dispatch(req, client_addr));

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .preserve_header_case(true)
            .title_case_headers(true);

        if let Err(err) = builder
            .serve_connection_with_upgrades(TokioIo::new(io), service)
            .await
        {
            // Only log connection errors, not normal endings
            if !err.to_string().contains("connection closed") {
                warn!("Connection from {} error: {:?}", client_addr, err);
            }
        }
    }
}

/// Wait up to `grace` for the tunnels tracked by `sessions` to finish
pub async fn drain(sessions: &SessionTracker, grace: Duration) {
    let active = sessions.active_count();
    if active == 0 {
        return;
    }
    info!("Waiting for {} tunnels to close...", active);

    let seconds = grace.as_secs().max(1);
    for i in 1..=seconds {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = sessions.active_count();

        if remaining == 0 {
            info!("All tunnels closed gracefully");
            return;
        }

        if i % 5 == 0 {
            info!("Still waiting for {} tunnels... ({}/{}s)", remaining, i, seconds);
        }
    }

    warn!(
        "Forced shutdown with {} tunnels still active",
        sessions.active_count()
    );
}
