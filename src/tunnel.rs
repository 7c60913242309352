use crate::body::{empty, full, ProxyBody};
use crate::buffer_pool::BufferPool;
use crate::connection::SessionTracker;
use crate::stream::{
    pump, BidirectionalByteStream, CopyError, ExclusiveSocketStream, FlushingFrameStream,
};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode, Version};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Maximum time to establish the TCP connection to a CONNECT target
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for CONNECT tunnels
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("dial tcp {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("tunneling not supported: {0}")]
    Upgrade(#[source] hyper::Error),

    #[error(transparent)]
    Copy(#[from] CopyError),
}

/// Serves CONNECT requests by splicing the client onto a TCP connection
#[derive(Clone)]
pub struct TunnelEngine {
    pool: Arc<BufferPool>,
    sessions: SessionTracker,
    dial_timeout: Duration,
}

impl TunnelEngine {
    pub fn new(pool: Arc<BufferPool>, sessions: SessionTracker) -> Self {
        Self {
            pool,
            sessions,
            dial_timeout: DIAL_TIMEOUT,
        }
    }

    /// Dial the target, answer the CONNECT, then relay in the background.
    ///
    /// The target is dialed before anything is sent so a failure can still be
    /// reported as `502` with the dial error as the body.
    pub async fn open(&self, req: Request<Incoming>, identity: &str) -> Response<ProxyBody> {
        let Some(target) = connect_target(&req) else {
            warn!("[{}] CONNECT without target: {:?}", identity, req.uri());
            return status_response(StatusCode::BAD_REQUEST, full("CONNECT must be to a socket address"));
        };

        let remote = match self.dial(&target).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("[{}] {}", identity, e);
                return status_response(StatusCode::BAD_GATEWAY, full(e.to_string()));
            }
        };

        let engine = self.clone();
        let identity = identity.to_string();
        tokio::task::spawn(async move {
            match engine.establish(req, remote).await {
                Ok(copied) => debug!("[{}] tunnel to {} closed, {} bytes to client", identity, target, copied),
                Err(e) => warn!("[{}] tunnel to {}: {}", identity, target, e),
            }
        });

        Response::new(empty())
    }

    async fn dial(&self, target: &str) -> Result<TcpStream, TunnelError> {
        let dial_error = |source: io::Error| TunnelError::Dial {
            target: target.to_string(),
            source,
        };

        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| dial_error(io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")))?
            .map_err(dial_error)?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on {}: {}", target, e);
        }
        Ok(stream)
    }

    /// Take over the client side of the request once the `200` is out
    async fn establish(&self, req: Request<Incoming>, remote: TcpStream) -> Result<u64, TunnelError> {
        let version = req.version();
        let upgraded = hyper::upgrade::on(req).await.map_err(TunnelError::Upgrade)?;

        if version == Version::HTTP_2 {
            self.relay(FlushingFrameStream::new(upgraded), remote).await
        } else {
            self.relay(ExclusiveSocketStream::new(upgraded), remote).await
        }
    }

    /// Relay bytes both ways between `client` and `target` until both directions end.
    ///
    /// client -> target runs detached; target -> client is awaited and its byte
    /// count returned. Each direction half-closes what it owns when done.
    pub async fn relay<C, T>(&self, client: C, target: T) -> Result<u64, TunnelError>
    where
        C: BidirectionalByteStream,
        T: BidirectionalByteStream,
    {
        let session = Arc::new(self.sessions.enter());
        let (client_reader, client_writer) = client.into_sides();
        let (target_reader, target_writer) = target.into_sides();

        let pool = Arc::clone(&self.pool);
        let upstream_session = Arc::clone(&session);
        tokio::task::spawn(async move {
            let _session = upstream_session;
            if let Err(e) = pump(client_reader, target_writer, &pool).await {
                debug!("tunnel client -> target: {}", e);
            }
        });

        let copied = pump(target_reader, client_writer, &self.pool).await?;
        drop(session);
        Ok(copied)
    }
}

/// `host:port` a CONNECT asks for, from the request target or the Host header
fn connect_target<B>(req: &Request<B>) -> Option<String> {
    req.uri()
        .authority()
        .map(|authority| authority.to_string())
        .or_else(|| {
            req.headers()
                .get(HOST)
                .and_then(|host| host.to_str().ok())
                .filter(|host| !host.is_empty())
                .map(str::to_string)
        })
}

fn status_response(status: StatusCode, body: ProxyBody) -> Response<ProxyBody> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}
