//! Optional PROXY protocol (v1/v2) header in front of inbound connections.
//!
//! Load balancers prepend the header to carry the real client address.
//! Connections without one are passed through untouched.

use proxy_header::{ParseConfig, ProxyHeader};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

const V1_PREFIX: &[u8] = b"PROXY ";
const V2_SIGNATURE: &[u8] = b"\r\n\r\n\0\r\nQUIT\n";
/// Longest v1 header, CRLF included
const V1_MAX_LEN: usize = 107;
const PEEK_LEN: usize = 1024;
const HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for PROXY header handling
#[derive(Debug, thiserror::Error)]
pub enum ProxyHeaderError {
    #[error("io error while reading PROXY header: {0}")]
    Io(#[from] io::Error),

    #[error("malformed PROXY header: {0}")]
    Malformed(String),

    #[error("timed out waiting for PROXY header")]
    Timeout,
}

#[derive(Debug, PartialEq, Eq)]
enum HeaderState {
    Absent,
    Incomplete,
    Complete,
}

fn header_state(data: &[u8]) -> HeaderState {
    if data.is_empty() {
        return HeaderState::Absent;
    }

    if V1_PREFIX.starts_with(data) || V2_SIGNATURE.starts_with(data) {
        return HeaderState::Incomplete;
    }

    if data.starts_with(V1_PREFIX) {
        let window = &data[..data.len().min(V1_MAX_LEN)];
        if window.windows(2).any(|w| w == b"\r\n") || data.len() >= V1_MAX_LEN {
            return HeaderState::Complete;
        }
        return HeaderState::Incomplete;
    }

    if data.starts_with(V2_SIGNATURE) {
        if data.len() < 16 {
            return HeaderState::Incomplete;
        }
        let total = 16 + u16::from_be_bytes([data[14], data[15]]) as usize;
        if data.len() >= total || total > PEEK_LEN {
            // Oversized headers are left to the parser to reject
            return HeaderState::Complete;
        }
        return HeaderState::Incomplete;
    }

    HeaderState::Absent
}

/// Consume a PROXY header from `stream` if one is present.
///
/// Returns the client address the header carries, or `peer` when there is no
/// header or it describes a local connection.
pub async fn accept_proxy_header(
    stream: &mut TcpStream,
    peer: SocketAddr,
) -> Result<SocketAddr, ProxyHeaderError> {
    read_proxy_header(stream, peer, HEADER_TIMEOUT).await
}

async fn read_proxy_header(
    stream: &mut TcpStream,
    peer: SocketAddr,
    timeout: Duration,
) -> Result<SocketAddr, ProxyHeaderError> {
    let mut buf = vec![0u8; PEEK_LEN];

    // An idle client is not held to the deadline until it starts a header
    let first = stream.peek(&mut buf).await?;
    let n = match header_state(&buf[..first]) {
        HeaderState::Absent => None,
        HeaderState::Complete => Some(first),
        HeaderState::Incomplete => tokio::time::timeout(timeout, async {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let n = stream.peek(&mut buf).await?;
                match header_state(&buf[..n]) {
                    HeaderState::Incomplete if n < PEEK_LEN => continue,
                    HeaderState::Absent => return Ok::<_, io::Error>(None),
                    _ => return Ok(Some(n)),
                }
            }
        })
        .await
        .map_err(|_| ProxyHeaderError::Timeout)??,
    };

    let Some(n) = n else {
        return Ok(peer);
    };

    let (source, consumed) = match ProxyHeader::parse(&buf[..n], ParseConfig::default()) {
        Ok((header, consumed)) => (header.proxied_address().map(|addr| addr.source), consumed),
        Err(e) => return Err(ProxyHeaderError::Malformed(format!("{:?}", e))),
    };

    let mut discard = vec![0u8; consumed];
    stream.read_exact(&mut discard).await?;

    match source {
        Some(source) => {
            debug!("PROXY header from {}: client {}", peer, source);
            Ok(source)
        }
        None => {
            debug!("PROXY header from {}: local connection", peer);
            Ok(peer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, peer) = accepted.unwrap();
        (client.unwrap(), server, peer)
    }

    async fn read_rest(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut rest = vec![0u8; len];
        stream.read_exact(&mut rest).await.unwrap();
        rest
    }

    #[test]
    fn test_header_state_detection() {
        assert_eq!(header_state(b""), HeaderState::Absent);
        assert_eq!(header_state(b"GET / HTTP/1.1\r\n"), HeaderState::Absent);
        assert_eq!(header_state(b"PRI * HTTP/2.0\r\n"), HeaderState::Absent);
        assert_eq!(header_state(&[0x16, 0x03, 0x01]), HeaderState::Absent);
        assert_eq!(header_state(b"PRO"), HeaderState::Incomplete);
        assert_eq!(header_state(b"PROXY TCP4 1.2.3.4"), HeaderState::Incomplete);
        assert_eq!(
            header_state(b"PROXY TCP4 1.2.3.4 5.6.7.8 111 222\r\n"),
            HeaderState::Complete
        );
        assert_eq!(header_state(&V2_SIGNATURE[..5]), HeaderState::Incomplete);
    }

    #[tokio::test]
    async fn test_v1_header_is_stripped() {
        let (mut client, mut server, peer) = tcp_pair().await;
        client
            .write_all(b"PROXY TCP4 203.0.113.7 10.0.0.1 5555 443\r\nGET / HTTP/1.1\r\n")
            .await
            .unwrap();

        let source = accept_proxy_header(&mut server, peer).await.unwrap();

        assert_eq!(source, "203.0.113.7:5555".parse::<SocketAddr>().unwrap());
        assert_eq!(read_rest(&mut server, 16).await, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_v1_header_split_across_writes() {
        let (mut client, mut server, peer) = tcp_pair().await;
        let writer = tokio::spawn(async move {
            client.write_all(b"PROXY TCP4 198.51.100.2 ").await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            client.write_all(b"10.0.0.1 4000 80\r\nhello").await.unwrap();
            client
        });

        let source = accept_proxy_header(&mut server, peer).await.unwrap();
        let _client = writer.await.unwrap();

        assert_eq!(source, "198.51.100.2:4000".parse::<SocketAddr>().unwrap());
        assert_eq!(read_rest(&mut server, 5).await, b"hello");
    }

    #[tokio::test]
    async fn test_v2_header_is_stripped() {
        let (mut client, mut server, peer) = tcp_pair().await;

        let mut header = V2_SIGNATURE.to_vec();
        header.push(0x21); // version 2, PROXY command
        header.push(0x11); // TCP over IPv4
        header.extend_from_slice(&12u16.to_be_bytes());
        header.extend_from_slice(&[192, 0, 2, 10]);
        header.extend_from_slice(&[10, 0, 0, 1]);
        header.extend_from_slice(&40000u16.to_be_bytes());
        header.extend_from_slice(&443u16.to_be_bytes());
        header.extend_from_slice(b"payload");
        client.write_all(&header).await.unwrap();

        let source = accept_proxy_header(&mut server, peer).await.unwrap();

        assert_eq!(source, "192.0.2.10:40000".parse::<SocketAddr>().unwrap());
        assert_eq!(read_rest(&mut server, 7).await, b"payload");
    }

    #[tokio::test]
    async fn test_plain_connection_passes_through() {
        let (mut client, mut server, peer) = tcp_pair().await;
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let source = accept_proxy_header(&mut server, peer).await.unwrap();

        assert_eq!(source, peer);
        assert_eq!(read_rest(&mut server, 16).await, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_idle_client_is_not_timed_out() {
        let (mut client, mut server, peer) = tcp_pair().await;
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            client
        });

        let source = read_proxy_header(&mut server, peer, Duration::from_millis(50))
            .await
            .unwrap();
        let _client = writer.await.unwrap();

        assert_eq!(source, peer);
        assert_eq!(read_rest(&mut server, 16).await, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_unfinished_header_times_out() {
        let (mut client, mut server, peer) = tcp_pair().await;
        client.write_all(b"PROXY TCP4 192.0.2.1").await.unwrap();

        let err = read_proxy_header(&mut server, peer, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyHeaderError::Timeout), "{:?}", err);
    }

    #[tokio::test]
    async fn test_malformed_v1_header_is_rejected() {
        let (mut client, mut server, peer) = tcp_pair().await;
        client
            .write_all(b"PROXY GARBAGE not an address\r\n")
            .await
            .unwrap();

        let err = accept_proxy_header(&mut server, peer).await.unwrap_err();
        assert!(matches!(err, ProxyHeaderError::Malformed(_)), "{:?}", err);
    }
}
