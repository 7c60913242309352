use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::error;

/// Body type of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Re-stream `body` through a bounded in-memory pipe.
///
/// A background task moves frames from `body` into the pipe one at a time, so
/// at most one frame is held in memory. A read error on `body` is logged and
/// ends the pipe as a normal EOF; a reader that goes away stops the task.
pub fn pipe_body<B>(body: B, label: &'static str) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Display + Send,
{
    if body.is_end_stream() {
        return empty();
    }
    let size_hint = body.size_hint();
    let (tx, rx) = mpsc::channel::<Frame<Bytes>>(1);

    tokio::spawn(async move {
        let mut body = body;
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if tx.send(frame).await.is_err() {
                        // Reader dropped the body
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!("Error while copy {}: {}", label, e);
                    break;
                }
                None => break,
            }
        }
    });

    PipeBody { rx, size_hint }.boxed()
}

/// Reading end of [`pipe_body`]
struct PipeBody {
    rx: mpsc::Receiver<Frame<Bytes>>,
    // Carried over from the source so a known length stays known downstream
    size_hint: SizeHint,
}

impl Body for PipeBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }

    fn size_hint(&self) -> SizeHint {
        self.size_hint.clone()
    }
}
