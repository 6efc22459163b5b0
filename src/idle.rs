//! Inbound idle timeout (spec §3 `timeout`, §4.5 web `timeout` pass):
//! wraps the accepted connection so the server tears it down if no bytes
//! move in either direction for the configured duration. Grounded on the
//! forwarding `AsyncRead`/`AsyncWrite` wrapper shape in
//! `examples/vishalbelsare-agentgateway/crates/agentgateway/src/transport/stream.rs`'s
//! `Socket`, extended with a heap-pinned `tokio::time::Sleep` that resets
//! on progress. A `None` duration makes this a transparent passthrough,
//! so callers can wrap every connection unconditionally.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// `IO` is held unpinned (true of `TcpStream` and `tokio_rustls`'s server
/// stream, the only two callers) so this struct stays `Unpin` without
/// needing structural pin-projection.
pub struct IdleTimeout<IO> {
    inner: IO,
    sleep: Option<Pin<Box<Sleep>>>,
    duration: Option<Duration>,
}

impl<IO: Unpin> IdleTimeout<IO> {
    pub fn new(inner: IO, duration: Option<Duration>) -> Self {
        Self {
            inner,
            sleep: duration.map(|d| Box::pin(tokio::time::sleep(d))),
            duration,
        }
    }

    fn check_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(sleep) = self.sleep.as_mut() else {
            return Poll::Pending;
        };
        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "inbound connection idle timeout elapsed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn reset_deadline(&mut self) {
        if let (Some(sleep), Some(duration)) = (self.sleep.as_mut(), self.duration) {
            sleep.as_mut().reset(Instant::now() + duration);
        }
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for IdleTimeout<IO> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Poll::Ready(err) = self.check_deadline(cx) {
            return Poll::Ready(err);
        }
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() != before {
            self.reset_deadline();
        }
        poll
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<IO> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Poll::Ready(err) = self.check_deadline(cx) {
            return Poll::Ready(err);
        }
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            self.reset_deadline();
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn passthrough_without_duration_never_times_out() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut wrapped = IdleTimeout::new(server, None);

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        wrapped.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn idle_past_duration_errors_with_timed_out() {
        let (client, server) = tokio::io::duplex(64);
        let mut wrapped = IdleTimeout::new(server, Some(Duration::from_millis(20)));
        let mut buf = [0u8; 1];
        let err = wrapped.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(client);
    }
}
