//! Writer that duplicates every byte to several sinks.
//!
//! Used to push one encrypted stream to every peer at once: all sinks see the same IV and
//! the same ciphertext.

use std::io;
use std::ops::DerefMut;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::MutexGuard;

use super::peer::Peer;

pub struct FanOut<S> {
    sinks: Vec<S>,
    // Bytes of the current buffer already accepted by each sink. Callers retry a pending
    // write with the same buffer, so progress carries over between polls.
    progress: Vec<usize>,
}

impl<S> FanOut<S> {
    pub fn new(sinks: Vec<S>) -> Self {
        let progress = vec![0; sinks.len()];
        Self { sinks, progress }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn reset(&mut self) {
        self.progress.iter_mut().for_each(|done| *done = 0);
    }
}

impl<'a> FanOut<MutexGuard<'a, OwnedWriteHalf>> {
    /// Locks the writer of every peer, in the order given, for the fan-out's lifetime.
    pub async fn lock_peers(peers: &'a [Arc<Peer>]) -> Self {
        let mut sinks = Vec::with_capacity(peers.len());
        for peer in peers {
            sinks.push(peer.lock_writer().await);
        }
        Self::new(sinks)
    }
}

impl<S> AsyncWrite for FanOut<S>
where
    S: DerefMut + Unpin,
    S::Target: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let mut pending = false;
        let mut failure = None;

        'sinks: for (sink, done) in this.sinks.iter_mut().zip(this.progress.iter_mut()) {
            while *done < buf.len() {
                match Pin::new(&mut **sink).poll_write(cx, &buf[*done..]) {
                    Poll::Ready(Ok(0)) => {
                        failure = Some(io::Error::from(io::ErrorKind::WriteZero));
                        break 'sinks;
                    }
                    Poll::Ready(Ok(n)) => *done += n,
                    Poll::Ready(Err(e)) => {
                        failure = Some(e);
                        break 'sinks;
                    }
                    Poll::Pending => {
                        pending = true;
                        break;
                    }
                }
            }
        }

        if let Some(e) = failure {
            this.reset();
            return Poll::Ready(Err(e));
        }
        if pending {
            return Poll::Pending;
        }

        this.reset();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut pending = false;

        for sink in self.sinks.iter_mut() {
            match Pin::new(&mut **sink).poll_flush(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => pending = true,
            }
        }

        if pending {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    // Connections outlive the fan-out; shutting it down only flushes.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
