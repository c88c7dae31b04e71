//! Connection handles.
//!
//! A [`ConnectionHandle`] is the engine's grip on one open session. Handles
//! are cheap `Arc` clones owned by the connection pool and shared by value
//! with routing and the pipeline. Each handle fronts a bounded per-handle
//! queue drained by exactly one writer task, so sends to a link are
//! serialized without the sender holding any lock across a suspension
//! point.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{short_id, NodeId};

use super::TransportKind;

/// Bound of the per-handle writer queue. Kept at one buffered frame so the
/// backlog lives in the pipeline's priority queue, where an emergency can
/// still overtake it; head-of-line blocking at a link is then at most the
/// frame already in flight.
pub const WRITER_QUEUE_DEPTH: usize = 1;

/// Lifecycle of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Draining,
    Closed,
}

struct HandleInner {
    peer: NodeId,
    kind: TransportKind,
    state: RwLock<LinkState>,
    last_used_ms: AtomicU64,
    writer: mpsc::Sender<Vec<u8>>,
}

/// Shared reference to one open session
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiving end its writer task drains.
    pub fn channel(peer: NodeId, kind: TransportKind) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (writer, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let handle = Self {
            inner: Arc::new(HandleInner {
                peer,
                kind,
                state: RwLock::new(LinkState::Connecting),
                last_used_ms: AtomicU64::new(0),
                writer,
            }),
        };
        (handle, rx)
    }

    pub fn peer(&self) -> NodeId {
        self.inner.peer
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    pub fn mark_open(&self) {
        *self.inner.state.write() = LinkState::Open;
    }

    pub fn mark_draining(&self) {
        let mut state = self.inner.state.write();
        if *state == LinkState::Open || *state == LinkState::Connecting {
            *state = LinkState::Draining;
        }
    }

    /// Idempotent close.
    pub fn close(&self) {
        *self.inner.state.write() = LinkState::Closed;
    }

    pub fn touch(&self, now_ms: u64) {
        self.inner.last_used_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_used_ms(&self) -> u64 {
        self.inner.last_used_ms.load(Ordering::Relaxed)
    }

    /// Enqueue framed bytes on the writer queue. Suspends when the queue is
    /// full; fails once the link has left the open state.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed(format!(
                "{} link to {} is {:?}",
                self.kind(),
                short_id(&self.peer()),
                self.state()
            )));
        }
        self.inner.writer.send(bytes).await.map_err(|_| {
            self.close();
            Error::ConnectionClosed(format!(
                "{} writer for {} is gone",
                self.kind(),
                short_id(&self.peer())
            ))
        })
    }

    /// Best-effort enqueue that never suspends; `Backpressure` when full.
    pub fn try_send(&self, bytes: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed("link is not open".into()));
        }
        self.inner.writer.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Backpressure,
            mpsc::error::TrySendError::Closed(_) => {
                self.close();
                Error::ConnectionClosed("writer is gone".into())
            }
        })
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer", &short_id(&self.peer()))
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_requires_open_state() {
        let (handle, mut rx) = ConnectionHandle::channel([1u8; 16], TransportKind::LocalBus);
        assert!(handle.send(vec![1]).await.is_err());

        handle.mark_open();
        handle.send(vec![2, 3]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_sticky() {
        let (handle, _rx) = ConnectionHandle::channel([1u8; 16], TransportKind::DirectLan);
        handle.mark_open();
        handle.close();
        handle.close();
        assert_eq!(handle.state(), LinkState::Closed);
        assert!(handle.send(vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn draining_only_applies_to_live_links() {
        let (handle, _rx) = ConnectionHandle::channel([1u8; 16], TransportKind::DirectLan);
        handle.mark_open();
        handle.mark_draining();
        assert_eq!(handle.state(), LinkState::Draining);
        handle.close();
        handle.mark_draining();
        assert_eq!(handle.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn try_send_reports_backpressure() {
        let (handle, _rx) = ConnectionHandle::channel([1u8; 16], TransportKind::ShortRange);
        handle.mark_open();
        for _ in 0..WRITER_QUEUE_DEPTH {
            handle.try_send(vec![0]).unwrap();
        }
        assert!(matches!(
            handle.try_send(vec![0]),
            Err(Error::Backpressure)
        ));
    }
}
