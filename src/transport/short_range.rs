//! Short-range radio transport.
//!
//! The engine cannot link a radio stack portably, so the medium itself is a
//! host-provided [`ShortRangeDriver`]; this transport translates between
//! driver events and the engine's transport events and gives the pool
//! per-peer handles whose writers feed the driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::protocol::NodeId;

use super::{ConnectionHandle, Transport, TransportEvent, TransportKind};

/// Events a radio driver reports upward
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A directed frame from a peer radio
    Frame {
        from: NodeId,
        signal_strength: u8,
        bytes: Vec<u8>,
    },
    /// A broadcast announcement overheard on the medium
    Announce { signal_strength: u8, bytes: Vec<u8> },
    /// The radio lost contact with a peer
    PeerLost { peer: NodeId },
}

/// Host-implemented radio seam
#[async_trait]
pub trait ShortRangeDriver: Send + Sync {
    /// Power the radio and begin reporting into `events`.
    async fn start(&self, events: mpsc::UnboundedSender<DriverEvent>) -> Result<()>;

    /// Broadcast to every radio in range.
    async fn broadcast(&self, bytes: Vec<u8>) -> Result<()>;

    /// Send a directed frame to one peer radio.
    async fn send(&self, peer: NodeId, bytes: Vec<u8>) -> Result<()>;

    /// Power the radio down.
    async fn stop(&self);
}

pub struct ShortRangeTransport {
    driver: Arc<dyn ShortRangeDriver>,
    events: mpsc::UnboundedSender<TransportEvent>,
    handles: Arc<DashMap<NodeId, ConnectionHandle>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShortRangeTransport {
    pub fn new(
        driver: Arc<dyn ShortRangeDriver>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            driver,
            events,
            handles: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn ensure_handle(
        handles: &DashMap<NodeId, ConnectionHandle>,
        driver: Arc<dyn ShortRangeDriver>,
        peer: NodeId,
    ) -> (ConnectionHandle, bool) {
        if let Some(existing) = handles.get(&peer) {
            if existing.is_open() {
                return (existing.clone(), false);
            }
        }
        let (handle, mut rx) = ConnectionHandle::channel(peer, TransportKind::ShortRange);
        tokio::spawn({
            let handle = handle.clone();
            async move {
                while let Some(bytes) = rx.recv().await {
                    if handle.state() == super::LinkState::Closed {
                        break;
                    }
                    if driver.send(peer, bytes).await.is_err() {
                        handle.close();
                        break;
                    }
                }
            }
        });
        handle.mark_open();
        handles.insert(peer, handle.clone());
        (handle, true)
    }
}

#[async_trait]
impl Transport for ShortRangeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ShortRange
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let (driver_tx, mut driver_rx) = mpsc::unbounded_channel();
        self.driver.start(driver_tx).await?;

        let events = self.events.clone();
        let handles = self.handles.clone();
        let driver = self.driver.clone();
        let running = self.running.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = driver_rx.recv().await {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    DriverEvent::Frame {
                        from,
                        signal_strength,
                        bytes,
                    } => {
                        let (handle, created) =
                            ShortRangeTransport::ensure_handle(&handles, driver.clone(), from);
                        if created {
                            let _ = events.send(TransportEvent::Connected { handle });
                        }
                        let _ = events.send(TransportEvent::FrameReceived {
                            peer: from,
                            kind: TransportKind::ShortRange,
                            signal_strength,
                            bytes,
                        });
                    }
                    DriverEvent::Announce {
                        signal_strength,
                        bytes,
                    } => {
                        let _ = events.send(TransportEvent::AnnounceReceived {
                            kind: TransportKind::ShortRange,
                            signal_strength,
                            origin: None,
                            bytes,
                        });
                    }
                    DriverEvent::PeerLost { peer } => {
                        if let Some((_, handle)) = handles.remove(&peer) {
                            handle.close();
                        }
                        let _ = events.send(TransportEvent::Disconnected {
                            peer,
                            kind: TransportKind::ShortRange,
                            reason: "radio contact lost".into(),
                        });
                    }
                }
            }
        });

        self.tasks.lock().push(pump);
        Ok(())
    }

    async fn announce(&self, frame: Vec<u8>) -> Result<()> {
        self.driver.broadcast(frame).await
    }

    async fn dial(&self, peer: NodeId, _endpoint: &str) -> Result<ConnectionHandle> {
        let (handle, _) = Self::ensure_handle(&self.handles, self.driver.clone(), peer);
        Ok(handle)
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for entry in self.handles.iter() {
            entry.value().close();
        }
        self.handles.clear();
        self.driver.stop().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    fn local_endpoint(&self) -> Option<String> {
        Some(String::from("radio"))
    }
}
