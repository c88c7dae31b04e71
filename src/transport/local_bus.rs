//! Local bus transport: an in-process broadcast medium.
//!
//! Co-located engine instances (and the integration tests) attach to a
//! named bus in a process-wide registry. Frames addressed to nobody are
//! announcements; directed frames materialize virtual per-peer sessions on
//! first contact, like any shared medium.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::NodeId;

use super::{ConnectionHandle, Transport, TransportEvent, TransportKind};

const BUS_DEPTH: usize = 1024;

/// One frame on the bus
#[derive(Debug, Clone)]
struct BusFrame {
    from: NodeId,
    /// `None` marks an announcement heard by everyone
    to: Option<NodeId>,
    bytes: Vec<u8>,
}

/// Process-wide registry of named buses
static BUS_REGISTRY: Lazy<Mutex<HashMap<String, broadcast::Sender<BusFrame>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn attach(bus_name: &str) -> broadcast::Sender<BusFrame> {
    let mut registry = BUS_REGISTRY.lock();
    registry
        .entry(bus_name.to_string())
        .or_insert_with(|| broadcast::channel(BUS_DEPTH).0)
        .clone()
}

pub struct LocalBusTransport {
    node_id: NodeId,
    bus_name: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    bus: OnceCell<broadcast::Sender<BusFrame>>,
    handles: Arc<DashMap<NodeId, ConnectionHandle>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalBusTransport {
    pub fn new(
        node_id: NodeId,
        bus_name: String,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            node_id,
            bus_name,
            events,
            bus: OnceCell::new(),
            handles: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn bus_sender(&self) -> Result<broadcast::Sender<BusFrame>> {
        self.bus
            .get()
            .cloned()
            .ok_or_else(|| Error::Transport("local bus not started".into()))
    }

    fn ensure_handle(
        handles: &DashMap<NodeId, ConnectionHandle>,
        bus: broadcast::Sender<BusFrame>,
        node_id: NodeId,
        peer: NodeId,
    ) -> (ConnectionHandle, bool) {
        if let Some(existing) = handles.get(&peer) {
            if existing.is_open() {
                return (existing.clone(), false);
            }
        }
        let (handle, mut rx) = ConnectionHandle::channel(peer, TransportKind::LocalBus);
        tokio::spawn({
            let handle = handle.clone();
            async move {
                while let Some(bytes) = rx.recv().await {
                    if handle.state() == super::LinkState::Closed {
                        break;
                    }
                    // A send with no receivers is a frame lost to an empty
                    // medium, not an error.
                    let _ = bus.send(BusFrame {
                        from: node_id,
                        to: Some(peer),
                        bytes,
                    });
                }
            }
        });
        handle.mark_open();
        handles.insert(peer, handle.clone());
        (handle, true)
    }
}

#[async_trait]
impl Transport for LocalBusTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalBus
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let bus = attach(&self.bus_name);
        let mut rx = bus.subscribe();
        let _ = self.bus.set(bus.clone());

        let events = self.events.clone();
        let handles = self.handles.clone();
        let node_id = self.node_id;
        let running = self.running.clone();
        let recv_task = tokio::spawn(async move {
            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let frame = match rx.recv().await {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("local bus receiver lagged, {} frames lost", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if frame.from == node_id {
                    continue;
                }
                match frame.to {
                    None => {
                        let _ = events.send(TransportEvent::AnnounceReceived {
                            kind: TransportKind::LocalBus,
                            signal_strength: TransportKind::LocalBus.default_signal(),
                            origin: None,
                            bytes: frame.bytes,
                        });
                    }
                    Some(to) if to == node_id => {
                        let (handle, created) = LocalBusTransport::ensure_handle(
                            &handles,
                            bus.clone(),
                            node_id,
                            frame.from,
                        );
                        if created {
                            let _ = events.send(TransportEvent::Connected { handle });
                        }
                        let _ = events.send(TransportEvent::FrameReceived {
                            peer: frame.from,
                            kind: TransportKind::LocalBus,
                            signal_strength: TransportKind::LocalBus.default_signal(),
                            bytes: frame.bytes,
                        });
                    }
                    Some(_) => {}
                }
            }
        });

        self.tasks.lock().push(recv_task);
        Ok(())
    }

    async fn announce(&self, frame: Vec<u8>) -> Result<()> {
        let bus = self.bus_sender()?;
        let _ = bus.send(BusFrame {
            from: self.node_id,
            to: None,
            bytes: frame,
        });
        Ok(())
    }

    async fn dial(&self, peer: NodeId, _endpoint: &str) -> Result<ConnectionHandle> {
        let bus = self.bus_sender()?;
        let (handle, _) = Self::ensure_handle(&self.handles, bus, self.node_id, peer);
        Ok(handle)
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for entry in self.handles.iter() {
            entry.value().close();
        }
        self.handles.clear();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    fn local_endpoint(&self) -> Option<String> {
        Some(self.bus_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u8) -> NodeId {
        [id; 16]
    }

    #[tokio::test]
    async fn announce_reaches_other_instances() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = LocalBusTransport::new(node(1), "bus-announce".into(), tx_a);
        let b = LocalBusTransport::new(node(2), "bus-announce".into(), tx_b);
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.announce(vec![0xAB, 0xCD]).await.unwrap();

        let event = rx_b.recv().await.unwrap();
        match event {
            TransportEvent::AnnounceReceived { bytes, kind, .. } => {
                assert_eq!(bytes, vec![0xAB, 0xCD]);
                assert_eq!(kind, TransportKind::LocalBus);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn directed_frames_open_virtual_sessions() {
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = LocalBusTransport::new(node(1), "bus-directed".into(), tx_a);
        let b = LocalBusTransport::new(node(2), "bus-directed".into(), tx_b);
        a.start().await.unwrap();
        b.start().await.unwrap();

        let handle = a.dial(node(2), "bus-directed").await.unwrap();
        handle.send(vec![1, 2, 3]).await.unwrap();

        let mut connected = false;
        let mut received = false;
        for _ in 0..2 {
            match rx_b.recv().await.unwrap() {
                TransportEvent::Connected { handle } => {
                    assert_eq!(handle.peer(), node(1));
                    connected = true;
                }
                TransportEvent::FrameReceived { peer, bytes, .. } => {
                    assert_eq!(peer, node(1));
                    assert_eq!(bytes, vec![1, 2, 3]);
                    received = true;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(connected && received);
    }

    #[tokio::test]
    async fn own_frames_are_not_echoed() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let a = LocalBusTransport::new(node(1), "bus-echo".into(), tx_a);
        a.start().await.unwrap();
        a.announce(vec![9]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());
    }
}
