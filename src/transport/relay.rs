//! Relay transport: one multiplexed session to a rendezvous server.
//!
//! The client registers its node id, then exchanges unicast and broadcast
//! frames with the server; per-peer sessions are virtual handles whose
//! writer tasks wrap bytes into relay frames. The server itself is external
//! infrastructure and not part of this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::constants::MAX_PAYLOAD;
use crate::protocol::NodeId;

use super::{ConnectionHandle, Transport, TransportEvent, TransportKind};

const MAX_FRAME: usize = MAX_PAYLOAD + 1024;

/// Frames exchanged with the rendezvous server
#[derive(Debug, Clone, Serialize, Deserialize)]
enum RelayFrame {
    Register { node_id: NodeId },
    Unicast {
        to: NodeId,
        from: NodeId,
        bytes: Vec<u8>,
    },
    Broadcast { from: NodeId, bytes: Vec<u8> },
}

pub struct RelayTransport {
    node_id: NodeId,
    endpoint: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: OnceCell<mpsc::Sender<RelayFrame>>,
    handles: Arc<DashMap<NodeId, ConnectionHandle>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayTransport {
    pub fn new(
        node_id: NodeId,
        endpoint: String,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            node_id,
            endpoint,
            events,
            link: OnceCell::new(),
            handles: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn link_sender(&self) -> Result<mpsc::Sender<RelayFrame>> {
        self.link
            .get()
            .cloned()
            .ok_or_else(|| Error::Transport("relay transport not started".into()))
    }

    /// Get or lazily create the virtual handle for a peer; returns
    /// `(handle, created)`.
    fn ensure_handle(
        handles: &DashMap<NodeId, ConnectionHandle>,
        link: mpsc::Sender<RelayFrame>,
        node_id: NodeId,
        peer: NodeId,
    ) -> (ConnectionHandle, bool) {
        if let Some(existing) = handles.get(&peer) {
            if existing.is_open() {
                return (existing.clone(), false);
            }
        }
        let (handle, mut rx) = ConnectionHandle::channel(peer, TransportKind::RelayServer);
        tokio::spawn({
            let handle = handle.clone();
            async move {
                while let Some(bytes) = rx.recv().await {
                    if handle.state() == super::LinkState::Closed {
                        break;
                    }
                    let frame = RelayFrame::Unicast {
                        to: peer,
                        from: node_id,
                        bytes,
                    };
                    if link.send(frame).await.is_err() {
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

    async fn write_frame(stream: &mut (impl AsyncWriteExt + Unpin), frame: &RelayFrame) -> Result<()> {
        let bytes = bincode::serialize(frame)?;
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, bytes.len() as u32);
        stream.write_all(&len_buf).await?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RelayServer
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| Error::Transport(format!("relay {}: {}", self.endpoint, e)))?;
        let (mut read_half, mut write_half) = stream.into_split();

        let (link_tx, mut link_rx) = mpsc::channel::<RelayFrame>(256);
        let _ = self.link.set(link_tx.clone());

        // Writer: serializes every outbound relay frame onto the socket.
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = link_rx.recv().await {
                if Self::write_frame(&mut write_half, &frame).await.is_err() {
                    break;
                }
            }
        });

        // Register before anything else flows.
        link_tx
            .send(RelayFrame::Register {
                node_id: self.node_id,
            })
            .await
            .map_err(|_| Error::Transport("relay writer gone at startup".into()))?;

        // Reader: demultiplexes server frames into transport events.
        let events = self.events.clone();
        let handles = self.handles.clone();
        let node_id = self.node_id;
        let running = self.running.clone();
        let reader_link = link_tx;
        let reader_task = tokio::spawn(async move {
            let mut len_buf = [0u8; 4];
            let reason = loop {
                if !running.load(Ordering::SeqCst) {
                    break "shutdown".to_string();
                }
                if let Err(e) = read_half.read_exact(&mut len_buf).await {
                    break e.to_string();
                }
                let len = LittleEndian::read_u32(&len_buf) as usize;
                if len > MAX_FRAME {
                    break format!("oversize relay frame of {} bytes", len);
                }
                let mut bytes = vec![0u8; len];
                if let Err(e) = read_half.read_exact(&mut bytes).await {
                    break e.to_string();
                }
                let frame: RelayFrame = match bincode::deserialize(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::debug!("undecodable relay frame: {}", e);
                        continue;
                    }
                };
                match frame {
                    RelayFrame::Unicast { from, bytes, .. } => {
                        let (handle, created) = RelayTransport::ensure_handle(
                            &handles,
                            reader_link.clone(),
                            node_id,
                            from,
                        );
                        if created {
                            let _ = events.send(TransportEvent::Connected { handle });
                        }
                        let _ = events.send(TransportEvent::FrameReceived {
                            peer: from,
                            kind: TransportKind::RelayServer,
                            signal_strength: TransportKind::RelayServer.default_signal(),
                            bytes,
                        });
                    }
                    RelayFrame::Broadcast { from, bytes } => {
                        if from != node_id {
                            let _ = events.send(TransportEvent::AnnounceReceived {
                                kind: TransportKind::RelayServer,
                                signal_strength: TransportKind::RelayServer.default_signal(),
                                origin: None,
                                bytes,
                            });
                        }
                    }
                    RelayFrame::Register { .. } => {}
                }
            };

            for entry in handles.iter() {
                entry.value().close();
            }
            handles.clear();
            let _ = events.send(TransportEvent::Error {
                peer: None,
                kind: TransportKind::RelayServer,
                message: format!("relay link lost: {}", reason),
            });
        });

        let mut tasks = self.tasks.lock();
        tasks.push(writer_task);
        tasks.push(reader_task);
        Ok(())
    }

    async fn announce(&self, frame: Vec<u8>) -> Result<()> {
        let link = self.link_sender()?;
        link.send(RelayFrame::Broadcast {
            from: self.node_id,
            bytes: frame,
        })
        .await
        .map_err(|_| Error::Transport("relay writer gone".into()))
    }

    async fn dial(&self, peer: NodeId, _endpoint: &str) -> Result<ConnectionHandle> {
        // Reachability through the relay is implicit once both sides are
        // registered; "dialing" just materializes the virtual session.
        let link = self.link_sender()?;
        let (handle, _) = Self::ensure_handle(&self.handles, link, self.node_id, peer);
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
        Some(String::from("relay"))
    }
}
