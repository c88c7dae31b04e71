//! Direct LAN transport: TCP sessions plus UDP broadcast announcements.
//!
//! Every session opens with a 20-byte hello (`MRHI` + node id) in both
//! directions so each side knows who it is talking to before any frame
//! flows. Data frames are length-prefixed (u32 little-endian). The
//! announcement path is connectionless UDP broadcast on the same port.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::constants::MAX_PAYLOAD;
use crate::protocol::{short_id, NodeId};

use super::{ConnectionHandle, Transport, TransportEvent, TransportKind};

const HELLO_MAGIC: &[u8; 4] = b"MRHI";

/// Length-prefixed frames may exceed MAX_PAYLOAD by the packet header
const MAX_FRAME: usize = MAX_PAYLOAD + 1024;

pub struct DirectLanTransport {
    node_id: NodeId,
    port: u16,
    events: mpsc::UnboundedSender<TransportEvent>,
    running: Arc<AtomicBool>,
    udp: OnceCell<Arc<UdpSocket>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DirectLanTransport {
    pub fn new(node_id: NodeId, port: u16, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            node_id,
            port,
            events,
            running: Arc::new(AtomicBool::new(false)),
            udp: OnceCell::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Exchange hellos; returns the remote node id.
    async fn handshake(stream: &mut TcpStream, node_id: &NodeId) -> Result<NodeId> {
        let mut ours = [0u8; 20];
        ours[..4].copy_from_slice(HELLO_MAGIC);
        ours[4..].copy_from_slice(node_id);
        stream.write_all(&ours).await?;
        stream.flush().await?;

        let mut theirs = [0u8; 20];
        stream.read_exact(&mut theirs).await?;
        if &theirs[..4] != HELLO_MAGIC {
            return Err(Error::Transport("bad hello from peer".into()));
        }
        let mut peer: NodeId = [0u8; 16];
        peer.copy_from_slice(&theirs[4..]);
        Ok(peer)
    }

    /// Wire up reader and writer tasks for an established session.
    fn spawn_session(&self, stream: TcpStream, peer: NodeId) -> ConnectionHandle {
        let (handle, writer_rx) = ConnectionHandle::channel(peer, TransportKind::DirectLan);
        let (read_half, write_half) = stream.into_split();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Self::writer_loop(
            write_half,
            writer_rx,
            handle.clone(),
        )));
        tasks.push(tokio::spawn(Self::reader_loop(
            read_half,
            peer,
            self.events.clone(),
            handle.clone(),
        )));

        handle.mark_open();
        handle
    }

    async fn writer_loop(
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::Receiver<Vec<u8>>,
        handle: ConnectionHandle,
    ) {
        let mut len_buf = [0u8; 4];
        while let Some(bytes) = rx.recv().await {
            if handle.state() == super::LinkState::Closed {
                break;
            }
            LittleEndian::write_u32(&mut len_buf, bytes.len() as u32);
            if write_half.write_all(&len_buf).await.is_err()
                || write_half.write_all(&bytes).await.is_err()
                || write_half.flush().await.is_err()
            {
                handle.close();
                break;
            }
        }
    }

    async fn reader_loop(
        mut read_half: OwnedReadHalf,
        peer: NodeId,
        events: mpsc::UnboundedSender<TransportEvent>,
        handle: ConnectionHandle,
    ) {
        let mut len_buf = [0u8; 4];
        let reason = loop {
            if let Err(e) = read_half.read_exact(&mut len_buf).await {
                break e.to_string();
            }
            let len = LittleEndian::read_u32(&len_buf) as usize;
            if len > MAX_FRAME {
                break format!("oversize frame of {} bytes", len);
            }
            let mut bytes = vec![0u8; len];
            if let Err(e) = read_half.read_exact(&mut bytes).await {
                break e.to_string();
            }
            let _ = events.send(TransportEvent::FrameReceived {
                peer,
                kind: TransportKind::DirectLan,
                signal_strength: TransportKind::DirectLan.default_signal(),
                bytes,
            });
        };

        handle.mark_draining();
        handle.close();
        let _ = events.send(TransportEvent::Disconnected {
            peer,
            kind: TransportKind::DirectLan,
            reason,
        });
    }
}

#[async_trait]
impl Transport for DirectLanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::DirectLan
    }

    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;

        let udp = UdpSocket::bind(("0.0.0.0", self.port)).await?;
        udp.set_broadcast(true)?;
        let udp = Arc::new(udp);
        let _ = self.udp.set(udp.clone());

        // Accept loop for inbound sessions
        let node_id = self.node_id;
        let events = self.events.clone();
        let running = self.running.clone();
        let session_events = self.events.clone();
        let accept_task = tokio::spawn({
            let running = running.clone();
            async move {
                while running.load(Ordering::SeqCst) {
                    let (mut stream, addr) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("direct-lan accept failed: {}", e);
                            continue;
                        }
                    };
                    let events = events.clone();
                    let session_events = session_events.clone();
                    tokio::spawn(async move {
                        match DirectLanTransport::handshake(&mut stream, &node_id).await {
                            Ok(peer) => {
                                let (handle, writer_rx) =
                                    ConnectionHandle::channel(peer, TransportKind::DirectLan);
                                let (read_half, write_half) = stream.into_split();
                                tokio::spawn(DirectLanTransport::writer_loop(
                                    write_half,
                                    writer_rx,
                                    handle.clone(),
                                ));
                                tokio::spawn(DirectLanTransport::reader_loop(
                                    read_half,
                                    peer,
                                    session_events.clone(),
                                    handle.clone(),
                                ));
                                handle.mark_open();
                                let _ = events.send(TransportEvent::Connected { handle });
                            }
                            Err(e) => {
                                log::debug!("handshake with {} failed: {}", addr, e);
                            }
                        }
                    });
                }
            }
        });

        // Announcement listener
        let announce_events = self.events.clone();
        let announce_running = self.running.clone();
        let announce_udp = udp;
        let announce_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME];
            while announce_running.load(Ordering::SeqCst) {
                match announce_udp.recv_from(&mut buf).await {
                    Ok((len, origin)) => {
                        let _ = announce_events.send(TransportEvent::AnnounceReceived {
                            kind: TransportKind::DirectLan,
                            signal_strength: TransportKind::DirectLan.default_signal(),
                            origin: Some(origin.ip().to_string()),
                            bytes: buf[..len].to_vec(),
                        });
                    }
                    Err(e) => {
                        log::debug!("direct-lan announce socket error: {}", e);
                        break;
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(accept_task);
        tasks.push(announce_task);
        Ok(())
    }

    async fn announce(&self, frame: Vec<u8>) -> Result<()> {
        let udp = self
            .udp
            .get()
            .ok_or_else(|| Error::Transport("direct-lan transport not started".into()))?;
        let target = SocketAddr::from((Ipv4Addr::BROADCAST, self.port));
        udp.send_to(&frame, target).await?;
        Ok(())
    }

    async fn dial(&self, peer: NodeId, endpoint: &str) -> Result<ConnectionHandle> {
        let addr: SocketAddr = endpoint
            .parse()
            .map_err(|_| Error::DialFailed(format!("bad direct-lan endpoint {}", endpoint)))?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::DialFailed(format!("{}: {}", addr, e)))?;
        let remote = Self::handshake(&mut stream, &self.node_id).await?;
        if remote != peer {
            return Err(Error::DialFailed(format!(
                "expected {} at {}, found {}",
                short_id(&peer),
                addr,
                short_id(&remote)
            )));
        }
        Ok(self.spawn_session(stream, peer))
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    fn local_endpoint(&self) -> Option<String> {
        // The IP half is learned by receivers from the announce datagram's
        // origin; only the port needs advertising.
        Some(self.port.to_string())
    }
}
