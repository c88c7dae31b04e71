//! Shared test harness: a scripted radio world.
#![allow(dead_code)]
//!
//! Each node gets a [`ShortRangeDriver`] attached to a common world with an
//! explicit adjacency set, so tests can build partial topologies (A-B-C
//! chains, diamonds) and cut links mid-flight. Directed sends can carry a
//! configurable latency to make ordering scenarios deterministic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use meshradio::config::NodeConfig;
use meshradio::error::{Error, Result};
use meshradio::protocol::NodeId;
use meshradio::transport::{DriverEvent, ShortRangeDriver, TransportKind};
use meshradio::{MeshEvent, MeshNode, Platform};

const RADIO_SIGNAL: u8 = 80;

struct WorldInner {
    radios: HashMap<NodeId, mpsc::UnboundedSender<DriverEvent>>,
    links: HashSet<(NodeId, NodeId)>,
    send_delay: Duration,
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A shared radio medium with scripted adjacency
#[derive(Clone)]
pub struct TestWorld {
    inner: Arc<Mutex<WorldInner>>,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::with_send_delay(Duration::from_millis(0))
    }

    /// Directed frames take `send_delay` to cross a link.
    pub fn with_send_delay(send_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WorldInner {
                radios: HashMap::new(),
                links: HashSet::new(),
                send_delay,
            })),
        }
    }

    pub fn driver(&self, node_id: NodeId) -> Arc<TestRadioDriver> {
        Arc::new(TestRadioDriver {
            node_id,
            world: self.inner.clone(),
        })
    }

    pub fn link(&self, a: NodeId, b: NodeId) {
        self.inner.lock().links.insert(link_key(a, b));
    }

    pub fn unlink(&self, a: NodeId, b: NodeId) {
        self.inner.lock().links.remove(&link_key(a, b));
    }
}

/// Radio driver bound to one node in a [`TestWorld`]
pub struct TestRadioDriver {
    node_id: NodeId,
    world: Arc<Mutex<WorldInner>>,
}

#[async_trait]
impl ShortRangeDriver for TestRadioDriver {
    async fn start(&self, events: mpsc::UnboundedSender<DriverEvent>) -> Result<()> {
        self.world.lock().radios.insert(self.node_id, events);
        Ok(())
    }

    async fn broadcast(&self, bytes: Vec<u8>) -> Result<()> {
        let neighbors: Vec<mpsc::UnboundedSender<DriverEvent>> = {
            let world = self.world.lock();
            world
                .radios
                .iter()
                .filter(|(id, _)| {
                    **id != self.node_id && world.links.contains(&link_key(self.node_id, **id))
                })
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in neighbors {
            let _ = tx.send(DriverEvent::Announce {
                signal_strength: RADIO_SIGNAL,
                bytes: bytes.clone(),
            });
        }
        Ok(())
    }

    async fn send(&self, peer: NodeId, bytes: Vec<u8>) -> Result<()> {
        let delay = self.world.lock().send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let tx = {
            let world = self.world.lock();
            if !world.links.contains(&link_key(self.node_id, peer)) {
                return Err(Error::Transport("radio link is down".into()));
            }
            world.radios.get(&peer).cloned()
        };
        let tx = tx.ok_or_else(|| Error::Transport("peer radio is off".into()))?;
        tx.send(DriverEvent::Frame {
            from: self.node_id,
            signal_strength: RADIO_SIGNAL,
            bytes,
        })
        .map_err(|_| Error::Transport("peer radio is gone".into()))
    }

    async fn stop(&self) {
        self.world.lock().radios.remove(&self.node_id);
    }
}

/// Node tuned for fast tests: short-range transport only, sub-second
/// announce cadence.
pub async fn spawn_node(world: &TestWorld, channel: u8) -> Arc<MeshNode> {
    let mut config = NodeConfig::default();
    config.transports_enabled = vec![TransportKind::ShortRange];
    config.announce_interval = Duration::from_millis(200);
    config.discovery_timeout = Duration::from_millis(1500);
    let node = Arc::new(MeshNode::new(config, Platform::in_process()).unwrap());
    node.set_short_range_driver(world.driver(node.node_id()));
    node.set_channel(channel).unwrap();
    node.power_on().await.unwrap();
    node
}

/// Capture every event a node emits. Keep the token alive for the test's
/// duration.
pub fn capture_events(
    node: &MeshNode,
) -> (
    mpsc::UnboundedReceiver<MeshEvent>,
    meshradio::SubscriptionToken,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = node.subscribe_events(move |event| {
        let _ = tx.send(event.clone());
    });
    (rx, token)
}

/// Wait until `deadline` for an event matching `predicate`.
pub async fn wait_for_event<F>(
    rx: &mut mpsc::UnboundedReceiver<MeshEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<MeshEvent>
where
    F: FnMut(&MeshEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) if predicate(&event) => return Some(event),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

/// Let announcements propagate until both sides know each other.
pub async fn settle(duration_ms: u64) {
    tokio::time::sleep(Duration::from_millis(duration_ms)).await;
}
