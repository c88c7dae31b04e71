//! Event broker with explicit subscription tokens.
//!
//! Subscribers register callbacks and get back a token; dropping or
//! cancelling the token unsubscribes. Callbacks run on the publisher's
//! execution context with no engine lock held; a callback slower than
//! 100 ms is logged as slow but never throttles delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::channel::Transmission;
use crate::discovery::Peer;
use crate::protocol::NodeId;
use crate::session::PairingRecord;
use crate::status::Status;

/// Budget a subscriber callback gets before being called out as slow
const SLOW_SUBSCRIBER: Duration = Duration::from_millis(100);

/// Events the engine surfaces upward
#[derive(Debug, Clone)]
pub enum MeshEvent {
    PeerDiscovered(Peer),
    PeerUpdated(Peer),
    PeerLost(NodeId),
    TransmissionReceived(Transmission),
    EmergencyReceived(Transmission),
    StatusChanged(Status),
    PairingStateChanged(PairingRecord),
    FatalError(String),
}

type Callback = Arc<dyn Fn(&MeshEvent) + Send + Sync>;

type Registry = HashMap<u64, Callback>;

/// The engine-owned broker
pub struct EventBus {
    next_id: AtomicU64,
    registry: Arc<RwLock<Registry>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            registry: Arc::new(RwLock::new(Registry::new())),
        })
    }

    /// Register a callback for every event. The token unsubscribes on drop.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.write().insert(id, Arc::new(callback));
        SubscriptionToken {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an event to every subscriber, outside the registry lock.
    pub fn publish(&self, event: &MeshEvent) {
        let callbacks: Vec<Callback> = {
            let registry = self.registry.read();
            registry.values().cloned().collect()
        };
        for callback in callbacks {
            let started = Instant::now();
            callback(event);
            let elapsed = started.elapsed();
            if elapsed > SLOW_SUBSCRIBER {
                log::warn!(
                    "slow event subscriber took {:?} handling {:?}",
                    elapsed,
                    std::mem::discriminant(event)
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.read().len()
    }
}

/// Unsubscribes its callback when dropped or cancelled
pub struct SubscriptionToken {
    id: u64,
    registry: Weak<RwLock<Registry>>,
}

impl SubscriptionToken {
    /// Explicit unsubscribe; equivalent to dropping the token.
    pub fn cancel(self) {}
}

impl Drop for SubscriptionToken {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().remove(&self.id);
        }
    }
}
