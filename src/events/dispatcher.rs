use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::connection_manager::ConnectionEvent;
use crate::metrics::EventMetrics;

use super::{AuctionClosedEvent, BidUpdateEvent};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Something a [`Registration`] can be revoked from
trait Revoke: Send + Sync {
    fn revoke(&self, token: u64) -> bool;
}

/// Handle returned by every `on_*` registration.
///
/// Dropping the handle keeps the handler registered; call
/// [`Registration::unregister`] to stop delivery.
pub struct Registration {
    token: u64,
    registry: Weak<dyn Revoke>,
}

impl Registration {
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unregister(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.revoke(self.token),
            None => false,
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("token", &self.token)
            .finish()
    }
}

/// Token-keyed callback registry for one event kind.
///
/// Tokens are monotonically increasing, so iteration order of the map is
/// registration order.
pub struct HandlerRegistry<T> {
    name: &'static str,
    next_token: AtomicU64,
    handlers: RwLock<BTreeMap<u64, Callback<T>>>,
}

impl<T: 'static> HandlerRegistry<T> {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            next_token: AtomicU64::new(1),
            handlers: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn register<F>(self: &Arc<Self>, handler: F) -> Registration
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().insert(token, Arc::new(handler));

        tracing::debug!(registry = self.name, token, "Handler registered");

        let registry: Arc<dyn Revoke> = self.clone();
        Registration {
            token,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Invoke every handler registered at the time of the call, in
    /// registration order. A panicking handler is logged and skipped.
    ///
    /// Returns the number of handlers that completed.
    pub fn dispatch(&self, event: &T) -> usize {
        // Snapshot so handlers can (un)register without deadlocking
        let snapshot: Vec<(u64, Callback<T>)> = self
            .handlers
            .read()
            .iter()
            .map(|(token, handler)| (*token, handler.clone()))
            .collect();

        let mut completed = 0;
        for (token, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => completed += 1,
                Err(_) => {
                    EventMetrics::record_handler_panic(self.name);
                    tracing::error!(registry = self.name, token, "Event handler panicked");
                }
            }
        }
        completed
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl<T: 'static> Revoke for HandlerRegistry<T> {
    fn revoke(&self, token: u64) -> bool {
        let removed = self.handlers.write().remove(&token).is_some();
        if removed {
            tracing::debug!(registry = self.name, token, "Handler unregistered");
        }
        removed
    }
}

/// Fan-out of inbound hub events and connection state changes to
/// independently registered listeners
pub struct EventDispatcher {
    bid_updates: Arc<HandlerRegistry<BidUpdateEvent>>,
    auction_closed: Arc<HandlerRegistry<AuctionClosedEvent>>,
    connection: Arc<HandlerRegistry<ConnectionEvent>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            bid_updates: HandlerRegistry::new("bid_update"),
            auction_closed: HandlerRegistry::new("auction_closed"),
            connection: HandlerRegistry::new("connection"),
        }
    }

    pub fn on_bid_update<F>(&self, handler: F) -> Registration
    where
        F: Fn(&BidUpdateEvent) + Send + Sync + 'static,
    {
        self.bid_updates.register(handler)
    }

    pub fn on_auction_closed<F>(&self, handler: F) -> Registration
    where
        F: Fn(&AuctionClosedEvent) + Send + Sync + 'static,
    {
        self.auction_closed.register(handler)
    }

    pub fn on_connection_event<F>(&self, handler: F) -> Registration
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.connection.register(handler)
    }

    pub fn dispatch_bid_update(&self, event: &BidUpdateEvent) -> usize {
        EventMetrics::record_received("bid_update");
        self.bid_updates.dispatch(event)
    }

    pub fn dispatch_auction_closed(&self, event: &AuctionClosedEvent) -> usize {
        EventMetrics::record_received("auction_closed");
        self.auction_closed.dispatch(event)
    }

    pub fn dispatch_connection_event(&self, event: &ConnectionEvent) -> usize {
        self.connection.dispatch(event)
    }

    /// Number of registered handlers (bid, closed, connection)
    pub fn handler_counts(&self) -> (usize, usize, usize) {
        (
            self.bid_updates.len(),
            self.auction_closed.len(),
            self.connection.len(),
        )
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
