use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::events::{
    AuctionClosedEvent, BidUpdateEvent, EventDispatcher, ItemId, Registration,
};
use crate::metrics::{CommandMetrics, ConnectionMetrics, EventMetrics};
use crate::websocket::{
    HubCommand, HubConnector, HubLink, LinkEvent, TransportOptions, WebSocketConnector,
    RECEIVE_AUCTION_CLOSED, RECEIVE_BID_UPDATE,
};

use super::{ConnectionEvent, ConnectionState, ConnectionStats, InterestSet};

/// Owns the single hub connection of the client.
///
/// Tracks the items the client is interested in, mirrors every change to the
/// hub, replays the full set after the transport reconnects and fans inbound
/// events out to registered listeners. Build one per session and share it
/// through an `Arc`.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

#[derive(Clone)]
struct LiveConnection {
    id: Uuid,
    link: Arc<dyn HubLink>,
}

#[derive(Default)]
struct Status {
    state: ConnectionState,
    live: Option<LiveConnection>,
    connected_since: Option<DateTime<Utc>>,
}

impl Status {
    fn is_current(&self, connection_id: Uuid) -> bool {
        self.live.as_ref().map(|live| live.id) == Some(connection_id)
    }

    /// Move to `next`. Returns `true` if the state actually changed.
    fn apply(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }

        self.state = next;
        match next {
            ConnectionState::Connected if self.connected_since.is_none() => {
                self.connected_since = Some(Utc::now());
            }
            ConnectionState::Disconnected => self.connected_since = None,
            _ => {}
        }
        ConnectionMetrics::set_state(next);
        true
    }
}

struct Shared {
    endpoint: String,
    connector: Arc<dyn HubConnector>,
    /// Serializes connection attempts and `stop`
    connect_guard: tokio::sync::Mutex<()>,
    // Lock order: status, then interest
    status: RwLock<Status>,
    interest: Mutex<InterestSet>,
    dispatcher: EventDispatcher,
    reconnections: AtomicU64,
    resync_failures: AtomicU64,
}

impl ConnectionManager {
    /// Manager for the hub behind `config.api_base_url`, using the WebSocket
    /// transport
    pub fn new(config: &RealtimeConfig) -> Self {
        let connector = WebSocketConnector::new(TransportOptions::from(config));
        Self::with_connector(config.hub_endpoint(), Arc::new(connector))
    }

    pub fn with_connector(endpoint: impl Into<String>, connector: Arc<dyn HubConnector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint: endpoint.into(),
                connector,
                connect_guard: tokio::sync::Mutex::new(()),
                status: RwLock::new(Status::default()),
                interest: Mutex::new(InterestSet::new()),
                dispatcher: EventDispatcher::new(),
                reconnections: AtomicU64::new(0),
                resync_failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Open the hub connection unless one already exists.
    ///
    /// Concurrent callers share a single attempt. Resolves once the
    /// handshake has completed.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.shared.connect().await.map(|_| ())
    }

    /// Watch `item_id`. The id is tracked only after the hub acknowledged it.
    #[tracing::instrument(skip(self))]
    pub async fn subscribe_item(&self, item_id: ItemId) -> Result<()> {
        let live = self.shared.connect().await?;
        self.shared
            .invoke(&live, HubCommand::SubscribeItem(item_id))
            .await?;
        self.shared.commit(live.id, |interest| {
            interest.subscribe(item_id);
        })?;

        tracing::debug!(connection_id = %live.id, item_id, "Subscribed to item");
        Ok(())
    }

    /// Stop watching `item_id`. Without a connected hub the id is only
    /// dropped locally; the next resync brings the server in line.
    #[tracing::instrument(skip(self))]
    pub async fn unsubscribe_item(&self, item_id: ItemId) -> Result<()> {
        let live = {
            let status = self.shared.status.read();
            match (&status.live, status.state) {
                (Some(live), ConnectionState::Connected) => live.clone(),
                _ => {
                    let mut interest = self.shared.interest.lock();
                    interest.unsubscribe(item_id);
                    ConnectionMetrics::set_interest_items(interest.len());
                    tracing::debug!(item_id, state = %status.state, "Removed item locally");
                    return Ok(());
                }
            }
        };

        self.shared
            .invoke(&live, HubCommand::UnsubscribeItem(item_id))
            .await?;
        self.shared.commit(live.id, |interest| {
            interest.unsubscribe(item_id);
        })?;

        tracing::debug!(connection_id = %live.id, item_id, "Unsubscribed from item");
        Ok(())
    }

    /// Replace the whole interest set with `item_ids` in one command
    #[tracing::instrument(skip(self, item_ids), fields(count = item_ids.len()))]
    pub async fn set_visible_items(&self, item_ids: &[ItemId]) -> Result<()> {
        let live = self.shared.connect().await?;
        self.shared
            .invoke(&live, HubCommand::SetVisibleItems(item_ids.to_vec()))
            .await?;
        self.shared.commit(live.id, |interest| {
            interest.replace_all(item_ids.iter().copied());
        })?;

        tracing::debug!(connection_id = %live.id, count = item_ids.len(), "Visible items replaced");
        Ok(())
    }

    pub fn on_bid_update<F>(&self, handler: F) -> Registration
    where
        F: Fn(&BidUpdateEvent) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on_bid_update(handler)
    }

    pub fn on_auction_closed<F>(&self, handler: F) -> Registration
    where
        F: Fn(&AuctionClosedEvent) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on_auction_closed(handler)
    }

    /// Listen for state transitions and resync failures. Transitions into
    /// `Connecting` are not reported.
    pub fn on_state_change<F>(&self, handler: F) -> Registration
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on_connection_event(handler)
    }

    /// Tear the connection down and forget every tracked item. Idempotent.
    pub async fn stop(&self) {
        self.shared.stop().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.read().state
    }

    /// Tracked item ids, ascending
    pub fn interest(&self) -> Vec<ItemId> {
        self.shared.interest.lock().to_vec()
    }

    pub fn stats(&self) -> ConnectionStats {
        let status = self.shared.status.read();
        ConnectionStats {
            state: status.state,
            interest_count: self.shared.interest.lock().len(),
            reconnections: self.shared.reconnections.load(Ordering::Relaxed),
            resync_failures: self.shared.resync_failures.load(Ordering::Relaxed),
            connected_since: status.connected_since,
        }
    }
}

impl Shared {
    fn live(&self) -> Option<LiveConnection> {
        self.status.read().live.clone()
    }

    fn live_with_id(&self, connection_id: Uuid) -> Option<LiveConnection> {
        self.status
            .read()
            .live
            .clone()
            .filter(|live| live.id == connection_id)
    }

    async fn connect(self: &Arc<Self>) -> Result<LiveConnection> {
        if let Some(live) = self.live() {
            return Ok(live);
        }

        let _guard = self.connect_guard.lock().await;
        if let Some(live) = self.live() {
            return Ok(live);
        }

        self.status.write().apply(ConnectionState::Connecting);
        ConnectionMetrics::record_connect_attempt();
        tracing::info!(endpoint = %self.endpoint, "Connecting to auction hub");

        let handle = match self.connector.connect(&self.endpoint).await {
            Ok(handle) => handle,
            Err(e) => {
                ConnectionMetrics::record_handshake_failure();
                let error = match e {
                    RealtimeError::Handshake(_) => e,
                    other => RealtimeError::handshake(other.to_string()),
                };
                tracing::warn!(endpoint = %self.endpoint, error = %error, "Hub connection failed");

                let changed = self.status.write().apply(ConnectionState::Disconnected);
                if changed {
                    self.announce(ConnectionState::Disconnected, Some(error.to_string()));
                }
                return Err(error);
            }
        };

        let live = LiveConnection {
            id: Uuid::new_v4(),
            link: handle.link,
        };
        let changed = {
            let mut status = self.status.write();
            status.live = Some(live.clone());
            status.apply(ConnectionState::Connected)
        };
        tokio::spawn(pump_events(Arc::downgrade(self), live.id, handle.events));

        tracing::info!(connection_id = %live.id, endpoint = %self.endpoint, "Connected to auction hub");
        if changed {
            self.announce(ConnectionState::Connected, None);
        }

        // Interest retained from a connection that closed for good
        self.resync(&live).await;
        Ok(live)
    }

    async fn stop(&self) {
        let _guard = self.connect_guard.lock().await;

        let (live, changed) = {
            let mut status = self.status.write();
            let live = status.live.take();
            let mut interest = self.interest.lock();
            interest.clear();
            ConnectionMetrics::set_interest_items(0);
            (live, status.apply(ConnectionState::Disconnected))
        };

        if let Some(live) = live {
            live.link.stop().await;
            tracing::info!(connection_id = %live.id, "Hub connection stopped");
        }
        if changed {
            self.announce(ConnectionState::Disconnected, None);
        }
    }

    async fn invoke(&self, live: &LiveConnection, command: HubCommand) -> Result<()> {
        let target = command.target();
        let started = Instant::now();

        match live.link.invoke(command).await {
            Ok(()) => {
                CommandMetrics::record_sent(target, started.elapsed());
                Ok(())
            }
            Err(e) => {
                CommandMetrics::record_failed(target);
                tracing::warn!(connection_id = %live.id, command = target, error = %e, "Hub command failed");
                Err(match e {
                    RealtimeError::Transport(_) => e,
                    other => RealtimeError::transport(other.to_string()),
                })
            }
        }
    }

    /// Apply an acknowledged mutation, unless the connection it was sent on
    /// is gone
    fn commit(&self, connection_id: Uuid, mutate: impl FnOnce(&mut InterestSet)) -> Result<()> {
        let status = self.status.read();
        if !status.is_current(connection_id) {
            return Err(RealtimeError::transport(
                "connection closed before the command was applied",
            ));
        }

        let mut interest = self.interest.lock();
        mutate(&mut interest);
        ConnectionMetrics::set_interest_items(interest.len());
        Ok(())
    }

    /// Send the full interest set. Failures are reported to listeners and
    /// never returned.
    async fn resync(&self, live: &LiveConnection) {
        let item_ids = self.interest.lock().to_vec();
        if item_ids.is_empty() {
            return;
        }

        tracing::info!(connection_id = %live.id, count = item_ids.len(), "Replaying interest set");
        if let Err(e) = self
            .invoke(live, HubCommand::SetVisibleItems(item_ids.clone()))
            .await
        {
            if self.live_with_id(live.id).is_none() {
                tracing::debug!(connection_id = %live.id, error = %e, "Resync interrupted by connection teardown");
                return;
            }
            self.resync_failures.fetch_add(1, Ordering::Relaxed);
            ConnectionMetrics::record_resync_failure();
            tracing::warn!(connection_id = %live.id, error = %e, "Interest resync failed");
            self.dispatcher
                .dispatch_connection_event(&ConnectionEvent::ResyncFailed {
                    item_ids,
                    error: e.to_string(),
                });
        }
    }

    /// Transition the connection `connection_id`, ignoring stale links
    fn transition(&self, connection_id: Uuid, next: ConnectionState, reason: Option<String>) {
        let changed = {
            let mut status = self.status.write();
            if !status.is_current(connection_id) {
                return;
            }
            if next == ConnectionState::Disconnected {
                status.live = None;
            }
            status.apply(next)
        };

        if changed {
            tracing::info!(connection_id = %connection_id, state = %next, reason = ?reason, "Hub connection state changed");
            self.announce(next, reason);
        }
    }

    fn announce(&self, state: ConnectionState, reason: Option<String>) {
        if state.is_observable() {
            self.dispatcher
                .dispatch_connection_event(&ConnectionEvent::StateChanged { state, reason });
        }
    }

    async fn handle_link_event(&self, connection_id: Uuid, event: LinkEvent) {
        match event {
            LinkEvent::Invocation { target, arguments } => self.route_invocation(&target, arguments),
            LinkEvent::Reconnecting { reason } => {
                self.transition(connection_id, ConnectionState::Reconnecting, Some(reason));
            }
            LinkEvent::Reconnected => {
                self.reconnections.fetch_add(1, Ordering::Relaxed);
                ConnectionMetrics::record_reconnected();
                self.transition(connection_id, ConnectionState::Connected, None);
                if let Some(live) = self.live_with_id(connection_id) {
                    self.resync(&live).await;
                }
            }
            LinkEvent::Closed { error } => {
                self.transition(connection_id, ConnectionState::Disconnected, error);
            }
        }
    }

    fn route_invocation(&self, target: &str, arguments: Vec<Value>) {
        if target.eq_ignore_ascii_case(RECEIVE_BID_UPDATE) {
            match first_argument::<BidUpdateEvent>(arguments) {
                Ok(event) => {
                    self.dispatcher.dispatch_bid_update(&event);
                }
                Err(e) => {
                    EventMetrics::record_undecodable();
                    tracing::warn!(method = target, error = %e, "Dropping malformed bid update");
                }
            }
        } else if target.eq_ignore_ascii_case(RECEIVE_AUCTION_CLOSED) {
            match first_argument::<AuctionClosedEvent>(arguments) {
                Ok(event) => {
                    self.dispatcher.dispatch_auction_closed(&event);
                }
                Err(e) => {
                    EventMetrics::record_undecodable();
                    tracing::warn!(method = target, error = %e, "Dropping malformed auction closed event");
                }
            }
        } else {
            EventMetrics::record_unknown_target();
            tracing::debug!(method = target, "No handler for hub method");
        }
    }
}

fn first_argument<T: DeserializeOwned>(arguments: Vec<Value>) -> Result<T> {
    let payload = arguments
        .into_iter()
        .next()
        .ok_or_else(|| RealtimeError::Protocol("invocation without arguments".to_string()))?;
    Ok(serde_json::from_value(payload)?)
}

/// Forward link events for one connection until the link closes or the
/// manager is dropped
async fn pump_events(
    shared: Weak<Shared>,
    connection_id: Uuid,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let closed = matches!(event, LinkEvent::Closed { .. });
        shared.handle_link_event(connection_id, event).await;
        if closed {
            tracing::debug!(connection_id = %connection_id, "Link event pump finished");
            return;
        }
    }

    // The driver went away without reporting a close
    if let Some(shared) = shared.upgrade() {
        tracing::warn!(connection_id = %connection_id, "Link driver exited without closing");
        shared.transition(
            connection_id,
            ConnectionState::Disconnected,
            Some("link driver exited".to_string()),
        );
    }
    tracing::debug!(connection_id = %connection_id, "Link event pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use crate::websocket::LinkHandle;

    #[derive(Default)]
    struct MockHub {
        connects: AtomicUsize,
        fail_connect: AtomicBool,
        connect_delay_ms: AtomicU64,
        invoke_delay_ms: AtomicU64,
        commands: Mutex<Vec<HubCommand>>,
        rejected_targets: Mutex<HashSet<&'static str>>,
        events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    }

    impl MockHub {
        fn push(&self, event: LinkEvent) {
            if let Some(events) = self.events.lock().as_ref() {
                let _ = events.send(event);
            }
        }

        fn commands(&self) -> Vec<HubCommand> {
            self.commands.lock().clone()
        }

        fn reject(&self, target: &'static str) {
            self.rejected_targets.lock().insert(target);
        }

        fn accept_all(&self) {
            self.rejected_targets.lock().clear();
        }
    }

    struct MockConnector {
        hub: Arc<MockHub>,
    }

    #[async_trait]
    impl HubConnector for MockConnector {
        async fn connect(&self, _endpoint: &str) -> Result<LinkHandle> {
            self.hub.connects.fetch_add(1, Ordering::SeqCst);
            let delay = self.hub.connect_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.hub.fail_connect.load(Ordering::SeqCst) {
                return Err(RealtimeError::handshake("connection refused"));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            *self.hub.events.lock() = Some(tx);
            Ok(LinkHandle {
                link: Arc::new(MockLink {
                    hub: self.hub.clone(),
                    stopped: AtomicBool::new(false),
                }),
                events: rx,
            })
        }
    }

    struct MockLink {
        hub: Arc<MockHub>,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl HubLink for MockLink {
        async fn invoke(&self, command: HubCommand) -> Result<()> {
            let delay = self.hub.invoke_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.stopped.load(Ordering::SeqCst) {
                return Err(RealtimeError::transport("link stopped"));
            }
            let target = command.target();
            self.hub.commands.lock().push(command);
            if self.hub.rejected_targets.lock().contains(target) {
                return Err(RealtimeError::transport(format!("{} rejected", target)));
            }
            Ok(())
        }

        async fn stop(&self) {
            if !self.stopped.swap(true, Ordering::SeqCst) {
                if let Some(events) = self.hub.events.lock().take() {
                    let _ = events.send(LinkEvent::Closed { error: None });
                }
            }
        }
    }

    fn manager() -> (ConnectionManager, Arc<MockHub>) {
        let hub = Arc::new(MockHub::default());
        let connector = MockConnector { hub: hub.clone() };
        let manager = ConnectionManager::with_connector("ws://hub.test/auctionHub", Arc::new(connector));
        (manager, hub)
    }

    fn record_events(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _ = manager.on_state_change(move |event| sink.lock().push(event.clone()));
        seen
    }

    fn states(events: &Mutex<Vec<ConnectionEvent>>) -> Vec<ConnectionState> {
        events.lock().iter().filter_map(|e| e.state()).collect()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn bid_payload(item_id: i64, price: f64) -> Value {
        json!({
            "auctionItemId": item_id,
            "currentPrice": price,
            "endTime": "2025-03-01T12:00:00Z",
            "bidTime": "2025-03-01T11:59:58Z",
            "bidId": 1,
            "currentHighestBidUserId": 7,
            "currentHighestBidUserName": "carol"
        })
    }

    #[tokio::test]
    async fn test_ensure_connected_is_idempotent() {
        let (manager, hub) = manager();
        let events = record_events(&manager);

        manager.ensure_connected().await.unwrap();
        manager.ensure_connected().await.unwrap();

        assert_eq!(hub.connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(states(&events), vec![ConnectionState::Connected]);
        assert!(manager.stats().connected_since.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_connected_makes_one_attempt() {
        let (manager, hub) = manager();
        hub.connect_delay_ms.store(50, Ordering::SeqCst);

        let (a, b, c, d) = tokio::join!(
            manager.ensure_connected(),
            manager.ensure_connected(),
            manager.subscribe_item(1),
            manager.ensure_connected(),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok() && d.is_ok());
        assert_eq!(hub.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mutation_sequence_net_effect() {
        let (manager, hub) = manager();

        manager.subscribe_item(1).await.unwrap();
        manager.subscribe_item(2).await.unwrap();
        manager.set_visible_items(&[3, 4]).await.unwrap();
        manager.subscribe_item(5).await.unwrap();
        manager.unsubscribe_item(3).await.unwrap();

        assert_eq!(manager.interest(), vec![4, 5]);
        assert_eq!(
            hub.commands(),
            vec![
                HubCommand::SubscribeItem(1),
                HubCommand::SubscribeItem(2),
                HubCommand::SetVisibleItems(vec![3, 4]),
                HubCommand::SubscribeItem(5),
                HubCommand::UnsubscribeItem(3),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_command_leaves_interest_unchanged() {
        let (manager, hub) = manager();
        manager.subscribe_item(1).await.unwrap();

        hub.reject("SubscribeItem");
        let result = manager.subscribe_item(2).await;
        assert!(matches!(result, Err(RealtimeError::Transport(_))));

        hub.reject("SetVisibleItems");
        assert!(manager.set_visible_items(&[8, 9]).await.is_err());

        assert_eq!(manager.interest(), vec![1]);
    }

    #[tokio::test]
    async fn test_unsubscribe_while_disconnected_sends_nothing() {
        let (manager, hub) = manager();

        manager.unsubscribe_item(4).await.unwrap();

        assert_eq!(hub.connects.load(Ordering::SeqCst), 0);
        assert!(hub.commands().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_resends_interest_once() {
        let (manager, hub) = manager();
        let events = record_events(&manager);
        manager.subscribe_item(1).await.unwrap();
        manager.subscribe_item(2).await.unwrap();

        hub.push(LinkEvent::Reconnecting {
            reason: "socket closed".to_string(),
        });
        hub.push(LinkEvent::Reconnected);

        wait_until(|| manager.stats().reconnections == 1 && hub.commands().len() == 3).await;
        // Give a stray duplicate replay the chance to show up
        tokio::time::sleep(Duration::from_millis(20)).await;

        let replays: Vec<HubCommand> = hub
            .commands()
            .into_iter()
            .filter(|c| matches!(c, HubCommand::SetVisibleItems(_)))
            .collect();
        assert_eq!(replays, vec![HubCommand::SetVisibleItems(vec![1, 2])]);
        assert_eq!(
            states(&events),
            vec![
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_with_empty_interest_sends_nothing() {
        let (manager, hub) = manager();
        manager.ensure_connected().await.unwrap();

        hub.push(LinkEvent::Reconnecting {
            reason: "timeout".to_string(),
        });
        hub.push(LinkEvent::Reconnected);
        wait_until(|| manager.stats().reconnections == 1).await;

        assert!(hub.commands().is_empty());
    }

    #[tokio::test]
    async fn test_resync_failure_is_reported_not_fatal() {
        let (manager, hub) = manager();
        let events = record_events(&manager);
        manager.set_visible_items(&[10, 11]).await.unwrap();
        hub.reject("SetVisibleItems");

        hub.push(LinkEvent::Reconnecting {
            reason: "socket closed".to_string(),
        });
        hub.push(LinkEvent::Reconnected);
        wait_until(|| manager.stats().resync_failures == 1).await;

        let failure = events
            .lock()
            .iter()
            .find_map(|e| match e {
                ConnectionEvent::ResyncFailed { item_ids, .. } => Some(item_ids.clone()),
                _ => None,
            });
        assert_eq!(failure, Some(vec![10, 11]));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.interest(), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_unsubscribe_while_reconnecting_is_local_until_resync() {
        let (manager, hub) = manager();
        manager.set_visible_items(&[1, 2, 3]).await.unwrap();

        hub.push(LinkEvent::Reconnecting {
            reason: "socket closed".to_string(),
        });
        wait_until(|| manager.state() == ConnectionState::Reconnecting).await;

        manager.unsubscribe_item(2).await.unwrap();
        assert_eq!(hub.commands().len(), 1);

        hub.push(LinkEvent::Reconnected);
        wait_until(|| hub.commands().len() == 2).await;
        assert_eq!(hub.commands()[1], HubCommand::SetVisibleItems(vec![1, 3]));
    }

    #[tokio::test]
    async fn test_stop_then_reconnect_starts_empty() {
        let (manager, hub) = manager();
        let events = record_events(&manager);
        manager.set_visible_items(&[1, 2]).await.unwrap();

        manager.stop().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.interest().is_empty());

        manager.stop().await;

        manager.ensure_connected().await.unwrap();
        assert_eq!(hub.connects.load(Ordering::SeqCst), 2);
        assert_eq!(hub.commands(), vec![HubCommand::SetVisibleItems(vec![1, 2])]);
        assert_eq!(
            states(&events),
            vec![
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn test_unrecoverable_close_retains_interest_for_next_connection() {
        let (manager, hub) = manager();
        let events = record_events(&manager);
        manager.subscribe_item(5).await.unwrap();

        hub.push(LinkEvent::Closed {
            error: Some("reconnect attempts exhausted".to_string()),
        });
        wait_until(|| manager.state() == ConnectionState::Disconnected).await;

        assert_eq!(manager.interest(), vec![5]);
        assert!(events.lock().contains(&ConnectionEvent::StateChanged {
            state: ConnectionState::Disconnected,
            reason: Some("reconnect attempts exhausted".to_string()),
        }));

        manager.ensure_connected().await.unwrap();
        assert_eq!(hub.connects.load(Ordering::SeqCst), 2);
        assert_eq!(
            hub.commands().last(),
            Some(&HubCommand::SetVisibleItems(vec![5]))
        );
    }

    #[tokio::test]
    async fn test_handshake_failure() {
        let (manager, hub) = manager();
        let events = record_events(&manager);
        hub.fail_connect.store(true, Ordering::SeqCst);

        let result = manager.subscribe_item(1).await;
        assert!(matches!(result, Err(RealtimeError::Handshake(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.interest().is_empty());
        assert_eq!(states(&events), vec![ConnectionState::Disconnected]);

        hub.fail_connect.store(false, Ordering::SeqCst);
        hub.accept_all();
        manager.subscribe_item(1).await.unwrap();
        assert_eq!(manager.interest(), vec![1]);
    }

    #[tokio::test]
    async fn test_inbound_events_are_routed() {
        let (manager, hub) = manager();
        let bids = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(Vec::new()));

        let sink = bids.clone();
        let _ = manager.on_bid_update(move |event| sink.lock().push(event.current_price));
        let sink = closed.clone();
        let _ = manager.on_auction_closed(move |event| sink.lock().push(event.item_id));

        manager.ensure_connected().await.unwrap();
        hub.push(LinkEvent::Invocation {
            target: "ReceiveBidUpdate".to_string(),
            arguments: vec![json!({"auctionItemId": "not a number"})],
        });
        hub.push(LinkEvent::Invocation {
            target: "ReceiveSomethingElse".to_string(),
            arguments: vec![],
        });
        hub.push(LinkEvent::Invocation {
            target: "receivebidupdate".to_string(),
            arguments: vec![bid_payload(3, 120.0)],
        });
        hub.push(LinkEvent::Invocation {
            target: "ReceiveAuctionClosed".to_string(),
            arguments: vec![json!({
                "auctionItemId": 3,
                "finalPrice": 120.0,
                "endTime": "2025-03-01T12:00:00Z",
                "status": 2,
                "winnerId": 7
            })],
        });

        wait_until(|| closed.lock().len() == 1).await;
        assert_eq!(*bids.lock(), vec![120.0]);
        assert_eq!(*closed.lock(), vec![3]);
    }

    #[tokio::test]
    async fn test_unregistered_handler_stops_receiving() {
        let (manager, hub) = manager();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        let first_handle = manager.on_bid_update(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = second.clone();
        let _second_handle = manager.on_bid_update(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        manager.ensure_connected().await.unwrap();
        hub.push(LinkEvent::Invocation {
            target: RECEIVE_BID_UPDATE.to_string(),
            arguments: vec![bid_payload(1, 10.0)],
        });
        wait_until(|| second.load(Ordering::SeqCst) == 1).await;

        assert!(first_handle.unregister());
        hub.push(LinkEvent::Invocation {
            target: RECEIVE_BID_UPDATE.to_string(),
            arguments: vec![bid_payload(1, 11.0)],
        });
        wait_until(|| second.load(Ordering::SeqCst) == 2).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_driver_exit_without_close_disconnects() {
        let (manager, hub) = manager();
        let events = record_events(&manager);
        manager.subscribe_item(6).await.unwrap();

        // Dropping the sender ends the event stream with no Closed event
        drop(hub.events.lock().take());
        wait_until(|| manager.state() == ConnectionState::Disconnected).await;

        assert!(events.lock().contains(&ConnectionEvent::StateChanged {
            state: ConnectionState::Disconnected,
            reason: Some("link driver exited".to_string()),
        }));
        assert_eq!(manager.interest(), vec![6]);

        manager.ensure_connected().await.unwrap();
        assert_eq!(hub.connects.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(
            hub.commands().last(),
            Some(&HubCommand::SetVisibleItems(vec![6]))
        );
    }

    #[tokio::test]
    async fn test_stop_during_resync_reports_no_failure() {
        let (manager, hub) = manager();
        let events = record_events(&manager);
        manager.set_visible_items(&[1, 2]).await.unwrap();
        hub.invoke_delay_ms.store(100, Ordering::SeqCst);

        hub.push(LinkEvent::Reconnecting {
            reason: "socket closed".to_string(),
        });
        hub.push(LinkEvent::Reconnected);
        wait_until(|| {
            manager.stats().reconnections == 1 && manager.state() == ConnectionState::Connected
        })
        .await;

        manager.stop().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(manager.stats().resync_failures, 0);
        assert!(!events
            .lock()
            .iter()
            .any(|e| matches!(e, ConnectionEvent::ResyncFailed { .. })));
        assert_eq!(states(&events).last(), Some(&ConnectionState::Disconnected));
    }
}
