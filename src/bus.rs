//! In-process fan-out bus
//!
//! Routes one inbound event to every listener currently registered for its
//! event type. Each listener owns a bounded channel; a dispatch sends to the
//! listeners one after another in registration order.
//!
//! Slow listeners: with [`BusConfig::send_timeout`] set, a listener that does
//! not accept an event within the timeout is evicted and its channel closed,
//! so one stalled client cannot hold up the rest. With no timeout, dispatch
//! waits as long as it takes.

use crate::codec::Codec;
use crate::config::BusConfig;
use crate::error::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Listener identity
pub type ListenerId = Uuid;

/// An event routed by type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Routing key, e.g. `players.online`
    pub event_type: String,

    /// Encoded payload
    pub payload: Bytes,

    /// Last-value cache version written for this event, if it was cached
    pub version: Option<u64>,
}

impl Event {
    /// Event with an already encoded payload
    pub fn new(event_type: impl Into<String>, payload: Bytes) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            version: None,
        }
    }

    /// Tag the event with the cache version it was stored under
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Encode a value into an event
    pub fn encode<T, C: Codec<T>>(event_type: impl Into<String>, value: &T, codec: &C) -> Result<Self> {
        Ok(Self::new(event_type, codec.encode(value)?))
    }
}

struct Listener {
    id: ListenerId,
    sender: mpsc::Sender<Event>,
}

struct BusInner {
    config: BusConfig,
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

/// Fan-out bus handle; clones share one registry
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl Bus {
    /// Create an empty bus
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                listeners: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Listener>>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Listener>>> {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener for `event_type`
    pub fn subscribe(&self, event_type: &str) -> (mpsc::Receiver<Event>, ListenerId) {
        let (sender, receiver) = mpsc::channel(self.inner.config.listener_capacity.max(1));
        let id = Uuid::new_v4();

        self.write()
            .entry(event_type.to_string())
            .or_default()
            .push(Listener { id, sender });

        tracing::debug!(event_type = %event_type, listener = %id, "Bus listener added");
        (receiver, id)
    }

    /// Register a listener that unsubscribes itself when dropped
    pub fn subscribe_guarded(&self, event_type: &str) -> BusSubscription {
        let (receiver, id) = self.subscribe(event_type);
        BusSubscription {
            bus: self.clone(),
            event_type: event_type.to_string(),
            id,
            receiver,
        }
    }

    /// Remove a listener and close its channel. Unknown ids are ignored.
    pub fn unsubscribe(&self, event_type: &str, id: ListenerId) {
        let mut listeners = self.write();
        let Some(entries) = listeners.get_mut(event_type) else {
            return;
        };

        let before = entries.len();
        entries.retain(|listener| listener.id != id);
        let removed = entries.len() != before;

        if entries.is_empty() {
            listeners.remove(event_type);
        }

        if removed {
            tracing::debug!(event_type = %event_type, listener = %id, "Bus listener removed");
        }
    }

    /// Deliver an event to every listener of its type.
    ///
    /// Returns the number of listeners that accepted it.
    pub async fn dispatch(&self, event: Event) -> usize {
        let targets: Vec<(ListenerId, mpsc::Sender<Event>)> = self
            .read()
            .get(&event.event_type)
            .map(|entries| {
                entries
                    .iter()
                    .map(|listener| (listener.id, listener.sender.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        for (id, sender) in targets {
            let result = match self.inner.config.send_timeout {
                Some(timeout) => sender.send_timeout(event.clone(), timeout).await,
                None => sender
                    .send(event.clone())
                    .await
                    .map_err(|e| SendTimeoutError::Closed(e.0)),
            };

            match result {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    tracing::warn!(
                        event_type = %event.event_type,
                        listener = %id,
                        "Evicting slow bus listener"
                    );
                    self.unsubscribe(&event.event_type, id);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    tracing::debug!(
                        event_type = %event.event_type,
                        listener = %id,
                        "Removing bus listener with dropped receiver"
                    );
                    self.unsubscribe(&event.event_type, id);
                }
            }
        }

        delivered
    }

    /// Relay every event from each source into [`Bus::dispatch`] until the
    /// source closes or `cancel` fires.
    pub fn start(
        &self,
        cancel: CancellationToken,
        sources: Vec<mpsc::Receiver<Event>>,
    ) -> Vec<JoinHandle<()>> {
        sources
            .into_iter()
            .map(|source| tokio::spawn(relay(self.clone(), source, cancel.clone())))
            .collect()
    }

    /// Listeners registered for an event type
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.read().get(event_type).map(Vec::len).unwrap_or(0)
    }

    /// Event types with at least one listener
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.read().keys().cloned().collect();
        types.sort();
        types
    }
}

async fn relay(bus: Bus, mut source: mpsc::Receiver<Event>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = bus.dispatch(event) => {}
        }
    }
    tracing::debug!("Bus relay stopped");
}

/// A bus listener that unsubscribes on drop
pub struct BusSubscription {
    bus: Bus,
    event_type: String,
    id: ListenerId,
    receiver: mpsc::Receiver<Event>,
}

impl BusSubscription {
    /// Next event; `None` once the listener has been removed
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Listener identity
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Event type listened to
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.event_type, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ONLINE: &str = "players.online";

    fn event(n: u8) -> Event {
        Event::new(ONLINE, Bytes::copy_from_slice(&[n]))
    }

    #[tokio::test]
    async fn test_subscribe_then_dispatch() {
        let bus = Bus::default();
        let (mut rx, _id) = bus.subscribe(ONLINE);

        assert_eq!(bus.dispatch(event(1)).await, 1);
        assert_eq!(rx.recv().await.unwrap(), event(1));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_listener_before_returning() {
        let bus = Bus::default();
        let (mut a, _) = bus.subscribe(ONLINE);
        let (mut b, _) = bus.subscribe(ONLINE);

        assert_eq!(bus.dispatch(event(7)).await, 2);
        assert_eq!(a.try_recv().unwrap(), event(7));
        assert_eq!(b.try_recv().unwrap(), event(7));
    }

    #[tokio::test]
    async fn test_dispatch_other_type_not_delivered() {
        let bus = Bus::default();
        let (mut rx, _) = bus.subscribe(ONLINE);

        assert_eq!(bus.dispatch(Event::new("kit.granted", Bytes::new())).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_then_dispatch() {
        let bus = Bus::default();
        let (mut rx, id) = bus.subscribe(ONLINE);
        let (mut kept, _) = bus.subscribe(ONLINE);

        bus.unsubscribe(ONLINE, id);
        assert_eq!(bus.dispatch(event(2)).await, 1);

        assert!(rx.recv().await.is_none());
        assert_eq!(kept.recv().await.unwrap(), event(2));
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let bus = Bus::default();
        bus.unsubscribe(ONLINE, Uuid::new_v4());

        let (_rx, _id) = bus.subscribe(ONLINE);
        bus.unsubscribe(ONLINE, Uuid::new_v4());
        assert_eq!(bus.listener_count(ONLINE), 1);
    }

    #[test]
    fn test_last_unsubscribe_removes_event_type() {
        let bus = Bus::default();
        let (_a, a) = bus.subscribe(ONLINE);
        let (_b, b) = bus.subscribe(ONLINE);
        assert_eq!(bus.event_types(), vec![ONLINE.to_string()]);

        bus.unsubscribe(ONLINE, a);
        assert_eq!(bus.listener_count(ONLINE), 1);
        bus.unsubscribe(ONLINE, b);
        assert!(bus.event_types().is_empty());
    }

    #[test]
    fn test_guard_unsubscribes_on_drop() {
        let bus = Bus::default();
        let subscription = bus.subscribe_guarded(ONLINE);
        assert_eq!(subscription.event_type(), ONLINE);
        assert_eq!(bus.listener_count(ONLINE), 1);

        drop(subscription);
        assert_eq!(bus.listener_count(ONLINE), 0);
    }

    #[tokio::test]
    async fn test_order_preserved_per_listener() {
        let bus = Bus::new(BusConfig {
            listener_capacity: 8,
            send_timeout: None,
        });
        let (mut rx, _) = bus.subscribe(ONLINE);

        for n in 0..5 {
            bus.dispatch(event(n)).await;
        }
        for n in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), event(n));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_listener_evicted() {
        let bus = Bus::new(BusConfig {
            listener_capacity: 1,
            send_timeout: Some(Duration::from_millis(100)),
        });
        let (mut stalled, _) = bus.subscribe(ONLINE);
        let (mut healthy, _) = bus.subscribe(ONLINE);

        assert_eq!(bus.dispatch(event(1)).await, 2);
        assert_eq!(healthy.recv().await.unwrap(), event(1));

        // The stalled listener's buffer is still full.
        assert_eq!(bus.dispatch(event(2)).await, 1);
        assert_eq!(healthy.recv().await.unwrap(), event(2));
        assert_eq!(bus.listener_count(ONLINE), 1);

        assert_eq!(stalled.recv().await.unwrap(), event(1));
        assert!(stalled.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_blocking_dispatch_waits_for_reader() {
        let bus = Bus::new(BusConfig::blocking());
        let (mut rx, _) = bus.subscribe(ONLINE);

        bus.dispatch(event(1)).await;
        let pending = tokio::spawn({
            let bus = bus.clone();
            async move { bus.dispatch(event(2)).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await.unwrap(), event(1));
        assert_eq!(pending.await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), event(2));
    }

    #[tokio::test]
    async fn test_dropped_receiver_pruned_on_dispatch() {
        let bus = Bus::default();
        let (rx, _) = bus.subscribe(ONLINE);
        drop(rx);

        assert_eq!(bus.dispatch(event(1)).await, 0);
        assert_eq!(bus.listener_count(ONLINE), 0);
    }

    #[tokio::test]
    async fn test_start_relays_sources_until_cancelled() {
        let bus = Bus::default();
        let mut listener = bus.subscribe_guarded(ONLINE);
        let (source_tx, source_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handles = bus.start(cancel.clone(), vec![source_rx]);
        source_tx.send(event(3)).await.unwrap();
        assert_eq!(listener.recv().await.unwrap(), event(3));

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(source_tx.send(event(4)).await.is_err());
    }

    #[tokio::test]
    async fn test_start_stops_when_source_closes() {
        let bus = Bus::default();
        let (source_tx, source_rx) = mpsc::channel(1);

        let handles = bus.start(CancellationToken::new(), vec![source_rx]);
        drop(source_tx);
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
