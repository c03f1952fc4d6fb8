//! Cache-then-live streaming
//!
//! [`LiveFeed`] is the producer side: it records the latest payload of an
//! event type and dispatches it on the [`Bus`]. [`CachedLiveStream`] is the
//! reader side: it seeds a client with the cached payload and then relays
//! every later dispatch until the client goes away.
//!
//! ```rust,no_run
//! use nats_streambus::bus::Bus;
//! use nats_streambus::cache::MemoryLastValueCache;
//! use nats_streambus::live::{CachedLiveStream, LiveFeed};
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> nats_streambus::Result<()> {
//! let bus = Bus::default();
//! let cache = Arc::new(MemoryLastValueCache::new());
//! let feed = LiveFeed::new(bus.clone(), cache.clone());
//!
//! let mut counts = CachedLiveStream::<u32>::new(bus, cache, "players.online")
//!     .open(CancellationToken::new())
//!     .await?;
//! feed.publish("players.online", &5u32).await?;
//! assert_eq!(counts.next().await, Some(5));
//! # Ok(())
//! # }
//! ```

use crate::bus::{Bus, BusSubscription, Event};
use crate::cache::LastValueCache;
use crate::codec::{Codec, JsonCodec};
use crate::error::Result;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Writes the cache and dispatches on the bus
#[derive(Clone)]
pub struct LiveFeed<C = JsonCodec> {
    bus: Bus,
    cache: Arc<dyn LastValueCache>,
    codec: C,
}

impl LiveFeed<JsonCodec> {
    pub fn new(bus: Bus, cache: Arc<dyn LastValueCache>) -> Self {
        Self {
            bus,
            cache,
            codec: JsonCodec,
        }
    }
}

impl<C> LiveFeed<C> {
    /// Replace the payload codec
    pub fn with_codec<C2>(self, codec: C2) -> LiveFeed<C2> {
        LiveFeed {
            bus: self.bus,
            cache: self.cache,
            codec,
        }
    }

    /// Encode `value`, store it as the latest for `event_type`, then dispatch.
    ///
    /// Returns the number of listeners that accepted the event.
    pub async fn publish<T>(&self, event_type: &str, value: &T) -> Result<usize>
    where
        C: Codec<T>,
    {
        let payload = self.codec.encode(value)?;
        self.publish_raw(Event::new(event_type, payload)).await
    }

    /// Store and dispatch an already encoded event.
    ///
    /// The dispatched event carries the cache version it was stored under.
    pub async fn publish_raw(&self, event: Event) -> Result<usize> {
        let version = self
            .cache
            .set(&event.event_type, event.payload.clone())
            .await?;
        Ok(self.bus.dispatch(event.with_version(version)).await)
    }
}

/// Seeds a client with the cached value of one event type, then relays live
/// dispatches of it.
pub struct CachedLiveStream<T, C = JsonCodec> {
    bus: Bus,
    cache: Arc<dyn LastValueCache>,
    event_type: String,
    codec: Arc<C>,
    buffer: usize,
    _payload: PhantomData<fn() -> T>,
}

impl<T> CachedLiveStream<T, JsonCodec> {
    pub fn new(bus: Bus, cache: Arc<dyn LastValueCache>, event_type: impl Into<String>) -> Self {
        Self {
            bus,
            cache,
            event_type: event_type.into(),
            codec: Arc::new(JsonCodec),
            buffer: 1,
            _payload: PhantomData,
        }
    }
}

impl<T, C> CachedLiveStream<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    /// Replace the payload codec
    pub fn with_codec<C2: Codec<T>>(self, codec: C2) -> CachedLiveStream<T, C2> {
        CachedLiveStream {
            bus: self.bus,
            cache: self.cache,
            event_type: self.event_type,
            codec: Arc::new(codec),
            buffer: self.buffer,
            _payload: PhantomData,
        }
    }

    /// Capacity of the client channel used by [`CachedLiveStream::open`]
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Relay into `sink` until `cancel` fires, the sink closes, or the bus
    /// evicts this listener.
    ///
    /// Fails only if the cache cannot be read.
    pub async fn serve(&self, sink: mpsc::Sender<T>, cancel: CancellationToken) -> Result<()> {
        let subscription = self.bus.subscribe_guarded(&self.event_type);
        let seeded = self.seed(&sink, &cancel).await?;
        relay(subscription, self.codec.clone(), sink, cancel, seeded).await;
        Ok(())
    }

    /// Register the listener, queue the cached value, then spawn the live
    /// relay and return the client end as a stream.
    ///
    /// Any dispatch made after this returns reaches the stream, after the
    /// cached value.
    pub async fn open(&self, cancel: CancellationToken) -> Result<ReceiverStream<T>> {
        let (sink, receiver) = mpsc::channel(self.buffer);
        let subscription = self.bus.subscribe_guarded(&self.event_type);
        let seeded = self.seed(&sink, &cancel).await?;

        tokio::spawn(relay(subscription, self.codec.clone(), sink, cancel, seeded));
        Ok(ReceiverStream::new(receiver))
    }

    /// Send the cached value, returning its cache version if it was delivered
    async fn seed(&self, sink: &mpsc::Sender<T>, cancel: &CancellationToken) -> Result<Option<u64>> {
        let Some(cached) = self.cache.get(&self.event_type).await? else {
            return Ok(None);
        };

        match self.codec.decode(&cached.payload) {
            Ok(value) => {
                let delivered = send(sink, value, cancel).await;
                Ok(delivered.then_some(cached.version))
            }
            Err(e) => {
                tracing::warn!(event_type = %self.event_type, error = %e, "Skipping undecodable cached value");
                Ok(None)
            }
        }
    }
}

async fn relay<T, C: Codec<T>>(
    mut subscription: BusSubscription,
    codec: Arc<C>,
    sink: mpsc::Sender<T>,
    cancel: CancellationToken,
    seeded: Option<u64>,
) {
    pump(&mut subscription, codec.as_ref(), &sink, &cancel, seeded).await;
    // Unregister before the client sees the stream end.
    drop(subscription);
}

async fn pump<T, C: Codec<T>>(
    subscription: &mut BusSubscription,
    codec: &C,
    sink: &mpsc::Sender<T>,
    cancel: &CancellationToken,
    seeded: Option<u64>,
) {
    let event_type = subscription.event_type().to_string();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sink.closed() => break,
            next = subscription.recv() => match next {
                Some(event) => event,
                None => {
                    tracing::debug!(event_type = %event_type, "Live listener evicted");
                    break;
                }
            },
        };

        // Dispatches of the seeded cache write, or older ones, were already sent.
        if let (Some(seed), Some(version)) = (seeded, event.version) {
            if version <= seed {
                tracing::trace!(event_type = %event_type, version, seed, "Skipping live event already seeded");
                continue;
            }
        }

        match codec.decode(&event.payload) {
            Ok(value) => {
                if !send(sink, value, cancel).await {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(event_type = %event_type, error = %e, "Skipping undecodable live event");
            }
        }
    }

    tracing::debug!(event_type = %event_type, "Live stream closed");
}

/// False once the client is gone or the stream is cancelled
async fn send<T>(sink: &mpsc::Sender<T>, value: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = sink.send(value) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryLastValueCache;
    use bytes::Bytes;
    use crate::config::BusConfig;
    use futures::StreamExt;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    const ONLINE: &str = "players.online";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OnlinePlayerCount {
        count: u32,
        max: u32,
    }

    fn count(count: u32) -> OnlinePlayerCount {
        OnlinePlayerCount { count, max: 20 }
    }

    fn fixture(config: BusConfig) -> (Bus, Arc<MemoryLastValueCache>, LiveFeed) {
        let bus = Bus::new(config);
        let cache = Arc::new(MemoryLastValueCache::new());
        let feed = LiveFeed::new(bus.clone(), cache.clone());
        (bus, cache, feed)
    }

    #[tokio::test]
    async fn test_feed_writes_cache_and_dispatches() {
        let (bus, cache, feed) = fixture(BusConfig::default());
        let mut listener = bus.subscribe_guarded(ONLINE);

        assert_eq!(feed.publish(ONLINE, &count(5)).await.unwrap(), 1);

        let event = listener.recv().await.unwrap();
        let cached = cache.get(ONLINE).await.unwrap().unwrap();
        assert_eq!(cached.payload, event.payload);
        assert_eq!(event.version, Some(cached.version));
    }

    #[tokio::test]
    async fn test_cached_value_then_live() {
        let (bus, cache, feed) = fixture(BusConfig::default());
        feed.publish(ONLINE, &count(1)).await.unwrap();

        let mut stream =
            CachedLiveStream::<OnlinePlayerCount>::new(bus, cache, ONLINE)
                .open(CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(stream.next().await, Some(count(1)));

        feed.publish(ONLINE, &count(2)).await.unwrap();
        assert_eq!(stream.next().await, Some(count(2)));
    }

    #[tokio::test]
    async fn test_no_cached_value_waits_for_live() {
        let (bus, cache, feed) = fixture(BusConfig::default());
        let mut stream =
            CachedLiveStream::<OnlinePlayerCount>::new(bus, cache, ONLINE)
                .open(CancellationToken::new())
                .await
                .unwrap();

        feed.publish(ONLINE, &count(3)).await.unwrap();
        assert_eq!(stream.next().await, Some(count(3)));
    }

    #[tokio::test]
    async fn test_repeated_value_after_open_delivered() {
        let (bus, cache, feed) = fixture(BusConfig::default());
        feed.publish(ONLINE, &count(5)).await.unwrap();

        let mut stream =
            CachedLiveStream::<OnlinePlayerCount>::new(bus, cache, ONLINE)
                .open(CancellationToken::new())
                .await
                .unwrap();
        feed.publish(ONLINE, &count(5)).await.unwrap();
        feed.publish(ONLINE, &count(6)).await.unwrap();

        assert_eq!(stream.next().await, Some(count(5)));
        assert_eq!(stream.next().await, Some(count(5)));
        assert_eq!(stream.next().await, Some(count(6)));
    }

    #[tokio::test]
    async fn test_dispatch_of_seeded_write_skipped() {
        let (bus, cache, feed) = fixture(BusConfig::default());
        // Cache written, dispatch still in flight when the stream opens.
        let payload = JsonCodec.encode(&count(1)).unwrap();
        let version = cache.set(ONLINE, payload.clone()).await.unwrap();

        let mut stream =
            CachedLiveStream::<OnlinePlayerCount>::new(bus.clone(), cache, ONLINE)
                .open(CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(bus.dispatch(Event::new(ONLINE, payload).with_version(version)).await, 1);
        feed.publish(ONLINE, &count(2)).await.unwrap();

        assert_eq!(stream.next().await, Some(count(1)));
        assert_eq!(stream.next().await, Some(count(2)));
    }

    #[tokio::test]
    async fn test_unversioned_dispatch_always_delivered() {
        let (bus, cache, feed) = fixture(BusConfig::default());
        feed.publish(ONLINE, &count(1)).await.unwrap();

        let mut stream =
            CachedLiveStream::<OnlinePlayerCount>::new(bus.clone(), cache, ONLINE)
                .open(CancellationToken::new())
                .await
                .unwrap();
        let payload = JsonCodec.encode(&count(1)).unwrap();
        bus.dispatch(Event::new(ONLINE, payload)).await;

        assert_eq!(stream.next().await, Some(count(1)));
        assert_eq!(stream.next().await, Some(count(1)));
    }

    #[tokio::test]
    async fn test_undecodable_live_event_skipped() {
        let (bus, cache, feed) = fixture(BusConfig::default());
        let mut stream =
            CachedLiveStream::<OnlinePlayerCount>::new(bus, cache, ONLINE)
                .open(CancellationToken::new())
                .await
                .unwrap();

        feed.publish_raw(Event::new(ONLINE, Bytes::from_static(b"garbage")))
            .await
            .unwrap();
        feed.publish(ONLINE, &count(4)).await.unwrap();

        assert_eq!(stream.next().await, Some(count(4)));
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_and_unsubscribes() {
        let (bus, cache, _feed) = fixture(BusConfig::default());
        let cancel = CancellationToken::new();
        let mut stream =
            CachedLiveStream::<OnlinePlayerCount>::new(bus.clone(), cache, ONLINE)
                .open(cancel.clone())
                .await
                .unwrap();
        assert_eq!(bus.listener_count(ONLINE), 1);

        cancel.cancel();
        assert_eq!(stream.next().await, None);
        assert_eq!(bus.listener_count(ONLINE), 0);
    }

    #[tokio::test]
    async fn test_serve_stops_when_client_drops() {
        let (bus, cache, feed) = fixture(BusConfig::default());
        let adapter = CachedLiveStream::<OnlinePlayerCount>::new(bus.clone(), cache, ONLINE);
        let (sink, receiver) = mpsc::channel(1);

        let serving = tokio::spawn(async move { adapter.serve(sink, CancellationToken::new()).await });
        while bus.listener_count(ONLINE) == 0 {
            tokio::task::yield_now().await;
        }

        drop(receiver);
        feed.publish(ONLINE, &count(1)).await.unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(bus.listener_count(ONLINE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_client_evicted() {
        let (bus, cache, feed) = fixture(BusConfig {
            listener_capacity: 1,
            send_timeout: Some(Duration::from_millis(50)),
        });
        let mut stream =
            CachedLiveStream::<OnlinePlayerCount>::new(bus.clone(), cache, ONLINE)
                .open(CancellationToken::new())
                .await
                .unwrap();

        let mut published = 0;
        for n in 0..10 {
            published += 1;
            if feed.publish(ONLINE, &count(n)).await.unwrap() == 0 {
                break;
            }
        }
        assert!(published < 10);
        assert_eq!(bus.listener_count(ONLINE), 0);

        let received: Vec<OnlinePlayerCount> = stream.collect().await;
        assert!(!received.is_empty());
        assert!(received.len() < published);
        for (n, value) in received.iter().enumerate() {
            assert_eq!(*value, count(n as u32));
        }
    }
}
