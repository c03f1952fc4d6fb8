//! NATS messaging and live fan-out
//!
//! Typed publish/subscribe and request/reply over NATS and JetStream, plus an
//! in-process fan-out bus that turns one inbound event into deliveries to
//! many long-lived streaming clients.
//!
//! # Features
//!
//! - **Durable publishing**: JetStream publish with a content-derived message ID,
//!   so re-publishing identical content stores it once
//! - **Durable subscribing**: pull consumers with explicit ack, nak-driven
//!   redelivery bounded by `max_deliver`, and optional dead-letter parking
//! - **Consumer groups**: instances sharing a group share one durable consumer
//! - **Request/reply**: typed RPC over core NATS with per-request inboxes and deadlines
//! - **Provisioning**: streams and consumers declared as a [`Topology`] and
//!   created once at start-up
//! - **Fan-out bus**: per-event-type listeners with bounded buffers and
//!   eviction of stalled listeners
//! - **Cache-then-live**: streams that open with the last known value and
//!   continue with live updates
//!
//! # Example: durable work queue
//!
//! ```rust,ignore
//! use nats_streambus::transport::jetstream::JetStreamTransport;
//! use nats_streambus::{provision, NatsConfig, Publisher, Subscriber, Topology};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NatsConfig::from_env()?;
//!     let transport = Arc::new(JetStreamTransport::connect(&config).await?);
//!
//!     let topology = Topology::new(&config)
//!         .stream("REWARDS", ["kit.granted", "kit.claimed"])
//!         .consumer("REWARDS", "grant-kit", "kit.granted", Some("rewards-workers"));
//!     let provisioned = provision(transport.as_ref(), &topology).await?;
//!
//!     let subscriber = Subscriber::<KitGranted>::durable(
//!         transport.clone(),
//!         provisioned.consumer("grant-kit")?.clone(),
//!     );
//!     subscriber.subscribe(|event: KitGranted| async move {
//!         grant(event).await?;
//!         Ok(())
//!     }).await?;
//!
//!     Publisher::<KitGranted>::durable(transport, "kit.granted")
//!         .publish(&KitGranted { player_id: "p-1".into(), kit: "starter".into() })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: live player count
//!
//! ```rust,ignore
//! use nats_streambus::{Bus, CachedLiveStream, LiveFeed, MemoryLastValueCache};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let bus = Bus::new(config.bus.clone());
//! let cache = Arc::new(MemoryLastValueCache::new());
//! let feed = LiveFeed::new(bus.clone(), cache.clone());
//!
//! // Each streaming RPC call
//! let body = CachedLiveStream::<OnlinePlayerCount>::new(bus, cache, "players.online")
//!     .open(CancellationToken::new())
//!     .await?;
//!
//! // Wherever counts arrive
//! feed.publish("players.online", &OnlinePlayerCount { count: 5, max: 20 }).await?;
//! ```

// Module declarations
pub mod bus;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod live;
pub mod publisher;
pub mod rpc;
pub mod store;
pub mod subscriber;
pub mod topology;
pub mod transport;

// Re-exports
pub use bus::{Bus, BusSubscription, Event, ListenerId};
pub use cache::{CachedValue, LastValueCache, MemoryLastValueCache};
pub use codec::{dedup_key, message_id, Codec, JsonCodec};
pub use config::{BusConfig, ConsumerPolicy, NatsConfig, StreamPolicy};
pub use error::{BoxError, MessagingError, Result, StoreError};
pub use handler::{Handler, RequestHandler};
pub use live::{CachedLiveStream, LiveFeed};
pub use publisher::Publisher;
pub use rpc::{RpcRequester, RpcResponder};
pub use store::{ApplyUpdate, MemoryStateStore, Versioned};
pub use subscriber::Subscriber;
pub use topology::{provision, ProvisionedTopology, Topology};
