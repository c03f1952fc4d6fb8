//! Stream and consumer provisioning
//!
//! Durable infrastructure is declared up front as a [`Topology`] and created
//! once at start-up by [`provision`]. The resulting [`ProvisionedTopology`]
//! is an immutable handle that subscribers use to look up their consumer.
//!
//! ```
//! use nats_streambus::{NatsConfig, Topology};
//!
//! let config = NatsConfig::default();
//! let topology = Topology::new(&config)
//!     .stream("REWARDS", ["kit.granted", "kit.claimed"])
//!     .consumer("REWARDS", "grant-kit", "kit.granted", Some("rewards-workers"));
//!
//! assert_eq!(topology.streams().len(), 1);
//! assert_eq!(topology.consumers().len(), 1);
//! ```

use crate::config::{ConsumerPolicy, NatsConfig, StreamPolicy};
use crate::error::{MessagingError, Result};
use crate::transport::{ConsumerSpec, DurableTransport, StreamSpec};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Declared streams and consumers
#[derive(Debug, Clone)]
pub struct Topology {
    stream_policy: StreamPolicy,
    consumer_policy: ConsumerPolicy,
    streams: Vec<StreamSpec>,
    consumers: Vec<ConsumerSpec>,
}

impl Topology {
    /// Empty topology using the configured retention and ack policies
    pub fn new(config: &NatsConfig) -> Self {
        Self {
            stream_policy: config.stream.clone(),
            consumer_policy: config.consumer.clone(),
            streams: Vec::new(),
            consumers: Vec::new(),
        }
    }

    /// Declare a stream capturing the given subjects
    pub fn stream<I, S>(mut self, name: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subjects = subjects.into_iter().map(Into::into).collect();
        self.streams
            .push(StreamSpec::new(name, subjects, &self.stream_policy));
        self
    }

    /// Declare a durable consumer, optionally shared by a group
    pub fn consumer(
        mut self,
        stream: impl Into<String>,
        durable_name: impl Into<String>,
        filter_subject: impl Into<String>,
        group: Option<&str>,
    ) -> Self {
        self.consumers.push(ConsumerSpec::new(
            stream,
            durable_name,
            filter_subject,
            group.map(str::to_string),
            &self.consumer_policy,
        ));
        self
    }

    /// Declared streams
    pub fn streams(&self) -> &[StreamSpec] {
        &self.streams
    }

    /// Declared consumers
    pub fn consumers(&self) -> &[ConsumerSpec] {
        &self.consumers
    }
}

/// Handle to provisioned durable infrastructure
#[derive(Debug, Clone)]
pub struct ProvisionedTopology {
    streams: Arc<HashMap<String, StreamSpec>>,
    consumers: Arc<HashMap<String, ConsumerSpec>>,
}

impl ProvisionedTopology {
    /// Consumer spec by durable name
    pub fn consumer(&self, durable_name: &str) -> Result<&ConsumerSpec> {
        self.consumers.get(durable_name).ok_or_else(|| {
            MessagingError::Config(format!("Consumer '{}' was not provisioned", durable_name))
        })
    }

    /// Stream spec by name
    pub fn stream(&self, name: &str) -> Option<&StreamSpec> {
        self.streams.get(name)
    }
}

/// Create every declared stream, then every declared consumer.
///
/// Existing streams and consumers are left as they are. Any other failure
/// aborts provisioning. Durable names must be unique across the topology,
/// since subscribers look consumers up by durable name alone.
pub async fn provision<T>(transport: &T, topology: &Topology) -> Result<ProvisionedTopology>
where
    T: DurableTransport + ?Sized,
{
    check_unique(topology)?;

    let mut streams = HashMap::new();
    for spec in &topology.streams {
        transport.ensure_stream(spec).await.map_err(into_provisioning)?;
        streams.insert(spec.name.clone(), spec.clone());
    }

    let mut consumers = HashMap::new();
    for spec in &topology.consumers {
        if !streams.contains_key(&spec.stream) {
            return Err(MessagingError::Provisioning(format!(
                "Consumer '{}' references undeclared stream '{}'",
                spec.durable_name, spec.stream
            )));
        }
        transport.ensure_consumer(spec).await.map_err(into_provisioning)?;
        consumers.insert(spec.durable_name.clone(), spec.clone());
    }

    tracing::info!(
        streams = streams.len(),
        consumers = consumers.len(),
        "Messaging topology provisioned"
    );

    Ok(ProvisionedTopology {
        streams: Arc::new(streams),
        consumers: Arc::new(consumers),
    })
}

fn check_unique(topology: &Topology) -> Result<()> {
    let mut streams = HashSet::new();
    for spec in &topology.streams {
        if !streams.insert(spec.name.as_str()) {
            return Err(MessagingError::Provisioning(format!(
                "Stream '{}' declared more than once",
                spec.name
            )));
        }
    }

    let mut durables = HashSet::new();
    for spec in &topology.consumers {
        if !durables.insert(spec.durable_name.as_str()) {
            return Err(MessagingError::Provisioning(format!(
                "Durable name '{}' declared more than once",
                spec.durable_name
            )));
        }
    }
    Ok(())
}

fn into_provisioning(err: MessagingError) -> MessagingError {
    match err {
        MessagingError::Provisioning(_) => err,
        other => MessagingError::Provisioning(other.to_string()),
    }
}
