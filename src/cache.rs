//! Last-known-value cache
//!
//! One encoded payload per event type, overwritten by every new dispatch and
//! never expired. Each write bumps a per-type version so readers can tell a
//! fresh dispatch from the one they already hold.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// A cached payload and the version it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub payload: Bytes,
    pub version: u64,
}

/// Snapshot store read when a live stream opens
#[async_trait]
pub trait LastValueCache: Send + Sync + 'static {
    /// Latest payload for `event_type`, if any was ever written
    async fn get(&self, event_type: &str) -> Result<Option<CachedValue>>;

    /// Replace the payload for `event_type`, returning the new version.
    ///
    /// Versions start at 1 and increase with every write to the same type.
    async fn set(&self, event_type: &str, payload: Bytes) -> Result<u64>;
}

/// In-process [`LastValueCache`]
#[derive(Debug, Default)]
pub struct MemoryLastValueCache {
    values: RwLock<HashMap<String, CachedValue>>,
}

impl MemoryLastValueCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LastValueCache for MemoryLastValueCache {
    async fn get(&self, event_type: &str) -> Result<Option<CachedValue>> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(event_type).cloned())
    }

    async fn set(&self, event_type: &str, payload: Bytes) -> Result<u64> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        let version = values.get(event_type).map_or(1, |current| current.version + 1);
        values.insert(event_type.to_string(), CachedValue { payload, version });
        Ok(version)
    }
}
