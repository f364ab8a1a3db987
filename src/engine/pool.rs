//! Shared engine clients behind the usage-tracking cache.
//!
//! Engine clients are cheap to clone but expensive to establish and verify,
//! so concurrent provision/teardown work on the same endpoint shares one
//! handle. The cache keeps idle handles around for a TTL and closes them
//! through its expiry sweep once nobody has used them for a while.

use std::sync::Arc;
use std::time::Duration;

use super::{ContainerEngine, EngineError};
use crate::cache::{CacheError, Lease, UsageTrackingCache};

/// A cached engine client tagged with the endpoint that produced it.
///
/// Equality is by endpoint: the cache maps values back to entries by value
/// comparison, and two handles for the same endpoint are interchangeable.
#[derive(Clone)]
pub struct EngineHandle {
    pub endpoint: String,
    pub engine: Arc<dyn ContainerEngine>,
}

impl PartialEq for EngineHandle {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

type ConnectFn = dyn Fn(&str) -> Result<Arc<dyn ContainerEngine>, EngineError> + Send + Sync;

/// Pool of engine clients keyed by endpoint.
pub struct EnginePool {
    cache: Arc<UsageTrackingCache<String, EngineHandle>>,
    connect: Box<ConnectFn>,
}

impl EnginePool {
    pub fn new(
        ttl: Duration,
        connect: impl Fn(&str) -> Result<Arc<dyn ContainerEngine>, EngineError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            cache: Arc::new(UsageTrackingCache::new(ttl)),
            connect: Box::new(connect),
        }
    }

    /// Pool that connects real Docker engines.
    pub fn docker(ttl: Duration) -> Self {
        Self::new(ttl, |endpoint| {
            super::DockerEngine::connect(endpoint).map(|e| Arc::new(e) as Arc<dyn ContainerEngine>)
        })
    }

    /// Pool that always hands out the one given engine. Used by tests and
    /// by embedders that manage their own client.
    pub fn fixed(endpoint: impl Into<String>, engine: Arc<dyn ContainerEngine>) -> Self {
        let fixed_endpoint = endpoint.into();
        Self::new(Duration::from_secs(600), move |requested| {
            if requested == fixed_endpoint {
                Ok(Arc::clone(&engine))
            } else {
                Err(EngineError::Connection(format!(
                    "pool only serves '{fixed_endpoint}', got '{requested}'"
                )))
            }
        })
    }

    /// Check out a handle for `endpoint`, connecting on first use.
    ///
    /// The returned lease releases its activity count on drop, so callers
    /// get acquire/use/release semantics even on their error paths.
    pub fn acquire(&self, endpoint: &str) -> Result<Lease<String, EngineHandle>, EngineError> {
        if let Some(lease) = self.cache.lease(&endpoint.to_string()) {
            return Ok(lease);
        }
        let handle = EngineHandle {
            endpoint: endpoint.to_string(),
            engine: (self.connect)(endpoint)?,
        };
        match self.cache.lease_new(endpoint.to_string(), handle) {
            Ok(lease) => Ok(lease),
            // Lost a connect race; use the winner's handle.
            Err(CacheError::AlreadyCached) => self
                .cache
                .lease(&endpoint.to_string())
                .ok_or_else(|| EngineError::Connection("engine handle expired mid-acquire".into())),
            Err(e) => Err(EngineError::Connection(e.to_string())),
        }
    }

    /// Run the expiry sweep on an interval, dropping idle handles.
    pub fn spawn_expiry(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        crate::cache::spawn_expiry(Arc::clone(&self.cache), every, |endpoint, _handle| {
            tracing::debug!(endpoint = %endpoint, "dropping idle engine client");
        })
    }

    #[cfg(test)]
    pub(crate) fn cached_handles(&self) -> usize {
        self.cache.len()
    }
}
