//! Resource Allocator
//!
//! Leases ports from a fixed contiguous pool. The lease map lives in one
//! record so "pick a free port" and "record the lease" happen under the same
//! lock; no port is ever held by two agents.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::store::{CoordinationStore, RecordKey, StoreError};

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("All {pool_size} ports starting at {base} are leased")]
    ResourceExhausted { base: u16, pool_size: u16 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Contiguous range `base..base + size`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPool {
    pub base: u16,
    pub size: u16,
}

impl PortPool {
    pub fn new(base: u16, size: u16) -> Self {
        Self { base, size }
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        let base = self.base;
        (0..self.size).filter_map(move |offset| base.checked_add(offset))
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.base && (port as u32) < self.base as u32 + self.size as u32
    }
}

impl From<&PortConfig> for PortPool {
    fn from(config: &PortConfig) -> Self {
        Self::new(config.base, config.pool_size)
    }
}

pub type PortLeases = BTreeMap<String, u16>;

#[derive(Debug, Clone)]
pub struct PortAllocator {
    store: CoordinationStore,
    pool: PortPool,
}

impl PortAllocator {
    pub fn new(store: CoordinationStore, pool: PortPool) -> Self {
        Self { store, pool }
    }

    pub fn pool(&self) -> PortPool {
        self.pool
    }

    /// Lease the lowest free port to `agent`. An agent that already holds a
    /// lease gets the same port back.
    pub async fn lease(&self, agent: &str) -> Result<u16, AllocationError> {
        let pool = self.pool;
        let port: Result<u16, AllocationError> = self
            .store
            .transact(&RecordKey::PortLeases, |leases: &mut PortLeases| {
                if let Some(existing) = leases.get(agent) {
                    debug!(agent = %agent, port = *existing, "Agent already holds a port lease");
                    return Ok(*existing);
                }

                let port = pool
                    .ports()
                    .find(|candidate| !leases.values().any(|held| held == candidate))
                    .ok_or(AllocationError::ResourceExhausted {
                        base: pool.base,
                        pool_size: pool.size,
                    })?;
                leases.insert(agent.to_string(), port);
                Ok(port)
            })
            .await;

        match &port {
            Ok(port) => info!(agent = %agent, port = *port, "Port leased"),
            Err(AllocationError::ResourceExhausted { .. }) => {
                warn!(agent = %agent, base = pool.base, size = pool.size, "Port pool exhausted")
            }
            Err(_) => {}
        }
        port
    }

    /// Return `agent`'s port to the pool. Releasing without a lease is a no-op.
    pub async fn release(&self, agent: &str) -> Result<Option<u16>, StoreError> {
        let released = self
            .store
            .transact(&RecordKey::PortLeases, |leases: &mut PortLeases| {
                Ok::<_, StoreError>(leases.remove(agent))
            })
            .await?;

        if let Some(port) = released {
            info!(agent = %agent, port, "Port released");
        }
        Ok(released)
    }

    pub async fn leases(&self) -> Result<PortLeases, StoreError> {
        self.store.read(&RecordKey::PortLeases).await
    }
}
