//! Host port allocation
//!
//! Ports come from a fixed range. The allocator keeps an in-process set of
//! ports that were handed out but not yet persisted, which stops two
//! allocations in this process from picking the same port. The store's
//! uniqueness constraint on `internal_port` is what actually guarantees
//! distinct ports; [`PortAllocator::reserve`] reports a collision as `false`
//! and the caller allocates again.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::HangarError;
use crate::models::deployment::DeploymentStatus;
use crate::store::{DeploymentFilter, DeploymentStore, DeploymentUpdate, StoreError, UpdateGuard};

/// Hands out unique host ports from `[min, max]`
pub struct PortAllocator {
    min: u16,
    max: u16,
    store: Arc<dyn DeploymentStore>,
    in_flight: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16, store: Arc<dyn DeploymentStore>) -> Result<Self, HangarError> {
        if min == 0 || min > max {
            return Err(HangarError::ConfigError(format!(
                "Invalid port range {}-{}",
                min, max
            )));
        }
        Ok(Self {
            min,
            max,
            store,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Pick the lowest port that is neither persisted by an active deployment
    /// nor held in flight, and hold it.
    pub async fn allocate(&self) -> Result<u16, HangarError> {
        // The lock spans the store query so a reservation that lands between
        // the query and the scan is still seen through the in-flight set.
        let mut in_flight = self.in_flight.lock().await;

        let used: HashSet<u16> = self
            .store
            .find_many(&DeploymentFilter::active_ports())
            .await?
            .into_iter()
            .filter_map(|d| d.internal_port)
            .collect();

        let port = (self.min..=self.max)
            .find(|p| !used.contains(p) && !in_flight.contains(p))
            .ok_or(HangarError::PortsExhausted {
                min: self.min,
                max: self.max,
            })?;

        in_flight.insert(port);
        debug!(port, "Allocated port");
        Ok(port)
    }

    /// Persist `port` on a deployment that is still `configuring`.
    ///
    /// Returns `false` when the record moved on, was deleted, or another
    /// active deployment already holds the port. The port stays in flight
    /// on failure; release it and allocate a fresh one.
    pub async fn reserve(&self, deployment_id: &str, port: u16) -> Result<bool, HangarError> {
        let mut in_flight = self.in_flight.lock().await;

        let update = DeploymentUpdate {
            internal_port: Some(Some(port)),
            ..Default::default()
        };
        let guard = UpdateGuard::status(DeploymentStatus::Configuring);

        match self.store.update_one(deployment_id, &guard, &update).await {
            Ok(Some(_)) => {
                in_flight.remove(&port);
                debug!(deployment_id = %deployment_id, port, "Reserved port");
                Ok(true)
            }
            Ok(None) => {
                warn!(
                    deployment_id = %deployment_id,
                    port,
                    "Port reservation skipped, deployment is no longer configuring"
                );
                Ok(false)
            }
            Err(StoreError::DuplicateKey { .. }) => {
                warn!(deployment_id = %deployment_id, port, "Port already held by another deployment");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop an in-flight hold. Never touches the store.
    pub async fn release(&self, port: u16) {
        if self.in_flight.lock().await.remove(&port) {
            debug!(port, "Released in-flight port");
        }
    }

    /// Number of ports currently held in flight
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}
