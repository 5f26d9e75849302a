//! Local deployment store
//!
//! Keeps every record in memory behind one async mutex, which makes each
//! operation atomic. When a snapshot file is configured, every mutation is
//! written through to it (temp file + rename) before the lock is released.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::HangarError;
use crate::filesys::file::File;
use crate::models::deployment::Deployment;
use crate::store::{DeploymentFilter, DeploymentStore, DeploymentUpdate, StoreError, UpdateGuard};

/// In-memory store with optional JSON snapshot
pub struct LocalStore {
    records: Mutex<HashMap<String, Deployment>>,
    snapshot: Option<File>,
}

impl LocalStore {
    /// Create an empty, purely in-memory store
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            snapshot: None,
        }
    }

    /// Open a store backed by a snapshot file, loading it if it exists
    pub async fn open(snapshot: File) -> Result<Self, HangarError> {
        let records = if snapshot.exists().await {
            let list: Vec<Deployment> = snapshot.read_json().await?;
            info!(
                path = %snapshot.path().display(),
                count = list.len(),
                "Loaded deployment snapshot"
            );
            list.into_iter().map(|d| (d.id.clone(), d)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            records: Mutex::new(records),
            snapshot: Some(snapshot),
        })
    }

    async fn persist(&self, records: &HashMap<String, Deployment>) -> Result<(), StoreError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };

        let mut list: Vec<&Deployment> = records.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let contents =
            serde_json::to_vec_pretty(&list).map_err(|e| StoreError::Backend(e.to_string()))?;
        snapshot
            .write_atomic(&contents)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        snapshot
            .set_permissions_600()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        debug!(count = list.len(), "Persisted deployment snapshot");
        Ok(())
    }
}

fn check_unique(
    records: &HashMap<String, Deployment>,
    candidate: &Deployment,
) -> Result<(), StoreError> {
    for other in records.values().filter(|d| d.id != candidate.id) {
        if other.subdomain == candidate.subdomain {
            return Err(StoreError::DuplicateKey {
                field: "subdomain",
                value: candidate.subdomain.clone(),
            });
        }

        if candidate.status.is_terminal() || other.status.is_terminal() {
            continue;
        }
        if let (Some(port), Some(other_port)) = (candidate.internal_port, other.internal_port) {
            if port == other_port {
                return Err(StoreError::DuplicateKey {
                    field: "internal_port",
                    value: port.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DeploymentStore for LocalStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Deployment>, StoreError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Deployment>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.values().find(|d| d.subdomain == subdomain).cloned())
    }

    async fn find_many(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>, StoreError> {
        let records = self.records.lock().await;
        let mut found: Vec<Deployment> = records
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    async fn insert(&self, deployment: Deployment) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&deployment.id) {
            return Err(StoreError::DuplicateKey {
                field: "id",
                value: deployment.id,
            });
        }
        check_unique(&records, &deployment)?;
        records.insert(deployment.id.clone(), deployment);
        self.persist(&records).await
    }

    async fn update_one(
        &self,
        id: &str,
        guard: &UpdateGuard,
        update: &DeploymentUpdate,
    ) -> Result<Option<Deployment>, StoreError> {
        let mut records = self.records.lock().await;
        let Some(current) = records.get(id) else {
            return Ok(None);
        };
        if !guard.matches(current) {
            return Ok(None);
        }

        let mut updated = current.clone();
        update.apply(&mut updated);
        check_unique(&records, &updated)?;

        records.insert(id.to_string(), updated.clone());
        self.persist(&records).await?;
        Ok(Some(updated))
    }

    async fn delete_one(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        let existed = records.remove(id).is_some();
        if existed {
            self.persist(&records).await?;
        }
        Ok(existed)
    }
}
