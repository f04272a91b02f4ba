//! In-memory correlation store implementation.
//!
//! Suitable for testing and single-process deployments. No persistence;
//! the audit trail is lost when the process exits.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use kiln_core::{ActivityId, ProductId, RunId};

use super::{ActivityCorrelation, ActivityStatus, CorrelationStore, DataProductMapping};
use crate::error::{Error, Result};

/// In-memory correlation store.
#[derive(Debug, Default)]
pub struct InMemoryCorrelationStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    correlations: HashMap<ActivityId, ActivityCorrelation>,
    products: HashMap<ProductId, DataProductMapping>,
    used_keys: HashSet<String>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryCorrelationStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CorrelationStore for InMemoryCorrelationStore {
    async fn save_correlation(&self, correlation: &ActivityCorrelation) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state
            .correlations
            .insert(correlation.activity_id.clone(), correlation.clone());
        Ok(())
    }

    async fn get_correlation(
        &self,
        activity_id: &ActivityId,
    ) -> Result<Option<ActivityCorrelation>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.correlations.get(activity_id).cloned()
        };
        Ok(result)
    }

    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<ActivityCorrelation>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .correlations
                .values()
                .filter(|c| &c.run_id == run_id)
                .cloned()
                .collect()
        };
        Ok(result)
    }

    async fn update_status(
        &self,
        activity_id: &ActivityId,
        status: ActivityStatus,
    ) -> Result<Option<ActivityStatus>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(correlation) = state.correlations.get_mut(activity_id) else {
            drop(state);
            return Ok(None);
        };

        if correlation.status.would_downgrade(status) {
            let kept = correlation.status;
            drop(state);
            return Ok(Some(kept));
        }

        correlation.status = status;
        correlation.updated_at = Utc::now();
        drop(state);
        Ok(Some(status))
    }

    async fn save_product(&self, mapping: &DataProductMapping) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let mut stored = mapping.clone();
        // An existing artifact link survives re-saves of the same product.
        if let Some(existing) = state.products.get(&mapping.product_id) {
            if existing.artifact_id.is_some() {
                stored.artifact_id.clone_from(&existing.artifact_id);
            }
        }
        state.products.insert(stored.product_id.clone(), stored);
        Ok(())
    }

    async fn get_product(&self, product_id: &ProductId) -> Result<Option<DataProductMapping>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.products.get(product_id).cloned()
        };
        Ok(result)
    }

    async fn list_products_by_activity(
        &self,
        activity_id: &ActivityId,
    ) -> Result<Vec<DataProductMapping>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .products
                .values()
                .filter(|p| &p.activity_id == activity_id)
                .cloned()
                .collect()
        };
        Ok(result)
    }

    async fn link_artifact(&self, product_id: &ProductId, artifact_id: &str) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let linked = match state.products.get_mut(product_id) {
            Some(product) if product.artifact_id.is_none() => {
                product.artifact_id = Some(artifact_id.to_string());
                true
            }
            _ => false,
        };
        drop(state);
        Ok(linked)
    }

    async fn is_key_used(&self, key: &str) -> Result<bool> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.used_keys.contains(key)
        };
        Ok(result)
    }

    async fn mark_key_used(&self, key: &str) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let inserted = state.used_keys.insert(key.to_string());
        drop(state);
        Ok(inserted)
    }
}
