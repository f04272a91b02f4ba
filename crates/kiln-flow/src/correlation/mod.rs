//! Correlation directory between remote activities and domain entities.
//!
//! The [`CorrelationStore`] trait is the directory mapping remote activity
//! ids to the run, campaign, and controller that requested them, the data
//! products an activity has produced, and the idempotency keys already
//! consumed by discrete actions.
//!
//! Correlation records are an audit trail: they are never deleted, and a
//! product's artifact link is set at most once.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kiln_core::{ActivityId, CampaignId, ControllerId, ProductId, RunId};

use crate::error::Result;

/// Remote activity lifecycle status as mirrored in the correlation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Accepted by the controller, not yet executing.
    Pending,
    /// Executing on the controller.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
}

impl ActivityStatus {
    /// Returns true for statuses the remote activity can never leave.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Monotonic rank used to reject out-of-order downgrades.
    const fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Returns true if updating from `self` to `next` is a downgrade.
    ///
    /// Late events may deliver `running` after `completed`; a terminal
    /// status is never replaced by a lower-ranked one. Moving between
    /// terminal statuses is also rejected.
    #[must_use]
    pub const fn would_downgrade(&self, next: Self) -> bool {
        self.is_terminal() && next.rank() <= self.rank()
    }

    /// Returns a lowercase label suitable for events and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Directory entry for one remote activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCorrelation {
    /// Remote activity id.
    pub activity_id: ActivityId,
    /// Owning experiment run.
    pub run_id: RunId,
    /// Campaign grouping, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
    /// Controller executing the activity.
    pub controller_id: ControllerId,
    /// Remote activity name.
    pub activity_name: String,
    /// Mirrored lifecycle status.
    pub status: ActivityStatus,
    /// When the correlation was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl ActivityCorrelation {
    /// Creates a new pending correlation record.
    #[must_use]
    pub fn new(
        activity_id: ActivityId,
        run_id: RunId,
        controller_id: ControllerId,
        activity_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            activity_id,
            run_id,
            campaign_id: None,
            controller_id,
            activity_name: activity_name.into(),
            status: ActivityStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the campaign grouping.
    #[must_use]
    pub fn with_campaign(mut self, campaign_id: CampaignId) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }
}

/// Mapping from a remote data product to its owning activity.
///
/// Immutable after creation except for the artifact link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProductMapping {
    /// Remote data product id.
    pub product_id: ProductId,
    /// Activity that produced the product.
    pub activity_id: ActivityId,
    /// Content type reported by the controller.
    pub content_type: String,
    /// Domain artifact id, linked at most once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    /// Free-form metadata reported alongside the product.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// When the product was first observed.
    pub created_at: DateTime<Utc>,
}

impl DataProductMapping {
    /// Creates a new unlinked mapping.
    #[must_use]
    pub fn new(
        product_id: ProductId,
        activity_id: ActivityId,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            product_id,
            activity_id,
            content_type: content_type.into(),
            artifact_id: None,
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
        }
    }
}

/// Storage abstraction for activity correlations, data products, and
/// idempotency keys.
///
/// Reads for absent keys return `None`/empty rather than failing; errors
/// are reserved for storage faults.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Saves a correlation record, overwriting any existing record for the
    /// same activity id.
    async fn save_correlation(&self, correlation: &ActivityCorrelation) -> Result<()>;

    /// Gets the correlation record for an activity id.
    async fn get_correlation(
        &self,
        activity_id: &ActivityId,
    ) -> Result<Option<ActivityCorrelation>>;

    /// Lists all correlation records for a run.
    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<ActivityCorrelation>>;

    /// Updates the status of an existing correlation record.
    ///
    /// Applies the downgrade policy: a terminal status is never replaced
    /// by a late lower-ranked event. Returns the status actually stored,
    /// or `None` when no record exists for the id.
    async fn update_status(
        &self,
        activity_id: &ActivityId,
        status: ActivityStatus,
    ) -> Result<Option<ActivityStatus>>;

    /// Saves a data product mapping.
    ///
    /// Overwrites only the mutable metadata; an existing artifact link is
    /// preserved.
    async fn save_product(&self, mapping: &DataProductMapping) -> Result<()>;

    /// Gets a data product mapping by product id.
    async fn get_product(&self, product_id: &ProductId) -> Result<Option<DataProductMapping>>;

    /// Lists all product mappings owned by an activity.
    async fn list_products_by_activity(
        &self,
        activity_id: &ActivityId,
    ) -> Result<Vec<DataProductMapping>>;

    /// Links a product mapping to a domain artifact.
    ///
    /// The link is write-once: returns `false` without modifying anything
    /// when a link is already present or the product is unknown, `true`
    /// when the link was set.
    async fn link_artifact(&self, product_id: &ProductId, artifact_id: &str) -> Result<bool>;

    /// Returns true if the idempotency key has been consumed.
    async fn is_key_used(&self, key: &str) -> Result<bool>;

    /// Marks an idempotency key as consumed.
    ///
    /// Returns `true` if the key was newly inserted, `false` if it was
    /// already present. The ledger is insert-only.
    async fn mark_key_used(&self, key: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_reject_downgrades() {
        assert!(ActivityStatus::Completed.would_downgrade(ActivityStatus::Running));
        assert!(ActivityStatus::Failed.would_downgrade(ActivityStatus::Pending));
        assert!(ActivityStatus::Cancelled.would_downgrade(ActivityStatus::Completed));
    }

    #[test]
    fn non_terminal_statuses_accept_any_update() {
        assert!(!ActivityStatus::Pending.would_downgrade(ActivityStatus::Running));
        assert!(!ActivityStatus::Running.would_downgrade(ActivityStatus::Pending));
        assert!(!ActivityStatus::Running.would_downgrade(ActivityStatus::Completed));
    }
}
