//! Strongly-typed identifiers for kiln entities.
//!
//! Two families of identifiers coexist:
//!
//! - **Locally minted** (`TaskId`, `EventId`): ULID-backed, lexicographically
//!   sortable by creation time, globally unique without coordination.
//! - **Externally assigned** (`ActivityId`, `ProductId`): opaque strings
//!   minted by remote instrument controllers; kiln never interprets their
//!   structure.
//! - **Domain-scoped** (`RunId`, `CampaignId`, `ControllerId`): opaque
//!   strings chosen by the workflow layer and controller registry.
//!
//! # Example
//!
//! ```rust
//! use kiln_core::id::{ControllerId, TaskId};
//!
//! let task = TaskId::generate();
//! let controller = ControllerId::new("printer-a3");
//!
//! // IDs are different types - this won't compile:
//! // let wrong: TaskId = controller;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            ///
            /// Uses ULID generation which is lexicographically sortable by
            /// creation time and globally unique without coordination.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = self.0.timestamp_ms();
                #[allow(clippy::cast_possible_wrap)]
                chrono::DateTime::from_timestamp_millis(ms as i64)
                    .unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " '{}': {}"), s, e),
                })
            }
        }
    };
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from a string.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true if the identifier is empty.
            ///
            /// Remote controllers signal start failure with an empty
            /// activity id, so callers must check before recording one.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

ulid_id! {
    /// A unique identifier for a scheduled task.
    ///
    /// Tasks are the unit of work the scheduler tracks; each maps to at most
    /// one remote activity per dispatch attempt.
    TaskId, "task ID"
}

ulid_id! {
    /// A unique identifier for a domain event.
    EventId, "event ID"
}

string_id! {
    /// An experiment run identifier assigned by the workflow layer.
    RunId, "run ID"
}

string_id! {
    /// A campaign identifier grouping related experiment runs.
    CampaignId, "campaign ID"
}

string_id! {
    /// A registered instrument controller identifier.
    ControllerId, "controller ID"
}

string_id! {
    /// A remote activity identifier minted by an instrument controller.
    ActivityId, "activity ID"
}

string_id! {
    /// A remote data product identifier minted by an instrument controller.
    ProductId, "product ID"
}
