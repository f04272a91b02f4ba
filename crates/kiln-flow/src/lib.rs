//! # kiln-flow
//!
//! Task orchestration core for long-running instrument activities.
//!
//! This crate coordinates work sent to remote instrument controllers
//! (printers, furnaces, measurement rigs) whose activities run for
//! minutes to hours and complete asynchronously:
//!
//! - **Scheduler**: Durable task records with a strict status state machine
//! - **Agent**: Bounded-concurrency polling dispatch with event-driven
//!   finalization
//! - **Supervisor**: Stale, timeout, retry, deadline, and health
//!   reconciliation with escalation callbacks
//! - **Gateway**: Schema-validated dispatch to per-controller clients
//! - **EventBridge**: Controller event normalization and in-process fan-out
//! - **CorrelationStore**: Activity and data-product bookkeeping
//!
//! ## Guarantees
//!
//! - **Monotonic**: Task status transitions never leave a terminal state,
//!   except the single failed-to-scheduled retry edge
//! - **Bounded**: The agent never runs more than `maxConcurrent` activities
//! - **Non-blocking**: No loop waits synchronously for a remote activity;
//!   completion is pushed through the event bridge, with the supervisor's
//!   reconciliation polls as the bounded fallback
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use kiln_core::{ControllerId, RunId};
//! use kiln_flow::error::Result;
//! use kiln_flow::config::SchedulerConfig;
//! use kiln_flow::scheduler::{Scheduler, TaskRequest};
//! use kiln_flow::store::memory::InMemoryTaskStore;
//! use kiln_flow::task::ActivityOption;
//!
//! # async fn demo() -> Result<()> {
//! let scheduler = Scheduler::new(
//!     Arc::new(InMemoryTaskStore::new()),
//!     SchedulerConfig::default(),
//! );
//!
//! let mut request = TaskRequest::new(
//!     RunId::new("run-7f3a"),
//!     ControllerId::new("printer-a3"),
//!     "print_job",
//! );
//! request.options = vec![
//!     ActivityOption::new("file", "bucket/bracket.stl"),
//!     ActivityOption::new("material", "ti64"),
//! ];
//!
//! let task = scheduler.schedule_task(request).await?;
//! println!("scheduled {}", task.id);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod agent;
pub mod bridge;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod gateway;
pub mod loops;
pub mod metrics;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod supervisor;
pub mod task;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::agent::Agent;
    pub use crate::bridge::{EventBridge, EventBus, InMemoryEventBus, TopicPattern};
    pub use crate::config::{
        AgentConfig, ControllerConfig, FlowConfig, GatewayConfig, SchedulerConfig,
        SupervisorConfig,
    };
    pub use crate::correlation::{
        ActivityCorrelation, ActivityStatus, CorrelationStore, DataProductMapping,
    };
    pub use crate::correlation::memory::InMemoryCorrelationStore;
    pub use crate::error::{Error, GatewayError, Result};
    pub use crate::events::{
        ControllerEvent, ControllerEventKind, Escalation, EscalationKind, FlowEvent,
    };
    pub use crate::gateway::{
        ActionAck, ActivityRequest, ControllerClient, GatewayService, HttpControllerClient,
        SimulatedControllerClient,
    };
    pub use crate::loops::{spawn_repeating, LoopHandle};
    pub use crate::metrics::FlowMetrics;
    pub use crate::scheduler::{Scheduler, TaskRequest, TaskStats};
    pub use crate::schema::{ExecutionPlan, SchemaMapper, ValidationReport};
    pub use crate::store::memory::InMemoryTaskStore;
    pub use crate::store::{TaskFilter, TaskStore};
    pub use crate::supervisor::{EscalationHandler, Supervisor};
    pub use crate::task::{
        ActivityOption, RetryPolicy, ScheduledTask, TaskPriority, TaskStatus, TransitionReason,
    };
}
