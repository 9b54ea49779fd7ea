//! # Arbor - Wait Scheduling & Workflow Automation for UI Trees
//!
//! Arbor automates interaction with evolving user-interface trees. It is
//! built around two cooperating cores that share one fabric: a selector
//! resolver, a scoped context, a telemetry bus, and cooperative
//! cancellation:
//!
//! - **The wait core** ([`wait`]) locates a logical UI node through a chain
//!   of fallback strategies, evaluates text / visibility / mutation-idle
//!   predicates, tolerates transiently detached ("stale") nodes, and
//!   surfaces structured telemetry under bounded timeouts with jittered
//!   polling and scroll-based recovery.
//! - **The workflow core** ([`workflow`]) runs declarative definitions of
//!   atomic and control-flow steps (`if`, `foreach`, `retry`) against a
//!   layered context store with transactional scopes and TTL entries.
//!
//! The live tree sits behind the [`dom`] trait seam, so the same cores run
//! against a browser bridge, a remote driver, or the in-memory fake in
//! [`testing`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use arbor::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let map = Arc::new(SelectorMap::parse(include_str!("selectors.json"))?);
//!     let resolver = Arc::new(SelectorResolver::new(map, backend));
//!
//!     // Wait for a node to carry the right text
//!     let waiter = Waiter::new(resolver.clone());
//!     let result = waiter
//!         .wait_text(
//!             WaitOptions::for_key("order.status")
//!                 .with_text("Shipped")
//!                 .with_timeout_ms(5_000),
//!         )
//!         .await?;
//!     println!("settled after {} poll(s)", result.poll_count);
//!
//!     // Run a workflow against the same resolver fabric
//!     let runner = WorkflowRunner::new(resolver);
//!     let definition = WorkflowDefinition::new("checkout")
//!         .with_step(WorkflowStep::click("cart.open"))
//!         .with_step(WorkflowStep::capture("cart.total", "totals.cart"));
//!     let outcome = runner.run_workflow(&definition, RunOptions::default()).await?;
//!     println!("run finished: {:?}", outcome.status);
//!     Ok(())
//! }
//! ```
#![deny(unsafe_code)]

pub mod context;
pub mod dom;
pub mod error;
pub mod runtime;
pub mod sanitize;
pub mod selector;
pub mod telemetry;
pub mod testing;
pub mod wait;
pub mod workflow;

pub use error::{ErrorCategory, StepError, StepErrorReason, WaitError, WaitErrorKind};

/// Everything most callers need.
pub mod prelude {
    pub use crate::context::{ContextManager, ContextStore, MemoryContext};
    pub use crate::dom::{DomBackend, DomElement, ElementHandle, ObserveTarget};
    pub use crate::error::{StepError, StepErrorReason, WaitError, WaitErrorKind};
    pub use crate::runtime::SchedulerEnv;
    pub use crate::selector::{
        SelectorEntry, SelectorMap, SelectorResolver, SelectorTry, validate_selector_map,
    };
    pub use crate::telemetry::{RunStatus, TelemetryBus};
    pub use crate::wait::{
        IdleOptions, TextMode, VisibilityOptions, WaitOptions, WaitResult, Waiter,
    };
    pub use crate::workflow::{
        Condition, RunOptions, TimingOverrides, WaitSpec, WorkflowDefinition, WorkflowRunner,
        WorkflowStep,
    };
}
