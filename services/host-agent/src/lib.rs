//! corral host agent
//!
//! The host agent runs on every host in the cluster and keeps the service
//! instances assigned to that host converged with the coordination store.
//!
//! ## Architecture
//!
//! - **Host Agent**: watches the host's instance directory and runs one
//!   reconciler task per assigned instance, respawning failed ones with backoff
//! - **Instance Reconciler**: drives one instance's container toward its
//!   desired state (run, pause, stop) and records the outcome
//! - **Operation Slot**: serializes container transitions per instance and
//!   carries the "process exited" signal back to the reconciler
//! - **Instance Registry**: which instances currently have a live reconciler
//! - **Runtime**: abstracts container lifecycle operations (mock in dev)

pub mod agent;
pub mod config;
pub mod error;
pub mod operation;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod state;

pub use agent::{AgentConfig, HostAgent};
pub use error::{ReconcileError, RuntimeAction};
pub use reconciler::{InstanceReconciler, ReconcilerConfig};
pub use registry::InstanceRegistry;
pub use runtime::{MockRuntime, PullError, RuntimeHandler, TerminateFn};
