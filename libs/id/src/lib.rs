//! # corral-id
//!
//! Typed identifiers used by the host agent and the coordination store.
//!
//! Every identifier renders as `{prefix}_{ulid}`:
//!
//! - `host_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `svc_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The rendered form contains no `/`, so it can be used verbatim as a
//! coordination-store path segment.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
