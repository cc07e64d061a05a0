//! # fleet-id
//!
//! Typed identifiers for the fleet node agent.
//!
//! ## ID Format
//!
//! Every resource ID uses a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F`
//! - `mach_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `evt_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//!
//! ULIDs sort by creation time, so comparing two IDs of the same type
//! compares their creation order. Instance event IDs additionally come from
//! an [`EventIdGenerator`], which keeps them strictly increasing even when
//! several events are created in the same millisecond.

mod error;
mod generator;
mod macros;
mod types;

pub use error::IdError;
pub use generator::EventIdGenerator;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
