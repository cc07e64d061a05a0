//! # fleet-events
//!
//! Instance lifecycle vocabulary shared by everything that stores, reports or
//! consumes instance events.
//!
//! ## Design Principles
//!
//! - Events are immutable records of validated state transitions
//! - Every event belongs to exactly one instance
//! - An event's type is its payload variant; the two cannot disagree
//! - Replaying an instance's events in ID order reproduces its status
//!
//! ## State Machine
//!
//! ```text
//! created -> preparing -> stopped -> starting -> running -> stopping
//!                |          | ^ ^        |          |          |
//!                |          | | +--------+          |          |
//!                |          | +---------------------+----------+
//!                v          |
//!           destroying <----+
//!                |
//!                v
//!           destroyed
//! ```
//!
//! The authoritative edge list is [`can_transition`].

mod error;
mod event;
mod status;

pub use error::EventError;
pub use event::*;
pub use status::*;
