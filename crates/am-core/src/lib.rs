//! AM Core - Shared types and traits
//!
//! This crate defines the abstractions used across:
//! - gpu-am-simulator (ledger, protocol client, back-off controller, driver)
//! - the in-memory cluster harness that stands in for the resource manager
//!
//! Key types:
//! - Allocate request/response records exchanged with the scheduler
//! - Collaborator traits (scheduler channel, locality, host placement, credentials)
//! - AmSimulator capability trait
//! - Error types

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
