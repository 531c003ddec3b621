//! # Ember Core
//!
//! Foundational types for the Ember submission scheduler.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ember-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │    Sync     │  │      Error          │  │
//! │  │ (GpuAddr,   │  │ (Stamps,    │  │    Taxonomy         │  │
//! │  │  EngineId)  │  │  Tags)      │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{Error, ErrorClass, Result};
pub use sync::*;
pub use types::*;
