//! FerroLift integration test support
//!
//! Fixtures shared by the end-to-end scenarios in `tests/`: deterministic payloads, a
//! configuration tuned for millisecond-scale runs, and an engine wired to an in-memory
//! storage system.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Unified test utilities
pub mod test_utils;
