//! Deterministic, pure logic shared by the lifecycle manager and the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod content_type;
pub mod ids;
pub mod links;
pub mod patch;
pub mod result_mapping;
pub mod spec;
pub mod transitions;
pub mod types;
