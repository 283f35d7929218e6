//! Instance lifecycle manager and invocation engine.
//!
//! Declared executables become network-invokable units of work: a client
//! creates an instance with parameters, the engine launches the program with
//! those parameters in its environment, and the program's output is mapped
//! into named, typed results on the same record.
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, patches, result
//!   mapping, content types, links). No I/O.
//! - **[`io`]**: Side-effecting operations (configuration, spec loading,
//!   process execution, instance stores).
//!
//! Orchestration modules ([`lifecycle`], [`invocation`], [`recovery`])
//! coordinate core logic with I/O.

pub mod clock;
pub mod core;
pub mod events;
pub mod invocation;
pub mod io;
pub mod lifecycle;
pub mod locks;
pub mod logging;
pub mod recovery;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
