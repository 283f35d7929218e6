//! I/O helpers: configuration, spec loading, process execution and stores.

pub mod config;
pub mod fs_atomic;
pub mod process;
pub mod runner;
pub mod spec_store;
pub mod store;
