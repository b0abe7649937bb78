//! Testing utilities
//!
//! Lets the runtime be exercised without a broker or a task backend: the
//! in-process [`MemoryBus`] stands in for the message bus and
//! [`MockExecutor`] for the backend.

pub mod mocks;

pub use crate::transport::{MemoryBus, MemoryTransport};
pub use mocks::*;
