//! Wire protocol between the agent and its orchestrator
//!
//! Subjects, typed message records and the JSON codec that maps between
//! them and raw bus payloads.

pub mod codec;
pub mod messages;
pub mod subjects;

pub use codec::{CodecError, MessageCodec};
pub use messages::*;
pub use subjects::*;
