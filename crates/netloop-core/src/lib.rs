//! # netloop-core
//!
//! Core types for the netloop reactor engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The reactor loop, multiplexer bindings and channel machinery live in
//! `netloop-runtime`.
//!
//! ## Modules
//!
//! - `id` - channel/executor identifier types and the id allocator
//! - `state` - executor lifecycle states and readiness interest flags
//! - `error` - error types
//! - `env` - environment variable utilities
//! - `log` - leveled stderr logging macros

#![allow(dead_code)]

pub mod env;
pub mod error;
pub mod id;
pub mod log;
pub mod state;

// Re-exports for convenience
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{NetError, NetResult};
pub use id::{ChannelId, ExecutorId, IdGen};
pub use state::{ExecutorState, Interest};
