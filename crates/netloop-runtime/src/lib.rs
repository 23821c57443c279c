//! # netloop-runtime
//!
//! The engine behind netloop: single-threaded reactor executors, the
//! readiness multiplexer, the channel registration protocol and the
//! per-channel handler pipeline.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Bootstrap / caller                   │
//! │        group.register(ch), ch.connect(), pipeline        │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                      ExecutorGroup                       │
//! │            chooser (mask / modulo round-robin)           │
//! └──────────────────────────────────────────────────────────┘
//!          │                  │                  │
//!          ▼                  ▼                  ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │ Executor  │      │ Executor  │      │ Executor  │
//!    │ + reactor │      │ + reactor │      │ + reactor │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                  │                  │
//!          └──────────────────┼──────────────────┘
//!                             ▼
//!    ┌──────────────────────────────────────────────────────┐
//!    │        Multiplexer (epoll / poll, rebuildable)       │
//!    └──────────────────────────────────────────────────────┘
//! ```
//!
//! Every channel is pinned to exactly one executor for its lifetime; no
//! work-stealing. Cross-thread operations are funneled through each
//! executor's task queue, which preserves per-channel ordering without
//! locks on the hot path.

#![allow(dead_code)]

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod executor;
pub mod group;
pub mod initializer;
pub mod multiplexer;
pub mod pipeline;
pub mod promise;
pub mod tls;

mod reactor;
mod time;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use bootstrap::Bootstrap;
pub use channel::{Channel, Transport};
pub use config::ReactorConfig;
pub use executor::{fallback_executor, Executor, MuxFactory, Scheduled, Task};
pub use group::ExecutorGroup;
pub use initializer::ChannelInitializer;
pub use multiplexer::{Multiplexer, ReadyEvent};
pub use pipeline::{Context, Handler, Msg, Pipeline};
pub use promise::{Outcome, Promise};
