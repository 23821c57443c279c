//! # netloop - event-driven network I/O engine
//!
//! A pool of single-threaded reactors multiplexing socket readiness and
//! deferred work, plus a per-connection handler chain bound to exactly
//! one reactor thread for the connection's lifetime. The substrate
//! beneath protocol codecs, proxies and RPC layers.
//!
//! ## Quick start
//!
//! ```ignore
//! use netloop::{Bootstrap, Channel, Context, ExecutorGroup, Handler, Msg, ReactorConfig};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn channel_read(&self, ctx: &Context, msg: Msg) -> netloop::NetResult<()> {
//!         if let (Ok(data), Some(ch)) = (msg.downcast::<Vec<u8>>(), ctx.channel()) {
//!             ch.write_and_flush(*data);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> netloop::NetResult<()> {
//!     let group = ExecutorGroup::new(ReactorConfig::from_env())?;
//!     let bootstrap = Bootstrap::new(&group)
//!         .handler(|ch: &Channel| ch.pipeline().add_last("echo", Box::new(Echo)));
//!     // bootstrap.bind(transport, addr) / bootstrap.connect(transport, addr)
//!     Ok(())
//! }
//! ```
//!
//! ## Pieces
//!
//! - [`ExecutorGroup`] - fixed reactor pool with a round-robin chooser
//! - [`Executor`] - lazily-started single-threaded task engine
//! - [`Channel`] / [`Transport`] - one connection pinned to one reactor
//! - [`Pipeline`] / [`Handler`] - the ordered per-connection handler chain
//! - [`Promise`] - writable future carrying every asynchronous result

// Re-export core types
pub use netloop_core::{
    env_get, env_get_bool, env_get_opt, ChannelId, ExecutorId, ExecutorState, Interest, NetError,
    NetResult,
};

// Re-export logging macros
pub use netloop_core::log::{self, set_level, Level};
pub use netloop_core::{nl_debug, nl_error, nl_info, nl_log, nl_trace, nl_warn};

// Re-export the engine
pub use netloop_runtime::{
    fallback_executor, Bootstrap, Channel, ChannelInitializer, Context, Executor, ExecutorGroup,
    Handler, Msg, Multiplexer, MuxFactory, Outcome, Pipeline, Promise, ReactorConfig, ReadyEvent,
    Scheduled, Task, Transport,
};
