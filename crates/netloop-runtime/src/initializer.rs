//! One-shot pipeline initializer
//!
//! A handler that installs a whole batch of handlers when its channel
//! comes up and then removes itself. Both `handler_added` (channel
//! already registered) and `channel_registered` can race to trigger it;
//! the taken-once closure keeps the initialization idempotent.

use crate::channel::Channel;
use crate::pipeline::{Context, Handler};
use netloop_core::error::{NetError, NetResult};
use netloop_core::nl_warn;
use std::sync::Mutex;

type InitFn = Box<dyn FnOnce(&Channel) -> NetResult<()> + Send>;

pub struct ChannelInitializer {
    init: Mutex<Option<InitFn>>,
}

impl ChannelInitializer {
    pub fn new<F>(init: F) -> ChannelInitializer
    where
        F: FnOnce(&Channel) -> NetResult<()> + Send + 'static,
    {
        ChannelInitializer {
            init: Mutex::new(Some(Box::new(init))),
        }
    }

    /// Run the closure at most once, then drop out of the pipeline.
    fn init_channel(&self, ctx: &Context) -> NetResult<()> {
        let Some(init) = self.init.lock().unwrap().take() else {
            return Ok(());
        };
        let channel = ctx.channel().ok_or(NetError::ChannelClosed)?;
        let result = init(&channel);
        if let Some(pipeline) = ctx.pipeline() {
            match pipeline.remove(ctx.name()) {
                Ok(()) | Err(NetError::HandlerNotFound(_)) => {}
                Err(e) => nl_warn!("initializer failed to remove itself: {}", e),
            }
        }
        result
    }
}

impl Handler for ChannelInitializer {
    fn handler_added(&self, ctx: &Context) -> NetResult<()> {
        match ctx.channel() {
            Some(ch) if ch.is_registered() => self.init_channel(ctx),
            _ => Ok(()),
        }
    }

    fn channel_registered(&self, ctx: &Context) -> NetResult<()> {
        self.init_channel(ctx)?;
        ctx.fire_channel_registered();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReactorConfig;
    use crate::executor::MuxFactory;
    use crate::group::ExecutorGroup;
    use crate::testutil::{IdleMux, NullTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Noop;
    impl Handler for Noop {}

    fn idle_group() -> ExecutorGroup {
        let factory: MuxFactory = Arc::new(|| {
            Ok(Box::new(IdleMux::new()) as Box<dyn crate::multiplexer::Multiplexer>)
        });
        let config = ReactorConfig::new().executors(1).name_prefix("init-test");
        ExecutorGroup::with_multiplexer(config, factory).unwrap()
    }

    #[test]
    fn test_initializer_installs_batch_and_removes_itself() {
        let group = idle_group();
        let channel = Channel::new(Box::new(NullTransport::new()));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        channel
            .pipeline()
            .add_last(
                "init",
                Box::new(ChannelInitializer::new(move |ch: &Channel| {
                    r.fetch_add(1, Ordering::SeqCst);
                    ch.pipeline().add_last("a", Box::new(Noop))?;
                    ch.pipeline().add_last("b", Box::new(Noop))?;
                    Ok(())
                })),
            )
            .unwrap();

        group
            .register(&channel)
            .await_done(Some(Duration::from_secs(2)))
            .unwrap();

        // The initializer ran on the loop thread; poll for the result.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while channel.pipeline().names() != vec!["a", "b"] {
            assert!(
                std::time::Instant::now() < deadline,
                "pipeline never initialized: {:?}",
                channel.pipeline().names()
            );
            std::thread::yield_now();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .await_done(Some(Duration::from_secs(5)))
            .unwrap();
    }

    #[test]
    fn test_initializer_runs_once_under_double_trigger() {
        // Drive both trigger paths by hand: the closure must run once.
        let group = idle_group();
        let channel = Channel::new(Box::new(NullTransport::new()));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let init = ChannelInitializer::new(move |_: &Channel| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        channel.pipeline().add_last("init", Box::new(init)).unwrap();

        group
            .register(&channel)
            .await_done(Some(Duration::from_secs(2)))
            .unwrap();
        // Registration already triggered it once; a second registered
        // event reaching the pipeline must not re-run the closure.
        channel.pipeline().fire_channel_registered();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ran.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .await_done(Some(Duration::from_secs(5)))
            .unwrap();
    }
}
