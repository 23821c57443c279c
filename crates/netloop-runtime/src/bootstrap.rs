//! Bootstrap - wiring a group, a handler factory and a transport
//!
//! The thin entry point over the registration protocol: pick an
//! executor through the group, install the caller's handlers via a
//! one-shot initializer, then drive register -> bind/connect in the
//! required order. No CLI or option-bag surface; concrete transports
//! come from the caller.

use crate::channel::{Channel, Transport};
use crate::group::ExecutorGroup;
use crate::initializer::ChannelInitializer;
use crate::promise::{Outcome, Promise};
use netloop_core::error::NetResult;
use netloop_core::nl_warn;
use std::net::SocketAddr;
use std::sync::Arc;

type HandlerFactory = Arc<dyn Fn(&Channel) -> NetResult<()> + Send + Sync>;

#[derive(Clone)]
pub struct Bootstrap {
    group: ExecutorGroup,
    factory: Option<HandlerFactory>,
}

impl Bootstrap {
    pub fn new(group: &ExecutorGroup) -> Bootstrap {
        Bootstrap {
            group: group.clone(),
            factory: None,
        }
    }

    /// Handler installation callback, run once per channel when it
    /// registers.
    pub fn handler<F>(mut self, factory: F) -> Bootstrap
    where
        F: Fn(&Channel) -> NetResult<()> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn group(&self) -> &ExecutorGroup {
        &self.group
    }

    /// New channel over `transport` with the handler factory staged in
    /// its pipeline (not yet registered).
    pub fn create_channel(&self, transport: Box<dyn Transport>) -> Channel {
        let channel = Channel::new(transport);
        if let Some(factory) = &self.factory {
            let factory = Arc::clone(factory);
            let init = ChannelInitializer::new(move |ch: &Channel| factory(ch));
            if let Err(e) = channel.pipeline().add_last("#initializer", Box::new(init)) {
                nl_warn!("failed to stage channel initializer: {}", e);
            }
        }
        channel
    }

    /// Register a fresh channel; returns it with its registration future
    pub fn register(&self, transport: Box<dyn Transport>) -> (Channel, Promise<()>) {
        let channel = self.create_channel(transport);
        let reg = self.group.register(&channel);
        (channel, reg)
    }

    /// Register, then connect once registration has succeeded. Fails
    /// (and closes the channel) on connect errors and timeouts.
    pub fn connect(&self, transport: Box<dyn Transport>, addr: SocketAddr) -> Promise<Channel> {
        let (channel, _reg) = self.register(transport);
        let result: Promise<Channel> = Promise::new();
        let r = result.clone();
        let ch = channel.clone();
        channel
            .connect(addr)
            .add_listener(move |outcome: &Outcome<()>| match outcome {
                Outcome::Success(()) => {
                    r.succeed(ch.clone());
                }
                other => {
                    r.fail(other.cause().unwrap_or(netloop_core::NetError::ChannelClosed));
                }
            });
        result
    }

    /// Register, then bind once registration has succeeded
    pub fn bind(&self, transport: Box<dyn Transport>, addr: SocketAddr) -> Promise<Channel> {
        let (channel, _reg) = self.register(transport);
        let result: Promise<Channel> = Promise::new();
        let r = result.clone();
        let ch = channel.clone();
        channel
            .bind(addr)
            .add_listener(move |outcome: &Outcome<()>| match outcome {
                Outcome::Success(()) => {
                    r.succeed(ch.clone());
                }
                other => {
                    r.fail(other.cause().unwrap_or(netloop_core::NetError::ChannelClosed));
                }
            });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReactorConfig;
    use crate::executor::MuxFactory;
    use crate::testutil::{IdleMux, StallTransport};
    use netloop_core::error::{NetError, NetResult};
    use std::os::unix::io::RawFd;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    /// Transport that records when bind actually runs
    struct RecordingTransport {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Transport for RecordingTransport {
        fn fd(&self) -> RawFd {
            -1
        }

        fn bind(&mut self, _addr: &std::net::SocketAddr) -> NetResult<()> {
            self.log.lock().unwrap().push("bind");
            Ok(())
        }

        fn close(&mut self) -> NetResult<()> {
            Ok(())
        }
    }

    struct RegisteredProbe {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl crate::pipeline::Handler for RegisteredProbe {
        fn channel_registered(&self, ctx: &crate::pipeline::Context) -> NetResult<()> {
            self.log.lock().unwrap().push("registered");
            ctx.fire_channel_registered();
            Ok(())
        }
    }

    fn idle_group(n: usize) -> ExecutorGroup {
        let factory: MuxFactory = Arc::new(|| {
            Ok(Box::new(IdleMux::new()) as Box<dyn crate::multiplexer::Multiplexer>)
        });
        let config = ReactorConfig::new().executors(n).name_prefix("boot-test");
        ExecutorGroup::with_multiplexer(config, factory).unwrap()
    }

    #[test]
    fn test_bind_runs_strictly_after_delayed_registration() {
        let group = idle_group(1);
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let l = Arc::clone(&log);
        let bootstrap = Bootstrap::new(&group).handler(move |ch: &Channel| {
            ch.pipeline().add_last(
                "probe",
                Box::new(RegisteredProbe { log: Arc::clone(&l) }),
            )
        });

        // Artificial registration delay: park the lone executor so the
        // registration task sits queued while bind is issued.
        group.executors()[0]
            .execute(Box::new(|| std::thread::sleep(Duration::from_millis(100))))
            .unwrap();

        let channel = bootstrap.create_channel(Box::new(RecordingTransport {
            log: Arc::clone(&log),
        }));
        let reg = group.register(&channel);
        assert!(!reg.is_done(), "registration should still be queued");

        // Issue bind from this foreign thread before registration ran.
        let bind = channel.bind("127.0.0.1:0".parse().unwrap());
        let outcome = bind.await_done(Some(Duration::from_secs(2))).unwrap();
        assert!(outcome.is_success(), "bind failed: {:?}", outcome.cause());

        // Never before, never skipped: registration strictly first.
        assert_eq!(*log.lock().unwrap(), vec!["registered", "bind"]);
        assert!(reg.is_success());

        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .await_done(Some(Duration::from_secs(5)))
            .unwrap();
    }

    #[test]
    fn test_bind_without_registration_fails() {
        let channel = Channel::new(Box::new(crate::testutil::NullTransport::new()));
        let bind = channel.bind("127.0.0.1:0".parse().unwrap());
        assert_eq!(bind.cause(), Some(NetError::NotRegistered));
    }

    #[test]
    fn test_connect_timeout_end_to_end() {
        // Four reactors, one hundred channels, a connect that can never
        // complete and a 50 ms deadline: every promise must fail with a
        // connect-timeout and every channel must end up closed.
        let config = ReactorConfig::new()
            .executors(4)
            .connect_timeout(Duration::from_millis(50))
            .name_prefix("e2e");
        let group = ExecutorGroup::new(config).unwrap();
        let bootstrap = Bootstrap::new(&group);
        let addr: std::net::SocketAddr = "10.255.255.1:9".parse().unwrap();

        let start = Instant::now();
        let attempts: Vec<(Promise<Channel>, Channel)> = (0..100)
            .map(|_| {
                let transport = Box::new(StallTransport::new());
                let channel = bootstrap.create_channel(transport);
                let reg = group.register(&channel);
                drop(reg);
                let p = channel.connect(addr);
                let result: Promise<Channel> = Promise::new();
                let r = result.clone();
                let ch = channel.clone();
                p.add_listener(move |o: &crate::promise::Outcome<()>| match o {
                    crate::promise::Outcome::Success(()) => {
                        r.succeed(ch.clone());
                    }
                    other => {
                        r.fail(other.cause().unwrap_or(NetError::ChannelClosed));
                    }
                });
                (result, channel)
            })
            .collect();

        for (promise, channel) in &attempts {
            let outcome = promise.await_done(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(outcome.cause(), Some(NetError::ConnectTimeout));
            let deadline = Instant::now() + Duration::from_secs(2);
            while channel.is_open() {
                assert!(Instant::now() < deadline, "channel left open");
                std::thread::yield_now();
            }
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(40),
            "timed out implausibly fast: {:?}",
            elapsed
        );
        assert!(
            elapsed < Duration::from_secs(2),
            "timeouts took far too long: {:?}",
            elapsed
        );

        group
            .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
            .await_done(Some(Duration::from_secs(5)))
            .unwrap();
    }
}
