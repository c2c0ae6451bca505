//! Event probes compiled into the default registry.

pub mod heartbeat;
pub mod netdev;

use std::{
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use netprobe_common::Event;
use tokio::sync::mpsc::error::TrySendError;

use crate::probes::{EventProbeCreator, EventSink, POLL_INTERVAL_MS, registry::RegistryBuilder, shutdown_flag};
use crate::telemetry;

pub use heartbeat::HeartbeatProbe;
pub use netdev::{NetdevArgs, NetdevErrorProbe};

pub fn register(builder: &mut RegistryBuilder) {
    builder
        .must_register(heartbeat::NAME, EventProbeCreator::with_map(heartbeat::create))
        .must_register(netdev::NAME, EventProbeCreator::with_args(netdev::create));
}

/// Hand an event to the sink without blocking.
///
/// A full sink drops the event. Returns `false` once the receiver is gone.
pub(crate) fn emit(sink: &EventSink, probe: &str, event: Event) -> bool {
    match sink.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            debug!("sink full, dropping {} event from {}", event.event_type, probe);
            true
        }
        Err(TrySendError::Closed(_)) => {
            info!("sink closed, {} stops emitting", probe);
            false
        }
    }
}

/// Background thread running a probe's periodic work until stopped.
pub(crate) struct Poller {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Run `tick` now and then every `interval` until stopped, until the
    /// process shuts down, or until `tick` breaks.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let shutdown = shutdown_flag();
        let keep_going = move || flag.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed);

        let handle = std::thread::Builder::new()
            .name(format!("probe-{}", name))
            .spawn(move || {
                while keep_going() {
                    if tick().is_break() {
                        break;
                    }
                    let deadline = Instant::now() + interval;
                    while keep_going() {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        std::thread::sleep(
                            (deadline - now).min(Duration::from_millis(POLL_INTERVAL_MS)),
                        );
                    }
                }
            })
            .with_context(|| format!("Failed to spawn worker for {}", name))?;

        telemetry::inc_active_probe(name);
        Ok(Self {
            name: name.to_string(),
            running,
            handle: Some(handle),
        })
    }

    /// True once the worker thread returned on its own or was stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                anyhow::bail!("worker of {} panicked", self.name);
            }
            telemetry::dec_active_probe(&self.name);
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::active_probe_count;

    #[test]
    fn test_active_gauge_counts_each_instance() {
        let name = "gauge-two-instances";
        let tick = || ControlFlow::Continue(());
        let mut first = Poller::spawn(name, Duration::from_millis(5), tick).unwrap();
        let mut second = Poller::spawn(name, Duration::from_millis(5), tick).unwrap();
        assert_eq!(active_probe_count(name), 2);

        first.stop().unwrap();
        assert!(!second.is_finished());
        assert_eq!(active_probe_count(name), 1);

        second.stop().unwrap();
        assert_eq!(active_probe_count(name), 0);
        // stopping twice does not count twice
        second.stop().unwrap();
        assert_eq!(active_probe_count(name), 0);
    }

    #[test]
    fn test_worker_ends_when_tick_breaks() {
        let mut poller =
            Poller::spawn("breaks-at-once", Duration::from_millis(5), || ControlFlow::Break(())).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !poller.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(poller.is_finished());
        poller.stop().unwrap();
    }
}
