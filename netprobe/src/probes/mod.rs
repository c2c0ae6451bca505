use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Result;
use log::{info, warn};
use netprobe_common::Event;
use tokio::sync::mpsc;

use crate::error::ProbeError;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub mod args;
pub mod builtin;
pub mod creator;
pub mod meta;
pub mod registry;

pub use args::{ArgSchema, FromArg, ProbeArgs, RawArgs};
pub use creator::{ArgShape, EventProbeCreator};
pub use meta::{MetadataEnricher, NetnsResolver, PodInfo, event_meta_by_netns};
pub use registry::{
    ProbeRegistry, RegistryBuilder, create_event_probe, install_registry, list_event_probes,
    registry,
};

/// Send side of the channel every probe emits its events onto.
///
/// Capacity and the behaviour on a full channel belong to whoever created it.
pub type EventSink = mpsc::Sender<Event>;

pub const POLL_INTERVAL_MS: u64 = 10;

/// Current Unix time in nanoseconds, the timestamp carried by events.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeState::Stopped => "stopped",
            ProbeState::Starting => "starting",
            ProbeState::Running => "running",
            ProbeState::Stopping => "stopping",
            ProbeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A running probe handle as returned by the registry.
///
/// Every instance owns its resources; two instances of the same probe must
/// not share kernel handles.
pub trait EventProbe: Send {
    fn name(&self) -> &str;
    fn start(&mut self) -> Result<(), ProbeError>;
    fn stop(&mut self) -> Result<(), ProbeError>;
    fn state(&self) -> ProbeState;

    fn ready(&self) -> bool {
        self.state() == ProbeState::Running
    }
}

impl<P: EventProbe + ?Sized> EventProbe for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn start(&mut self) -> Result<(), ProbeError> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<(), ProbeError> {
        (**self).stop()
    }

    fn state(&self) -> ProbeState {
        (**self).state()
    }
}

/// The part a probe author writes: acquire and release resources.
pub trait SimpleProbe: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

/// Wraps a [`SimpleProbe`] with name and state tracking.
pub struct StatefulProbe<S> {
    name: String,
    state: ProbeState,
    inner: S,
}

pub fn new_event_probe<S: SimpleProbe>(name: &str, simple: S) -> StatefulProbe<S> {
    StatefulProbe {
        name: name.to_string(),
        state: ProbeState::Stopped,
        inner: simple,
    }
}

impl<S> StatefulProbe<S> {
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn invalid_state(&self) -> ProbeError {
        ProbeError::InvalidState {
            name: self.name.clone(),
            state: self.state,
        }
    }

    fn failed(&mut self, source: anyhow::Error) -> ProbeError {
        self.state = ProbeState::Failed;
        ProbeError::Lifecycle {
            name: self.name.clone(),
            source,
        }
    }
}

impl<S: SimpleProbe> EventProbe for StatefulProbe<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), ProbeError> {
        if self.state != ProbeState::Stopped {
            return Err(self.invalid_state());
        }
        self.state = ProbeState::Starting;
        if let Err(e) = self.inner.start() {
            warn!("probe {} failed to start: {:#}", self.name, e);
            return Err(self.failed(e));
        }
        self.state = ProbeState::Running;
        info!("probe {} started", self.name);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ProbeError> {
        if self.state != ProbeState::Running {
            return Err(self.invalid_state());
        }
        self.state = ProbeState::Stopping;
        if let Err(e) = self.inner.stop() {
            warn!("probe {} failed to stop: {:#}", self.name, e);
            return Err(self.failed(e));
        }
        self.state = ProbeState::Stopped;
        info!("probe {} stopped", self.name);
        Ok(())
    }

    fn state(&self) -> ProbeState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counting {
        starts: u32,
        stops: u32,
        fail_start: bool,
    }

    impl SimpleProbe for Counting {
        fn start(&mut self) -> Result<()> {
            if self.fail_start {
                anyhow::bail!("tracepoint not available");
            }
            self.starts += 1;
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.stops += 1;
            Ok(())
        }
    }

    #[test]
    fn test_stateful_probe_lifecycle() {
        let mut probe = new_event_probe("counting", Counting::default());
        assert_eq!(probe.state(), ProbeState::Stopped);
        assert!(!probe.ready());

        probe.start().unwrap();
        assert!(probe.ready());
        assert_eq!(probe.inner().starts, 1);

        probe.stop().unwrap();
        assert_eq!(probe.state(), ProbeState::Stopped);
        assert_eq!(probe.inner().stops, 1);

        // restart is allowed once stopped
        probe.start().unwrap();
        assert_eq!(probe.inner().starts, 2);
    }

    #[test]
    fn test_double_start_is_rejected() {
        let mut probe = new_event_probe("counting", Counting::default());
        probe.start().unwrap();
        let err = probe.start().unwrap_err();
        assert!(matches!(
            err,
            ProbeError::InvalidState {
                state: ProbeState::Running,
                ..
            }
        ));
        assert_eq!(probe.inner().starts, 1);
    }

    #[test]
    fn test_stop_when_not_running_is_rejected() {
        let mut probe = new_event_probe("counting", Counting::default());
        assert!(matches!(
            probe.stop(),
            Err(ProbeError::InvalidState { .. })
        ));
        assert_eq!(probe.inner().stops, 0);
    }

    #[test]
    fn test_failed_start_moves_to_failed() {
        let mut probe = new_event_probe(
            "counting",
            Counting {
                fail_start: true,
                ..Default::default()
            },
        );
        let err = probe.start().unwrap_err();
        assert!(err.to_string().contains("tracepoint not available"));
        assert_eq!(probe.state(), ProbeState::Failed);
        assert!(probe.start().is_err());
    }

    #[test]
    fn test_boxed_probe_delegates() {
        let mut probe: Box<dyn EventProbe> = Box::new(new_event_probe("boxed", Counting::default()));
        assert_eq!(probe.name(), "boxed");
        probe.start().unwrap();
        assert!(probe.ready());
    }
}
