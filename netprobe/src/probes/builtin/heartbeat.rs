//! Liveness events for the event pipeline.
//!
//! Emits one `Heartbeat` event right after start and then at a fixed
//! interval, tagged with the labels given in the probe configuration. A
//! consumer that stops seeing heartbeats knows the sink path is broken.

use std::{collections::HashMap, ops::ControlFlow, time::Duration};

use anyhow::Result;
use netprobe_common::{Event, Label};

use crate::probes::{
    EventSink, SimpleProbe, StatefulProbe,
    builtin::{Poller, emit},
    new_event_probe, now_nanos,
};

pub const NAME: &str = "heartbeat";
pub const EVENT_TYPE: &str = "Heartbeat";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct HeartbeatProbe {
    sink: EventSink,
    labels: Vec<Label>,
    interval: Duration,
    poller: Option<Poller>,
}

pub fn create(sink: EventSink, args: HashMap<String, String>) -> Result<StatefulProbe<HeartbeatProbe>> {
    Ok(new_event_probe(NAME, HeartbeatProbe::new(sink, args, HEARTBEAT_INTERVAL)))
}

impl HeartbeatProbe {
    pub fn new(sink: EventSink, args: HashMap<String, String>, interval: Duration) -> Self {
        let mut labels: Vec<Label> = args.into_iter().map(|(k, v)| Label::new(k, v)).collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            sink,
            labels,
            interval,
            poller: None,
        }
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// True when no worker is running.
    pub fn is_idle(&self) -> bool {
        self.poller.as_ref().is_none_or(Poller::is_finished)
    }
}

impl SimpleProbe for HeartbeatProbe {
    fn start(&mut self) -> Result<()> {
        let sink = self.sink.clone();
        let labels = self.labels.clone();
        let mut seq: u64 = 0;

        self.poller = Some(Poller::spawn(NAME, self.interval, move || {
            seq += 1;
            let event = Event::new(now_nanos(), EVENT_TYPE, format!("heartbeat #{}", seq))
                .with_labels(labels.iter().cloned());
            if emit(&sink, NAME, event) {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        })?);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        match self.poller.take() {
            Some(mut poller) => poller.stop(),
            None => Ok(()),
        }
    }
}
