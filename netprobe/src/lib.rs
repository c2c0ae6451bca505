pub mod error;
#[cfg(feature = "k8s")]
pub mod k8s;
pub mod probes;
pub mod settings;
pub mod telemetry;

use anyhow::Result;
use log::{info, warn};
use netprobe_common::Event;
use tokio::{signal, sync::mpsc};

use crate::probes::{EventProbe, EventSink};
use crate::settings::Settings;

pub struct NetProbeEngine {
    pub settings: Settings,
    sink: Option<EventSink>,
    events: mpsc::Receiver<Event>,
    probes: Vec<Box<dyn EventProbe>>,
}

impl NetProbeEngine {
    pub fn new(settings: Settings) -> Self {
        let (sink, events) = mpsc::channel(settings.sink_capacity);
        Self {
            settings,
            sink: Some(sink),
            events,
            probes: Vec::new(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let started = self.start_probes();
        if started == 0 {
            warn!("No event probe started");
        }

        info!("Monitoring active. Press Ctrl-C to exit.");
        loop {
            tokio::select! {
                res = signal::ctrl_c() => {
                    res?;
                    info!("Exiting...");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => handle_event(&event),
                    None => {
                        info!("All event probes stopped emitting");
                        break;
                    }
                },
            }
        }

        probes::request_shutdown();
        self.stop_probes();
        telemetry::shutdown_metrics();
        Ok(())
    }

    /// Create and start every enabled probe from the settings.
    ///
    /// A probe that fails to create or start is logged and skipped. Returns
    /// the number of running probes.
    pub fn start_probes(&mut self) -> usize {
        let Some(sink) = self.sink.take() else {
            return self.probes.len();
        };

        for cfg in self.settings.enabled_probes() {
            let mut probe = match probes::create_event_probe(&cfg.name, sink.clone(), cfg.raw_args()) {
                Ok(probe) => probe,
                Err(e) => {
                    warn!("Skipping probe {}: {}", cfg.name, e);
                    continue;
                }
            };
            if let Err(e) = probe.start() {
                warn!("Skipping probe {}: {}", cfg.name, e);
                continue;
            }
            self.probes.push(probe);
        }

        self.probes.len()
    }

    /// Receive the next event, `None` once every probe has dropped its sink.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn stop_probes(&mut self) {
        for probe in self.probes.iter_mut() {
            if let Err(e) = probe.stop() {
                warn!("{}", e);
            }
        }
        self.probes.clear();
    }
}

fn handle_event(event: &Event) {
    telemetry::record_event(event.event_type.as_str());
    if event.labels.is_empty() {
        info!("[{}] {} {}", event.timestamp, event.event_type, event.message);
    } else {
        let labels: Vec<String> = event.labels.iter().map(ToString::to_string).collect();
        info!(
            "[{}] {} {} {{{}}}",
            event.timestamp,
            event.event_type,
            event.message,
            labels.join(", ")
        );
    }
}
