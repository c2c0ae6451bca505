//! Network device error/drop probe.
//!
//! ## Why procfs?
//! - `/proc/net/dev` is available on every kernel, no tracing support needed
//! - Counters are cumulative, so polling at a coarse interval loses nothing
//!
//! Emits a `NetDevError` event whenever the receive or transmit error+drop
//! counters of a watched interface grow by at least `MinDelta` between polls.

use std::{collections::HashMap, ops::ControlFlow, time::Duration};

use anyhow::{Context, Result};
use log::warn;
use netprobe_common::{Event, Label};

use crate::probes::{
    ArgSchema, EventSink, ProbeArgs, SimpleProbe, StatefulProbe,
    builtin::{Poller, emit},
    meta::{current_netns, event_meta_by_netns},
    new_event_probe, now_nanos,
};

pub const NAME: &str = "netdev_errors";
pub const EVENT_TYPE: &str = "NetDevError";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetdevArgs {
    pub interval_ms: u64,
    /// Interfaces to watch; empty means all.
    pub interfaces: Vec<String>,
    pub min_delta: u64,
}

impl Default for NetdevArgs {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            interfaces: Vec::new(),
            min_delta: 1,
        }
    }
}

impl ProbeArgs for NetdevArgs {
    fn schema() -> ArgSchema<Self> {
        ArgSchema::<Self>::new()
            .field("IntervalMs", |a, v| a.interval_ms = v)
            .field("Interfaces", |a, v| a.interfaces = v)
            .field("MinDelta", |a, v| a.min_delta = v)
    }
}

/// Errors plus drops per direction for one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    pub rx: u64,
    pub tx: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDelta {
    pub device: String,
    pub direction: &'static str,
    pub delta: u64,
}

fn read_counters() -> Result<HashMap<String, ErrorCounters>> {
    let devices = procfs::net::dev_status().context("Failed to read /proc/net/dev")?;
    Ok(devices
        .into_iter()
        .map(|(name, dev)| {
            (
                name,
                ErrorCounters {
                    rx: dev.recv_errs + dev.recv_drop,
                    tx: dev.sent_errs + dev.sent_drop,
                },
            )
        })
        .collect())
}

/// Compare two snapshots. Interfaces absent from `prev` are skipped, and a
/// counter that went backwards (device re-created) counts as no growth.
pub fn diff_counters(
    prev: &HashMap<String, ErrorCounters>,
    cur: &HashMap<String, ErrorCounters>,
    watched: &[String],
    min_delta: u64,
) -> Vec<CounterDelta> {
    let mut deltas = Vec::new();
    for (device, now) in cur {
        if !watched.is_empty() && !watched.contains(device) {
            continue;
        }
        let Some(before) = prev.get(device) else {
            continue;
        };
        for (direction, delta) in [
            ("rx", now.rx.saturating_sub(before.rx)),
            ("tx", now.tx.saturating_sub(before.tx)),
        ] {
            if delta > 0 && delta >= min_delta {
                deltas.push(CounterDelta {
                    device: device.clone(),
                    direction,
                    delta,
                });
            }
        }
    }
    deltas.sort_by(|a, b| (&a.device, a.direction).cmp(&(&b.device, b.direction)));
    deltas
}

/// One `NetDevError` event per delta, labelled with the device, the
/// direction and then `meta`.
pub fn delta_events(deltas: Vec<CounterDelta>, meta: &[Label]) -> Vec<Event> {
    let timestamp = now_nanos();
    deltas
        .into_iter()
        .map(|d| {
            Event::new(
                timestamp,
                EVENT_TYPE,
                format!("{} {} errors+drops increased by {}", d.device, d.direction, d.delta),
            )
            .with_labels([Label::new("device", d.device), Label::new("direction", d.direction)])
            .with_labels(meta.iter().cloned())
        })
        .collect()
}

pub struct NetdevErrorProbe {
    sink: EventSink,
    args: NetdevArgs,
    poller: Option<Poller>,
}

pub fn create(sink: EventSink, args: NetdevArgs) -> Result<StatefulProbe<NetdevErrorProbe>> {
    if args.interval_ms == 0 {
        anyhow::bail!("IntervalMs must be greater than zero");
    }
    // fail early on hosts without /proc/net/dev
    read_counters()?;
    Ok(new_event_probe(
        NAME,
        NetdevErrorProbe {
            sink,
            args,
            poller: None,
        },
    ))
}

impl NetdevErrorProbe {
    pub fn args(&self) -> &NetdevArgs {
        &self.args
    }
}

impl SimpleProbe for NetdevErrorProbe {
    fn start(&mut self) -> Result<()> {
        let sink = self.sink.clone();
        let args = self.args.clone();
        let mut prev = read_counters()?;
        let netns = current_netns();

        self.poller = Some(Poller::spawn(
            NAME,
            Duration::from_millis(args.interval_ms),
            move || {
                let cur = match read_counters() {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("{}: {:#}", NAME, e);
                        return ControlFlow::Continue(());
                    }
                };
                let deltas = diff_counters(&prev, &cur, &args.interfaces, args.min_delta);
                prev = cur;
                if deltas.is_empty() {
                    return ControlFlow::Continue(());
                }

                let meta = netns.map(event_meta_by_netns).unwrap_or_default();
                for event in delta_events(deltas, &meta) {
                    if !emit(&sink, NAME, event) {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            },
        )?);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        match self.poller.take() {
            Some(mut poller) => poller.stop(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::{MetadataEnricher, NetnsResolver, PodInfo};
    use serde_json::json;
    use std::sync::Arc;

    fn snapshot(entries: &[(&str, u64, u64)]) -> HashMap<String, ErrorCounters> {
        entries
            .iter()
            .map(|(name, rx, tx)| (name.to_string(), ErrorCounters { rx: *rx, tx: *tx }))
            .collect()
    }

    #[test]
    fn test_args_bind_from_config() {
        let raw = serde_json::from_value(json!({
            "intervalms": 250,
            "INTERFACES": ["eth0", "eth1"],
        }))
        .unwrap();
        let args = NetdevArgs::schema().bind(&raw).unwrap();
        assert_eq!(
            args,
            NetdevArgs {
                interval_ms: 250,
                interfaces: vec!["eth0".to_string(), "eth1".to_string()],
                min_delta: 1,
            }
        );
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let err = create(
            tx,
            NetdevArgs {
                interval_ms: 0,
                ..Default::default()
            },
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("IntervalMs"));
    }

    #[test]
    fn test_diff_reports_growth_per_direction() {
        let prev = snapshot(&[("eth0", 10, 5), ("lo", 0, 0)]);
        let cur = snapshot(&[("eth0", 13, 5), ("lo", 0, 2)]);
        let deltas = diff_counters(&prev, &cur, &[], 1);
        assert_eq!(
            deltas,
            vec![
                CounterDelta {
                    device: "eth0".to_string(),
                    direction: "rx",
                    delta: 3
                },
                CounterDelta {
                    device: "lo".to_string(),
                    direction: "tx",
                    delta: 2
                },
            ]
        );
    }

    #[test]
    fn test_diff_respects_watch_list_and_threshold() {
        let prev = snapshot(&[("eth0", 0, 0), ("eth1", 0, 0)]);
        let cur = snapshot(&[("eth0", 2, 0), ("eth1", 10, 0)]);
        let deltas = diff_counters(&prev, &cur, &["eth0".to_string()], 5);
        assert!(deltas.is_empty());

        let deltas = diff_counters(&prev, &cur, &["eth1".to_string()], 5);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].device, "eth1");
    }

    struct OnePod;

    impl NetnsResolver for OnePod {
        fn resolve(&self, netns: u64) -> anyhow::Result<Arc<PodInfo>> {
            anyhow::ensure!(netns == 4026532281, "netns {} not found", netns);
            Ok(Arc::new(PodInfo {
                pod_name: "web-0".to_string(),
                namespace: "shop".to_string(),
            }))
        }

        fn node_name(&self) -> &str {
            "node-1"
        }
    }

    #[test]
    fn test_events_carry_device_and_pod_labels() {
        let prev = snapshot(&[("eth0", 1, 1)]);
        let cur = snapshot(&[("eth0", 4, 1)]);
        let enricher = MetadataEnricher::with_resolver(Arc::new(OnePod));
        let meta = enricher.labels_for_netns(4026532281);

        let events = delta_events(diff_counters(&prev, &cur, &[], 1), &meta);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_str(), EVENT_TYPE);
        assert_eq!(events[0].message, "eth0 rx errors+drops increased by 3");
        assert_eq!(
            events[0].labels,
            vec![
                Label::new("device", "eth0"),
                Label::new("direction", "rx"),
                Label::new("pod", "web-0"),
                Label::new("namespace", "shop"),
                Label::new("node", "node-1"),
            ]
        );
    }

    #[test]
    fn test_unresolved_netns_keeps_device_labels() {
        let enricher = MetadataEnricher::with_resolver(Arc::new(OnePod));
        let meta = enricher.labels_for_netns(1);
        let deltas = vec![CounterDelta {
            device: "lo".to_string(),
            direction: "tx",
            delta: 2,
        }];
        let events = delta_events(deltas, &meta);
        assert_eq!(
            events[0].labels,
            vec![Label::new("device", "lo"), Label::new("direction", "tx")]
        );
    }

    #[test]
    fn test_diff_ignores_new_and_reset_devices() {
        let prev = snapshot(&[("veth1", 100, 100)]);
        let cur = snapshot(&[("veth1", 3, 4), ("veth2", 50, 50)]);
        assert!(diff_counters(&prev, &cur, &[], 1).is_empty());
    }
}
