//! Workload identity labels for events coming from a network namespace.

use std::sync::Arc;

use log::{debug, info};
use netprobe_common::Label;
use once_cell::sync::OnceCell;

use crate::telemetry;

static ENRICHER: OnceCell<MetadataEnricher> = OnceCell::new();

/// Kubernetes pod identity owning a network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub pod_name: String,
    pub namespace: String,
}

/// Lookup service mapping a network namespace id (the inode of
/// `/proc/<pid>/ns/net`) to the workload that owns it.
pub trait NetnsResolver: Send + Sync {
    fn resolve(&self, netns: u64) -> anyhow::Result<Arc<PodInfo>>;

    /// Name of the node this process runs on.
    fn node_name(&self) -> &str;
}

/// Best-effort enrichment of events with pod/namespace/node labels.
#[derive(Clone)]
pub struct MetadataEnricher {
    inner: Option<Arc<dyn NetnsResolver>>,
}

impl MetadataEnricher {
    /// An enricher that never resolves anything.
    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn with_resolver(resolver: Arc<dyn NetnsResolver>) -> Self {
        Self {
            inner: Some(resolver),
        }
    }

    /// Labels `[pod, namespace, node]` for the workload owning `netns`.
    ///
    /// Lookup failures are expected while containers come and go; they are
    /// logged and produce no labels.
    pub fn labels_for_netns(&self, netns: u64) -> Vec<Label> {
        let Some(resolver) = &self.inner else {
            debug!("no namespace resolver configured, netns {} not enriched", netns);
            return Vec::new();
        };

        match resolver.resolve(netns) {
            Ok(pod) => vec![
                Label::new("pod", pod.pod_name.as_str()),
                Label::new("namespace", pod.namespace.as_str()),
                Label::new("node", resolver.node_name()),
            ],
            Err(e) => {
                info!("resolve entity for netns {}: {:#}", netns, e);
                telemetry::record_metadata_lookup_failure();
                Vec::new()
            }
        }
    }

    /// Install this enricher for [`event_meta_by_netns`]. Only the first
    /// installation takes effect.
    pub fn install(self) -> bool {
        ENRICHER.set(self).is_ok()
    }
}

/// Parse the target of a `/proc/<pid>/ns/net` link, e.g. `net:[4026531992]`.
pub fn parse_netns_link(link: &str) -> Option<u64> {
    link.strip_prefix("net:[")?.strip_suffix(']')?.parse().ok()
}

fn read_netns_link(path: &str) -> Option<u64> {
    let target = std::fs::read_link(path).ok()?;
    parse_netns_link(target.to_str()?)
}

/// Network namespace id of process `pid`.
pub fn netns_of(pid: i32) -> Option<u64> {
    read_netns_link(&format!("/proc/{}/ns/net", pid))
}

/// Network namespace id of this process.
pub fn current_netns() -> Option<u64> {
    read_netns_link("/proc/self/ns/net")
}

/// Labels for `netns` using the process-wide enricher, empty if none is installed.
pub fn event_meta_by_netns(netns: u64) -> Vec<Label> {
    match ENRICHER.get() {
        Some(enricher) => enricher.labels_for_netns(netns),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticResolver {
        pods: HashMap<u64, Arc<PodInfo>>,
    }

    impl NetnsResolver for StaticResolver {
        fn resolve(&self, netns: u64) -> anyhow::Result<Arc<PodInfo>> {
            self.pods
                .get(&netns)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("netns {} not found", netns))
        }

        fn node_name(&self) -> &str {
            "node-1"
        }
    }

    fn enricher() -> MetadataEnricher {
        let pod = Arc::new(PodInfo {
            pod_name: "web-7d4b8c9f5-abc12".to_string(),
            namespace: "shop".to_string(),
        });
        MetadataEnricher::with_resolver(Arc::new(StaticResolver {
            pods: HashMap::from([(4026532281, pod)]),
        }))
    }

    #[test]
    fn test_labels_in_fixed_order() {
        let labels = enricher().labels_for_netns(4026532281);
        assert_eq!(
            labels,
            vec![
                Label::new("pod", "web-7d4b8c9f5-abc12"),
                Label::new("namespace", "shop"),
                Label::new("node", "node-1"),
            ]
        );
    }

    #[test]
    fn test_unknown_netns_yields_no_labels() {
        assert!(enricher().labels_for_netns(1).is_empty());
    }

    #[test]
    fn test_none_enricher_yields_no_labels() {
        assert!(MetadataEnricher::none().labels_for_netns(4026532281).is_empty());
    }

    #[test]
    fn test_parse_netns_link() {
        assert_eq!(parse_netns_link("net:[4026531992]"), Some(4026531992));
        assert_eq!(parse_netns_link("mnt:[4026531992]"), None);
        assert_eq!(parse_netns_link("net:[abc]"), None);
    }
}
