//! Kubernetes workload resolution for network namespaces.
//!
//! Maps a network namespace id to Kubernetes pod metadata by:
//! 1. Scanning processes for one whose `/proc/{pid}/ns/net` is that namespace
//! 2. Parsing `/proc/{pid}/cgroup` of that process to extract the container ID
//! 3. Watching pods on the current node via the K8s API
//! 4. Caching the mapping: netns → container_id → PodInfo

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, atomic::Ordering},
    time::Duration,
};

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, runtime::watcher};
use log::{debug, warn};
use thiserror::Error;

use crate::probes::meta::{NetnsResolver, PodInfo, netns_of};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no process found in netns {0}")]
    NamespaceNotFound(u64),

    #[error("netns {0} does not belong to a container")]
    NotAContainer(u64),

    #[error("container {container_id} of netns {netns} is not a known pod")]
    UnknownContainer { netns: u64, container_id: String },
}

/// Thread-safe resolver: netns → PodInfo.
///
/// Designed to be wrapped in `Arc` and shared with the probes through
/// [`crate::probes::MetadataEnricher`].
pub struct PodResolver {
    node_name: String,
    /// netns → container_id (found by scanning /proc, cached).
    netns_cache: RwLock<HashMap<u64, Option<String>>>,
    /// container_id (short 12-char prefix) → PodInfo.
    /// Populated and updated by the K8s watcher task.
    pod_store: RwLock<HashMap<String, Arc<PodInfo>>>,
}

impl PodResolver {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            netns_cache: RwLock::new(HashMap::new()),
            pod_store: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a network namespace to pod metadata.
    ///
    /// Returns cached result in O(1) for known namespaces.
    /// On cache miss, scans `/proc` for a process living in `netns` and
    /// extracts the container ID from its cgroup.
    pub fn resolve_netns(&self, netns: u64) -> Result<Arc<PodInfo>, ResolveError> {
        let cached = self
            .netns_cache
            .read()
            .ok()
            .and_then(|cache| cache.get(&netns).cloned());

        let container_id = match cached {
            Some(entry) => entry,
            None => {
                let pid = find_pid_in_netns(netns).ok_or(ResolveError::NamespaceNotFound(netns))?;
                let container_id = extract_container_id(pid);
                // Cache the result (even None, to avoid re-scanning /proc)
                if let Ok(mut cache) = self.netns_cache.write() {
                    cache.insert(netns, container_id.clone());
                }
                container_id
            }
        };

        let container_id = container_id.ok_or(ResolveError::NotAContainer(netns))?;
        self.pod_store
            .read()
            .ok()
            .and_then(|store| store.get(&container_id).cloned())
            .ok_or(ResolveError::UnknownContainer {
                netns,
                container_id,
            })
    }

    /// Insert pod metadata for a container directly.
    pub fn insert_container(&self, container_id: &str, info: PodInfo) {
        if let Ok(mut store) = self.pod_store.write() {
            store.insert(container_id.to_string(), Arc::new(info));
        }
    }

    /// Start the K8s pod watcher background task.
    ///
    /// Watches pods on this node and keeps the pod_store updated.
    pub async fn start_k8s_watcher(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        let client = Client::try_default()
            .await
            .context("Failed to create K8s client (not running in cluster?)")?;

        // Pods are namespaced resources, but we want to watch across all namespaces on this node.
        let api: Api<Pod> = Api::all(client);
        let watcher_config = watcher::Config {
            field_selector: Some(format!("spec.nodeName={}", self.node_name)),
            ..Default::default()
        };

        let resolver = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let stream = watcher(api, watcher_config);
            tokio::pin!(stream);

            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod)) => {
                        resolver.apply_pod_event(&pod, false);
                    }
                    Ok(watcher::Event::Delete(pod)) => {
                        resolver.apply_pod_event(&pod, true);
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                    Err(e) => {
                        // kube's watcher retries with backoff
                        warn!("K8s pod watcher error: {}. Will retry.", e);
                    }
                }
            }

            warn!("K8s pod watcher stream ended");
        });

        self.start_cache_cleanup_task();

        Ok(handle)
    }

    /// Process a pod event from the K8s API watcher.
    fn apply_pod_event(&self, pod: &Pod, is_delete: bool) {
        let metadata = &pod.metadata;
        let pod_name = match &metadata.name {
            Some(n) => n.clone(),
            None => return,
        };
        let namespace = metadata.namespace.clone().unwrap_or_default();
        let container_ids = extract_container_ids_from_pod(pod);

        if is_delete {
            if let Ok(mut store) = self.pod_store.write() {
                for cid in &container_ids {
                    store.remove(cid);
                }
            }
            // A deleted container's netns id may be reused by the kernel
            if let Ok(mut cache) = self.netns_cache.write() {
                cache.retain(|_, v| {
                    v.as_ref()
                        .map(|id| !container_ids.contains(id))
                        .unwrap_or(true)
                });
            }
            debug!("pod {}/{} removed", namespace, pod_name);
            return;
        }

        let info = Arc::new(PodInfo {
            pod_name,
            namespace,
        });

        if let Ok(mut store) = self.pod_store.write() {
            for cid in container_ids {
                store.insert(cid, Arc::clone(&info));
            }
        }
    }

    /// Periodically evict stale netns_cache entries whose container_id
    /// no longer exists in pod_store, and negative entries that may have
    /// been cached before the pod showed up.
    fn start_cache_cleanup_task(self: &Arc<Self>) {
        let resolver = Arc::clone(self);
        let shutdown = crate::probes::shutdown_flag();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                resolver.evict_stale();
            }
        });
    }

    fn evict_stale(&self) {
        if let (Ok(pod_store), Ok(mut netns_cache)) =
            (self.pod_store.read(), self.netns_cache.write())
        {
            netns_cache.retain(|_, v| {
                v.as_ref()
                    .map(|cid| pod_store.contains_key(cid))
                    .unwrap_or(false)
            });
        }
    }
}

impl NetnsResolver for PodResolver {
    fn resolve(&self, netns: u64) -> Result<Arc<PodInfo>> {
        Ok(self.resolve_netns(netns)?)
    }

    fn node_name(&self) -> &str {
        &self.node_name
    }
}

/// First process found living in `netns`.
fn find_pid_in_netns(netns: u64) -> Option<i32> {
    let processes = procfs::process::all_processes().ok()?;
    processes
        .filter_map(|p| p.ok())
        .map(|p| p.pid)
        .find(|pid| netns_of(*pid) == Some(netns))
}

/// Extract container IDs from a pod's status.
///
/// Returns short (12-char) container ID strings.
fn extract_container_ids_from_pod(pod: &Pod) -> Vec<String> {
    let mut ids = Vec::new();

    if let Some(status) = &pod.status {
        for containers in [&status.container_statuses, &status.init_container_statuses]
            .into_iter()
            .flatten()
        {
            for cs in containers {
                if let Some(cid) = &cs.container_id {
                    // Format: "containerd://<64hex>" or "docker://<64hex>"
                    if let Some(hex_id) = cid.rsplit("://").next()
                        && hex_id.len() >= 12
                    {
                        ids.push(hex_id[..12].to_string());
                    }
                }
            }
        }
    }

    ids
}

/// Parse `/proc/{pid}/cgroup` to extract the container ID.
///
/// Supports both cgroup v1 and v2 formats:
/// - v2: `0::/kubepods/besteffort/pod<uid>/<64-hex-container-id>`
/// - v1: `12:memory:/kubepods/besteffort/pod<uid>/<64-hex-container-id>`
/// - systemd scope: `cri-containerd-<64hex>.scope` or `docker-<64hex>.scope`
fn extract_container_id(pid: i32) -> Option<String> {
    let path = format!("/proc/{}/cgroup", pid);
    let content = std::fs::read_to_string(&path).ok()?;

    for line in content.lines() {
        if let Some(id) = parse_container_id_from_cgroup_line(line) {
            return Some(id);
        }
    }
    None
}

/// Extract a container ID from a single cgroup line.
///
/// Returns the first 12 characters of a 64-char hex container ID.
fn parse_container_id_from_cgroup_line(line: &str) -> Option<String> {
    // Get the path portion after "hierarchy-ID:controller-list:"
    let path = line.splitn(3, ':').nth(2)?;

    // Skip lines that don't look like container cgroups
    if !path.contains("kubepods") && !path.contains("docker") && !path.contains("containerd") {
        return None;
    }

    // Get the last path segment
    let last_segment = path.rsplit('/').next()?;

    // Check for scope-style (systemd/cri): "cri-containerd-<64hex>.scope" or "docker-<64hex>.scope"
    if last_segment.ends_with(".scope") {
        let inner = last_segment.trim_end_matches(".scope");
        // Extract the hex ID after the last '-'
        if let Some(hex_id) = inner.rsplit('-').next()
            && is_container_id(hex_id)
        {
            return Some(hex_id[..12].to_string());
        }
    }

    // Check for plain container ID as last path segment
    if is_container_id(last_segment) {
        return Some(last_segment[..12].to_string());
    }

    None
}

/// Check if a string looks like a 64-char hex container ID.
fn is_container_id(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
