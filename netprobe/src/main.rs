use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use netprobe::{NetProbeEngine, probes::MetadataEnricher, settings::Settings, telemetry};

#[derive(Debug, Parser)]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// YAML file listing the event probes to run
    #[clap(short, long, env = "NETPROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Print the registered event probes and exit
    #[clap(long)]
    list_probes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    if opt.list_probes {
        let mut names: Vec<_> = netprobe::probes::list_event_probes().into_iter().collect();
        names.sort();
        for name in names {
            println!("{}", name);
        }
        return Ok(());
    }

    let settings = Settings::new(opt.config.as_deref()).context("Failed to load settings")?;

    if let Err(e) = telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref()) {
        warn!("Failed to initialize metrics: {:#}", e);
    }

    let enricher = build_enricher(&settings).await;
    if !enricher.install() {
        warn!("Metadata enricher was already installed");
    }

    NetProbeEngine::new(settings).run().await
}

fn node_name(settings: &Settings) -> String {
    settings
        .node_name
        .clone()
        .or_else(|| std::env::var("NODE_NAME").ok())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_default()
}

#[cfg(feature = "k8s")]
async fn build_enricher(settings: &Settings) -> MetadataEnricher {
    use std::sync::Arc;

    let node = node_name(settings);
    let resolver = Arc::new(netprobe::k8s::PodResolver::new(node.clone()));
    match resolver.start_k8s_watcher().await {
        Ok(_) => {
            info!("Pod metadata enrichment enabled on node {}", node);
            MetadataEnricher::with_resolver(resolver)
        }
        Err(e) => {
            warn!("Pod metadata enrichment disabled: {:#}", e);
            MetadataEnricher::none()
        }
    }
}

#[cfg(not(feature = "k8s"))]
async fn build_enricher(settings: &Settings) -> MetadataEnricher {
    info!(
        "Built without k8s support, events from {} are not enriched",
        node_name(settings)
    );
    MetadataEnricher::none()
}
