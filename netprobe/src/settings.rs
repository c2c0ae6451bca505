use std::{collections::HashMap, path::Path};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::probes::RawArgs;

const DEFAULT_SINK_CAPACITY: usize = 1024;

fn default_sink_capacity() -> usize {
    DEFAULT_SINK_CAPACITY
}

fn default_enabled() -> bool {
    true
}

/// One entry of `event_probes`: a registered probe name plus its raw
/// arguments, bound by the probe's creator at creation time.
#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,
}

impl ProbeConfig {
    pub fn raw_args(&self) -> &RawArgs {
        &self.args
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub node_name: Option<String>,
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
    #[serde(default)]
    pub event_probes: Vec<ProbeConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_name: None,
            otel_exporter_otlp_endpoint: None,
            sink_capacity: DEFAULT_SINK_CAPACITY,
            event_probes: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from an optional YAML file overlaid with `NETPROBE__*`
    /// environment variables.
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let s = builder
            .add_source(
                Environment::with_prefix("NETPROBE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        if settings.sink_capacity == 0 {
            return Err(ConfigError::Message(
                "sink_capacity must be greater than zero".to_string(),
            ));
        }
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn enabled_probes(&self) -> impl Iterator<Item = &ProbeConfig> {
        self.event_probes.iter().filter(|p| p.enabled)
    }
}
