//! Name-keyed registry of event probe creators.
//!
//! Registration happens on a [`RegistryBuilder`], which is then frozen into
//! a [`ProbeRegistry`] that has no mutating operations and can be shared
//! freely between threads. The process-wide registry is installed once with
//! [`install_registry`] or, if nothing was installed, built from the builtin
//! probes on first use.

use std::collections::{HashMap, HashSet};

use log::{debug, info};
use once_cell::sync::OnceCell;

use crate::error::{ProbeError, RegistryError};
use crate::probes::{ArgShape, EventProbe, EventProbeCreator, EventSink, RawArgs, builtin};
use crate::telemetry;

static REGISTRY: OnceCell<ProbeRegistry> = OnceCell::new();

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    creators: HashMap<String, EventProbeCreator>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder already holding every builtin probe.
    pub fn with_builtin() -> Self {
        let mut builder = Self::new();
        builtin::register(&mut builder);
        builder
    }

    pub fn try_register(
        &mut self,
        name: &str,
        creator: EventProbeCreator,
    ) -> Result<&mut Self, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.creators.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        creator
            .validate()
            .map_err(|reason| RegistryError::InvalidShape {
                name: name.to_string(),
                reason,
            })?;

        debug!("registered event probe {} ({})", name, creator.shape());
        self.creators.insert(name.to_string(), creator);
        Ok(self)
    }

    /// Register a creator, aborting on any integration error.
    ///
    /// A duplicate name or a malformed argument schema means a probe was
    /// written against the wrong contract; there is no sensible way to go on.
    pub fn must_register(&mut self, name: &str, creator: EventProbeCreator) -> &mut Self {
        if let Err(e) = self.try_register(name, creator) {
            panic!("{}", e);
        }
        self
    }

    pub fn build(self) -> ProbeRegistry {
        ProbeRegistry {
            creators: self.creators,
        }
    }
}

/// Read-only lookup of probe creators; the dispatcher.
#[derive(Debug)]
pub struct ProbeRegistry {
    creators: HashMap<String, EventProbeCreator>,
}

impl ProbeRegistry {
    /// Look up `name`, bind `args` to its declared shape and construct a
    /// fresh probe emitting onto `sink`. The registry keeps no reference to
    /// the returned probe.
    pub fn create(
        &self,
        name: &str,
        sink: EventSink,
        args: &RawArgs,
    ) -> Result<Box<dyn EventProbe>, ProbeError> {
        let result = match self.creators.get(name) {
            Some(creator) => creator.call(name, sink, args),
            None => Err(ProbeError::UnknownProbe(name.to_string())),
        };

        match &result {
            Ok(_) => {
                info!("created event probe {}", name);
                telemetry::record_probe_created(name);
            }
            Err(e) => telemetry::record_probe_create_failure(name, e.kind()),
        }
        result
    }

    /// Names of all registered probes, in no particular order.
    pub fn list(&self) -> HashSet<String> {
        self.creators.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.creators.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&ArgShape> {
        self.creators.get(name).map(EventProbeCreator::shape)
    }

    pub fn len(&self) -> usize {
        self.creators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.creators.is_empty()
    }
}

/// Install `registry` as the process-wide registry.
///
/// Must run before the first call to [`registry`]; later calls fail.
pub fn install_registry(registry: ProbeRegistry) -> Result<(), RegistryError> {
    REGISTRY
        .set(registry)
        .map_err(|_| RegistryError::AlreadyInstalled)
}

/// The process-wide registry, defaulting to the builtin probes.
pub fn registry() -> &'static ProbeRegistry {
    REGISTRY.get_or_init(|| RegistryBuilder::with_builtin().build())
}

pub fn create_event_probe(
    name: &str,
    sink: EventSink,
    args: &RawArgs,
) -> Result<Box<dyn EventProbe>, ProbeError> {
    registry().create(name, sink, args)
}

pub fn list_event_probes() -> HashSet<String> {
    registry().list()
}
