use std::{collections::HashMap, fmt, sync::Arc};

use crate::error::ProbeError;
use crate::probes::{
    EventProbe, EventSink,
    args::{ArgSchema, FieldSpec, FromArg, ProbeArgs, RawArgs, bind_mapping},
};

/// Shape of the configuration parameter a probe constructor accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgShape {
    /// The constructor only takes the sink; configuration is ignored.
    None,
    /// A record bound field by field.
    Record(Vec<FieldSpec>),
    /// A string-keyed mapping bound value for value.
    Mapping { value_type: String },
}

impl fmt::Display for ArgShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgShape::None => f.write_str("none"),
            ArgShape::Record(fields) => {
                f.write_str("{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.type_name)?;
                }
                f.write_str("}")
            }
            ArgShape::Mapping { value_type } => write!(f, "map[string]{}", value_type),
        }
    }
}

type ConstructResult = Result<Box<dyn EventProbe>, ProbeError>;
type ConstructFn = dyn Fn(&str, EventSink, &RawArgs) -> ConstructResult + Send + Sync;

/// How to construct one named probe type.
///
/// Three constructor forms are accepted, matching the three argument shapes:
///
/// ```ignore
/// fn create(sink: EventSink) -> anyhow::Result<impl EventProbe>
/// fn create(sink: EventSink, args: MyArgs) -> anyhow::Result<impl EventProbe>   // MyArgs: ProbeArgs
/// fn create(sink: EventSink, args: HashMap<String, V>) -> anyhow::Result<impl EventProbe>
/// ```
///
/// Record schemas are built once here and reused for every call.
pub struct EventProbeCreator {
    shape: ArgShape,
    problem: Option<String>,
    construct: Box<ConstructFn>,
}

fn construction_error(name: &str, source: anyhow::Error) -> ProbeError {
    ProbeError::Construction {
        name: name.to_string(),
        source,
    }
}

impl EventProbeCreator {
    /// Constructor without a configuration parameter.
    pub fn new<F, P>(ctor: F) -> Self
    where
        F: Fn(EventSink) -> anyhow::Result<P> + Send + Sync + 'static,
        P: EventProbe + 'static,
    {
        Self {
            shape: ArgShape::None,
            problem: None,
            construct: Box::new(move |name: &str, sink: EventSink, _args: &RawArgs| -> ConstructResult {
                let probe = ctor(sink).map_err(|e| construction_error(name, e))?;
                Ok(Box::new(probe) as Box<dyn EventProbe>)
            }),
        }
    }

    /// Constructor taking a record-shaped configuration.
    pub fn with_args<A, F, P>(ctor: F) -> Self
    where
        A: ProbeArgs,
        F: Fn(EventSink, A) -> anyhow::Result<P> + Send + Sync + 'static,
        P: EventProbe + 'static,
    {
        let schema: Arc<ArgSchema<A>> = Arc::new(A::schema());
        let shape = ArgShape::Record(schema.fields());
        let problem = schema.validate().err();
        Self {
            shape,
            problem,
            construct: Box::new(move |name: &str, sink: EventSink, args: &RawArgs| -> ConstructResult {
                let bound = schema.bind(args)?;
                let probe = ctor(sink, bound).map_err(|e| construction_error(name, e))?;
                Ok(Box::new(probe) as Box<dyn EventProbe>)
            }),
        }
    }

    /// Constructor taking a string-keyed mapping.
    pub fn with_map<V, F, P>(ctor: F) -> Self
    where
        V: FromArg + 'static,
        F: Fn(EventSink, HashMap<String, V>) -> anyhow::Result<P> + Send + Sync + 'static,
        P: EventProbe + 'static,
    {
        Self {
            shape: ArgShape::Mapping {
                value_type: V::type_name(),
            },
            problem: None,
            construct: Box::new(move |name: &str, sink: EventSink, args: &RawArgs| -> ConstructResult {
                let bound = bind_mapping::<V>(args)?;
                let probe = ctor(sink, bound).map_err(|e| construction_error(name, e))?;
                Ok(Box::new(probe) as Box<dyn EventProbe>)
            }),
        }
    }

    pub fn shape(&self) -> &ArgShape {
        &self.shape
    }

    /// Shape violation found when the creator was built, if any.
    pub fn validate(&self) -> Result<(), String> {
        match &self.problem {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    /// Bind `args` to the declared shape and run the constructor.
    pub fn call(
        &self,
        name: &str,
        sink: EventSink,
        args: &RawArgs,
    ) -> Result<Box<dyn EventProbe>, ProbeError> {
        (self.construct)(name, sink, args)
    }
}

impl fmt::Debug for EventProbeCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProbeCreator")
            .field("shape", &self.shape)
            .field("problem", &self.problem)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::{SimpleProbe, StatefulProbe, new_event_probe};
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Nop;

    impl SimpleProbe for Nop {
        fn start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Threshold {
        limit: u32,
    }

    impl ProbeArgs for Threshold {
        fn schema() -> ArgSchema<Self> {
            ArgSchema::<Self>::new().field("Limit", |a, v| a.limit = v)
        }
    }

    fn raw(value: serde_json::Value) -> RawArgs {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_no_arg_creator_ignores_config() {
        let creator = EventProbeCreator::new(|_sink| Ok(new_event_probe("plain", Nop)));
        assert_eq!(creator.shape(), &ArgShape::None);
        let (tx, _rx) = mpsc::channel(1);
        let probe = creator
            .call("plain", tx, &raw(json!({"anything": "goes"})))
            .unwrap();
        assert_eq!(probe.name(), "plain");
    }

    #[test]
    fn test_record_creator_binds_args() {
        let creator = EventProbeCreator::with_args(|_sink, args: Threshold| {
            Ok(new_event_probe(&format!("limit-{}", args.limit), Nop))
        });
        assert_eq!(creator.shape().to_string(), "{Limit: u32}");

        let (tx, _rx) = mpsc::channel(1);
        let probe = creator.call("threshold", tx, &raw(json!({"LIMIT": 7}))).unwrap();
        assert_eq!(probe.name(), "limit-7");
    }

    #[test]
    fn test_record_creator_binding_error_skips_constructor() {
        let creator = EventProbeCreator::with_args(
            |_sink, _args: Threshold| -> anyhow::Result<StatefulProbe<Nop>> {
                panic!("constructor must not run");
            },
        );
        let (tx, _rx) = mpsc::channel(1);
        let err = creator
            .call("threshold", tx, &raw(json!({"limit": "high"})))
            .err()
            .unwrap();
        match err {
            ProbeError::ArgBinding(e) => assert_eq!(e.field, "Limit"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_map_creator_shape_and_binding() {
        let creator = EventProbeCreator::with_map(|_sink, labels: HashMap<String, String>| {
            Ok(new_event_probe(&format!("labels-{}", labels.len()), Nop))
        });
        assert_eq!(creator.shape().to_string(), "map[string]string");

        let (tx, _rx) = mpsc::channel(1);
        let probe = creator
            .call("labels", tx, &raw(json!({"a": "1", "b": "2"})))
            .unwrap();
        assert_eq!(probe.name(), "labels-2");
    }

    #[test]
    fn test_constructor_error_is_wrapped_with_name() {
        let creator = EventProbeCreator::new(|_sink| -> anyhow::Result<StatefulProbe<Nop>> {
            anyhow::bail!("kernel lacks BTF")
        });
        let (tx, _rx) = mpsc::channel(1);
        let err = creator.call("needs-btf", tx, &RawArgs::new()).err().unwrap();
        assert!(matches!(err, ProbeError::Construction { ref name, .. } if name == "needs-btf"));
        assert!(err.to_string().contains("kernel lacks BTF"));
    }

    #[test]
    fn test_invalid_schema_is_reported() {
        #[derive(Default)]
        struct Ambiguous {
            value: u32,
        }

        impl ProbeArgs for Ambiguous {
            fn schema() -> ArgSchema<Self> {
                ArgSchema::<Self>::new()
                    .field("Value", |a, v| a.value = v)
                    .field("VALUE", |a, v| a.value = v)
            }
        }

        let creator =
            EventProbeCreator::with_args(|_sink, _args: Ambiguous| Ok(new_event_probe("x", Nop)));
        assert!(creator.validate().is_err());
    }
}
