//! Immutable operation and graph records plus typed argument lookup.
//!
//! Records are plain serde data. Nested graphs appear as structured
//! [`ArgValue::Graph`] values or as JSON text inside [`ArgValue::Str`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Integer device-type tag selecting an operator registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceType(pub i32);

impl DeviceType {
    pub const CPU: DeviceType = DeviceType(0);
    pub const GPU: DeviceType = DeviceType(1);
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::CPU
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DeviceType::CPU => f.write_str("CPU"),
            DeviceType::GPU => f.write_str("GPU"),
            DeviceType(tag) => write!(f, "device({tag})"),
        }
    }
}

/// Device placement descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOption {
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub device_id: i32,
}

impl DeviceOption {
    pub fn new(device_type: DeviceType) -> Self {
        DeviceOption {
            device_type,
            device_id: 0,
        }
    }
}

/// Argument payload: scalars, repeated scalars, or nested graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Int(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strs(Vec<String>),
    Graph(Box<GraphRecord>),
    Graphs(Vec<GraphRecord>),
}

impl ArgValue {
    fn kind(&self) -> &'static str {
        match self {
            ArgValue::Int(_) => "int",
            ArgValue::Float(_) => "float",
            ArgValue::Bool(_) => "bool",
            ArgValue::Str(_) => "string",
            ArgValue::Ints(_) => "ints",
            ArgValue::Floats(_) => "floats",
            ArgValue::Strs(_) => "strings",
            ArgValue::Graph(_) => "graph",
            ArgValue::Graphs(_) => "graphs",
        }
    }
}

macro_rules! arg_value_from {
    ($($ty:ty => $variant:ident via $conv:expr),* $(,)?) => {
        $(
            impl From<$ty> for ArgValue {
                fn from(value: $ty) -> Self {
                    ArgValue::$variant(($conv)(value))
                }
            }
        )*
    };
}

arg_value_from! {
    i64 => Int via |v| v,
    i32 => Int via i64::from,
    f32 => Float via |v| v,
    bool => Bool via |v| v,
    String => Str via |v| v,
    &str => Str via |v: &str| v.to_string(),
    Vec<i64> => Ints via |v| v,
    Vec<i32> => Ints via |v: Vec<i32>| v.into_iter().map(i64::from).collect(),
    Vec<f32> => Floats via |v| v,
    Vec<String> => Strs via |v| v,
    Vec<&str> => Strs via |v: Vec<&str>| v.into_iter().map(str::to_string).collect(),
    GraphRecord => Graph via Box::new,
}

/// Named argument attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
}

/// Conversion from an [`ArgValue`] into a concrete Rust type.
pub trait FromArg: Sized {
    fn from_single(value: &ArgValue) -> Option<Self>;
    fn from_repeated(value: &ArgValue) -> Option<Vec<Self>>;
}

impl FromArg for i64 {
    fn from_single(value: &ArgValue) -> Option<Self> {
        match value {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn from_repeated(value: &ArgValue) -> Option<Vec<Self>> {
        match value {
            ArgValue::Ints(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromArg for i32 {
    fn from_single(value: &ArgValue) -> Option<Self> {
        i64::from_single(value).and_then(|v| i32::try_from(v).ok())
    }

    fn from_repeated(value: &ArgValue) -> Option<Vec<Self>> {
        i64::from_repeated(value)?
            .into_iter()
            .map(|v| i32::try_from(v).ok())
            .collect()
    }
}

impl FromArg for usize {
    fn from_single(value: &ArgValue) -> Option<Self> {
        i64::from_single(value).and_then(|v| usize::try_from(v).ok())
    }

    fn from_repeated(value: &ArgValue) -> Option<Vec<Self>> {
        i64::from_repeated(value)?
            .into_iter()
            .map(|v| usize::try_from(v).ok())
            .collect()
    }
}

impl FromArg for f32 {
    fn from_single(value: &ArgValue) -> Option<Self> {
        match value {
            ArgValue::Float(v) => Some(*v),
            ArgValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    fn from_repeated(value: &ArgValue) -> Option<Vec<Self>> {
        match value {
            ArgValue::Floats(v) => Some(v.clone()),
            ArgValue::Ints(v) => Some(v.iter().map(|x| *x as f32).collect()),
            _ => None,
        }
    }
}

impl FromArg for bool {
    fn from_single(value: &ArgValue) -> Option<Self> {
        match value {
            ArgValue::Bool(v) => Some(*v),
            ArgValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    fn from_repeated(value: &ArgValue) -> Option<Vec<Self>> {
        match value {
            ArgValue::Ints(v) => Some(v.iter().map(|x| *x != 0).collect()),
            _ => None,
        }
    }
}

impl FromArg for String {
    fn from_single(value: &ArgValue) -> Option<Self> {
        match value {
            ArgValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn from_repeated(value: &ArgValue) -> Option<Vec<Self>> {
        match value {
            ArgValue::Strs(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromArg for GraphRecord {
    fn from_single(value: &ArgValue) -> Option<Self> {
        match value {
            ArgValue::Graph(graph) => Some((**graph).clone()),
            _ => None,
        }
    }

    fn from_repeated(value: &ArgValue) -> Option<Vec<Self>> {
        match value {
            ArgValue::Graphs(graphs) => Some(graphs.clone()),
            _ => None,
        }
    }
}

fn find_arg<'a>(args: &'a [Argument], name: &str) -> Option<&'a ArgValue> {
    args.iter().find(|arg| arg.name == name).map(|arg| &arg.value)
}

fn single_arg<T: FromArg>(args: &[Argument], name: &str) -> Result<Option<T>> {
    match find_arg(args, name) {
        None => Ok(None),
        Some(value) => T::from_single(value).map(Some).ok_or_else(|| {
            RuntimeError::invalid_argument(
                name,
                format!(
                    "holds a {} value that cannot be read as {}",
                    value.kind(),
                    std::any::type_name::<T>()
                ),
            )
        }),
    }
}

fn repeated_arg<T: FromArg>(args: &[Argument], name: &str) -> Result<Option<Vec<T>>> {
    match find_arg(args, name) {
        None => Ok(None),
        Some(value) => T::from_repeated(value).map(Some).ok_or_else(|| {
            RuntimeError::invalid_argument(
                name,
                format!(
                    "holds a {} value that cannot be read as a list of {}",
                    value.kind(),
                    std::any::type_name::<T>()
                ),
            )
        }),
    }
}

/// Immutable description of one computation step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub op_type: String,
    /// Explicit engine or comma-separated list of engines.
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Ordering-only dependencies; never bound as data inputs.
    #[serde(default)]
    pub control_inputs: Vec<String>,
    #[serde(default)]
    pub device: Option<DeviceOption>,
    #[serde(default)]
    pub args: Vec<Argument>,
}

impl OperatorRecord {
    pub fn new(op_type: impl Into<String>) -> Self {
        OperatorRecord {
            op_type: op_type.into(),
            ..OperatorRecord::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn with_device(mut self, device: DeviceOption) -> Self {
        self.device = Some(device);
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.set_arg(name, value);
        self
    }

    /// Inserts or replaces an argument.
    pub fn set_arg(&mut self, name: impl Into<String>, value: impl Into<ArgValue>) {
        let name = name.into();
        let value = value.into();
        match self.args.iter_mut().find(|arg| arg.name == name) {
            Some(existing) => existing.value = value,
            None => self.args.push(Argument { name, value }),
        }
    }

    /// Device this record is placed on; records without placement run on CPU.
    pub fn device_type(&self) -> DeviceType {
        self.device.map(|d| d.device_type).unwrap_or_default()
    }

    /// Engines explicitly requested by the record, in order.
    pub fn engines(&self) -> Vec<String> {
        self.engine
            .split(',')
            .map(str::trim)
            .filter(|engine| !engine.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|input| input == name)
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|output| output == name)
    }

    pub fn arg_value(&self, name: &str) -> Option<&ArgValue> {
        find_arg(&self.args, name)
    }

    pub fn has_arg(&self, name: &str) -> bool {
        self.arg_value(name).is_some()
    }

    /// Whether `name` is present and readable as a single `T`.
    pub fn has_single_of_type<T: FromArg>(&self, name: &str) -> bool {
        self.arg_value(name)
            .and_then(T::from_single)
            .is_some()
    }

    /// Single-valued argument; a present value of the wrong kind is an error.
    pub fn single<T: FromArg>(&self, name: &str) -> Result<Option<T>> {
        single_arg(&self.args, name)
    }

    pub fn single_or<T: FromArg>(&self, name: &str, default: T) -> Result<T> {
        Ok(self.single(name)?.unwrap_or(default))
    }

    /// Repeated argument; absent means empty.
    pub fn repeated<T: FromArg>(&self, name: &str) -> Result<Vec<T>> {
        Ok(repeated_arg(&self.args, name)?.unwrap_or_default())
    }

    pub fn repeated_or<T: FromArg>(&self, name: &str, default: Vec<T>) -> Result<Vec<T>> {
        Ok(repeated_arg(&self.args, name)?.unwrap_or(default))
    }

    /// Nested graph argument, given either structurally or as JSON text.
    ///
    /// An absent argument or an empty string yields `None`.
    pub fn graph_arg(&self, name: &str) -> Result<Option<GraphRecord>> {
        match self.arg_value(name) {
            None => Ok(None),
            Some(ArgValue::Graph(graph)) => Ok(Some((**graph).clone())),
            Some(ArgValue::Str(text)) if text.trim().is_empty() => Ok(None),
            Some(ArgValue::Str(text)) => GraphRecord::from_json_str(text)
                .map(Some)
                .map_err(|err| RuntimeError::invalid_argument(name, err.to_string())),
            Some(other) => Err(RuntimeError::invalid_argument(
                name,
                format!("expected a graph, found a {} value", other.kind()),
            )),
        }
    }

    /// Short single-line rendering used in diagnostics.
    pub fn debug_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

fn default_graph_type() -> String {
    "simple".to_string()
}

/// Declarative graph: an ordered list of operation records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_graph_type")]
    pub graph_type: String,
    #[serde(default)]
    pub ops: Vec<OperatorRecord>,
    /// Placement inherited by records that carry none.
    #[serde(default)]
    pub device: Option<DeviceOption>,
    #[serde(default)]
    pub external_inputs: Vec<String>,
    #[serde(default)]
    pub external_outputs: Vec<String>,
    #[serde(default)]
    pub args: Vec<Argument>,
}

impl Default for GraphRecord {
    fn default() -> Self {
        GraphRecord {
            name: String::new(),
            graph_type: default_graph_type(),
            ops: Vec::new(),
            device: None,
            external_inputs: Vec::new(),
            external_outputs: Vec::new(),
            args: Vec::new(),
        }
    }
}

impl GraphRecord {
    pub fn new(name: impl Into<String>) -> Self {
        GraphRecord {
            name: name.into(),
            ..GraphRecord::default()
        }
    }

    pub fn with_type(mut self, graph_type: impl Into<String>) -> Self {
        self.graph_type = graph_type.into();
        self
    }

    pub fn with_device(mut self, device: DeviceOption) -> Self {
        self.device = Some(device);
        self
    }

    pub fn op(mut self, op: OperatorRecord) -> Self {
        self.ops.push(op);
        self
    }

    pub fn external_input(mut self, name: impl Into<String>) -> Self {
        self.external_inputs.push(name.into());
        self
    }

    pub fn external_output(mut self, name: impl Into<String>) -> Self {
        self.external_outputs.push(name.into());
        self
    }

    pub fn single<T: FromArg>(&self, name: &str) -> Result<Option<T>> {
        single_arg(&self.args, name)
    }

    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
