//! Registry of named device variables: settings, status, and info.
//!
//! Each variable has an optional getter and setter. Bulk operations read every variable of one or
//! more kinds ([`DeviceVariableAccess::get_settings`], [`DeviceVariableAccess::get_full_status`],
//! [`DeviceVariableAccess::get_full_info`]) and apply a snapshot of settings
//! ([`DeviceVariableAccess::apply_settings`]). Errors a variable declares as ignorable drop it from
//! a bulk result instead of failing the whole operation.
//!
//! ```
//! use instrumentcore::{
//!     DeviceVariableAccess, DeviceVariables, Include, Value, VariableKind, VariableSpec,
//! };
//!
//! struct Source {
//!     level: f64,
//!     vars: DeviceVariables<Source>,
//! }
//!
//! impl DeviceVariableAccess for Source {
//!     fn device_variables(&self) -> &DeviceVariables<Self> {
//!         &self.vars
//!     }
//!     fn device_variables_mut(&mut self) -> &mut DeviceVariables<Self> {
//!         &mut self.vars
//!     }
//! }
//!
//! let mut src = Source { level: 1.0, vars: DeviceVariables::new() };
//! src.add_device_variable(
//!     VariableSpec::new("level", VariableKind::Settings)
//!         .getter(|dev: &mut Source, _| Ok(Value::Float(dev.level)))
//!         .setter(|dev: &mut Source, args| {
//!             dev.level = args[0].to_f64()?;
//!             Ok(Value::Unset)
//!         }),
//! )
//! .unwrap();
//!
//! src.set_variable("level", 2.5.into()).unwrap();
//! let settings = src.get_settings(&Include::All).unwrap();
//! assert_eq!(settings.get("level"), Some(&Value::Float(2.5)));
//! ```

use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::Arc,
};

use log::debug;
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{MapAccess, Visitor},
    ser::SerializeMap,
};

use crate::{ErrorKind, InstrumentError, Value};

/// Lowest and highest variable priority.
const PRIORITY_RANGE: std::ops::RangeInclusive<i32> = -10..=10;

/// The kind of a device variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    /// Values that can be read back and applied again.
    Settings,
    /// Measured or derived state.
    Status,
    /// Static information such as the identification string.
    Info,
}

impl VariableKind {
    fn index(self) -> usize {
        match self {
            VariableKind::Settings => 0,
            VariableKind::Status => 1,
            VariableKind::Info => 2,
        }
    }
}

impl FromStr for VariableKind {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "settings" => Ok(VariableKind::Settings),
            "status" => Ok(VariableKind::Status),
            "info" => Ok(VariableKind::Info),
            _ => Err(InstrumentError::InvalidArgument(format!(
                "Unknown variable kind '{s}'"
            ))),
        }
    }
}

/// Getter or setter of a device variable.
///
/// Getters are called with the device and no arguments (or the channel when multiplexed).
/// Setters are called with the value(s) to set; their return value is ignored.
pub type Accessor<D> = Arc<dyn Fn(&mut D, &[Value]) -> Result<Value, InstrumentError> + Send + Sync>;

/// Multiplex a variable over several channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Multiplex {
    /// The channels.
    pub values: Vec<Value>,
    /// Position at which the channel is inserted into the accessor arguments.
    pub arg_position: usize,
}

/// Declaration of a device variable.
pub struct VariableSpec<D> {
    name: String,
    kind: VariableKind,
    getter: Option<Accessor<D>>,
    setter: Option<Accessor<D>>,
    ignore_errors: HashSet<ErrorKind>,
    multiplex: Option<Multiplex>,
    expand_tuple_args: bool,
    priority: i32,
}

impl<D> VariableSpec<D> {
    /// Declare a variable without accessors.
    pub fn new(name: &str, kind: VariableKind) -> Self {
        VariableSpec {
            name: name.to_string(),
            kind,
            getter: None,
            setter: None,
            ignore_errors: HashSet::new(),
            multiplex: None,
            expand_tuple_args: false,
            priority: 0,
        }
    }

    /// Set the getter.
    pub fn getter<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut D, &[Value]) -> Result<Value, InstrumentError> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(f));
        self
    }

    /// Set the setter.
    pub fn setter<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut D, &[Value]) -> Result<Value, InstrumentError> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(f));
        self
    }

    /// Drop the variable from bulk operations when an accessor fails with this kind of error.
    pub fn ignore_error(mut self, kind: ErrorKind) -> Self {
        self.ignore_errors.insert(kind);
        self
    }

    /// Multiplex the accessors over `values`.
    pub fn multiplex(mut self, values: Vec<Value>, arg_position: usize) -> Self {
        self.multiplex = Some(Multiplex {
            values,
            arg_position,
        });
        self
    }

    /// Pass the items of a list value to the setter as separate arguments.
    pub fn expand_tuple_args(mut self, expand: bool) -> Self {
        self.expand_tuple_args = expand;
        self
    }

    /// Set the priority, between -10 and 10. Variables with a higher priority are included by
    /// lower [`Include::Priority`] thresholds.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Which variables a bulk read includes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Include {
    /// Every variable, the same as `Priority(-10)`.
    #[default]
    All,
    /// Variables with at least this priority.
    Priority(i32),
    /// Variables with these names.
    Names(HashSet<String>),
}

impl Include {
    fn includes(&self, name: &str, priority: i32) -> bool {
        match self {
            Include::All => true,
            Include::Priority(threshold) => priority >= *threshold,
            Include::Names(names) => names.contains(name),
        }
    }
}

/// An ordered name to value mapping, the result of a bulk read.
///
/// Serializes as a map, so settings snapshots can be stored in TOML or JSON and applied later.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableValues {
    entries: Vec<(String, Value)>,
}

impl VariableValues {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Insert a value, replacing an existing value of the same name in place.
    pub fn push(&mut self, name: &str, value: Value) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    /// Iterate over names and values in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// The names in order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for VariableValues {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<S: Into<String>> FromIterator<(S, Value)> for VariableValues {
    fn from_iter<I: IntoIterator<Item = (S, Value)>>(iter: I) -> Self {
        let mut values = VariableValues::new();
        for (name, value) in iter {
            values.push(&name.into(), value);
        }
        values
    }
}

impl Serialize for VariableValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

struct VariableValuesVisitor;

impl<'de> Visitor<'de> for VariableValuesVisitor {
    type Value = VariableValues;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map of variable names to values")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<Self::Value, M::Error> {
        let mut values = VariableValues::new();
        while let Some((name, value)) = access.next_entry::<String, Value>()? {
            values.push(&name, value);
        }
        Ok(values)
    }
}

impl<'de> Deserialize<'de> for VariableValues {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        deserializer.deserialize_map(VariableValuesVisitor)
    }
}

struct DeviceVariable<D> {
    kind: VariableKind,
    getter: Option<Accessor<D>>,
    setter: Option<Accessor<D>>,
    ignore_errors: HashSet<ErrorKind>,
    priority: i32,
}

/// Insert `channel` into `args` at `position`, or at the end if `args` is shorter.
fn with_channel(args: &[Value], channel: &Value, position: usize) -> Vec<Value> {
    let mut full = args.to_vec();
    full.insert(position.min(full.len()), channel.clone());
    full
}

fn multiplexed_getter<D: 'static>(getter: Accessor<D>, mux: Multiplex) -> Accessor<D> {
    Arc::new(move |dev: &mut D, args: &[Value]| {
        let (channels, rest) = match args.split_first() {
            None => (mux.values.clone(), args),
            Some((Value::List(channels), rest)) => (channels.clone(), rest),
            Some((channel, rest)) => {
                return getter(dev, &with_channel(rest, channel, mux.arg_position));
            }
        };
        channels
            .iter()
            .map(|channel| getter(dev, &with_channel(rest, channel, mux.arg_position)))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List)
    })
}

fn multiplexed_setter<D: 'static>(setter: Accessor<D>, mux: Multiplex) -> Accessor<D> {
    Arc::new(move |dev: &mut D, args: &[Value]| {
        let Some((value, rest)) = args.split_first() else {
            return Err(InstrumentError::InvalidArgument(
                "Missing value for multiplexed setter".to_string(),
            ));
        };
        let items: Vec<Value> = match value {
            Value::List(items) => {
                if items.len() != mux.values.len() {
                    return Err(InstrumentError::LengthMismatch {
                        expected: mux.values.len(),
                        actual: items.len(),
                        context: "multiplexed setter values".to_string(),
                    });
                }
                items.clone()
            }
            scalar => vec![scalar.clone(); mux.values.len()],
        };
        for (channel, item) in mux.values.iter().zip(items) {
            let mut call_args = match item {
                Value::List(parts) => parts,
                single => vec![single],
            };
            call_args.extend_from_slice(rest);
            setter(dev, &with_channel(&call_args, channel, mux.arg_position))?;
        }
        Ok(Value::Unset)
    })
}

fn expanding_setter<D: 'static>(setter: Accessor<D>) -> Accessor<D> {
    Arc::new(move |dev: &mut D, args: &[Value]| match args {
        [Value::List(items)] => setter(dev, items),
        _ => setter(dev, args),
    })
}

/// The variables of one device.
pub struct DeviceVariables<D> {
    variables: HashMap<String, DeviceVariable<D>>,
    order: [Vec<String>; 3],
    ignored: HashMap<VariableKind, HashSet<ErrorKind>>,
}

impl<D> Default for DeviceVariables<D> {
    fn default() -> Self {
        DeviceVariables {
            variables: HashMap::new(),
            order: [Vec::new(), Vec::new(), Vec::new()],
            ignored: HashMap::new(),
        }
    }
}

impl<D: 'static> DeviceVariables<D> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable, replacing a variable of the same name.
    pub fn add(&mut self, spec: VariableSpec<D>) -> Result<(), InstrumentError> {
        if !PRIORITY_RANGE.contains(&spec.priority) {
            return Err(InstrumentError::InvalidArgument(format!(
                "Priority {} of variable '{}' is not within [-10, 10]",
                spec.priority, spec.name
            )));
        }
        let mut getter = spec.getter;
        let mut setter = spec.setter;
        if spec.expand_tuple_args {
            setter = setter.map(expanding_setter);
        }
        if let Some(mux) = spec.multiplex {
            getter = getter.map(|g| multiplexed_getter(g, mux.clone()));
            setter = setter.map(|s| multiplexed_setter(s, mux));
        }

        if let Some(previous) = self.variables.get(&spec.name) {
            let previous_kind = previous.kind;
            self.order[previous_kind.index()].retain(|n| n != &spec.name);
        }
        debug!("Adding {:?} variable {}", spec.kind, spec.name);
        self.order[spec.kind.index()].push(spec.name.clone());
        self.variables.insert(
            spec.name,
            DeviceVariable {
                kind: spec.kind,
                getter,
                setter,
                ignore_errors: spec.ignore_errors,
                priority: spec.priority,
            },
        );
        Ok(())
    }

    /// Remove a variable.
    pub fn remove(&mut self, name: &str) -> Result<(), InstrumentError> {
        let var = self
            .variables
            .remove(name)
            .ok_or_else(|| InstrumentError::UnknownVariable(name.to_string()))?;
        self.order[var.kind.index()].retain(|n| n != name);
        Ok(())
    }

    /// Returns `true` if a variable with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Kind of a variable.
    pub fn kind_of(&self, name: &str) -> Option<VariableKind> {
        self.variables.get(name).map(|v| v.kind)
    }

    /// Names of the variables of one kind, in enumeration order.
    pub fn names(&self, kind: VariableKind) -> &[String] {
        &self.order[kind.index()]
    }

    /// Move a variable to the end of the enumeration order of its kind.
    pub fn touch(&mut self, name: &str) {
        if let Some(var) = self.variables.get(name) {
            let order = &mut self.order[var.kind.index()];
            if let Some(pos) = order.iter().position(|n| n == name) {
                let moved = order.remove(pos);
                order.push(moved);
            }
        }
    }

    /// Ignore errors of this kind for all variables of `variable_kind` during bulk operations.
    pub fn ignore_errors(&mut self, variable_kind: VariableKind, error_kind: ErrorKind) {
        self.ignored
            .entry(variable_kind)
            .or_default()
            .insert(error_kind);
    }

    fn is_ignorable(&self, name: &str, err: &InstrumentError) -> bool {
        let Some(var) = self.variables.get(name) else {
            return false;
        };
        let kind = err.kind();
        var.ignore_errors.contains(&kind)
            || self
                .ignored
                .get(&var.kind)
                .is_some_and(|set| set.contains(&kind))
    }

    fn getter(&self, name: &str) -> Result<Accessor<D>, InstrumentError> {
        let var = self
            .variables
            .get(name)
            .ok_or_else(|| InstrumentError::UnknownVariable(name.to_string()))?;
        var.getter.clone().ok_or_else(|| InstrumentError::NoAccessor {
            name: name.to_string(),
            accessor: "getter",
        })
    }

    fn setter(&self, name: &str) -> Result<Accessor<D>, InstrumentError> {
        let var = self
            .variables
            .get(name)
            .ok_or_else(|| InstrumentError::UnknownVariable(name.to_string()))?;
        var.setter.clone().ok_or_else(|| InstrumentError::NoAccessor {
            name: name.to_string(),
            accessor: "setter",
        })
    }

    /// Getters of the included variables of `kinds`, in enumeration order.
    fn plan_reads(&self, kinds: &[VariableKind], include: &Include) -> Vec<(String, Accessor<D>)> {
        kinds
            .iter()
            .flat_map(|kind| self.order[kind.index()].iter())
            .filter_map(|name| {
                let var = self.variables.get(name)?;
                let getter = var.getter.clone()?;
                include
                    .includes(name, var.priority)
                    .then(|| (name.clone(), getter))
            })
            .collect()
    }

    /// Setters of settings present in `values`, in enumeration order.
    fn plan_writes(&self, values: &VariableValues) -> Vec<(String, Accessor<D>, Value)> {
        self.order[VariableKind::Settings.index()]
            .iter()
            .filter_map(|name| {
                let value = values.get(name)?;
                let setter = self.variables.get(name)?.setter.clone()?;
                Some((name.clone(), setter, value.clone()))
            })
            .collect()
    }
}

/// Bulk and by-name access to the [`DeviceVariables`] of a device.
///
/// Implementors only expose their registry; all operations are provided.
pub trait DeviceVariableAccess: Sized + 'static {
    /// The registry of this device.
    fn device_variables(&self) -> &DeviceVariables<Self>;

    /// The registry of this device, mutable.
    fn device_variables_mut(&mut self) -> &mut DeviceVariables<Self>;

    /// Add a variable, see [`DeviceVariables::add`].
    fn add_device_variable(&mut self, spec: VariableSpec<Self>) -> Result<(), InstrumentError> {
        self.device_variables_mut().add(spec)
    }

    /// Remove a variable.
    fn remove_device_variable(&mut self, name: &str) -> Result<(), InstrumentError> {
        self.device_variables_mut().remove(name)
    }

    /// Read all included variables of `kinds`.
    ///
    /// Variables whose getter fails with an ignorable error are left out of the result. Any other
    /// error is returned.
    fn get_device_variables(
        &mut self,
        kinds: &[VariableKind],
        include: &Include,
    ) -> Result<VariableValues, InstrumentError> {
        let plan = self.device_variables().plan_reads(kinds, include);
        let mut values = VariableValues::new();
        for (name, getter) in plan {
            match getter(self, &[]) {
                Ok(value) => values.push(&name, value),
                Err(err) if self.device_variables().is_ignorable(&name, &err) => {
                    debug!("Skipping variable {name}: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(values)
    }

    /// Read all settings.
    fn get_settings(&mut self, include: &Include) -> Result<VariableValues, InstrumentError> {
        self.get_device_variables(&[VariableKind::Settings], include)
    }

    /// Read all status variables and settings.
    fn get_full_status(&mut self, include: &Include) -> Result<VariableValues, InstrumentError> {
        self.get_device_variables(&[VariableKind::Status, VariableKind::Settings], include)
    }

    /// Read all info and status variables and settings.
    fn get_full_info(&mut self, include: &Include) -> Result<VariableValues, InstrumentError> {
        self.get_device_variables(
            &[VariableKind::Info, VariableKind::Status, VariableKind::Settings],
            include,
        )
    }

    /// Apply settings in enumeration order.
    ///
    /// Names that are not settings or have no setter are skipped. Ignorable errors are logged and
    /// swallowed.
    fn apply_settings(&mut self, values: &VariableValues) -> Result<(), InstrumentError> {
        let plan = self.device_variables().plan_writes(values);
        for (name, setter, value) in plan {
            match setter(self, std::slice::from_ref(&value)) {
                Ok(_) => {}
                Err(err) if self.device_variables().is_ignorable(&name, &err) => {
                    debug!("Ignoring error while applying {name}: {err}");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Read a single variable.
    fn get_variable(&mut self, name: &str) -> Result<Value, InstrumentError> {
        let getter = self.device_variables().getter(name)?;
        self.device_variables_mut().touch(name);
        getter(self, &[])
    }

    /// Set a single variable.
    fn set_variable(&mut self, name: &str, value: Value) -> Result<(), InstrumentError> {
        let setter = self.device_variables().setter(name)?;
        self.device_variables_mut().touch(name);
        setter(self, std::slice::from_ref(&value)).map(|_| ())
    }
}
