//! Apply parameter classes to the arguments and results of a call.
//!
//! A [`ParameterSubstitution`] describes the arguments of a driver method by name. Arguments
//! whose name matches a parameter class (or that are mapped to one explicitly) are converted from
//! alias to device value before the call, and declared return parameters are converted from
//! device value to alias afterwards.

use std::collections::HashMap;

use crate::{InstrumentError, ParameterTable, Value};

/// Which direction of a call is substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubstitutionMode {
    /// Arguments and return values.
    #[default]
    Full,
    /// Only arguments.
    InputsOnly,
    /// Only return values.
    OutputsOnly,
}

/// A call argument.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    /// An alias that is substituted.
    Value(Value),
    /// A value that is already in device form and bypasses substitution.
    Wire(Value),
}

macro_rules! call_arg_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for CallArg {
                fn from(value: $ty) -> Self {
                    CallArg::Value(value.into())
                }
            }
        )*
    };
}

call_arg_from!(Value, bool, i32, i64, u32, usize, f64, &str, String);

/// The parameter classes of the return value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReturnParameters {
    /// The return value is passed through.
    #[default]
    None,
    /// The whole return value is converted with this class.
    Single(String),
    /// The return value is a list and each element is converted with its own class, if any.
    Tuple(Vec<Option<String>>),
}

/// Substitution rules of one call site.
///
/// # Example
/// ```
/// use instrumentcore::{
///     CallArg, EnumParameter, ParameterSubstitution, ParameterTable, ReturnParameters, Value,
/// };
///
/// let mut table = ParameterTable::new();
/// table.add(EnumParameter::new("mode", [("auto", 0), ("manual", 1)])).unwrap();
///
/// let subst = ParameterSubstitution::new(&["channel", "mode"])
///     .with_returns(ReturnParameters::Single("mode".to_string()));
/// let result = subst
///     .call(&table, vec![CallArg::from(1), CallArg::from("manual")], |args| {
///         assert_eq!(args, vec![Value::Int(1), Value::Int(1)]);
///         Ok(Value::Int(0))
///     })
///     .unwrap();
/// assert_eq!(result, Value::from("auto"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ParameterSubstitution {
    arg_names: Vec<String>,
    defaults: Vec<Value>,
    explicit: HashMap<String, String>,
    returns: ReturnParameters,
    mode: SubstitutionMode,
}

impl ParameterSubstitution {
    /// Describe a call with these argument names. All defaults are [`Value::Unset`].
    pub fn new(arg_names: &[&str]) -> Self {
        ParameterSubstitution {
            arg_names: arg_names.iter().map(|n| n.to_string()).collect(),
            defaults: vec![Value::Unset; arg_names.len()],
            ..Default::default()
        }
    }

    /// Set the default of an argument, used when the argument is omitted.
    pub fn with_default(mut self, arg: &str, default: Value) -> Self {
        if let Some(pos) = self.arg_names.iter().position(|n| n == arg) {
            self.defaults[pos] = default;
        }
        self
    }

    /// Convert `arg` with the parameter class `class` instead of the class of the same name.
    pub fn with_parameter(mut self, arg: &str, class: &str) -> Self {
        self.explicit.insert(arg.to_string(), class.to_string());
        self
    }

    /// Declare the parameter classes of the return value.
    pub fn with_returns(mut self, returns: ReturnParameters) -> Self {
        self.returns = returns;
        self
    }

    /// Set the substitution mode.
    pub fn with_mode(mut self, mode: SubstitutionMode) -> Self {
        self.mode = mode;
        self
    }

    fn class_for<'a>(&'a self, arg: &'a str, table: &ParameterTable) -> Option<&'a str> {
        match self.explicit.get(arg) {
            Some(class) => Some(class.as_str()),
            None => table.contains(arg).then_some(arg),
        }
    }

    /// Convert the arguments of a call to device values.
    ///
    /// Omitted trailing arguments take their default. An unset argument whose default is also
    /// unset is passed on unchanged, as are [`CallArg::Wire`] arguments.
    pub fn substitute_inputs(
        &self,
        table: &ParameterTable,
        args: Vec<CallArg>,
    ) -> Result<Vec<Value>, InstrumentError> {
        if args.len() > self.arg_names.len() {
            return Err(InstrumentError::LengthMismatch {
                expected: self.arg_names.len(),
                actual: args.len(),
                context: format!("arguments ({})", self.arg_names.join(", ")),
            });
        }
        let substitute = self.mode != SubstitutionMode::OutputsOnly;
        let mut args = args.into_iter();
        let mut out = Vec::with_capacity(self.arg_names.len());
        for (name, default) in self.arg_names.iter().zip(&self.defaults) {
            let arg = args.next().unwrap_or_else(|| CallArg::Value(default.clone()));
            let value = match arg {
                CallArg::Wire(value) => value,
                CallArg::Value(value) if !substitute => value,
                CallArg::Value(value) if value.is_unset() && default.is_unset() => value,
                CallArg::Value(value) => match self.class_for(name, table) {
                    Some(class) => table.get(class)?.to_value(&value)?,
                    None => value,
                },
            };
            out.push(value);
        }
        Ok(out)
    }

    /// Convert the return value of a call to aliases.
    pub fn substitute_output(
        &self,
        table: &ParameterTable,
        result: Value,
    ) -> Result<Value, InstrumentError> {
        if self.mode == SubstitutionMode::InputsOnly {
            return Ok(result);
        }
        match &self.returns {
            ReturnParameters::None => Ok(result),
            ReturnParameters::Single(class) => table.get(class)?.to_alias(&result),
            ReturnParameters::Tuple(classes) => {
                let Value::List(items) = result else {
                    return Err(InstrumentError::InvalidArgument(format!(
                        "Expected a list return value, got {result:?}"
                    )));
                };
                if items.len() != classes.len() {
                    return Err(InstrumentError::LengthMismatch {
                        expected: classes.len(),
                        actual: items.len(),
                        context: "return values".to_string(),
                    });
                }
                items
                    .into_iter()
                    .zip(classes)
                    .map(|(item, class)| match class {
                        Some(class) => table.get(class)?.to_alias(&item),
                        None => Ok(item),
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List)
            }
        }
    }

    /// Substitute the arguments, call `f`, and substitute its return value.
    pub fn call<F>(
        &self,
        table: &ParameterTable,
        args: Vec<CallArg>,
        f: F,
    ) -> Result<Value, InstrumentError>
    where
        F: FnOnce(Vec<Value>) -> Result<Value, InstrumentError>,
    {
        let values = self.substitute_inputs(table, args)?;
        let result = f(values)?;
        self.substitute_output(table, result)
    }
}
