use log::trace;

use crate::{InstrumentError, Value};

use super::{DeviceBinding, ParameterClass};

/// Which aliases an [`EnumParameter`] accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllowedAlias {
    /// Only the aliases of the table.
    #[default]
    Exact,
    /// Aliases of the table and device values, which pass through unchanged.
    DeviceValues,
    /// Anything; unknown aliases pass through unchanged.
    All,
}

/// Which device values an [`EnumParameter`] accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllowedValue {
    /// Only the values of the table.
    #[default]
    Exact,
    /// Anything; unknown values pass through unchanged.
    All,
}

/// Case normalization applied to string keys before a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseNormalization {
    /// Convert to lower case.
    Lower,
    /// Convert to upper case.
    Upper,
}

impl CaseNormalization {
    fn apply(case: Option<CaseNormalization>, value: &Value) -> Value {
        match (case, value) {
            (Some(CaseNormalization::Lower), Value::Str(s)) => Value::Str(s.to_lowercase()),
            (Some(CaseNormalization::Upper), Value::Str(s)) => Value::Str(s.to_uppercase()),
            _ => value.clone(),
        }
    }
}

/// Keys are compared as numbers if both are numeric, so `Int(1)` finds `Float(1.0)`.
fn same_key(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(_), _) | (_, Value::Str(_)) => a == b,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

/// Find `key` in `pairs`: exact first, then, if enabled, the longest table key that `key`
/// starts with.
fn lookup<'a>(pairs: &'a [(Value, Value)], key: &Value, match_prefix: bool) -> Option<&'a Value> {
    if let Some((_, v)) = pairs.iter().find(|(k, _)| same_key(k, key)) {
        return Some(v);
    }
    let Value::Str(text) = key else {
        return None;
    };
    if !match_prefix {
        return None;
    }
    pairs
        .iter()
        .filter_map(|(k, v)| k.as_str().map(|k| (k, v)))
        .filter(|(k, _)| !k.is_empty() && text.starts_with(k))
        .max_by_key(|(k, _)| k.len())
        .map(|(_, v)| v)
}

/// Append `(key, value)` unless the key is already present.
fn push_first(pairs: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    if !pairs.iter().any(|(k, _)| same_key(k, &key)) {
        pairs.push((key, value));
    }
}

/// A parameter with a fixed set of aliases, e.g. `"auto" -> 0`, `"manual" -> 1`.
///
/// The table is an ordered list of `(alias, value)` pairs. Duplicate aliases keep the first
/// definition, and the inverse table maps each value to the first alias that defines it, unless
/// an explicit value map is given.
///
/// # Example
/// ```
/// use instrumentcore::{EnumParameter, ParameterClass, Value};
///
/// let mode = EnumParameter::new("mode", [("auto", 0), ("manual", 1)]);
/// assert_eq!(mode.to_value(&"manual".into()).unwrap(), Value::Int(1));
/// assert_eq!(mode.to_alias(&Value::Int(0)).unwrap(), Value::from("auto"));
/// assert!(mode.to_value(&"off".into()).is_err());
/// ```
#[derive(Debug)]
pub struct EnumParameter {
    name: String,
    alias_map: Vec<(Value, Value)>,
    value_map: Vec<(Value, Value)>,
    allowed_alias: AllowedAlias,
    allowed_value: AllowedValue,
    alias_case: Option<CaseNormalization>,
    value_case: Option<CaseNormalization>,
    match_prefix: bool,
    binding: DeviceBinding,
}

impl EnumParameter {
    /// Create a new enum parameter from `(alias, value)` pairs.
    pub fn new<A, V, I>(name: &str, pairs: I) -> Self
    where
        A: Into<Value>,
        V: Into<Value>,
        I: IntoIterator<Item = (A, V)>,
    {
        let mut alias_map = Vec::new();
        for (alias, value) in pairs {
            push_first(&mut alias_map, alias.into(), value.into());
        }
        let mut value_map = Vec::new();
        for (alias, value) in &alias_map {
            push_first(&mut value_map, value.clone(), alias.clone());
        }
        EnumParameter {
            name: name.to_string(),
            alias_map,
            value_map,
            allowed_alias: AllowedAlias::default(),
            allowed_value: AllowedValue::default(),
            alias_case: None,
            value_case: None,
            match_prefix: false,
            binding: DeviceBinding::default(),
        }
    }

    /// Replace the derived inverse table with explicit `(value, alias)` pairs.
    pub fn with_value_map<A, V, I>(mut self, pairs: I) -> Self
    where
        V: Into<Value>,
        A: Into<Value>,
        I: IntoIterator<Item = (V, A)>,
    {
        let mut value_map = Vec::new();
        for (value, alias) in pairs {
            let value = CaseNormalization::apply(self.value_case, &value.into());
            push_first(&mut value_map, value, alias.into());
        }
        self.value_map = value_map;
        self
    }

    /// Set which aliases are accepted.
    pub fn allowed_alias(mut self, allowed: AllowedAlias) -> Self {
        self.allowed_alias = allowed;
        self
    }

    /// Set which device values are accepted.
    pub fn allowed_value(mut self, allowed: AllowedValue) -> Self {
        self.allowed_value = allowed;
        self
    }

    /// Normalize the case of string aliases before the lookup.
    pub fn alias_case(mut self, case: CaseNormalization) -> Self {
        self.alias_case = Some(case);
        self.alias_map = Self::normalized(&self.alias_map, self.alias_case);
        self
    }

    /// Normalize the case of string device values before the lookup.
    pub fn value_case(mut self, case: CaseNormalization) -> Self {
        self.value_case = Some(case);
        self.value_map = Self::normalized(&self.value_map, self.value_case);
        self
    }

    /// Accept device replies that start with a known device value, e.g. `INTERNAL` for `INT`.
    ///
    /// Only the value to alias direction is affected; aliases always have to match exactly.
    pub fn match_prefix(mut self, enabled: bool) -> Self {
        self.match_prefix = enabled;
        self
    }

    /// The aliases in definition order.
    pub fn aliases(&self) -> Vec<Value> {
        self.alias_map.iter().map(|(a, _)| a.clone()).collect()
    }

    /// The device values in definition order.
    pub fn values(&self) -> Vec<Value> {
        self.value_map.iter().map(|(v, _)| v.clone()).collect()
    }

    fn normalized(pairs: &[(Value, Value)], case: Option<CaseNormalization>) -> Vec<(Value, Value)> {
        let mut out = Vec::new();
        for (key, target) in pairs {
            push_first(&mut out, CaseNormalization::apply(case, key), target.clone());
        }
        out
    }

    fn find_value(&self, alias: &Value) -> Option<&Value> {
        let alias = CaseNormalization::apply(self.alias_case, alias);
        lookup(&self.alias_map, &alias, false)
    }

    fn find_alias(&self, value: &Value) -> Option<&Value> {
        let value = CaseNormalization::apply(self.value_case, value);
        lookup(&self.value_map, &value, self.match_prefix)
    }

    fn is_device_value(&self, value: &Value) -> bool {
        let value = CaseNormalization::apply(self.value_case, value);
        lookup(&self.value_map, &value, false).is_some()
    }

    fn join(keys: &[(Value, Value)]) -> String {
        keys.iter()
            .map(|(k, _)| format!("'{k}'"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl ParameterClass for EnumParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    fn check_alias(&self, alias: &Value) -> bool {
        match self.allowed_alias {
            AllowedAlias::Exact => self.find_value(alias).is_some(),
            AllowedAlias::DeviceValues => {
                self.find_value(alias).is_some() || self.is_device_value(alias)
            }
            AllowedAlias::All => true,
        }
    }

    fn check_value(&self, value: &Value) -> bool {
        match self.allowed_value {
            AllowedValue::Exact => self.find_alias(value).is_some(),
            AllowedValue::All => true,
        }
    }

    fn alias_error(&self) -> String {
        format!("allowed aliases are {}", Self::join(&self.alias_map))
    }

    fn value_error(&self) -> String {
        format!("allowed values are {}", Self::join(&self.value_map))
    }

    fn alias_to_value(&self, alias: &Value) -> Result<Value, InstrumentError> {
        match self.find_value(alias) {
            Some(value) => Ok(value.clone()),
            None => {
                trace!("{}: passing '{alias}' through unchanged", self.name);
                Ok(alias.clone())
            }
        }
    }

    fn value_to_alias(&self, value: &Value) -> Result<Value, InstrumentError> {
        match self.find_alias(value) {
            Some(alias) => Ok(alias.clone()),
            None => Ok(value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    fn test_first_definition_wins() {
        let param = EnumParameter::new("p", [("a", 1), ("b", 1), ("a", 2)]);
        assert_eq!(param.to_value(&"a".into()).unwrap(), Value::Int(1));
        assert_eq!(param.to_alias(&1.into()).unwrap(), Value::from("a"));
        assert!(param.to_alias(&2.into()).is_err());
    }

    #[rstest]
    #[case("ON", "on")]
    #[case("ONCE", "once")]
    #[case("ONCEMORE", "once")]
    #[case("OFFSET", "off")]
    fn test_prefix_prefers_exact(#[case] reply: &str, #[case] expected: &str) {
        let param = EnumParameter::new("p", [("on", "ON"), ("once", "ONCE"), ("off", "OFF")])
            .match_prefix(true);
        assert_eq!(param.to_alias(&reply.into()).unwrap(), Value::from(expected));
    }

    #[rstest]
    #[case("onx")]
    #[case("of")]
    fn test_prefix_ignored_for_aliases(#[case] alias: &str) {
        let param = EnumParameter::new("p", [("on", "1"), ("off", "0")]).match_prefix(true);
        assert!(matches!(
            param.to_value(&alias.into()),
            Err(InstrumentError::ParameterValidation { .. })
        ));
        assert!(param.to_alias(&"OF".into()).is_err());
    }

    #[rstest]
    fn test_case_normalization() {
        let param = EnumParameter::new("p", [("Auto", "AUTO"), ("Manual", "MAN")])
            .alias_case(CaseNormalization::Lower)
            .value_case(CaseNormalization::Upper);
        assert_eq!(param.to_value(&"AUTO".into()).unwrap(), Value::from("AUTO"));
        assert_eq!(param.to_alias(&"man".into()).unwrap(), Value::from("Manual"));
        assert!(param.to_value(&"semi".into()).is_err());
    }

    #[rstest]
    fn test_allowed_sets() {
        let param = EnumParameter::new("p", [("low", 1), ("high", 2)])
            .allowed_alias(AllowedAlias::DeviceValues)
            .allowed_value(AllowedValue::All);
        assert_eq!(param.to_value(&2.into()).unwrap(), Value::Int(2));
        assert!(param.to_value(&3.into()).is_err());
        assert_eq!(param.to_alias(&7.into()).unwrap(), Value::Int(7));

        let strict = EnumParameter::new("p", [("low", 1)]);
        match strict.to_value(&"mid".into()) {
            Err(InstrumentError::ParameterValidation { message, .. }) => {
                assert!(message.contains("'low'"));
            }
            other => panic!("Expected a validation error, got {other:?}"),
        }
    }

    #[rstest]
    fn test_explicit_value_map() {
        let param = EnumParameter::new("p", [("on", 1), ("off", 0)])
            .with_value_map([(1, "enabled"), (0, "disabled")]);
        assert_eq!(param.to_alias(&Value::Float(1.0)).unwrap(), Value::from("enabled"));
    }
}
