use crate::{InstrumentError, Value};

use super::{DeviceBinding, ParameterClass};

/// What a [`RangeParameter`] does with values outside of its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangePolicy {
    /// Reject the value.
    #[default]
    Error,
    /// Clamp the value to the closest bound.
    Truncate,
}

/// A numeric parameter with optional bounds.
///
/// Aliases and device values are the same number; the class only validates or clamps them.
///
/// # Example
/// ```
/// use instrumentcore::{ParameterClass, RangeParameter, RangePolicy, Value};
///
/// let param = RangeParameter::new("level", Some(0.0), Some(10.0), RangePolicy::Truncate);
/// assert_eq!(param.to_value(&Value::Int(15)).unwrap(), Value::Int(10));
/// ```
#[derive(Debug)]
pub struct RangeParameter {
    name: String,
    min: Option<f64>,
    max: Option<f64>,
    policy: RangePolicy,
    binding: DeviceBinding,
}

impl RangeParameter {
    /// Create a new range parameter. Swapped bounds are reordered.
    pub fn new(name: &str, min: Option<f64>, max: Option<f64>, policy: RangePolicy) -> Self {
        let (min, max) = match (min, max) {
            (Some(lo), Some(hi)) if lo > hi => (Some(hi), Some(lo)),
            bounds => bounds,
        };
        RangeParameter {
            name: name.to_string(),
            min,
            max,
            policy,
            binding: DeviceBinding::default(),
        }
    }

    /// The normalized bounds.
    pub fn bounds(&self) -> (Option<f64>, Option<f64>) {
        (self.min, self.max)
    }

    fn in_range(&self, x: f64) -> bool {
        self.min.is_none_or(|lo| x >= lo) && self.max.is_none_or(|hi| x <= hi)
    }

    fn check(&self, value: &Value) -> bool {
        match (value.as_f64(), self.policy) {
            (Some(x), RangePolicy::Error) => self.in_range(x),
            (Some(x), RangePolicy::Truncate) => !x.is_nan(),
            (None, _) => false,
        }
    }

    fn apply(&self, value: &Value) -> Result<Value, InstrumentError> {
        let x = value.to_f64()?;
        if self.policy == RangePolicy::Error || self.in_range(x) {
            return Ok(value.clone());
        }
        let clamped = match (self.min, self.max) {
            (Some(lo), _) if x < lo => lo,
            (_, Some(hi)) if x > hi => hi,
            _ => x,
        };
        match value {
            Value::Int(_) if clamped.fract() == 0.0 => Ok(Value::Int(clamped as i64)),
            _ => Ok(Value::Float(clamped)),
        }
    }
}

fn describe_bound(bound: Option<f64>) -> String {
    bound.map_or_else(|| "unbounded".to_string(), |b| b.to_string())
}

impl ParameterClass for RangeParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    fn check_alias(&self, alias: &Value) -> bool {
        self.check(alias)
    }

    fn check_value(&self, value: &Value) -> bool {
        self.check(value)
    }

    fn alias_error(&self) -> String {
        format!(
            "must be a number in [{}, {}]",
            describe_bound(self.min),
            describe_bound(self.max)
        )
    }

    fn value_error(&self) -> String {
        self.alias_error()
    }

    fn alias_to_value(&self, alias: &Value) -> Result<Value, InstrumentError> {
        self.apply(alias)
    }

    fn value_to_alias(&self, value: &Value) -> Result<Value, InstrumentError> {
        self.apply(value)
    }
}
