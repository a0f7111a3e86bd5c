use std::sync::Arc;

use crate::{InstrumentError, Value};

use super::{DeviceBinding, DeviceRef, ParameterClass};

/// A conversion hook, called with the input and the currently bound device.
pub type ConvertFn =
    Arc<dyn Fn(&Value, Option<&DeviceRef>) -> Result<Value, InstrumentError> + Send + Sync>;

/// A validation hook, called with the input and the currently bound device.
pub type CheckFn = Arc<dyn Fn(&Value, Option<&DeviceRef>) -> bool + Send + Sync>;

/// A parameter whose conversions are arbitrary functions.
///
/// Missing conversions are the identity and missing checks accept everything.
///
/// # Example
/// ```
/// use instrumentcore::{FunctionParameter, ParameterClass, Value};
///
/// let milli = FunctionParameter::new("milli")
///     .with_to_value(|alias, _| Ok(Value::Float(alias.to_f64()? / 1000.0)))
///     .with_to_alias(|value, _| Ok(Value::Float(value.to_f64()? * 1000.0)));
/// assert_eq!(milli.to_value(&Value::Int(250)).unwrap(), Value::Float(0.25));
/// ```
#[derive(Default)]
pub struct FunctionParameter {
    name: String,
    to_value: Option<ConvertFn>,
    to_alias: Option<ConvertFn>,
    check_alias: Option<CheckFn>,
    check_value: Option<CheckFn>,
    alias_err: Option<String>,
    value_err: Option<String>,
    binding: DeviceBinding,
}

impl FunctionParameter {
    /// Create an identity parameter.
    pub fn new(name: &str) -> Self {
        FunctionParameter {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Set the alias to value conversion.
    pub fn with_to_value<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, Option<&DeviceRef>) -> Result<Value, InstrumentError> + Send + Sync + 'static,
    {
        self.to_value = Some(Arc::new(f));
        self
    }

    /// Set the value to alias conversion.
    pub fn with_to_alias<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, Option<&DeviceRef>) -> Result<Value, InstrumentError> + Send + Sync + 'static,
    {
        self.to_alias = Some(Arc::new(f));
        self
    }

    /// Set the alias check and the message shown when it fails.
    pub fn with_check_alias<F>(mut self, f: F, error: &str) -> Self
    where
        F: Fn(&Value, Option<&DeviceRef>) -> bool + Send + Sync + 'static,
    {
        self.check_alias = Some(Arc::new(f));
        self.alias_err = Some(error.to_string());
        self
    }

    /// Set the value check and the message shown when it fails.
    pub fn with_check_value<F>(mut self, f: F, error: &str) -> Self
    where
        F: Fn(&Value, Option<&DeviceRef>) -> bool + Send + Sync + 'static,
    {
        self.check_value = Some(Arc::new(f));
        self.value_err = Some(error.to_string());
        self
    }

    fn convert(&self, hook: Option<&ConvertFn>, input: &Value) -> Result<Value, InstrumentError> {
        match hook {
            Some(f) => f(input, self.binding.current().as_ref()),
            None => Ok(input.clone()),
        }
    }
}

impl ParameterClass for FunctionParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    fn check_alias(&self, alias: &Value) -> bool {
        self.check_alias
            .as_ref()
            .is_none_or(|f| f(alias, self.binding.current().as_ref()))
    }

    fn check_value(&self, value: &Value) -> bool {
        self.check_value
            .as_ref()
            .is_none_or(|f| f(value, self.binding.current().as_ref()))
    }

    fn alias_error(&self) -> String {
        self.alias_err
            .clone()
            .unwrap_or_else(|| "alias not allowed".to_string())
    }

    fn value_error(&self) -> String {
        self.value_err
            .clone()
            .unwrap_or_else(|| "value not allowed".to_string())
    }

    fn alias_to_value(&self, alias: &Value) -> Result<Value, InstrumentError> {
        self.convert(self.to_value.as_ref(), alias)
    }

    fn value_to_alias(&self, value: &Value) -> Result<Value, InstrumentError> {
        self.convert(self.to_alias.as_ref(), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::with_device;
    use rstest::*;

    struct Channel {
        scale: f64,
    }

    #[rstest]
    fn test_uses_bound_device() {
        let param = FunctionParameter::new("scaled").with_to_value(|alias, device| {
            let scale = device
                .and_then(|d| d.downcast_ref::<Channel>())
                .map_or(1.0, |c| c.scale);
            Ok(Value::Float(alias.to_f64()? * scale))
        });
        assert_eq!(param.to_value(&2.into()).unwrap(), Value::Float(2.0));

        let device: DeviceRef = Arc::new(Channel { scale: 10.0 });
        let scaled = with_device(&param, device, |p| p.to_value(&2.into())).unwrap();
        assert_eq!(scaled, Value::Float(20.0));
        assert!(param.binding().current().is_none());
    }

    #[rstest]
    fn test_check_message() {
        let param = FunctionParameter::new("even")
            .with_check_alias(|alias, _| alias.as_i64().is_some_and(|i| i % 2 == 0), "must be even");
        assert!(param.to_value(&4.into()).is_ok());
        match param.to_value(&3.into()) {
            Err(InstrumentError::ParameterValidation { message, .. }) => {
                assert!(message.ends_with("must be even"));
            }
            other => panic!("Expected a validation error, got {other:?}"),
        }
    }
}
