//! Parameter classes convert between user-facing aliases and the values a device understands.
//!
//! A parameter class is registered once per device in a [`ParameterTable`] and looked up by its
//! name. Every class implements the raw conversions [`ParameterClass::alias_to_value`] and
//! [`ParameterClass::value_to_alias`]; the checked conversions [`ParameterClass::to_value`] and
//! [`ParameterClass::to_alias`] validate their input first and fail with
//! [`InstrumentError::ParameterValidation`].

mod combined;
mod enumeration;
mod function;
mod range;

use std::{any::Any, collections::HashMap, sync::Arc};

use log::debug;
use parking_lot::Mutex;

pub use combined::CombinedParameter;
pub use enumeration::{AllowedAlias, AllowedValue, CaseNormalization, EnumParameter};
pub use function::{CheckFn, ConvertFn, FunctionParameter};
pub use range::{RangeParameter, RangePolicy};

use crate::{InstrumentError, Value};

/// Reference to the device a parameter class is currently bound to.
///
/// Conversions that need to query the device, e.g. to read the current range of a channel,
/// downcast this reference to the concrete type they expect.
pub type DeviceRef = Arc<dyn Any + Send + Sync>;

/// The device a parameter class is bound to, if any.
#[derive(Default)]
pub struct DeviceBinding {
    device: Mutex<Option<DeviceRef>>,
}

impl std::fmt::Debug for DeviceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBinding")
            .field("bound", &self.device.lock().is_some())
            .finish()
    }
}

impl DeviceBinding {
    /// The currently bound device.
    pub fn current(&self) -> Option<DeviceRef> {
        self.device.lock().clone()
    }

    /// Bind `device` until the returned guard is dropped, which restores the previous binding.
    pub fn bind(&self, device: DeviceRef) -> BindingGuard<'_> {
        let previous = self.device.lock().replace(device);
        BindingGuard {
            binding: self,
            previous,
        }
    }
}

/// Restores the previous device binding on drop, see [`DeviceBinding::bind`].
pub struct BindingGuard<'a> {
    binding: &'a DeviceBinding,
    previous: Option<DeviceRef>,
}

impl Drop for BindingGuard<'_> {
    fn drop(&mut self) {
        *self.binding.device.lock() = self.previous.take();
    }
}

/// Run `f` with `param` bound to `device`.
///
/// The previous binding is restored when `f` returns, fails, or panics.
pub fn with_device<P, R>(param: &P, device: DeviceRef, f: impl FnOnce(&P) -> R) -> R
where
    P: ParameterClass + ?Sized,
{
    let _guard = param.binding().bind(device);
    f(param)
}

/// The conversion contract shared by all parameter classes.
pub trait ParameterClass: Send + Sync {
    /// Unique name of the class within a [`ParameterTable`].
    fn name(&self) -> &str;

    /// The device binding of this class.
    fn binding(&self) -> &DeviceBinding;

    /// Returns `true` if `alias` may be converted to a device value.
    fn check_alias(&self, _alias: &Value) -> bool {
        true
    }

    /// Returns `true` if `value` may be converted to an alias.
    fn check_value(&self, _value: &Value) -> bool {
        true
    }

    /// Human-readable description of the allowed aliases.
    fn alias_error(&self) -> String {
        "alias not allowed".to_string()
    }

    /// Human-readable description of the allowed device values.
    fn value_error(&self) -> String {
        "value not allowed".to_string()
    }

    /// Convert an alias to a device value without validation.
    fn alias_to_value(&self, alias: &Value) -> Result<Value, InstrumentError>;

    /// Convert a device value to an alias without validation.
    fn value_to_alias(&self, value: &Value) -> Result<Value, InstrumentError>;

    /// Validate `alias` and convert it to a device value.
    fn to_value(&self, alias: &Value) -> Result<Value, InstrumentError> {
        if !self.check_alias(alias) {
            return Err(InstrumentError::ParameterValidation {
                parameter: self.name().to_string(),
                message: format!("'{alias}': {}", self.alias_error()),
            });
        }
        self.alias_to_value(alias)
    }

    /// Validate `value` and convert it to an alias.
    fn to_alias(&self, value: &Value) -> Result<Value, InstrumentError> {
        if !self.check_value(value) {
            return Err(InstrumentError::ParameterValidation {
                parameter: self.name().to_string(),
                message: format!("'{value}': {}", self.value_error()),
            });
        }
        self.value_to_alias(value)
    }
}

/// Parameter classes of a device, by name.
#[derive(Default)]
pub struct ParameterTable {
    classes: HashMap<String, Arc<dyn ParameterClass>>,
}

impl ParameterTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter class. Fails if a class with the same name exists.
    pub fn add<P: ParameterClass + 'static>(&mut self, class: P) -> Result<(), InstrumentError> {
        self.add_shared(Arc::new(class))
    }

    /// Register a parameter class that is shared with other tables.
    pub fn add_shared(&mut self, class: Arc<dyn ParameterClass>) -> Result<(), InstrumentError> {
        let name = class.name().to_string();
        if self.classes.contains_key(&name) {
            return Err(InstrumentError::InvalidArgument(format!(
                "Parameter class '{name}' already exists"
            )));
        }
        debug!("Adding parameter class {name}");
        self.classes.insert(name, class);
        Ok(())
    }

    /// Replace an existing parameter class with a class of the same name.
    pub fn replace(&mut self, class: Arc<dyn ParameterClass>) -> Result<(), InstrumentError> {
        match self.classes.get_mut(class.name()) {
            Some(slot) => {
                debug!("Replacing parameter class {}", class.name());
                *slot = class;
                Ok(())
            }
            None => Err(InstrumentError::UnknownParameterClass(
                class.name().to_string(),
            )),
        }
    }

    /// Look up a parameter class.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ParameterClass>, InstrumentError> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| InstrumentError::UnknownParameterClass(name.to_string()))
    }

    /// Returns `true` if a class with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// Sorted names of all registered classes.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    fn test_table_add_replace() {
        let mut table = ParameterTable::new();
        table
            .add(RangeParameter::new("volt", Some(0.0), Some(10.0), RangePolicy::Error))
            .unwrap();
        assert!(table
            .add(RangeParameter::new("volt", None, None, RangePolicy::Error))
            .is_err());

        let wider = RangeParameter::new("volt", Some(0.0), Some(20.0), RangePolicy::Error);
        table.replace(Arc::new(wider)).unwrap();
        assert_eq!(
            table.get("volt").unwrap().to_value(&15.into()).unwrap(),
            Value::Int(15)
        );

        let missing = RangeParameter::new("curr", None, None, RangePolicy::Error);
        assert!(matches!(
            table.replace(Arc::new(missing)),
            Err(InstrumentError::UnknownParameterClass(_))
        ));
        assert_eq!(table.names(), vec!["volt".to_string()]);
    }

    #[rstest]
    fn test_binding_restored_on_error() {
        let param = RangeParameter::new("p", None, None, RangePolicy::Error);
        let outer: DeviceRef = Arc::new(1u8);
        let _outer = param.binding().bind(outer);

        let result: Result<(), InstrumentError> = with_device(&param, Arc::new("inner"), |p| {
            let current = p.binding().current().unwrap();
            assert!(current.downcast_ref::<&str>().is_some());
            Err(InstrumentError::InvalidArgument("failed".into()))
        });
        assert!(result.is_err());

        let current = param.binding().current().unwrap();
        assert_eq!(current.downcast_ref::<u8>(), Some(&1));
    }
}
