use std::sync::Arc;

use crate::{InstrumentError, Value};

use super::{DeviceBinding, ParameterClass};

/// A chain of parameter classes.
///
/// Aliases are converted from left to right, values from right to left. Validation happens in
/// every step of the chain. A device bound to the chain is bound to each step while it runs.
pub struct CombinedParameter {
    name: String,
    steps: Vec<Arc<dyn ParameterClass>>,
    binding: DeviceBinding,
}

impl CombinedParameter {
    /// Create a new chain.
    pub fn new(name: &str, steps: Vec<Arc<dyn ParameterClass>>) -> Self {
        CombinedParameter {
            name: name.to_string(),
            steps,
            binding: DeviceBinding::default(),
        }
    }

    fn run_step(
        &self,
        step: &Arc<dyn ParameterClass>,
        f: impl FnOnce(&dyn ParameterClass) -> Result<Value, InstrumentError>,
    ) -> Result<Value, InstrumentError> {
        let _guard = self
            .binding
            .current()
            .map(|device| step.binding().bind(device));
        f(step.as_ref())
    }
}

impl ParameterClass for CombinedParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    fn alias_to_value(&self, alias: &Value) -> Result<Value, InstrumentError> {
        self.steps.iter().try_fold(alias.clone(), |acc, step| {
            self.run_step(step, |p| p.to_value(&acc))
        })
    }

    fn value_to_alias(&self, value: &Value) -> Result<Value, InstrumentError> {
        self.steps.iter().rev().try_fold(value.clone(), |acc, step| {
            self.run_step(step, |p| p.to_alias(&acc))
        })
    }
}
