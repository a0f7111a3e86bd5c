//! Facade for SCPI-style instruments.
//!
//! A [`ScpiDevice`] combines a [`Link`], a [`Codec`], a command validity cache, the parameter
//! table, the device variable registry, and a table of SCPI parameter descriptors. Drivers
//! usually wrap a `ScpiDevice` and only declare their commands.

use std::{collections::HashMap, sync::Arc, thread, time::Duration};

use log::debug;

use crate::{
    ArgType, CallArg, Codec, DataType, DeviceConfig, DeviceVariableAccess, DeviceVariables,
    EnumParameter, InstrumentError, InstrumentInterface, Link, NumericArray, NumericFormat,
    ParameterClass, ParameterSubstitution, ParameterTable, ReadRequest, SharedInterface, Value,
    VariableKind, VariableSpec, codec, decode_array,
};

/// Value type of a [`ScpiParameterDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScpiParameterKind {
    /// Free text.
    String,
    /// An integer.
    Int,
    /// A float.
    Float,
    /// A boolean.
    Bool,
    /// One of a fixed set of options.
    Enum,
}

/// How enum replies are matched against the options of a [`ScpiParameterDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Accept replies that start with an option, e.g. `INTERNAL` for `INT`.
    #[default]
    Prefix,
    /// Only accept the option itself.
    Exact,
}

/// A SCPI parameter that is read with `COMMAND?` and written with `COMMAND value`.
///
/// # Example
/// ```
/// use instrumentcore::{MatchMode, ScpiParameterDescriptor};
///
/// let source = ScpiParameterDescriptor::enumeration(
///     "TRIG:SOUR",
///     [("internal", "INT"), ("external", "EXT"), ("bus", "BUS")],
///     MatchMode::Prefix,
/// );
/// ```
#[derive(Debug)]
pub struct ScpiParameterDescriptor {
    command: String,
    kind: ScpiParameterKind,
    options: Option<EnumParameter>,
    set_delay: Duration,
}

impl ScpiParameterDescriptor {
    /// Describe a parameter of a plain value type. Use
    /// [`ScpiParameterDescriptor::enumeration`] for [`ScpiParameterKind::Enum`].
    pub fn new(command: &str, kind: ScpiParameterKind) -> Self {
        ScpiParameterDescriptor {
            command: command.to_string(),
            kind,
            options: None,
            set_delay: Duration::ZERO,
        }
    }

    /// Describe an enum parameter with `(alias, device token)` options.
    pub fn enumeration<'a, I>(command: &str, options: I, match_mode: MatchMode) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let options = EnumParameter::new(command, options)
            .value_case(crate::CaseNormalization::Upper)
            .match_prefix(match_mode == MatchMode::Prefix);
        ScpiParameterDescriptor {
            command: command.to_string(),
            kind: ScpiParameterKind::Enum,
            options: Some(options),
            set_delay: Duration::ZERO,
        }
    }

    /// Wait this long after a write before reading the value back.
    pub fn with_set_delay(mut self, delay: Duration) -> Self {
        self.set_delay = delay;
        self
    }

    /// The command header.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The value type.
    pub fn kind(&self) -> ScpiParameterKind {
        self.kind
    }

    fn data_type(&self) -> DataType {
        match self.kind {
            ScpiParameterKind::String | ScpiParameterKind::Enum => DataType::String,
            ScpiParameterKind::Int => DataType::Int,
            ScpiParameterKind::Float => DataType::Float,
            ScpiParameterKind::Bool => DataType::Bool,
        }
    }

    fn arg_type(&self) -> ArgType {
        match self.kind {
            ScpiParameterKind::String | ScpiParameterKind::Enum => ArgType::String,
            ScpiParameterKind::Int => ArgType::Int,
            ScpiParameterKind::Float => ArgType::Float,
            ScpiParameterKind::Bool => ArgType::Bool,
        }
    }
}

/// A SCPI-style instrument.
///
/// All communication runs through the [`Link`], so fail-safe retries, the shared interface hold,
/// and write buffering apply to every method.
pub struct ScpiDevice<T: InstrumentInterface> {
    link: Link<T>,
    codec: Codec,
    validity_cache: HashMap<String, bool>,
    parameters: ParameterTable,
    variables: DeviceVariables<ScpiDevice<T>>,
    scpi_parameters: HashMap<String, Arc<ScpiParameterDescriptor>>,
}

impl<T: InstrumentInterface + 'static> ScpiDevice<T> {
    /// Create a new device that exclusively owns its interface.
    pub fn new(interface: T, config: DeviceConfig) -> Self {
        Self::from_shared(SharedInterface::new(interface), config)
    }

    /// Create a new device on a shared interface.
    pub fn from_shared(interface: SharedInterface<T>, config: DeviceConfig) -> Self {
        let link = Link::from_shared(interface, config.link)
            .with_separator(&config.codec.write_separator);
        ScpiDevice {
            link,
            codec: Codec::new(config.codec),
            validity_cache: HashMap::new(),
            parameters: ParameterTable::new(),
            variables: DeviceVariables::new(),
            scpi_parameters: HashMap::new(),
        }
    }

    /// The link of this device.
    pub fn link(&self) -> &Link<T> {
        &self.link
    }

    /// The link of this device, mutable.
    pub fn link_mut(&mut self) -> &mut Link<T> {
        &mut self.link
    }

    /// The codec of this device.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Send a command without argument.
    pub fn write(&mut self, msg: &str) -> Result<(), InstrumentError> {
        self.write_command(msg, None, None, None, None)
    }

    /// Compose and send a command.
    ///
    /// # Arguments
    /// * `msg` - The command header.
    /// * `arg` - Optional argument, see [`Codec::compose`].
    /// * `arg_type` - How to convert the argument, detected from the value if `None`.
    /// * `unit` - Unit appended after the argument.
    /// * `wait_sync` - Wait for the operation to complete, defaults to
    ///   [`crate::LinkConfig::write_sync`].
    pub fn write_command(
        &mut self,
        msg: &str,
        arg: Option<&Value>,
        arg_type: Option<&ArgType>,
        unit: Option<&str>,
        wait_sync: Option<bool>,
    ) -> Result<(), InstrumentError> {
        let cmd = self.codec.compose(msg, arg, arg_type, unit, None)?;
        self.link.write_retry(&cmd, false)?;
        if wait_sync.unwrap_or(self.link.config().write_sync) {
            self.wait_sync()?;
        }
        Ok(())
    }

    /// Send a query and parse the reply.
    pub fn ask(&mut self, msg: &str, data_type: &DataType) -> Result<Value, InstrumentError> {
        self.ask_delayed(msg, data_type, Duration::ZERO)
    }

    /// Send a query, wait for `delay`, and parse the reply.
    pub fn ask_delayed(
        &mut self,
        msg: &str,
        data_type: &DataType,
        delay: Duration,
    ) -> Result<Value, InstrumentError> {
        let reply = self.link.ask_retry(msg, delay, ReadRequest::new())?;
        self.codec.parse(&reply, data_type)
    }

    /// Send a query and return the reply with the options of `request`.
    pub fn ask_raw(
        &mut self,
        msg: &str,
        request: ReadRequest<'_>,
    ) -> Result<Vec<u8>, InstrumentError> {
        self.link.ask_retry(msg, Duration::ZERO, request)
    }

    /// Read a reply and parse it.
    pub fn read(&mut self, data_type: &DataType) -> Result<Value, InstrumentError> {
        let reply = self.link.read_retry(ReadRequest::new())?;
        self.codec.parse(&reply, data_type)
    }

    /// Discard pending input and return the number of discarded bytes.
    pub fn flush(&mut self) -> Result<usize, InstrumentError> {
        self.link.flush_input()
    }

    /// Close and re-open the interface.
    pub fn reconnect(&mut self) -> Result<(), InstrumentError> {
        self.link.reconnect()
    }

    /// Run one recovery step, see [`Link::recover`].
    pub fn recover(&mut self, attempt: u32) {
        self.link.recover(attempt);
    }

    /// Identification string (`*IDN?`).
    pub fn get_id(&mut self) -> Result<String, InstrumentError> {
        let id = self.ask("*IDN?", &DataType::String)?;
        Ok(id.to_string())
    }

    /// Reset the instrument (`*RST`).
    pub fn reset(&mut self) -> Result<(), InstrumentError> {
        self.write("*RST")
    }

    /// Clear the status registers (`*CLS` by default).
    pub fn clear_status(&mut self) -> Result<(), InstrumentError> {
        let cmd = self.codec.config().clear_status_command.clone();
        self.write(&cmd)
    }

    /// Block until all pending operations are complete (`*OPC?` by default).
    pub fn wait_sync(&mut self) -> Result<(), InstrumentError> {
        let query = self.codec.config().sync_query.clone();
        self.ask(&query, &DataType::Int).map(|_| ())
    }

    /// Event status register (`*ESR?` by default).
    pub fn get_esr(&mut self) -> Result<i64, InstrumentError> {
        let query = self.codec.config().status_query.clone();
        self.ask(&query, &DataType::Int)?.to_i64()
    }

    /// Status byte (`*STB?`).
    pub fn get_stb(&mut self) -> Result<i64, InstrumentError> {
        self.ask("*STB?", &DataType::Int)?.to_i64()
    }

    /// Check whether the instrument accepts `cmd`.
    ///
    /// The command is sent, any reply is discarded, and the event status register is tested
    /// against [`crate::CodecConfig::parse_error_mask`].
    ///
    /// # Arguments
    /// * `cmd` - The exact command to test.
    /// * `cached` - Use and update the validity cache.
    /// * `clear_status_first` - Clear the status registers before sending the command.
    pub fn is_command_valid(
        &mut self,
        cmd: &str,
        cached: bool,
        clear_status_first: bool,
    ) -> Result<bool, InstrumentError> {
        if cached {
            if let Some(valid) = self.validity_cache.get(cmd) {
                return Ok(*valid);
            }
        }
        if clear_status_first {
            self.clear_status()?;
        }
        self.write(cmd)?;
        // Inside a write buffer scope the command is still pending.
        self.link.flush_write_buffer()?;
        self.flush()?;
        let esr = self.get_esr()?;
        let valid = esr & i64::from(self.codec.config().parse_error_mask) == 0;
        debug!("Command {cmd} is {}", if valid { "valid" } else { "invalid" });
        if cached {
            self.validity_cache.insert(cmd.to_string(), valid);
        }
        Ok(valid)
    }

    /// Run `f` inside a write buffer scope, see [`Link::with_write_buffer`].
    pub fn with_write_buffer<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, InstrumentError>,
    ) -> Result<R, InstrumentError> {
        self.link.begin_write_buffer();
        let result = f(self);
        let flushed = self.link.end_write_buffer();
        let value = result?;
        flushed?;
        Ok(value)
    }

    /// Read a binary block, see [`crate::read_binary_array`].
    pub fn read_binary_array(
        &mut self,
        include_header: bool,
        flush_trailing_line: bool,
    ) -> Result<Vec<u8>, InstrumentError> {
        self.link.read_with(|intf| {
            codec::read_binary_array(intf, include_header, flush_trailing_line)
        })
    }

    /// Send a query and read a binary block under a single hold.
    pub fn ask_binary_array(
        &mut self,
        msg: &str,
        include_header: bool,
        flush_trailing_line: bool,
    ) -> Result<Vec<u8>, InstrumentError> {
        self.link.ask_with(msg, |intf| {
            codec::read_binary_array(intf, include_header, flush_trailing_line)
        })
    }

    /// Send a query and decode the binary block reply, e.g. a waveform.
    pub fn ask_array(
        &mut self,
        msg: &str,
        format: &NumericFormat,
    ) -> Result<NumericArray, InstrumentError> {
        let frame = self.ask_binary_array(msg, true, true)?;
        decode_array(&frame, format, true)
    }

    /// The parameter table.
    pub fn parameters(&self) -> &ParameterTable {
        &self.parameters
    }

    /// Register a parameter class.
    pub fn add_parameter_class<P: ParameterClass + 'static>(
        &mut self,
        class: P,
    ) -> Result<(), InstrumentError> {
        self.parameters.add(class)
    }

    /// Replace a registered parameter class.
    pub fn replace_parameter_class(
        &mut self,
        class: Arc<dyn ParameterClass>,
    ) -> Result<(), InstrumentError> {
        self.parameters.replace(class)
    }

    /// Look up a parameter class.
    pub fn get_parameter_class(
        &self,
        name: &str,
    ) -> Result<Arc<dyn ParameterClass>, InstrumentError> {
        self.parameters.get(name)
    }

    /// Names of all registered parameter classes.
    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters.names()
    }

    /// Call `f` with the arguments converted by `substitution`, and convert its return value.
    pub fn call_substituted<F>(
        &mut self,
        substitution: &ParameterSubstitution,
        args: Vec<CallArg>,
        f: F,
    ) -> Result<Value, InstrumentError>
    where
        F: FnOnce(&mut Self, Vec<Value>) -> Result<Value, InstrumentError>,
    {
        let values = substitution.substitute_inputs(&self.parameters, args)?;
        let result = f(self, values)?;
        substitution.substitute_output(&self.parameters, result)
    }

    /// Register a SCPI parameter and a settings variable of the same name.
    pub fn add_scpi_parameter(
        &mut self,
        name: &str,
        descriptor: ScpiParameterDescriptor,
    ) -> Result<(), InstrumentError> {
        self.scpi_parameters
            .insert(name.to_string(), Arc::new(descriptor));
        let get_name = name.to_string();
        let set_name = name.to_string();
        self.add_device_variable(
            VariableSpec::new(name, VariableKind::Settings)
                .getter(move |dev: &mut Self, _| dev.get_scpi_parameter(&get_name))
                .setter(move |dev: &mut Self, args| {
                    let value = args.first().cloned().unwrap_or_default();
                    dev.set_scpi_parameter(&set_name, value)
                }),
        )
    }

    fn scpi_parameter(&self, name: &str) -> Result<Arc<ScpiParameterDescriptor>, InstrumentError> {
        self.scpi_parameters
            .get(name)
            .cloned()
            .ok_or_else(|| InstrumentError::UnknownKey(format!("SCPI parameter '{name}'")))
    }

    /// Query a SCPI parameter. Enum replies are converted to their alias.
    pub fn get_scpi_parameter(&mut self, name: &str) -> Result<Value, InstrumentError> {
        let desc = self.scpi_parameter(name)?;
        let reply = self.ask(&format!("{}?", desc.command), &desc.data_type())?;
        match &desc.options {
            Some(options) => options.to_alias(&reply),
            None => Ok(reply),
        }
    }

    /// Set a SCPI parameter and return the value read back from the instrument.
    pub fn set_scpi_parameter(
        &mut self,
        name: &str,
        value: Value,
    ) -> Result<Value, InstrumentError> {
        let desc = self.scpi_parameter(name)?;
        let wire = match &desc.options {
            Some(options) => options.to_value(&value)?,
            None => value,
        };
        self.write_command(&desc.command, Some(&wire), Some(&desc.arg_type()), None, None)?;
        if !desc.set_delay.is_zero() {
            thread::sleep(desc.set_delay);
        }
        self.get_scpi_parameter(name)
    }

    /// Register the variables every SCPI instrument has: the identification string.
    pub fn add_standard_variables(&mut self) -> Result<(), InstrumentError> {
        self.add_device_variable(
            VariableSpec::new("idn", VariableKind::Info)
                .getter(|dev: &mut Self, _| dev.get_id().map(Value::from)),
        )
    }
}

impl<T: InstrumentInterface + 'static> DeviceVariableAccess for ScpiDevice<T> {
    fn device_variables(&self) -> &DeviceVariables<Self> {
        &self.variables
    }

    fn device_variables_mut(&mut self) -> &mut DeviceVariables<Self> {
        &mut self.variables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LoopbackInterfaceString;
    use rstest::*;

    fn device(from_host: Vec<&str>, from_inst: Vec<&str>) -> ScpiDevice<LoopbackInterfaceString> {
        ScpiDevice::new(
            LoopbackInterfaceString::new(from_host, from_inst, "\n"),
            DeviceConfig::default(),
        )
    }

    #[rstest]
    fn test_validity_cache() {
        let mut dev = device(vec!["*CLS", "SYST:BEEP", "*ESR?"], vec!["32"]);
        assert!(!dev.is_command_valid("SYST:BEEP", true, true).unwrap());
        // Second call is served from the cache, nothing is sent.
        assert!(!dev.is_command_valid("SYST:BEEP", true, true).unwrap());
    }

    #[rstest]
    fn test_write_sync() {
        let mut dev = device(vec!["INIT", "*OPC?"], vec!["1"]);
        dev.write_command("INIT", None, None, None, Some(true))
            .unwrap();
    }

    #[rstest]
    fn test_unknown_scpi_parameter() {
        let mut dev = device(vec![], vec![]);
        assert!(matches!(
            dev.get_scpi_parameter("missing"),
            Err(InstrumentError::UnknownKey(_))
        ));
    }
}
