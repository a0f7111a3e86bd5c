//! InstrumentCore: the communication core shared by (scientific) instrument drivers
//!
//! Every instrument driver needs the same few things: send commands, read replies, survive a
//! flaky cable, turn replies into typed values, and expose its settings in a uniform way. This
//! crate provides these building blocks so that a driver only has to declare its command table.
//!
//! # Building blocks
//!
//! - [`InstrumentInterface`]: the byte-oriented transport trait, implemented for any
//!   [`std::io::Read`] + [`std::io::Write`] port ([`Instrument`]), TCP/IP ([`TcpIpInterface`]),
//!   serial ports ([`SerialInterface`], feature `serial`) and loopback test interfaces.
//! - [`SharedInterface`]: a transport that several callers share, with a timeout-bounded scoped
//!   hold.
//! - [`Link`]: the retry/recovery engine with fail-safe mode, reconnects and write coalescing.
//! - [`Codec`]: composes commands from typed arguments and parses replies, including IEEE-488.2
//!   definite length binary blocks ([`decode_array`], [`read_binary_array`]).
//! - Parameter classes ([`RangeParameter`], [`EnumParameter`], [`FunctionParameter`],
//!   [`CombinedParameter`]) that convert between user-facing aliases and wire values, and
//!   [`ParameterSubstitution`] to apply them at call sites.
//! - [`DeviceVariables`]: a registry of named settings/status/info accessors with bulk
//!   [`DeviceVariableAccess::get_settings`] and [`DeviceVariableAccess::apply_settings`].
//! - [`ScpiDevice`]: puts all of the above together for SCPI-style instruments.
//!
//! # Example
//!
//! ```no_run
//! use instrumentcore::{DataType, DeviceConfig, ScpiDevice, TcpIpInterface};
//!
//! let interface = TcpIpInterface::try_new("192.168.10.1:5025").unwrap();
//! let mut dev = ScpiDevice::new(interface, DeviceConfig::default());
//!
//! println!("{}", dev.get_id().unwrap());
//! let volts = dev.ask("VOLT?", &DataType::Float).unwrap();
//! println!("Voltage: {volts}");
//! ```
//!
//! # License
//!
//! Licensed under either of
//!
//! - Apache License, Version 2.0 ([LICENSE-APACHE](http://www.apache.org/licenses/LICENSE-2.0))
//! - MIT license ([LICENSE-MIT](http://opensource.org/licenses/MIT))
//!
//! at your option.

#![warn(missing_docs)]

use std::time::{Duration, Instant};

mod codec;
mod config;
mod instrument;
mod link;
mod loopback;
mod parameter;
mod registry;
mod scpi;
#[cfg(feature = "serial")]
mod serial;
mod shared;
mod substitute;
mod tcp_ip;
mod value;

pub use codec::{
    ArgType, ByteOrder, Codec, DataType, NumericArray, NumericFormat, NumericKind, ParseFn,
    decode_array, read_binary_array,
};
pub use config::{CodecConfig, DeviceConfig, FloatFormat, LinkConfig};
pub use instrument::{ErrorKind, Instrument, InstrumentError};
pub use link::{Link, ReadRequest, WriteScope};
pub use loopback::{LoopbackInterfaceBytes, LoopbackInterfaceString};
pub use parameter::{
    AllowedAlias, AllowedValue, BindingGuard, CaseNormalization, CheckFn, CombinedParameter,
    ConvertFn, DeviceBinding, DeviceRef, EnumParameter, FunctionParameter, ParameterClass,
    ParameterTable, RangeParameter, RangePolicy, with_device,
};
pub use registry::{
    Accessor, DeviceVariableAccess, DeviceVariables, Include, Multiplex, VariableKind,
    VariableSpec, VariableValues,
};
pub use scpi::{MatchMode, ScpiDevice, ScpiParameterDescriptor, ScpiParameterKind};
#[cfg(feature = "serial")]
pub use serial::SerialInterface;
pub use shared::{InterfaceHold, SharedInterface};
pub use substitute::{CallArg, ParameterSubstitution, ReturnParameters, SubstitutionMode};
pub use tcp_ip::TcpIpInterface;
pub use value::Value;

/// The `InstrumentInterface` trait defines the byte-oriented transport of an instrument.
///
/// Implementors only have to provide [`InstrumentInterface::read_exact`] and
/// [`InstrumentInterface::write_raw`]. Everything else has a default implementation that can be
/// overwritten where the transport knows better, e.g., serial ports that can actually change
/// their timeout or TCP/IP connections that can be re-opened.
pub trait InstrumentInterface {
    /// Read exactly as many bytes as fit into the buffer.
    ///
    /// # Arguments:
    /// - `buf` - The buffer to fill.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError>;

    /// Write raw bytes to the instrument and flush the interface.
    ///
    /// # Arguments:
    /// - `data` - The bytes to send, no terminator is appended.
    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError>;

    /// Get the terminator of the interface. Defaults to `"\n"`.
    fn get_terminator(&self) -> &str {
        "\n"
    }

    /// Set the terminator of an interface from a `&str`.
    ///
    /// # Arguments:
    /// - `_terminator` - A string slice that will be used as the terminator for commands
    fn set_terminator(&mut self, _terminator: &str) {}

    /// Get the read timeout of the interface. Defaults to three seconds.
    fn get_timeout(&self) -> Duration {
        Duration::from_secs(3)
    }

    /// Set the read timeout of the interface.
    ///
    /// The default implementation ignores the new timeout.
    fn set_timeout(&mut self, _timeout: Duration) -> Result<(), InstrumentError> {
        Ok(())
    }

    /// (Re-)open the underlying connection. A no-op by default.
    fn open(&mut self) -> Result<(), InstrumentError> {
        Ok(())
    }

    /// Close the underlying connection. A no-op by default.
    fn close(&mut self) -> Result<(), InstrumentError> {
        Ok(())
    }

    /// Returns `true` if the underlying connection is open.
    fn is_open(&self) -> bool {
        true
    }

    /// Discard all bytes that are waiting to be read and return how many were discarded.
    fn flush_input(&mut self) -> Result<usize, InstrumentError> {
        Ok(0)
    }

    /// Write a string to the instrument without appending the terminator.
    fn write(&mut self, data: &str) -> Result<(), InstrumentError> {
        self.write_raw(data.as_bytes())
    }

    /// Send a command to the instrument.
    ///
    /// This function takes the command, appends the terminator, and writes it to the instrument.
    ///
    /// # Arguments:
    /// - `cmd` - A string slice that will be sent to the instrument.
    fn sendcmd(&mut self, cmd: &str) -> Result<(), InstrumentError> {
        let cmd = format!("{cmd}{}", self.get_terminator());
        self.write_raw(cmd.as_bytes())
    }

    /// Read bytes until the terminator is found.
    ///
    /// Bytes are read one at a time until the line ends with the terminator. If no terminator is
    /// encountered within the timeout of the interface, [`InstrumentError::Timeout`] is returned.
    ///
    /// # Arguments:
    /// - `strip_terminator` - Remove the terminator from the returned bytes.
    fn read_line(&mut self, strip_terminator: bool) -> Result<Vec<u8>, InstrumentError> {
        let terminator = self.get_terminator().as_bytes().to_vec();
        let timeout = self.get_timeout();
        let mut line = Vec::new();
        let mut single_buf = [0u8];

        let tic = Instant::now();
        while tic.elapsed() < timeout {
            self.read_exact(&mut single_buf)?;
            line.push(single_buf[0]);
            if !terminator.is_empty() && line.ends_with(&terminator) {
                if strip_terminator {
                    line.truncate(line.len() - terminator.len());
                }
                return Ok(line);
            }
        }
        Err(InstrumentError::Timeout(timeout))
    }

    /// Read one line from the instrument and return it as a trimmed string.
    ///
    /// Invalid UTF-8 is replaced with the replacement character.
    fn read_until_terminator(&mut self) -> Result<String, InstrumentError> {
        let line = self.read_line(true)?;
        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }

    /// Query the instrument with a command and return the response as a String.
    ///
    /// # Arguments
    /// * `cmd` - The command to send to the instrument for which we expect a response.
    fn query(&mut self, cmd: &str) -> Result<String, InstrumentError> {
        self.sendcmd(cmd)?;
        match self.read_until_terminator() {
            Err(InstrumentError::Timeout(timeout)) => Err(InstrumentError::TimeoutQuery {
                query: cmd.to_string(),
                timeout,
            }),
            other => other,
        }
    }
}
