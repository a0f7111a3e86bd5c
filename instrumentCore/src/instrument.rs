//! This module provides the generic implementation of the [`InstrumentInterface`] trait and the
//! error type that every part of the communication core returns.
//!
//! The generic [`Instrument`] can be called with any type that implements [`std::io::Read`] and
//! [`std::io::Write`], such as [`std::net::TcpStream`] or [`serialport::SerialPort`].

use std::time::Duration;

use thiserror::Error;

use crate::InstrumentInterface;

/// A general instrument interface that can be built with any interface that implements
/// [`std::io::Read`] and [`std::io::Write`].
///
/// The generic interface cannot re-open the underlying port, so reconnection attempts of the
/// [`crate::Link`] degrade to draining the input. Use [`crate::TcpIpInterface`] or
/// [`crate::SerialInterface`] if reconnection matters.
///
/// # Example
///
/// ```no_run
/// use std::{net::TcpStream, time::Duration};
///
/// use instrumentcore::Instrument;
///
/// let my_interface = TcpStream::connect("192.168.10.1:8000").unwrap();
/// let inst_interface = Instrument::new(my_interface, Duration::from_secs(3));
/// ```
pub struct Instrument<P: std::io::Read + std::io::Write> {
    port: P,
    terminator: String,
    timeout: Duration,
}

impl<P: std::io::Read + std::io::Write> Instrument<P> {
    /// Create a new instance of [`Instrument`] with a given port.
    pub fn new(port: P, timeout: Duration) -> Self {
        Self {
            port,
            terminator: "\n".to_string(),
            timeout,
        }
    }

    /// Consume the instrument and hand back the underlying port.
    pub fn into_inner(self) -> P {
        self.port
    }
}

impl<P: std::io::Read + std::io::Write> InstrumentInterface for Instrument<P> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError> {
        self.port.read_exact(buf)?;
        Ok(())
    }

    fn get_terminator(&self) -> &str {
        self.terminator.as_str()
    }

    fn set_terminator(&mut self, terminator: &str) {
        self.terminator = terminator.to_string();
    }

    fn get_timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), InstrumentError> {
        self.timeout = timeout;
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }
}

/// Flat classification of an [`InstrumentError`].
///
/// Device variables use sets of error kinds to decide which failures are ignored during bulk
/// reads and writes, and the [`crate::Link`] only recovers from [`ErrorKind::Link`] failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Any I/O failure of the transport, including read timeouts.
    Link,
    /// The scoped hold on the transport could not be acquired in time.
    LockTimeout,
    /// A binary frame did not follow the `#<n><length><payload>` layout.
    MalformedFrame,
    /// A reply could not be parsed into the requested type.
    MalformedReply,
    /// Two lengths that must agree did not.
    LengthMismatch,
    /// A type tag is not known to the codec.
    UnrecognizedType,
    /// A reply token is not part of a lookup map.
    UnknownKey,
    /// A value or alias was rejected by a parameter class.
    ParameterValidation,
    /// No device variable with the given name is registered.
    UnknownVariable,
    /// The device variable exists, but lacks the requested getter or setter.
    NoAccessor,
    /// No parameter class with the given name is registered.
    UnknownParameterClass,
    /// A caller passed an argument that is not allowed.
    InvalidArgument,
    /// The configuration could not be read.
    Config,
    /// The interface does not support the requested operation.
    NotSupported,
}

/// The error enum for all instruments.
///
/// For any command sending or querying, your instrument should return either an empty result or a
/// result with the query where this Error is the alternative. [`InstrumentError`] makes it easy to
/// propagate all the sending commands, querying errors forward with the `?` operator such that
/// errors propagate nicely. If this is not possible, it is considered a bug and should be
/// reported.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstrumentError {
    /// The configuration could not be loaded. Contains the message of the underlying parser.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The called command is not supported by this interface.
    #[error("This command is not supported by this interface.")]
    InterfaceCommandNotSupported,
    /// Error when an invalid argument is passed to a function. This error contains only an error
    /// message, but no arguments. It is intended for the user.
    #[error("{0}")]
    InvalidArgument(String),
    /// Error when reading from/writing to an interface. See [`std::io::Error`] for more details.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Two lengths that must agree did not, e.g., the declared and the actual length of a binary
    /// payload. The context contains (at most 20 bytes of) the offending data.
    #[error("Length mismatch: expected {expected}, got {actual} ({context})")]
    LengthMismatch {
        /// The expected length.
        expected: usize,
        /// The length that was found.
        actual: usize,
        /// Human readable context of where the mismatch occurred.
        context: String,
    },
    /// The scoped hold on a shared interface could not be acquired within the timeout.
    #[error("Could not acquire the interface within {0:?}.")]
    LockTimeout(Duration),
    /// A binary frame received from the instrument is malformed.
    #[error("Malformed binary frame: {0}")]
    MalformedFrame(String),
    /// Instrument response could not be parsed becuase it was unexpected by the driver. This error
    /// contains the response that was received from the instrument.
    #[error("Response from instrument could not be parsed. Response was: {0}")]
    MalformedReply(String),
    /// A device variable exists, but does not have the requested accessor.
    #[error("Device variable '{name}' has no {accessor}")]
    NoAccessor {
        /// Name of the device variable.
        name: String,
        /// Either `"getter"` or `"setter"`.
        accessor: &'static str,
    },
    /// An alias or value was rejected by a parameter class. The message describes the allowed
    /// range or set.
    #[error("Parameter '{parameter}': {message}")]
    ParameterValidation {
        /// Name of the parameter class that rejected the value.
        parameter: String,
        /// Human readable description of what is allowed.
        message: String,
    },
    #[cfg(feature = "serial")]
    /// Serial port errors can occur when opening a serial interface. See the [`serialport::Error`]
    /// documentation for more information.
    #[error(transparent)]
    Serialport(#[from] serialport::Error),
    /// Timeout occurred while waiting for a response from the instrument. The error contains the
    /// timeout that was exceeded.
    #[error(
        "Timeout occured while waiting for a response from the instrument. Timeout was set to {0:?}."
    )]
    Timeout(Duration),
    /// Timeout occurred while waiting for a response to a query. The error contains the query
    /// that was sent and the timeout that was exceeded.
    #[error(
        "Timeout occured while waiting for a response to query: {query}. Timeout was set to {timeout:?}."
    )]
    TimeoutQuery {
        /// The query that timed out.
        query: String,
        /// The timeout that was set.
        timeout: Duration,
    },
    /// A reply token could not be found in a lookup map.
    #[error("Reply '{0}' is not a known key")]
    UnknownKey(String),
    /// No parameter class with the given name is registered.
    #[error("Unknown parameter class '{0}'")]
    UnknownParameterClass(String),
    /// No device variable with the given name is registered.
    #[error("Unknown device variable '{0}'")]
    UnknownVariable(String),
    /// A type tag passed to the codec is not recognized.
    #[error("Unrecognized type: {0}")]
    UnrecognizedType(String),
}

impl InstrumentError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstrumentError::Config(_) => ErrorKind::Config,
            InstrumentError::InterfaceCommandNotSupported => ErrorKind::NotSupported,
            InstrumentError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            InstrumentError::Io(_)
            | InstrumentError::Timeout(_)
            | InstrumentError::TimeoutQuery { .. } => ErrorKind::Link,
            #[cfg(feature = "serial")]
            InstrumentError::Serialport(_) => ErrorKind::Link,
            InstrumentError::LengthMismatch { .. } => ErrorKind::LengthMismatch,
            InstrumentError::LockTimeout(_) => ErrorKind::LockTimeout,
            InstrumentError::MalformedFrame(_) => ErrorKind::MalformedFrame,
            InstrumentError::MalformedReply(_) => ErrorKind::MalformedReply,
            InstrumentError::NoAccessor { .. } => ErrorKind::NoAccessor,
            InstrumentError::ParameterValidation { .. } => ErrorKind::ParameterValidation,
            InstrumentError::UnknownKey(_) => ErrorKind::UnknownKey,
            InstrumentError::UnknownParameterClass(_) => ErrorKind::UnknownParameterClass,
            InstrumentError::UnknownVariable(_) => ErrorKind::UnknownVariable,
            InstrumentError::UnrecognizedType(_) => ErrorKind::UnrecognizedType,
        }
    }

    /// Returns `true` if the error is a transport failure that a retry may fix.
    pub fn is_link_error(&self) -> bool {
        self.kind() == ErrorKind::Link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_classification() {
        let io = InstrumentError::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(io.is_link_error());
        assert!(InstrumentError::Timeout(Duration::from_secs(1)).is_link_error());
        assert!(!InstrumentError::MalformedFrame("x".into()).is_link_error());
        assert!(!InstrumentError::LockTimeout(Duration::from_secs(1)).is_link_error());
    }
}
