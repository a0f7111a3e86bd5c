//! This module provides the implementation for an instrument controlled via a serial port.
//!
//! It includes a blocking implementation of the [`InstrumentInterface`] trait using the
//! `serialport` crate. The port builder is kept around, such that the port can be closed and
//! re-opened when the [`crate::Link`] tries to recover from a broken connection.

use std::{io::Read, io::Write, time::Duration};

use serialport::{ClearBuffer, SerialPort, SerialPortBuilder};

use crate::{InstrumentError, InstrumentInterface};

/// A blocking serial port implementation using the `serialport` crate.
pub struct SerialInterface {
    builder: SerialPortBuilder,
    port: Option<Box<dyn SerialPort>>,
    terminator: String,
    timeout: Duration,
}

impl SerialInterface {
    /// Try to open a serial port with the given name and baud rate.
    ///
    /// All other settings are left at the `serialport` defaults (8N1, no flow control). The
    /// timeout is set to 3 seconds.
    ///
    /// # Arguments
    /// * `port` - The name of the serial port, e.g., `"/dev/ttyUSB0"` or `"COM3"`.
    /// * `baud_rate` - The baud rate to use.
    pub fn simple(port: &str, baud_rate: u32) -> Result<Self, InstrumentError> {
        let spb = serialport::new(port, baud_rate).timeout(Duration::from_secs(3));
        Self::full(spb)
    }

    /// Try to open a serial port from a fully configured [`SerialPortBuilder`].
    ///
    /// The terminator is by default set to `"\n"`, but can be changed using the `set_terminator`
    /// function.
    pub fn full(spb: SerialPortBuilder) -> Result<Self, InstrumentError> {
        let port = spb.clone().open()?;
        let timeout = port.timeout();
        Ok(SerialInterface {
            builder: spb,
            port: Some(port),
            terminator: "\n".to_string(),
            timeout,
        })
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, InstrumentError> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected).into())
    }
}

impl InstrumentInterface for SerialInterface {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError> {
        self.port()?.read_exact(buf)?;
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
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
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn open(&mut self) -> Result<(), InstrumentError> {
        if self.port.is_none() {
            let port = self.builder.clone().timeout(self.timeout).open()?;
            self.port = Some(port);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        self.port = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn flush_input(&mut self) -> Result<usize, InstrumentError> {
        let port = self.port()?;
        let pending = port.bytes_to_read()? as usize;
        port.clear(ClearBuffer::Input)?;
        Ok(pending)
    }
}
