//! This module provides the implementation for an instrument controlled via TCP/IP.
//!
//! It includes a blocking implementation of the [`InstrumentInterface`] trait using the
//! [`std::net::TcpStream`] struct. The resolved socket address is kept, such that the connection
//! can be re-established after a failure.

use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use crate::{InstrumentError, InstrumentInterface};

/// A blocking TCP/IP implementation using the [`std::net::TcpStream`] struct.
#[derive(Debug)]
pub struct TcpIpInterface {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    terminator: String,
    timeout: Duration,
}

impl TcpIpInterface {
    /// Try to create a new instance of `TcpIpInterface`.
    ///
    /// The terminator is by default set to `"\n"`, but can be changed using the `set_terminator`
    /// function.
    ///
    /// If no read timeout is set, which is possible for the `TcpStream`, we set a manual timeout
    /// of three seconds. This can of course be adjusted with the `set_timeout` function. The
    /// reason for this is that we do not want to infinitely block, as this is not wanted for
    /// instrument communications, especially when they are blocking.
    ///
    /// # Arguments
    /// * `sock_addr` - Socket address.
    pub fn try_new<A: ToSocketAddrs>(sock_addr: A) -> Result<Self, InstrumentError> {
        let addr = sock_addr.to_socket_addrs()?.next().ok_or_else(|| {
            InstrumentError::InvalidArgument("Socket address did not resolve".to_string())
        })?;
        let mut interface = TcpIpInterface {
            addr,
            stream: None,
            terminator: "\n".to_string(),
            timeout: Duration::from_secs(3),
        };
        interface.open()?;
        Ok(interface)
    }

    fn stream(&mut self) -> Result<&mut TcpStream, InstrumentError> {
        self.stream
            .as_mut()
            .ok_or_else(|| std::io::Error::from(ErrorKind::NotConnected).into())
    }
}

impl InstrumentInterface for TcpIpInterface {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError> {
        self.stream()?.read_exact(buf)?;
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        let stream = self.stream()?;
        stream.write_all(data)?;
        stream.flush()?;
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
        if let Some(stream) = self.stream.as_ref() {
            // a zero duration is rejected by the socket API
            let timeout = timeout.max(Duration::from_millis(1));
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn open(&mut self) -> Result<(), InstrumentError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
            let timeout = self.timeout.max(Duration::from_millis(1));
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
            self.stream = Some(stream);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        if let Some(stream) = self.stream.take() {
            stream.shutdown(std::net::Shutdown::Both)?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn flush_input(&mut self) -> Result<usize, InstrumentError> {
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut discarded = 0;
        let mut buf = [0u8; 256];
        let result = loop {
            match stream.read(&mut buf) {
                Ok(0) => break Ok(discarded),
                Ok(n) => discarded += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break Ok(discarded),
                Err(err) => break Err(err.into()),
            }
        };
        stream.set_nonblocking(false)?;
        result
    }
}
