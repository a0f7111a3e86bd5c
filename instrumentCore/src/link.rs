//! The retry/recovery engine that sits between a driver and its transport.
//!
//! A [`Link`] wraps a [`SharedInterface`] and provides writes, reads, and queries that
//!
//! - take the scoped hold on the interface for the whole request,
//! - retry after link errors when fail-safe mode is enabled, alternating between a reconnect and
//!   a lighter drain-and-probe recovery,
//! - coalesce writes inside a write buffer scope into a single transmission.

use std::{
    ops::{Deref, DerefMut},
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use crate::{InstrumentError, InstrumentInterface, LinkConfig, SharedInterface};

/// Options of a single read.
///
/// By default a line is read, the terminator is stripped, the operation timeout of the link is
/// used, and link errors are retried in fail-safe mode.
pub struct ReadRequest<'a> {
    raw: bool,
    size: Option<usize>,
    timeout: Option<Duration>,
    wait_callback: Option<&'a mut dyn FnMut()>,
    retry: bool,
}

impl Default for ReadRequest<'_> {
    fn default() -> Self {
        ReadRequest {
            raw: false,
            size: None,
            timeout: None,
            wait_callback: None,
            retry: true,
        }
    }
}

impl<'a> ReadRequest<'a> {
    /// Create a request with the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the terminator in the returned bytes.
    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// Read exactly `size` bytes instead of a line.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Override the operation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Call `callback` between read attempts while waiting for a slow reply.
    pub fn wait_callback(mut self, callback: &'a mut dyn FnMut()) -> Self {
        self.wait_callback = Some(callback);
        self
    }

    /// Disable retries for this request.
    pub fn no_retry(mut self) -> Self {
        self.retry = false;
        self
    }
}

/// Pending buffered writes.
#[derive(Debug, Default)]
struct WriteBuffer {
    pending: Option<String>,
    depth: usize,
}

impl WriteBuffer {
    fn push(&mut self, msg: &str, separator: &str) {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.push_str(separator);
                pending.push_str(msg);
            }
            None => self.pending = Some(msg.to_string()),
        }
    }

    /// Take the pending content, with `msg` appended if given.
    fn take_with(&mut self, msg: Option<&str>, separator: &str) -> Option<String> {
        if let Some(msg) = msg {
            self.push(msg, separator);
        }
        self.pending.take()
    }
}

/// The retry/recovery engine.
///
/// Without fail-safe mode, every link error is returned to the caller immediately. With
/// fail-safe mode, an operation that fails with a link error is retried up to
/// [`LinkConfig::retry_times`] times. Before each retry, the link sleeps for
/// [`LinkConfig::retry_delay`] and recovers: on even attempts the interface is closed and
/// re-opened, on odd attempts pending input is drained and the recovery probe is sent. Errors
/// during recovery are logged and otherwise ignored.
pub struct Link<T: InstrumentInterface> {
    interface: SharedInterface<T>,
    config: LinkConfig,
    separator: String,
    buffer: WriteBuffer,
}

impl<T: InstrumentInterface> Link<T> {
    /// Create a new link that exclusively owns the interface.
    pub fn new(interface: T, config: LinkConfig) -> Self {
        Self::from_shared(SharedInterface::new(interface), config)
    }

    /// Create a new link on an interface that might be shared with other callers.
    pub fn from_shared(interface: SharedInterface<T>, config: LinkConfig) -> Self {
        Link {
            interface,
            config,
            separator: ";".to_string(),
            buffer: WriteBuffer::default(),
        }
    }

    /// Set the separator that joins buffered writes. Defaults to `";"`.
    pub fn with_separator(mut self, separator: &str) -> Self {
        self.separator = separator.to_string();
        self
    }

    /// The configuration of this link.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// The shared interface of this link.
    pub fn interface(&self) -> &SharedInterface<T> {
        &self.interface
    }

    /// Take the scoped hold on the interface with the operation timeout.
    pub fn hold(&self) -> Result<crate::InterfaceHold<'_, T>, InstrumentError> {
        self.interface.hold(self.config.timeout)
    }

    /// Current nesting depth of write buffer scopes.
    pub fn buffer_depth(&self) -> usize {
        self.buffer.depth
    }

    /// Buffered content that was not sent yet.
    pub fn pending_write(&self) -> Option<&str> {
        self.buffer.pending.as_deref()
    }

    /// Write a message to the instrument.
    ///
    /// Inside a write buffer scope and with `flush` set to `false`, the message is appended to the
    /// buffer. Otherwise the buffer and the message are sent as one command.
    pub fn write_retry(&mut self, msg: &str, flush: bool) -> Result<(), InstrumentError> {
        if self.buffer.depth > 0 && !flush {
            trace!("Buffering: {msg}");
            self.buffer.push(msg, &self.separator);
            return Ok(());
        }
        match self.buffer.take_with(Some(msg), &self.separator) {
            Some(outgoing) => self.send(&outgoing),
            None => Ok(()),
        }
    }

    /// Send all buffered writes, if any.
    pub fn flush_write_buffer(&mut self) -> Result<(), InstrumentError> {
        match self.buffer.take_with(None, &self.separator) {
            Some(outgoing) => self.send(&outgoing),
            None => Ok(()),
        }
    }

    fn send(&mut self, outgoing: &str) -> Result<(), InstrumentError> {
        self.with_retry(true, "write", |link| {
            let mut intf = link.hold()?;
            trace!("TX: {outgoing}");
            intf.sendcmd(outgoing)
        })
    }

    /// Read a reply from the instrument.
    ///
    /// Buffered writes are sent first, as every read finishes the preceding writes.
    pub fn read_retry(&mut self, mut request: ReadRequest<'_>) -> Result<Vec<u8>, InstrumentError> {
        self.flush_write_buffer()?;
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        self.with_retry(request.retry, "read", |link| {
            let mut intf = link.hold()?;
            single_attempt_read(
                &mut *intf,
                &link.config,
                request.raw,
                request.size,
                timeout,
                request.wait_callback.as_deref_mut(),
            )
        })
    }

    /// Write a message, wait for `delay`, and read the reply, all under a single hold.
    pub fn ask_retry(
        &mut self,
        msg: &str,
        delay: Duration,
        mut request: ReadRequest<'_>,
    ) -> Result<Vec<u8>, InstrumentError> {
        self.flush_write_buffer()?;
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        self.with_retry(request.retry, "ask", |link| {
            let mut intf = link.hold()?;
            trace!("TX: {msg}");
            intf.sendcmd(msg)?;
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            single_attempt_read(
                &mut *intf,
                &link.config,
                request.raw,
                request.size,
                timeout,
                request.wait_callback.as_deref_mut(),
            )
        })
    }

    /// Read with a custom reader, e.g. a binary block, with the retry policy of
    /// [`Link::read_retry`].
    ///
    /// `read` runs under the hold with the transport timeout set to the operation timeout.
    pub fn read_with<R>(
        &mut self,
        read: impl FnMut(&mut T) -> Result<R, InstrumentError>,
    ) -> Result<R, InstrumentError> {
        self.held_read(None, read)
    }

    /// Write a message and read the reply with a custom reader under a single hold, with the
    /// retry policy of [`Link::ask_retry`].
    pub fn ask_with<R>(
        &mut self,
        msg: &str,
        read: impl FnMut(&mut T) -> Result<R, InstrumentError>,
    ) -> Result<R, InstrumentError> {
        self.held_read(Some(msg), read)
    }

    fn held_read<R>(
        &mut self,
        msg: Option<&str>,
        mut read: impl FnMut(&mut T) -> Result<R, InstrumentError>,
    ) -> Result<R, InstrumentError> {
        self.flush_write_buffer()?;
        let what = if msg.is_some() { "ask" } else { "read" };
        self.with_retry(true, what, |link| {
            let mut intf = link.hold()?;
            if let Some(msg) = msg {
                trace!("TX: {msg}");
                intf.sendcmd(msg)?;
            }
            let previous = intf.get_timeout();
            intf.set_timeout(link.config.timeout)?;
            let result = read(&mut *intf);
            if let Err(err) = intf.set_timeout(previous) {
                debug!("Restoring the interface timeout failed: {err}");
            }
            result
        })
    }

    /// Run `op` and retry it after link errors as described in the type documentation.
    fn with_retry<R>(
        &mut self,
        retry: bool,
        what: &str,
        mut op: impl FnMut(&mut Self) -> Result<R, InstrumentError>,
    ) -> Result<R, InstrumentError> {
        let retry_times = if retry && self.config.fail_safe {
            self.config.retry_times
        } else {
            0
        };
        let mut attempt = 0;
        loop {
            match op(self) {
                Ok(result) => return Ok(result),
                Err(err) if err.is_link_error() && attempt < retry_times => {
                    warn!(
                        "{what} failed (attempt {} of {}): {err}",
                        attempt + 1,
                        retry_times + 1
                    );
                    thread::sleep(self.config.retry_delay);
                    self.recover(attempt);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Try to bring the link back into a usable state after the failed attempt `attempt`.
    ///
    /// Even attempts reconnect, odd attempts drain the input and send the recovery probe. Errors
    /// are logged and ignored.
    pub fn recover(&mut self, attempt: u32) {
        let result = if attempt % 2 == 0 {
            self.reconnect()
        } else {
            self.drain_and_probe()
        };
        if let Err(err) = result {
            debug!("Recovery after attempt {attempt} failed: {err}");
        }
    }

    /// Close and re-open the interface.
    pub fn reconnect(&mut self) -> Result<(), InstrumentError> {
        let mut intf = self.hold()?;
        debug!("Reconnecting interface");
        if let Err(err) = intf.close() {
            debug!("Closing the interface failed: {err}");
        }
        intf.open()
    }

    /// Discard pending input and return the number of discarded bytes.
    pub fn flush_input(&mut self) -> Result<usize, InstrumentError> {
        let mut intf = self.hold()?;
        intf.flush_input()
    }

    fn drain_and_probe(&mut self) -> Result<(), InstrumentError> {
        let mut intf = self.hold()?;
        let drained = intf.flush_input()?;
        debug!("Drained {drained} bytes from interface");
        if let Some(probe) = self.config.recovery_probe.as_deref() {
            let reply = intf.query(probe)?;
            trace!("Recovery probe {probe} returned {reply}");
        }
        Ok(())
    }

    /// Enter a write buffer scope. Scopes can be nested.
    pub fn begin_write_buffer(&mut self) {
        self.buffer.depth += 1;
    }

    /// Leave a write buffer scope and send the buffer if this was the outermost scope.
    pub fn end_write_buffer(&mut self) -> Result<(), InstrumentError> {
        self.buffer.depth = self.buffer.depth.saturating_sub(1);
        if self.buffer.depth == 0 {
            self.flush_write_buffer()
        } else {
            Ok(())
        }
    }

    /// Run `f` inside a write buffer scope.
    ///
    /// The buffer is left even if `f` fails. The error of `f` takes precedence over an error
    /// while sending the buffer.
    pub fn with_write_buffer<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, InstrumentError>,
    ) -> Result<R, InstrumentError> {
        self.begin_write_buffer();
        let result = f(self);
        let flushed = self.end_write_buffer();
        let value = result?;
        flushed?;
        Ok(value)
    }

    /// Enter a write buffer scope that is left when the returned guard is dropped.
    ///
    /// Use [`WriteScope::finish`] to observe errors while sending the buffer; a dropped guard can
    /// only log them.
    pub fn buffered(&mut self) -> WriteScope<'_, T> {
        self.begin_write_buffer();
        WriteScope {
            link: self,
            finished: false,
        }
    }
}

/// Guard of a write buffer scope, see [`Link::buffered`].
pub struct WriteScope<'a, T: InstrumentInterface> {
    link: &'a mut Link<T>,
    finished: bool,
}

impl<T: InstrumentInterface> WriteScope<'_, T> {
    /// Leave the scope and return the result of sending the buffer.
    pub fn finish(mut self) -> Result<(), InstrumentError> {
        self.finished = true;
        self.link.end_write_buffer()
    }
}

impl<T: InstrumentInterface> Deref for WriteScope<'_, T> {
    type Target = Link<T>;

    fn deref(&self) -> &Self::Target {
        self.link
    }
}

impl<T: InstrumentInterface> DerefMut for WriteScope<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.link
    }
}

impl<T: InstrumentInterface> Drop for WriteScope<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.link.end_write_buffer() {
                warn!("Sending buffered writes failed: {err}");
            }
        }
    }
}

/// Read once from an interface that is already held.
///
/// The transport timeout is lowered to the backend timeout when in fail-safe mode and a wait
/// callback is given, such that the callback runs regularly. Failed reads are repeated, calling
/// the callback in between, until the overall `timeout` elapsed. Without a callback the first
/// failure is returned.
fn single_attempt_read<T: InstrumentInterface + ?Sized>(
    intf: &mut T,
    config: &LinkConfig,
    raw: bool,
    size: Option<usize>,
    timeout: Duration,
    mut wait_callback: Option<&mut (dyn FnMut() + '_)>,
) -> Result<Vec<u8>, InstrumentError> {
    let attempt_timeout = match wait_callback {
        Some(_) if config.fail_safe => config.backend_timeout.min(timeout),
        _ => timeout,
    };
    let previous = intf.get_timeout();
    intf.set_timeout(attempt_timeout)?;

    let tic = Instant::now();
    let result = loop {
        let attempt_start = Instant::now();
        match read_once(intf, raw, size) {
            Ok(data) => break Ok(data),
            Err(err) if err.is_link_error() => match wait_callback.as_deref_mut() {
                Some(callback) if tic.elapsed() < timeout => {
                    let spent = attempt_start.elapsed();
                    if spent < config.callback_period {
                        thread::sleep(config.callback_period - spent);
                    }
                    callback();
                }
                _ => break Err(err),
            },
            Err(err) => break Err(err),
        }
    };

    if let Err(err) = intf.set_timeout(previous) {
        debug!("Restoring the interface timeout failed: {err}");
    }
    result
}

fn read_once<T: InstrumentInterface + ?Sized>(
    intf: &mut T,
    raw: bool,
    size: Option<usize>,
) -> Result<Vec<u8>, InstrumentError> {
    let data = match size {
        Some(size) => {
            let mut buf = vec![0u8; size];
            intf.read_exact(&mut buf)?;
            buf
        }
        None => intf.read_line(!raw)?,
    };
    trace!("RX: {}", String::from_utf8_lossy(&data).trim_end());
    Ok(data)
}
