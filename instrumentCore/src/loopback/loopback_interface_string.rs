//! Loopback transport for line based protocols.

use std::collections::VecDeque;

use crate::{InstrumentError, InstrumentInterface, loopback::IncrIndex};

/// A scripted transport for testing drivers that exchange terminated strings.
///
/// Provide the lines expected from the host and the replies of the instrument, both without
/// terminator. Every write must match the next expected line exactly; a mismatch panics. Replies
/// are served byte by byte in order. When the interface is dropped, left over lines panic too,
/// so a test fails if the driver skipped a command.
///
/// # Example
///
/// ```
/// use instrumentcore::{DataType, DeviceConfig, LoopbackInterfaceString, ScpiDevice, Value};
///
/// let loopback = LoopbackInterfaceString::new(
///     vec!["*IDN?", "VOLT?"],
///     vec!["ACME,PSU-1,1234,1.0", "3.300000E+00"],
///     "\n",
/// );
/// let mut dev = ScpiDevice::new(loopback, DeviceConfig::default());
///
/// assert_eq!(dev.get_id().unwrap(), "ACME,PSU-1,1234,1.0");
/// assert_eq!(dev.ask("VOLT?", &DataType::Float).unwrap(), Value::Float(3.3));
/// ```
pub struct LoopbackInterfaceString {
    from_host: Vec<String>,
    from_inst: Vec<String>,
    terminator_exp: String,
    from_host_index: IncrIndex,
    from_inst_index: IncrIndex,
    curr_bytes: VecDeque<u8>,
    terminator: String,
}

impl LoopbackInterfaceString {
    /// Create a new loopback interface.
    ///
    /// # Arguments:
    /// * `from_host` - Lines expected from the host, in order.
    /// * `from_inst` - Replies of the instrument, in order.
    /// * `terminator_exp` - Terminator the host is expected to append, also appended to replies.
    pub fn new<S: Into<String>>(
        from_host: Vec<S>,
        from_inst: Vec<S>,
        terminator_exp: &str,
    ) -> Self {
        LoopbackInterfaceString {
            from_host: from_host.into_iter().map(Into::into).collect(),
            from_inst: from_inst.into_iter().map(Into::into).collect(),
            terminator_exp: terminator_exp.to_string(),
            from_host_index: IncrIndex::default(),
            from_inst_index: IncrIndex::default(),
            curr_bytes: VecDeque::new(),
            terminator: "\n".to_string(),
        }
    }

    /// Panic if not all scripted lines were used.
    ///
    /// Called automatically on drop, unless the thread is already panicking.
    pub fn finalize(&mut self) {
        if let Some(fil) = self.from_host.get(self.from_host_index.peek()) {
            panic!("Leftover expected commands found from host to instrument: {fil}");
        }
        if let Some(fil) = self.from_inst.get(self.from_inst_index.peek()) {
            panic!("Leftover expected commands found from instrument to host: {fil}");
        }
    }

    fn next_from_host(&mut self) -> String {
        match self.from_host.get(self.from_host_index.next()) {
            Some(cmd) => format!("{cmd}{}", self.terminator_exp),
            None => panic!("No more commands were expected from host to instrument."),
        }
    }

    fn next_from_inst(&mut self) -> String {
        match self.from_inst.get(self.from_inst_index.next()) {
            Some(reply) => format!("{reply}{}", self.terminator_exp),
            None => panic!("No more replies were expected from instrument to host."),
        }
    }

    fn read_one_byte(&mut self) -> u8 {
        loop {
            if let Some(byte) = self.curr_bytes.pop_front() {
                return byte;
            }
            let next = self.next_from_inst();
            self.curr_bytes = next.into_bytes().into();
        }
    }
}

impl InstrumentInterface for LoopbackInterfaceString {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError> {
        for byte in buf.iter_mut() {
            *byte = self.read_one_byte();
        }
        Ok(())
    }

    fn write_raw(&mut self, cmd: &[u8]) -> Result<(), InstrumentError> {
        let exp = self.next_from_host();
        assert_eq!(
            exp.as_bytes(),
            cmd,
            "Expected sendcmd {exp:?}, got {:?}",
            String::from_utf8_lossy(cmd)
        );
        Ok(())
    }

    fn get_terminator(&self) -> &str {
        self.terminator.as_str()
    }

    fn set_terminator(&mut self, terminator: &str) {
        self.terminator = terminator.to_string();
    }

    /// Drop the rest of a partially read reply.
    fn flush_input(&mut self) -> Result<usize, InstrumentError> {
        let drained = self.curr_bytes.len();
        self.curr_bytes.clear();
        Ok(drained)
    }
}

impl Drop for LoopbackInterfaceString {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.finalize();
        }
    }
}
