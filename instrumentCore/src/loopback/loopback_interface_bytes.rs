//! Loopback transport for protocols that exchange raw byte packages.

use std::collections::VecDeque;

use crate::{InstrumentError, InstrumentInterface, loopback::IncrIndex};

/// A scripted transport for testing drivers that exchange byte packages.
///
/// Works like [`crate::LoopbackInterfaceString`], but packages are compared and served as is,
/// without a terminator. Reads can span package boundaries.
///
/// # Example
///
/// ```
/// use instrumentcore::{InstrumentInterface, LoopbackInterfaceBytes, read_binary_array};
///
/// let mut lbk = LoopbackInterfaceBytes::new(vec![b"CURV?\n".to_vec()], vec![b"#14abcd\n".to_vec()]);
/// lbk.write_raw(b"CURV?\n").unwrap();
/// let payload = read_binary_array(&mut lbk, false, true).unwrap();
/// assert_eq!(payload, b"abcd");
/// ```
pub struct LoopbackInterfaceBytes {
    from_host: Vec<Vec<u8>>,
    from_inst: Vec<Vec<u8>>,
    from_host_index: IncrIndex,
    from_inst_index: IncrIndex,
    curr_bytes: VecDeque<u8>,
}

impl LoopbackInterfaceBytes {
    /// Create a new loopback interface.
    ///
    /// # Arguments:
    /// * `from_host` - Packages expected from the host, in order.
    /// * `from_inst` - Packages sent by the instrument, in order.
    pub fn new(from_host: Vec<Vec<u8>>, from_inst: Vec<Vec<u8>>) -> Self {
        LoopbackInterfaceBytes {
            from_host,
            from_inst,
            from_host_index: IncrIndex::default(),
            from_inst_index: IncrIndex::default(),
            curr_bytes: VecDeque::new(),
        }
    }

    /// Panic if not all scripted packages were used.
    ///
    /// Called automatically on drop, unless the thread is already panicking.
    pub fn finalize(&mut self) {
        if let Some(fil) = self.from_host.get(self.from_host_index.peek()) {
            panic!("Leftover expected commands found from host to instrument: {fil:?}");
        }
        if let Some(fil) = self.from_inst.get(self.from_inst_index.peek()) {
            panic!("Leftover expected commands found from instrument to host: {fil:?}");
        }
    }

    fn read_one_byte(&mut self) -> u8 {
        loop {
            if let Some(byte) = self.curr_bytes.pop_front() {
                return byte;
            }
            match self.from_inst.get(self.from_inst_index.next()) {
                Some(package) => self.curr_bytes = package.clone().into(),
                None => panic!("No more bytes were expected from instrument to host."),
            }
        }
    }
}

impl InstrumentInterface for LoopbackInterfaceBytes {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError> {
        for byte in buf.iter_mut() {
            *byte = self.read_one_byte();
        }
        Ok(())
    }

    fn write_raw(&mut self, cmd: &[u8]) -> Result<(), InstrumentError> {
        let exp = match self.from_host.get(self.from_host_index.next()) {
            Some(exp) => exp.as_slice(),
            None => panic!("No more bytes were expected from host to instrument."),
        };
        assert_eq!(exp, cmd, "Expected package {exp:?}, got {cmd:?}");
        Ok(())
    }

    fn flush_input(&mut self) -> Result<usize, InstrumentError> {
        let drained = self.curr_bytes.len();
        self.curr_bytes.clear();
        Ok(drained)
    }
}

impl Drop for LoopbackInterfaceBytes {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.finalize();
        }
    }
}
