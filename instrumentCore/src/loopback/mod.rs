//! Scripted transports for testing drivers without hardware.
//!
//! [`LoopbackInterfaceString`] serves line based protocols with a fixed terminator, which covers
//! SCPI-style instruments. [`LoopbackInterfaceBytes`] serves protocols that exchange raw byte
//! packages, e.g. binary block transfers.
//!
//! Both transports panic as soon as the host sends something unexpected, and when they are
//! dropped while scripted messages are left over.

mod loopback_interface_bytes;
mod loopback_interface_string;

pub use loopback_interface_bytes::LoopbackInterfaceBytes;
pub use loopback_interface_string::LoopbackInterfaceString;

/// An index that starts at 0 and increments whenever `next` is called.
#[derive(Debug, Default)]
struct IncrIndex {
    index: usize,
}

impl IncrIndex {
    fn next(&mut self) -> usize {
        let current = self.index;
        self.index += 1;
        current
    }

    fn peek(&self) -> usize {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incrementing_index() {
        let mut idx = IncrIndex::default();
        assert_eq!(0, idx.next());
        assert_eq!(1, idx.next());
        assert_eq!(2, idx.peek());
        assert_eq!(2, idx.next());
    }
}
