//! Tests of the retry/recovery engine.

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use rstest::*;

use instrumentcore::{
    InstrumentError, InstrumentInterface, Link, LinkConfig, LoopbackInterfaceString, ReadRequest,
    SharedInterface, read_binary_array,
};

/// Counters shared between a test and its [`FlakyInterface`].
#[derive(Clone, Default)]
struct Counters {
    failures_left: Arc<AtomicUsize>,
    reconnects: Arc<AtomicUsize>,
    drains: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<String>>>,
    timeouts: Arc<Mutex<Vec<Duration>>>,
}

/// A transport that answers `MEAS?` with `1.5`, `*STB?` with `0`, and `CURV?` with a binary
/// block, but fails a configurable number of reads first.
struct FlakyInterface {
    counters: Counters,
    replies: VecDeque<u8>,
    timeout: Duration,
    close_fails: bool,
}

impl FlakyInterface {
    fn new(failures: usize) -> (Self, Counters) {
        let counters = Counters::default();
        counters.failures_left.store(failures, Ordering::SeqCst);
        let intf = FlakyInterface {
            counters: counters.clone(),
            replies: VecDeque::new(),
            timeout: Duration::from_secs(3),
            close_fails: false,
        };
        (intf, counters)
    }

    /// Fail on `close`, like a TCP socket whose peer is already gone.
    fn with_failing_close(mut self) -> Self {
        self.close_fails = true;
        self
    }

    fn timed_out() -> InstrumentError {
        InstrumentError::Io(io::Error::new(io::ErrorKind::TimedOut, "no reply"))
    }
}

impl InstrumentInterface for FlakyInterface {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InstrumentError> {
        let failures = &self.counters.failures_left;
        if failures.load(Ordering::SeqCst) > 0 {
            failures.fetch_sub(1, Ordering::SeqCst);
            return Err(Self::timed_out());
        }
        for byte in buf.iter_mut() {
            *byte = self.replies.pop_front().ok_or_else(Self::timed_out)?;
        }
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        let cmd = String::from_utf8_lossy(data).trim_end().to_string();
        match cmd.as_str() {
            "MEAS?" => self.replies.extend(b"1.5\n"),
            "*STB?" => self.replies.extend(b"0\n"),
            "CURV?" => self.replies.extend(b"#13abc\n"),
            _ => {}
        }
        self.counters.sent.lock().unwrap().push(cmd);
        Ok(())
    }

    fn get_timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), InstrumentError> {
        self.counters.timeouts.lock().unwrap().push(timeout);
        self.timeout = timeout;
        Ok(())
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        self.replies.clear();
        if self.close_fails {
            return Err(InstrumentError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "not connected",
            )));
        }
        Ok(())
    }

    fn open(&mut self) -> Result<(), InstrumentError> {
        self.counters.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush_input(&mut self) -> Result<usize, InstrumentError> {
        self.counters.drains.fetch_add(1, Ordering::SeqCst);
        let drained = self.replies.len();
        self.replies.clear();
        Ok(drained)
    }
}

#[fixture]
fn fail_safe() -> LinkConfig {
    LinkConfig::default()
        .with_fail_safe(true)
        .with_retries(5, Duration::ZERO)
}

/// Two failed reads are recovered by one reconnect and one drain-and-probe.
#[rstest]
fn test_recovers_alternating(fail_safe: LinkConfig) {
    let (intf, counters) = FlakyInterface::new(2);
    let mut link = Link::new(intf, fail_safe);

    let reply = link
        .ask_retry("MEAS?", Duration::ZERO, ReadRequest::new())
        .unwrap();
    assert_eq!(reply, b"1.5");
    assert_eq!(counters.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(counters.drains.load(Ordering::SeqCst), 1);
    assert_eq!(
        *counters.sent.lock().unwrap(),
        vec!["MEAS?", "MEAS?", "*STB?", "MEAS?"]
    );
}

/// Without fail-safe mode the first link error is returned.
#[rstest]
fn test_no_retry_without_fail_safe() {
    let (intf, counters) = FlakyInterface::new(1);
    let mut link = Link::new(intf, LinkConfig::default());

    let err = link
        .ask_retry("MEAS?", Duration::ZERO, ReadRequest::new())
        .unwrap_err();
    assert!(err.is_link_error());
    assert_eq!(counters.reconnects.load(Ordering::SeqCst), 0);
    assert_eq!(counters.drains.load(Ordering::SeqCst), 0);
}

/// A binary block read with a custom reader is retried like any other read.
#[rstest]
fn test_binary_read_is_retried(fail_safe: LinkConfig) {
    let (intf, counters) = FlakyInterface::new(1);
    let mut link = Link::new(intf, fail_safe.with_recovery_probe(None));

    let payload = link
        .ask_with("CURV?", |intf| read_binary_array(intf, false, true))
        .unwrap();
    assert_eq!(payload, b"abc");
    assert_eq!(counters.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(*counters.sent.lock().unwrap(), vec!["CURV?", "CURV?"]);
    assert_eq!(
        *counters.timeouts.lock().unwrap(),
        vec![
            Duration::from_secs(3),
            Duration::from_secs(3),
            Duration::from_secs(3),
            Duration::from_secs(3)
        ]
    );
}

/// A failing close does not keep the interface from being re-opened.
#[rstest]
fn test_reconnect_after_failed_close() {
    let (intf, counters) = FlakyInterface::new(0);
    let mut link = Link::new(intf.with_failing_close(), LinkConfig::default());

    link.reconnect().unwrap();
    assert_eq!(counters.reconnects.load(Ordering::SeqCst), 1);
}

/// Recovery re-opens a link whose close fails and the request succeeds on the next attempt.
#[rstest]
fn test_recovers_after_failed_close(fail_safe: LinkConfig) {
    let (intf, counters) = FlakyInterface::new(1);
    let mut link = Link::new(intf.with_failing_close(), fail_safe);

    let reply = link
        .ask_retry("MEAS?", Duration::ZERO, ReadRequest::new())
        .unwrap();
    assert_eq!(reply, b"1.5");
    assert_eq!(counters.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(counters.drains.load(Ordering::SeqCst), 0);
}

/// Retries are exhausted after `retry_times` additional attempts.
#[rstest]
fn test_gives_up_after_retries() {
    let (intf, counters) = FlakyInterface::new(10);
    let config = LinkConfig::default()
        .with_fail_safe(true)
        .with_retries(2, Duration::ZERO)
        .with_recovery_probe(None);
    let mut link = Link::new(intf, config);

    assert!(link.read_retry(ReadRequest::new()).is_err());
    assert_eq!(counters.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(counters.drains.load(Ordering::SeqCst), 1);
    assert_eq!(counters.failures_left.load(Ordering::SeqCst), 7);
}

/// A wait callback keeps a single attempt alive and the transport timeout is restored.
#[rstest]
fn test_wait_callback(fail_safe: LinkConfig) {
    let (intf, counters) = FlakyInterface::new(2);
    let config = fail_safe.with_callback_period(Duration::from_millis(1));
    let mut link = Link::new(intf, config);

    let mut calls = 0;
    let mut callback = || calls += 1;
    let reply = link
        .ask_retry(
            "MEAS?",
            Duration::ZERO,
            ReadRequest::new().wait_callback(&mut callback),
        )
        .unwrap();
    assert_eq!(reply, b"1.5");
    assert_eq!(calls, 2);
    assert_eq!(counters.reconnects.load(Ordering::SeqCst), 0);
    assert_eq!(
        *counters.timeouts.lock().unwrap(),
        vec![Duration::from_millis(500), Duration::from_secs(3)]
    );
}

/// Three buffered writes are sent as a single command when the scope is left.
#[rstest]
fn test_write_buffer_coalesces() {
    let lbk = LoopbackInterfaceString::new(vec!["A;B;C"], vec![], "\n");
    let mut link = Link::new(lbk, LinkConfig::default());

    let mut scope = link.buffered();
    scope.write_retry("A", false).unwrap();
    scope.write_retry("B", false).unwrap();
    scope.write_retry("C", false).unwrap();
    assert_eq!(scope.pending_write(), Some("A;B;C"));
    scope.finish().unwrap();
    assert_eq!(link.buffer_depth(), 0);
}

/// Only the outermost scope sends, and a read sends pending writes first.
#[rstest]
fn test_nested_scopes_and_read_flush() {
    let lbk = LoopbackInterfaceString::new(vec!["X|Y", "Z", "*OPC?"], vec!["1"], "\n");
    let mut link = Link::new(lbk, LinkConfig::default()).with_separator("|");

    link.with_write_buffer(|outer| {
        outer.write_retry("X", false)?;
        outer.with_write_buffer(|inner| inner.write_retry("Y", false))?;
        assert_eq!(outer.pending_write(), Some("X|Y"));
        Ok(())
    })
    .unwrap();

    link.begin_write_buffer();
    link.write_retry("Z", false).unwrap();
    let reply = link
        .ask_retry("*OPC?", Duration::ZERO, ReadRequest::new())
        .unwrap();
    assert_eq!(reply, b"1");
    link.end_write_buffer().unwrap();
}

/// A hold kept by another caller times out and is not retried.
#[rstest]
fn test_lock_timeout() {
    let (intf, counters) = FlakyInterface::new(0);
    let shared = SharedInterface::new(intf);
    let config = LinkConfig::default()
        .with_timeout(Duration::from_millis(20))
        .with_fail_safe(true);
    let mut link = Link::from_shared(shared.clone(), config);

    let _hold = shared.hold(Duration::from_millis(20)).unwrap();
    match link.write_retry("MEAS?", false) {
        Err(InstrumentError::LockTimeout(timeout)) => {
            assert_eq!(timeout, Duration::from_millis(20));
        }
        other => panic!("Expected a lock timeout, got {other:?}"),
    }
    assert_eq!(counters.reconnects.load(Ordering::SeqCst), 0);
}
