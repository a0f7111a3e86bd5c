//! Test cases for the LoopbackInterfaceString.

use rstest::*;

use instrumentcore::{InstrumentInterface, LoopbackInterfaceString};

/// A function that creates a new `LoopbackInterfaceString` with the given input and output vectors.
fn crt_lbk(input: Vec<&str>, output: Vec<&str>) -> LoopbackInterfaceString {
    LoopbackInterfaceString::new(input, output, "\n")
}

/// Create a loopback interface that contains no commands.
#[fixture]
fn emp_lbk() -> LoopbackInterfaceString {
    crt_lbk(vec![], vec![])
}

/// Ensure `finalize` method passes if an empty loopback interface is used.
#[rstest]
fn finalize_test(mut emp_lbk: LoopbackInterfaceString) {
    emp_lbk.finalize();
}

/// Ensure `finalize` method panics if commands are left in the loopback interface.
#[rstest]
#[case(vec!["cmd"], vec![])]
#[case(vec![], vec!["resp"])]
#[case(vec!["cmd"], vec!["resp"])]
#[should_panic]
fn finalize_test_panic(#[case] from_host: Vec<&str>, #[case] from_inst: Vec<&str>) {
    let mut lbk = crt_lbk(from_host, from_inst);
    lbk.finalize();
}

#[rstest]
fn sendcmd() {
    let mut lbk = crt_lbk(vec!["cmd1", "cmd2"], vec![]);
    lbk.sendcmd("cmd1").unwrap();
    lbk.sendcmd("cmd2").unwrap();
    lbk.finalize();
}

#[rstest]
#[should_panic]
fn sendcmd_mismatch() {
    let mut lbk = crt_lbk(vec!["cmd1"], vec![]);
    let _ = lbk.sendcmd("cmd3");
}

#[rstest]
fn terminator(mut emp_lbk: LoopbackInterfaceString) {
    assert_eq!(emp_lbk.get_terminator(), "\n");
    emp_lbk.set_terminator("\r\n");
    assert_eq!(emp_lbk.get_terminator(), "\r\n");
}

/// The expected terminator is checked on every write.
#[rstest]
#[should_panic]
fn terminator_wrong() {
    let mut lbk = LoopbackInterfaceString::new(vec!["cmd1"], vec![], "\r\n");
    let _ = lbk.sendcmd("cmd1");
}

#[rstest]
fn query() {
    let mut lbk = crt_lbk(vec!["cmd1", "cmd2"], vec!["resp1", "resp2"]);
    let resp1 = lbk.query("cmd1").unwrap();
    assert_eq!(resp1, "resp1");
    let resp2 = lbk.query("cmd2").unwrap();
    assert_eq!(resp2, "resp2");
    lbk.finalize();
}

/// Draining discards the rest of a partially read reply only.
#[rstest]
fn flush_input() {
    let mut lbk = crt_lbk(vec![], vec!["abc", "next"]);
    let mut first = [0u8; 1];
    lbk.read_exact(&mut first).unwrap();
    assert_eq!(&first, b"a");
    assert_eq!(lbk.flush_input().unwrap(), 3);
    assert_eq!(lbk.read_until_terminator().unwrap(), "next");
}
