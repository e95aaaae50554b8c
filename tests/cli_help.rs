//! CLI help strings succeed.

use assert_cmd::Command;

#[test]
fn freeproxy_help() {
    Command::cargo_bin("freeproxy")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn freeproxy_sign_help() {
    Command::cargo_bin("freeproxy")
        .unwrap()
        .args(["sign", "--help"])
        .assert()
        .success();
}
