//! `sign` subcommand: mints a leaf certificate and exits 0 (spec.md S6).

mod common;

use assert_cmd::Command;

#[test]
fn sign_creates_cert_and_key_files() {
    let dir = common::temp_workdir();

    Command::cargo_bin("freeproxy")
        .unwrap()
        .current_dir(dir.path())
        .args(["sign", "example.test"])
        .assert()
        .success();

    assert!(dir.path().join("crts/example.test.crt").is_file());
    assert!(dir.path().join("crts/example.test.key").is_file());
    assert!(dir.path().join("crts/root.crt").is_file());
    assert!(dir.path().join("crts/root.pem").is_file());
}

#[test]
fn sign_alias_s_works() {
    let dir = common::temp_workdir();

    Command::cargo_bin("freeproxy")
        .unwrap()
        .current_dir(dir.path())
        .args(["s", "example.test"])
        .assert()
        .success();

    assert!(dir.path().join("crts/example.test.crt").is_file());
}
