//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::{TempDir, tempdir},
};

/// Command isolated from the caller's environment and config files.
fn cli_cmd(dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("otaflash");
    cmd.current_dir(dir)
        .env("HOME", dir)
        .env("XDG_CONFIG_HOME", dir)
        .env("NO_COLOR", "1")
        .env_remove("OTAFLASH_PORT")
        .env_remove("OTAFLASH_BAUD")
        .env_remove("OTAFLASH_TIMEOUT")
        .env_remove("RUST_LOG");
    cmd
}

fn workdir() -> TempDir {
    tempdir().expect("tempdir should be created")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let dir = workdir();
    cli_cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("otaflash"))
        .stdout(predicate::str::contains("OTAFLASH_BAUD"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let dir = workdir();
    cli_cmd(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("otaflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn no_arguments_print_usage_and_port_table() {
    let dir = workdir();
    cli_cmd(dir.path())
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains(
            "Please feed the COM PORT number and the Application Image",
        ))
        .stderr(predicate::str::contains("0: /dev/ttyS0"))
        .stderr(predicate::str::contains("16: /dev/ttyUSB0"))
        .stderr(predicate::str::contains("37: /dev/cuaU3"));
}

#[test]
fn port_index_without_image_is_usage_error() {
    let dir = workdir();
    cli_cmd(dir.path())
        .arg("16")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Application Image"));
}

#[test]
fn out_of_range_port_index_is_usage_error() {
    let dir = workdir();
    fs::write(dir.path().join("app.bin"), b"image").expect("write image");
    cli_cmd(dir.path())
        .args(["38", "app.bin"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid port index '38'"))
        .stderr(predicate::str::contains("/dev/ttyS0"));
}

#[test]
fn non_numeric_port_index_is_usage_error() {
    let dir = workdir();
    cli_cmd(dir.path())
        .args(["usb", "app.bin"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid port index"));
}

#[test]
fn invalid_flag_is_usage_error_with_port_table() {
    let dir = workdir();
    cli_cmd(dir.path())
        .arg("--invalid-flag-xyz")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("--invalid-flag-xyz"))
        .stderr(predicate::str::contains("Known serial ports"))
        .stderr(predicate::str::contains("0: /dev/ttyS0"));
}

#[test]
fn invalid_baud_from_environment_is_usage_error_with_port_table() {
    let dir = workdir();
    cli_cmd(dir.path())
        .env("OTAFLASH_BAUD", "fast")
        .args(["0", "app.bin"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Known serial ports"))
        .stderr(predicate::str::contains("37: /dev/cuaU3"));
}

#[test]
fn missing_image_file_fails_before_opening_port() {
    let dir = workdir();
    cli_cmd(dir.path())
        .args(["0", "does_not_exist.bin"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to load image"))
        .stderr(predicate::str::contains("serial port").not());
}

#[test]
fn empty_image_file_is_rejected() {
    let dir = workdir();
    fs::write(dir.path().join("empty.bin"), b"").expect("write image");
    cli_cmd(dir.path())
        .args(["0", "empty.bin"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("image is empty"));
}

#[test]
fn unopenable_port_exits_one() {
    let dir = workdir();
    fs::write(dir.path().join("app.bin"), b"image").expect("write image");
    cli_cmd(dir.path())
        .args(["--port", "/nonexistent/ttyOTA", "app.bin"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to open serial port /nonexistent/ttyOTA"));
}

#[test]
fn port_index_is_shown_with_its_path() {
    let dir = workdir();
    fs::write(dir.path().join("app.bin"), b"image").expect("write image");
    cli_cmd(dir.path())
        .args(["37", "app.bin"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("/dev/cuaU3 (index 37)"));
}

#[test]
fn port_from_environment_overrides_index() {
    let dir = workdir();
    fs::write(dir.path().join("app.bin"), b"image").expect("write image");
    cli_cmd(dir.path())
        .env("OTAFLASH_PORT", "/nonexistent/ttyENV")
        .args(["0", "app.bin"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("/nonexistent/ttyENV"));
}

#[test]
fn local_config_supplies_port() {
    let dir = workdir();
    fs::write(dir.path().join("app.bin"), b"image").expect("write image");
    fs::write(
        dir.path().join("otaflash.toml"),
        "[connection]\nport = \"/nonexistent/ttyCFG\"\n",
    )
    .expect("write config");

    cli_cmd(dir.path())
        .arg("app.bin")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("/nonexistent/ttyCFG"));
}

#[test]
fn invalid_local_config_is_a_warning() {
    let dir = workdir();
    fs::write(dir.path().join("otaflash.toml"), "invalid toml [[[").expect("write config");

    cli_cmd(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to parse config file"))
        .stderr(predicate::str::contains("Application Image"));
}

#[test]
fn invalid_explicit_config_is_fatal() {
    let dir = workdir();
    fs::write(dir.path().join("custom.toml"), "[connection]\nbaud = \"fast\"\n")
        .expect("write config");

    cli_cmd(dir.path())
        .args(["--config", "custom.toml", "0", "app.bin"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid config file"));
}
