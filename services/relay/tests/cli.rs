//! Process-level behavior of the `tcp-relay` binary.

use std::io::Write;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the binary and wait for it to exit on its own.
fn run_to_exit(args: &[&str]) -> ExitStatus {
    let mut child = Command::new(env!("CARGO_BIN_EXE_tcp-relay"))
        .args(args)
        .env_remove("RUST_LOG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn tcp-relay");

    let deadline = Instant::now() + EXIT_TIMEOUT;
    loop {
        if let Some(status) = child.try_wait().expect("failed to poll tcp-relay") {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            panic!("tcp-relay did not exit within {:?}", EXIT_TIMEOUT);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn listener_block(port: u32, backend_port: u32) -> String {
    format!(
        "[[listeners]]\nport = {}\nbackends = [{{ host = \"127.0.0.1\", port = {} }}]\n",
        port, backend_port
    )
}

#[test]
fn missing_argument_is_usage_error() {
    let status = run_to_exit(&[]);
    assert!(!status.success());
}

#[test]
fn extra_argument_is_usage_error() {
    let config = write_config(&listener_block(0, 3100));
    let path = config.path().to_str().unwrap();
    let status = run_to_exit(&[path, "unexpected"]);
    assert!(!status.success());
}

#[test]
fn unreadable_config_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.toml");
    let status = run_to_exit(&[path.to_str().unwrap()]);
    assert!(!status.success());
}

#[test]
fn out_of_range_listen_port_aborts_startup() {
    let port = free_port();
    let content = format!(
        "bind_host = \"127.0.0.1\"\n{}{}",
        listener_block(port as u32, 3100),
        listener_block(99999, 3100)
    );
    let config = write_config(&content);

    let status = run_to_exit(&[config.path().to_str().unwrap()]);
    assert_eq!(status.code(), Some(1));

    // Nothing is left listening on the valid port.
    std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
}

#[test]
fn out_of_range_backend_port_aborts_startup() {
    let port = free_port();
    let content = format!(
        "bind_host = \"127.0.0.1\"\n{}{}",
        listener_block(port as u32, 3100),
        listener_block(0, 99999)
    );
    let config = write_config(&content);

    let status = run_to_exit(&[config.path().to_str().unwrap()]);
    assert_eq!(status.code(), Some(1));
    std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
}

#[test]
fn duplicate_listen_port_aborts_startup() {
    let port = free_port();
    let content = format!(
        "bind_host = \"127.0.0.1\"\n{}{}",
        listener_block(port as u32, 3100),
        listener_block(port as u32, 3101)
    );
    let config = write_config(&content);

    let status = run_to_exit(&[config.path().to_str().unwrap()]);
    assert_eq!(status.code(), Some(1));
    std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
}
