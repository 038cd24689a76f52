//! End-to-end tests that run the built binary.
//!
//! These cover what only shows up across processes: the supervisor and its
//! workers sharing one port, and how startup errors reach the terminal.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_echo-fixtures");

/// Kills the wrapped process when the test ends, pass or fail.
struct Running(Child);

impl Drop for Running {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn wait_until_listening(addr: SocketAddr) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while TcpStream::connect(addr).is_err() {
        assert!(Instant::now() < deadline, "nothing listening on {addr}");
        thread::sleep(Duration::from_millis(25));
    }
}

fn echo_once(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(payload).unwrap();
    let mut received = vec![0u8; payload.len()];
    stream.read_exact(&mut received).unwrap();
    received
}

/// Parent pid and state letter from `/proc/<pid>/stat`, or `None` once the
/// process is gone.
#[cfg(target_os = "linux")]
fn proc_stat(pid: u32) -> Option<(u32, char)> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces, so fields are counted from the
    // closing parenthesis.
    let mut fields = stat.rsplit_once(')')?.1.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((ppid, state))
}

#[cfg(target_os = "linux")]
fn children_of(parent: u32) -> Vec<u32> {
    let mut pids: Vec<u32> = std::fs::read_dir("/proc")
        .unwrap()
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .filter(|&pid| matches!(proc_stat(pid), Some((ppid, state)) if ppid == parent && state != 'Z'))
        .collect();
    pids.sort_unstable();
    pids
}

#[cfg(target_os = "linux")]
fn is_alive(pid: u32) -> bool {
    matches!(proc_stat(pid), Some((_, state)) if state != 'Z')
}

#[cfg(target_os = "linux")]
#[test]
fn test_cluster_serves_and_dies_with_supervisor() {
    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut supervisor = Running(
        Command::new(BIN)
            .args(["--mode", "cluster", "--workers", "2", "--host", "127.0.0.1"])
            .args(["--port", &port.to_string(), "--log-level", "warn"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap(),
    );
    let supervisor_pid = supervisor.0.id();

    let deadline = Instant::now() + Duration::from_secs(10);
    let workers = loop {
        let workers = children_of(supervisor_pid);
        if workers.len() == 2 {
            break workers;
        }
        assert!(
            Instant::now() < deadline,
            "expected 2 workers, found {workers:?}"
        );
        thread::sleep(Duration::from_millis(25));
    };

    wait_until_listening(addr);
    for i in 0..8 {
        let payload = format!("hello from client {i}");
        assert_eq!(echo_once(addr, payload.as_bytes()), payload.as_bytes());
    }

    // SIGKILL leaves the supervisor no chance to clean up after itself.
    supervisor.0.kill().unwrap();
    supervisor.0.wait().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while workers.iter().any(|&pid| is_alive(pid)) {
        assert!(
            Instant::now() < deadline,
            "workers outlived the supervisor: {workers:?}"
        );
        thread::sleep(Duration::from_millis(25));
    }

    // Nothing holds the port any more.
    TcpListener::bind(addr).unwrap();
}

#[test]
fn test_single_process_echoes() {
    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let _server = Running(
        Command::new(BIN)
            .args(["--host", "127.0.0.1", "--port", &port.to_string()])
            .args(["--log-level", "warn"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap(),
    );

    wait_until_listening(addr);
    assert_eq!(echo_once(addr, b"hello"), b"hello");
    assert_eq!(echo_once(addr, b"world"), b"world");
}

#[test]
fn test_invalid_config_reports_message() {
    let output = Command::new(BIN)
        .args(["--threads", "65"])
        .stdin(Stdio::null())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Error: Invalid configuration: threads must be between 1 and 64, got 65"),
        "unexpected stderr: {stderr}"
    );
    assert!(!stderr.contains("Invalid("), "debug output leaked: {stderr}");
}

#[test]
fn test_port_in_use_fails_startup() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let output = Command::new(BIN)
        .args(["--host", "127.0.0.1", "--port", &port.to_string()])
        .args(["--log-level", "off"])
        .stdin(Stdio::null())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("Error: "), "unexpected stderr: {stderr}");
}
