//! Blocking client scenarios run against every event loop backend.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Block until a connection to `addr` succeeds, for servers started on
/// another thread or in another process.
pub fn wait_until_listening(addr: SocketAddr) {
    for _ in 0..200 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(25));
    }
    panic!("nothing listening on {addr}");
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).unwrap();
    let mut received = vec![0u8; payload.len()];
    stream.read_exact(&mut received).unwrap();
    received
}

/// "hello" then "world" on one connection, then a fresh connection.
pub fn hello_world_then_reconnect(addr: SocketAddr) {
    let mut client = connect(addr);
    assert_eq!(round_trip(&mut client, b"hello"), b"hello");
    assert_eq!(round_trip(&mut client, b"world"), b"world");
    drop(client);

    let mut client = connect(addr);
    assert_eq!(round_trip(&mut client, b"again"), b"again");
}

/// Two clients interleaving 10000 bytes each get back only their own bytes.
pub fn interleaved_clients(addr: SocketAddr) {
    let mut a = connect(addr);
    let mut b = connect(addr);

    let payload_a = vec![b'A'; 10_000];
    let payload_b = vec![b'B'; 10_000];

    for (chunk_a, chunk_b) in payload_a.chunks(1000).zip(payload_b.chunks(1000)) {
        a.write_all(chunk_a).unwrap();
        b.write_all(chunk_b).unwrap();
    }

    let mut received_a = vec![0u8; payload_a.len()];
    let mut received_b = vec![0u8; payload_b.len()];
    a.read_exact(&mut received_a).unwrap();
    b.read_exact(&mut received_b).unwrap();

    assert_eq!(received_a, payload_a);
    assert_eq!(received_b, payload_b);
}

/// A client closing mid-session does not disturb another one.
pub fn close_is_isolated(addr: SocketAddr) {
    let mut survivor = connect(addr);
    assert_eq!(round_trip(&mut survivor, b"first"), b"first");

    let mut closed = connect(addr);
    assert_eq!(round_trip(&mut closed, b"bye"), b"bye");
    drop(closed);

    assert_eq!(round_trip(&mut survivor, b"still here"), b"still here");
    assert_eq!(round_trip(&mut connect(addr), b"new"), b"new");
}

/// A payload far larger than socket buffers comes back byte for byte.
pub fn large_payload(addr: SocketAddr) {
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

    let mut reader = connect(addr);
    let mut writer = reader.try_clone().unwrap();

    let to_send = payload.clone();
    let write = thread::spawn(move || {
        writer.write_all(&to_send).unwrap();
        writer.shutdown(Shutdown::Write).unwrap();
    });

    let mut received = Vec::with_capacity(payload.len());
    reader.read_to_end(&mut received).unwrap();
    write.join().unwrap();

    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
}
