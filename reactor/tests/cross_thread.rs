//! Sends issued from an application thread arrive in order.

use std::io::Read;
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use reactor::{EventLoop, InetAddress, ServerOption, TcpServer};

const SENDS: usize = 1000;

#[test]
fn cross_thread_sends_preserve_order() {
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let mut server = TcpServer::new(
            &event_loop,
            &InetAddress::loopback(0),
            "sender-test",
            ServerOption::NoReusePort,
        )
        .unwrap();
        server.set_thread_num(1);

        server.set_connection_callback(move |conn| {
            if conn.connected() {
                // Hammer the connection from a thread that is not any loop;
                // every send has to hop onto the owner loop.
                let conn = conn.clone();
                thread::spawn(move || {
                    for i in 0..SENDS {
                        conn.send(format!("{i:04}").as_bytes());
                    }
                });
            }
        });

        server.start().unwrap();
        tx.send((event_loop.clone(), server.listen_address().port()))
            .unwrap();
        event_loop.run();
        drop(server);
    });

    let (event_loop, port) = rx.recv().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let expected: String = (0..SENDS).map(|i| format!("{i:04}")).collect();
    let mut received = Vec::with_capacity(expected.len());
    let mut chunk = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(30);
    while received.len() < expected.len() {
        assert!(
            Instant::now() < deadline,
            "stalled after {} bytes",
            received.len()
        );
        let n = client.read(&mut chunk).unwrap();
        assert!(n > 0, "unexpected EOF after {} bytes", received.len());
        received.extend_from_slice(&chunk[..n]);
    }

    assert_eq!(received.len(), expected.len());
    assert_eq!(String::from_utf8(received).unwrap(), expected);

    drop(client);
    event_loop.quit();
    handle.join().unwrap();
}
