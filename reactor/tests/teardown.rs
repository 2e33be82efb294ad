//! Server destruction with live connections: every connection observes the
//! down callback, all loops terminate, nothing dangles.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use reactor::{EventLoop, InetAddress, ServerOption, TcpServer};

#[test]
fn teardown_notifies_live_connections() {
    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let up = ups.clone();
    let down = downs.clone();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let mut server = TcpServer::new(
            &event_loop,
            &InetAddress::loopback(0),
            "teardown-test",
            ServerOption::NoReusePort,
        )
        .unwrap();
        server.set_thread_num(2);
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                up.fetch_add(1, Ordering::SeqCst);
            } else {
                down.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.start().unwrap();
        tx.send((event_loop.clone(), server.listen_address().port()))
            .unwrap();
        event_loop.run();
        // Dropping the server on the base loop's thread tears down every
        // registered connection on its owner loop and joins the workers.
        drop(server);
    });

    let (event_loop, port) = rx.recv().unwrap();

    let mut clients = Vec::new();
    for _ in 0..2 {
        clients.push(TcpStream::connect(("127.0.0.1", port)).unwrap());
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    while ups.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "connections never established");
        thread::sleep(Duration::from_millis(10));
    }

    event_loop.quit();
    handle.join().unwrap();

    // Both live connections were told they went down during the teardown.
    assert_eq!(downs.load(Ordering::SeqCst), 2);

    // The sockets are really gone: clients observe EOF or a reset.
    for mut client in clients {
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 8];
        match client.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected {n} bytes from a dead server"),
        }
    }
}
