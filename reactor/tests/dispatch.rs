//! Round-robin assignment of connections to worker loops.

use std::net::TcpStream;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use reactor::{EventLoop, InetAddress, ServerOption, TcpServer};

const WORKERS: usize = 3;
const ROUNDS: usize = 3;

#[test]
fn connections_round_robin_over_workers() {
    let assignments: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    let seen = assignments.clone();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let mut server = TcpServer::new(
            &event_loop,
            &InetAddress::loopback(0),
            "dispatch-test",
            ServerOption::NoReusePort,
        )
        .unwrap();
        server.set_thread_num(WORKERS);
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                // The callback runs on the worker the connection was pinned
                // to, so the thread id identifies the worker.
                seen.lock().unwrap().push(thread::current().id());
            }
        });
        server.start().unwrap();
        tx.send((event_loop.clone(), server.listen_address().port()))
            .unwrap();
        event_loop.run();
        drop(server);
    });

    let (event_loop, port) = rx.recv().unwrap();

    let mut clients = Vec::new();
    for i in 0..WORKERS * ROUNDS {
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // Wait for the establish callback so accept order matches connect
        // order.
        let deadline = Instant::now() + Duration::from_secs(5);
        while assignments.lock().unwrap().len() <= i {
            assert!(Instant::now() < deadline, "connection {i} never established");
            thread::sleep(Duration::from_millis(5));
        }
        clients.push(client);
    }

    let ids = assignments.lock().unwrap().clone();
    assert_eq!(ids.len(), WORKERS * ROUNDS);

    // First round hits three distinct workers.
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
    assert_ne!(ids[0], ids[2]);

    // Strict rotation afterwards: worker i also serves i + N, i + 2N, ...
    for i in 0..(WORKERS * (ROUNDS - 1)) {
        assert_eq!(ids[i], ids[i + WORKERS], "rotation broke at connection {i}");
    }

    drop(clients);
    event_loop.quit();
    handle.join().unwrap();
}
