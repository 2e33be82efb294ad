//! Large write: high-water edge trigger, write-complete, data integrity.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use reactor::{EventLoop, InetAddress, ServerOption, TcpServer};

const PAYLOAD_LEN: usize = 32 * 1024 * 1024;
const HIGH_WATER_MARK: usize = 1024 * 1024;

fn payload_byte(i: usize) -> u8 {
    (i % 251) as u8
}

#[test]
fn high_water_fires_once_and_payload_arrives_intact() {
    let high_water_hits = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let hw = high_water_hits.clone();
    let wc = write_completes.clone();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let mut server = TcpServer::new(
            &event_loop,
            &InetAddress::loopback(0),
            "flood-test",
            ServerOption::NoReusePort,
        )
        .unwrap();
        server.set_thread_num(1);

        let hw = hw.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let hw = hw.clone();
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn, queued| {
                        assert!(queued >= HIGH_WATER_MARK);
                        hw.fetch_add(1, Ordering::SeqCst);
                    }),
                    HIGH_WATER_MARK,
                );
                // Runs on the owner loop: one oversized send that cannot
                // fit the socket buffer, so the remainder gets queued.
                let blob: Vec<u8> = (0..PAYLOAD_LEN).map(payload_byte).collect();
                conn.send(&blob);
            }
        });
        let wc = wc.clone();
        server.set_write_complete_callback(move |_conn| {
            wc.fetch_add(1, Ordering::SeqCst);
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
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut received = 0usize;
    let mut chunk = vec![0u8; 64 * 1024];
    let deadline = Instant::now() + Duration::from_secs(60);
    while received < PAYLOAD_LEN {
        assert!(Instant::now() < deadline, "payload stalled at {received}");
        let n = client.read(&mut chunk).unwrap();
        assert!(n > 0, "unexpected EOF at {received}");
        for (offset, &byte) in chunk[..n].iter().enumerate() {
            assert_eq!(
                byte,
                payload_byte(received + offset),
                "corruption at byte {}",
                received + offset
            );
        }
        received += n;
    }
    assert_eq!(received, PAYLOAD_LEN);

    let deadline = Instant::now() + Duration::from_secs(5);
    while write_completes.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "write-complete never fired");
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(high_water_hits.load(Ordering::SeqCst), 1);
    assert_eq!(write_completes.load(Ordering::SeqCst), 1);

    drop(client);
    event_loop.quit();
    handle.join().unwrap();
}
