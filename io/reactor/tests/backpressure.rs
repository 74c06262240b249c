//! High-watermark backpressure on a peer that refuses to read.

use reactor::{EventLoop, InetAddr, TcpServer};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const HIGH_WATER_MARK: usize = 1024;
// Large enough that loopback socket buffers cannot swallow it all.
const PAYLOAD: usize = 64 * 1024 * 1024;

fn wait_until(timeout: Duration, pred: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn high_water_mark_fires_once_per_crossing() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let hwm_level = Arc::new(AtomicUsize::new(0));
    let wc_hits = Arc::new(AtomicUsize::new(0));
    let (hits, level, wc) = (hwm_hits.clone(), hwm_level.clone(), wc_hits.clone());

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let base_loop = EventLoop::new().unwrap();
        let listen = InetAddr::parse(&format!("127.0.0.1:{port}")).unwrap();
        let server = TcpServer::new(base_loop.clone(), &listen, "bp", false).unwrap();
        server.set_thread_num(1);

        let wc = wc.clone();
        server.set_write_complete_callback(move |_conn| {
            wc.fetch_add(1, Ordering::SeqCst);
        });
        server.set_connection_callback(move |conn| {
            if !conn.connected() {
                return;
            }
            let hits = hits.clone();
            let level = level.clone();
            conn.set_high_water_mark_callback(
                Arc::new(move |_conn, total| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    level.store(total, Ordering::SeqCst);
                }),
                HIGH_WATER_MARK,
            );
            // The peer never reads, so the direct write stalls and the
            // rest lands in the output buffer.
            conn.send(&vec![0u8; PAYLOAD]);
        });
        server.set_message_callback(|_conn, buf, _at| {
            buf.retrieve_all();
        });

        server.start();
        tx.send(base_loop.clone()).unwrap();
        base_loop.run();
        drop(server);
    });
    let base_loop: Arc<EventLoop> = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let client = TcpStream::connect(addr).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        hwm_hits.load(Ordering::SeqCst) == 1
    }));
    assert!(hwm_level.load(Ordering::SeqCst) >= HIGH_WATER_MARK);

    // The client still has not read a byte: the callback must not fire
    // again and the write cannot have completed.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(hwm_hits.load(Ordering::SeqCst), 1);
    assert_eq!(wc_hits.load(Ordering::SeqCst), 0);

    drop(client);
    base_loop.quit();
    handle.join().unwrap();
}
