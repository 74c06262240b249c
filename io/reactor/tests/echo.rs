//! End-to-end tests over real sockets: echo, cross-thread send,
//! round-robin dispatch, peer reset, and wakeup latency.

use reactor::{EventLoop, InetAddr, TcpConnectionHandle, TcpServer};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Spin until `pred` holds or the timeout expires.
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

struct TestServer {
    base_loop: Arc<EventLoop>,
    addr: SocketAddr,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    /// Start a server on its own base-loop thread. `configure` runs
    /// before `start()` to wire callbacks.
    fn start(
        name: &str,
        threads: usize,
        configure: impl FnOnce(&TcpServer) + Send + 'static,
    ) -> Self {
        let port = get_available_port();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let name = name.to_string();
        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let base_loop = EventLoop::new().unwrap();
            let listen = InetAddr::parse(&format!("127.0.0.1:{port}")).unwrap();
            let server = TcpServer::new(base_loop.clone(), &listen, name, false).unwrap();
            server.set_thread_num(threads);
            configure(&server);
            server.start();
            tx.send(base_loop.clone()).unwrap();
            base_loop.run();
            drop(server);
        });

        // listen() runs synchronously inside start() on the base thread,
        // so the socket accepts connections as soon as this returns.
        let base_loop = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        TestServer {
            base_loop,
            addr,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.base_loop.quit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn echo_then_eof() {
    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    let (u, d) = (ups.clone(), downs.clone());

    let server = TestServer::start("echo", 2, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                u.fetch_add(1, Ordering::SeqCst);
            } else {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.set_message_callback(|conn, buf, _at| {
            let msg = buf.retrieve_all_as_string();
            conn.send(msg.as_bytes());
            conn.shut_down();
        });
    });

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.write_all(b"hello").unwrap();

    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, b"hello");

    assert!(wait_until(Duration::from_secs(5), || {
        ups.load(Ordering::SeqCst) == 1 && downs.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn cross_thread_send() {
    let slot: Arc<Mutex<Option<TcpConnectionHandle>>> = Arc::new(Mutex::new(None));
    let s = slot.clone();

    let server = TestServer::start("xsend", 1, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                *s.lock().unwrap() = Some(conn.clone());
            }
        });
        server.set_message_callback(|_conn, buf, _at| {
            buf.retrieve_all();
        });
    });

    let mut client = TcpStream::connect(server.addr).unwrap();
    assert!(wait_until(Duration::from_secs(5), || slot
        .lock()
        .unwrap()
        .is_some()));

    // This test thread is unrelated to any loop thread.
    let conn = slot.lock().unwrap().clone().unwrap();
    conn.send(b"x");

    let mut byte = [0u8; 1];
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"x");
}

#[test]
fn round_robin_dispatch() {
    let assigned: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let a = assigned.clone();

    let server = TestServer::start("rr", 3, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                a.lock()
                    .unwrap()
                    .push(Arc::as_ptr(conn.owner_loop()) as usize);
            }
        });
    });

    let mut clients = Vec::new();
    for i in 0..5 {
        clients.push(TcpStream::connect(server.addr).unwrap());
        // Sequential accepts: wait for each UP before the next connect.
        assert!(wait_until(Duration::from_secs(5), || {
            assigned.lock().unwrap().len() == i + 1
        }));
    }

    let picks = assigned.lock().unwrap().clone();
    assert_eq!(picks.len(), 5);
    assert_eq!(picks[0], picks[3]);
    assert_eq!(picks[1], picks[4]);
    assert_ne!(picks[0], picks[1]);
    assert_ne!(picks[1], picks[2]);
    assert_ne!(picks[0], picks[2]);
}

#[test]
fn peer_reset_removes_connection_once() {
    let downs = Arc::new(AtomicUsize::new(0));
    let d = downs.clone();

    let server = TestServer::start("reset", 1, move |server| {
        server.set_connection_callback(move |conn| {
            if !conn.connected() {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.set_message_callback(|_conn, buf, _at| {
            buf.retrieve_all();
        });
    });

    let client = TcpStream::connect(server.addr).unwrap();
    (&client).write_all(b"abc").unwrap();
    // SO_LINGER(0) turns the close into an RST.
    let raw = socket2::SockRef::from(&client);
    raw.set_linger(Some(Duration::from_secs(0))).unwrap();
    drop(client);

    assert!(wait_until(Duration::from_secs(5), || {
        downs.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(downs.load(Ordering::SeqCst), 1);
}

#[test]
fn start_is_idempotent() {
    let ups = Arc::new(AtomicUsize::new(0));
    let u = ups.clone();

    let server = TestServer::start("twice", 1, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                u.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.set_message_callback(|conn, buf, _at| {
            let msg = buf.retrieve_all_as_string();
            conn.send(msg.as_bytes());
            conn.shut_down();
        });
        // Second start must be a no-op.
        server.start();
    });

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.write_all(b"ping").unwrap();
    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, b"ping");
    assert!(wait_until(Duration::from_secs(5), || {
        ups.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn idle_loop_wakes_for_foreign_task() {
    let server = TestServer::start("wake", 0, |_| {});

    // The base loop is parked in poll with a 10 s timeout; a foreign
    // run_in_loop must get through within milliseconds.
    thread::sleep(Duration::from_millis(100));
    let before = server.base_loop.poll_return_time();
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    server.base_loop.run_in_loop(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(server.base_loop.poll_return_time() >= before);
}
