use reactor::{EventLoop, InetAddr, TcpServer};

fn main() {
    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8000".to_string());
    let addr = InetAddr::parse(&bind_addr).expect("invalid listen address");

    let base_loop = EventLoop::new().expect("failed to create event loop");
    let server =
        TcpServer::new(base_loop.clone(), &addr, "echo", false).expect("failed to bind");
    server.set_thread_num(2);

    server.set_connection_callback(|conn| {
        if conn.connected() {
            eprintln!("connection up: {}", conn.peer_addr());
        } else {
            eprintln!("connection down: {}", conn.peer_addr());
        }
    });
    server.set_message_callback(|conn, buf, _at| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
        conn.shut_down();
    });

    eprintln!("starting echo server on {bind_addr}");
    server.start();
    base_loop.run();
}
