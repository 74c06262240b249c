//! Echo application wiring.

use crate::config::Config;
use crate::metrics;
use reactor::{Error, EventLoop, InetAddr, TcpServer};
use std::sync::Arc;
use tracing::info;

/// Echoes every message back to the peer, then half-closes the write
/// side so the client sees EOF after its reply.
pub struct EchoServer {
    server: TcpServer,
}

impl EchoServer {
    pub fn new(base_loop: Arc<EventLoop>, config: &Config) -> Result<Self, Error> {
        let addr = InetAddr::parse(&config.server.address)?;
        let server = TcpServer::new(
            base_loop,
            &addr,
            config.server.name.clone(),
            config.server.reuse_port,
        )?;
        server.set_thread_num(config.workers.threads);

        server.set_connection_callback(|conn| {
            if conn.connected() {
                metrics::CONNECTIONS_ACCEPTED.increment();
                metrics::CONNECTIONS_ACTIVE.increment();
                info!(peer = %conn.peer_addr(), "connection up");
            } else {
                metrics::CONNECTIONS_ACTIVE.decrement();
                info!(peer = %conn.peer_addr(), "connection down");
            }
        });
        server.set_message_callback(|conn, buf, _at| {
            let msg = buf.retrieve_all_as_string();
            metrics::BYTES_RECEIVED.add(msg.len() as u64);
            conn.send(msg.as_bytes());
            metrics::BYTES_SENT.add(msg.len() as u64);
            conn.shut_down();
        });

        Ok(EchoServer { server })
    }

    pub fn start(&self) {
        self.server.start();
    }

    pub fn name(&self) -> &str {
        self.server.name()
    }
}
