//! One-loop-per-thread reactor TCP server framework.
//!
//! A `TcpServer` accepts connections on a base event loop and distributes
//! them round-robin across a fixed pool of worker loops. Each loop blocks
//! in an epoll-backed poller and drives per-descriptor channels; all I/O
//! and user callbacks for a connection run on its assigned loop thread.

pub mod acceptor;
pub mod addr;
pub mod buffer;
pub mod channel;
pub mod connection;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod loop_pool;
pub mod loop_thread;
pub mod poller;
pub mod server;
pub mod socket;
pub mod timestamp;

// Public API re-exports
pub use addr::InetAddr;
pub use buffer::Buffer;
pub use channel::{Channel, EventHandlers};
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    TcpConnectionHandle, WriteCompleteCallback,
};
pub use error::Error;
pub use event_loop::EventLoop;
pub use loop_pool::LoopPool;
pub use loop_thread::{LoopThread, ThreadInitCallback};
pub use poller::{new_default_poller, Poller};
pub use server::TcpServer;
pub use socket::Socket;
pub use timestamp::Timestamp;
