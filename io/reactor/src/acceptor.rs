//! Listening socket plus its channel on the base loop.

use crate::addr::InetAddr;
use crate::channel::{Channel, EventHandlers};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::socket::Socket;
use parking_lot::Mutex;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// Receives each accepted descriptor and its peer address. Without a
/// callback installed the descriptor is simply dropped (closed).
pub type NewConnectionCallback = Box<dyn FnMut(OwnedFd, InetAddr) + Send>;

pub struct Acceptor {
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    on_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Create a nonblocking, close-on-exec listening socket bound to
    /// `listen_addr`, with SO_REUSEADDR on and SO_REUSEPORT as requested.
    pub fn new(
        owner: &Arc<EventLoop>,
        listen_addr: &InetAddr,
        reuse_port: bool,
    ) -> Result<Arc<Self>, Error> {
        let raw = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .map_err(Error::Io)?;
        raw.set_reuse_address(true).map_err(Error::Io)?;
        raw.set_nonblocking(true).map_err(Error::Io)?;

        let socket = Socket::from_fd(OwnedFd::from(raw));
        socket.set_reuse_port(reuse_port).map_err(Error::Io)?;
        socket.bind(listen_addr).map_err(Error::Io)?;

        let channel = Channel::new(Arc::downgrade(owner), socket.fd());
        let acceptor = Arc::new(Acceptor {
            socket,
            channel,
            listening: AtomicBool::new(false),
            on_connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_handlers(EventHandlers {
            read: Some(Box::new(move |_| {
                if let Some(acceptor) = weak.upgrade() {
                    acceptor.handle_read();
                }
            })),
            ..Default::default()
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.on_connection.lock() = Some(cb);
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Enter the OS listening state and arm the read channel. Must run
    /// on the owner loop's thread.
    pub fn listen(self: &Arc<Self>) {
        self.listening.store(true, Ordering::Release);
        if let Err(err) = self.socket.listen() {
            error!(%err, "listen failed");
            return;
        }
        self.channel.enable_reading();
    }

    fn handle_read(&self) {
        match self.socket.accept() {
            Ok((fd, peer_addr)) => {
                let mut on_connection = self.on_connection.lock();
                if let Some(cb) = on_connection.as_mut() {
                    cb(fd, peer_addr);
                }
                // No callback: fd drops here and the connection closes.
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!(%err, "accept failed");
                if err.raw_os_error() == Some(libc::EMFILE) {
                    // fd exhaustion: the listen channel stays armed and
                    // accepting resumes once descriptors free up.
                    error!("socket fd reached the process limit");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
