//! Per-client connection state machine.
//!
//! A connection owns its socket, a channel on its assigned worker loop,
//! and input/output buffers. Every syscall and user callback for the
//! connection runs on that worker loop's thread; the shared handle is
//! only a way to get work posted there.
//!
//! ```text
//! Connecting --connect_established--> Connected
//! Connected  --shut_down-----------> Disconnecting
//! Connected  --peer close/error----> Disconnected   (handle_close)
//! Disconnecting --output drained---> handle_close -> Disconnected
//! ```

use crate::addr::InetAddr;
use crate::buffer::Buffer;
use crate::channel::{Channel, EventHandlers};
use crate::event_loop::EventLoop;
use crate::socket::Socket;
use crate::timestamp::Timestamp;
use parking_lot::Mutex;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, trace, warn};

/// Output-buffer threshold above which the high-watermark callback
/// fires (once per crossing).
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

pub type TcpConnectionHandle = Arc<TcpConnection>;
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionHandle) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionHandle, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionHandle) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionHandle, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionHandle) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    owner: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    /// Wrap an accepted descriptor. SO_KEEPALIVE is turned on; the
    /// channel's callbacks are wired to this connection through weak
    /// references so a dead connection drops events instead of firing.
    pub fn new(
        owner: Arc<EventLoop>,
        name: String,
        fd: OwnedFd,
        local_addr: InetAddr,
        peer_addr: InetAddr,
    ) -> Arc<Self> {
        let socket = Socket::from_fd(fd);
        if let Err(err) = socket.set_keep_alive(true) {
            warn!(name = %name, %err, "failed to enable keepalive");
        }
        let channel = Channel::new(Arc::downgrade(&owner), socket.fd());
        info!(name = %name, fd = channel.fd(), "connection created");

        let conn = Arc::new(TcpConnection {
            owner,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(Callbacks::default()),
        });

        let (read, write, close, err) = (
            Arc::downgrade(&conn),
            Arc::downgrade(&conn),
            Arc::downgrade(&conn),
            Arc::downgrade(&conn),
        );
        conn.channel.set_handlers(EventHandlers {
            read: Some(Box::new(move |at| {
                if let Some(conn) = read.upgrade() {
                    conn.handle_read(at);
                }
            })),
            write: Some(Box::new(move || {
                if let Some(conn) = write.upgrade() {
                    conn.handle_write();
                }
            })),
            close: Some(Box::new(move || {
                if let Some(conn) = close.upgrade() {
                    conn.handle_close();
                }
            })),
            error: Some(Box::new(move || {
                if let Some(conn) = err.upgrade() {
                    conn.handle_error();
                }
            })),
        });

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddr {
        self.peer_addr
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.owner
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// TCP_NODELAY is exposed but not set by default.
    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Release);
        self.callbacks.lock().high_water_mark = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().close = Some(cb);
    }

    /// Thread-safe send. A no-op unless connected; off the worker loop
    /// the bytes are copied and the write is posted to it.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.owner.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let owned = data.to_vec();
            self.owner.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Half-close the write side once the output buffer drains.
    pub fn shut_down(self: &Arc<Self>) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = self.clone();
            self.owner.run_in_loop(move || conn.shut_down_in_loop());
        }
    }

    /// Runs on the worker loop right after the server hands the
    /// connection over: arm reading, install the lifetime guard, tell
    /// the user.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.set_state(State::Connected);
        self.channel.tie(self.clone());
        self.channel.enable_reading();
        if let Some(cb) = self.connection_callback() {
            cb(self);
        }
    }

    /// Final teardown, posted to the worker loop by the server after the
    /// table entry is gone. The last handle drop closes the socket.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.connection_callback() {
                cb(self);
            }
        }
        self.channel.remove();
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.callbacks.lock().connection.clone()
    }

    fn message_callback(&self) -> Option<MessageCallback> {
        self.callbacks.lock().message.clone()
    }

    fn write_complete_callback(&self) -> Option<WriteCompleteCallback> {
        self.callbacks.lock().write_complete.clone()
    }

    fn high_water_mark_callback(&self) -> Option<HighWaterMarkCallback> {
        self.callbacks.lock().high_water_mark.clone()
    }

    fn close_callback(&self) -> Option<CloseCallback> {
        self.callbacks.lock().close.clone()
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state() == State::Disconnected {
            warn!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut nwrote = 0usize;
        let mut fault = false;
        let mut output = self.output.lock();

        // Nothing queued and not watching writability: try the direct
        // write first.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            let n = unsafe {
                libc::write(
                    self.channel.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                nwrote = n as usize;
                if nwrote == data.len() {
                    if let Some(cb) = self.write_complete_callback() {
                        let conn = self.clone();
                        self.owner.queue_in_loop(move || cb(&conn));
                    }
                }
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!(name = %self.name, %err, "write failed");
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    ) {
                        fault = true;
                    }
                }
            }
        }

        let remaining = data.len() - nwrote;
        if remaining > 0 && !fault {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= mark && old_len < mark {
                if let Some(cb) = self.high_water_mark_callback() {
                    let conn = self.clone();
                    let total = old_len + remaining;
                    self.owner.queue_in_loop(move || cb(&conn, total));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shut_down_in_loop(&self) {
        // Still watching writability means the output buffer has bytes;
        // handle_write re-invokes this once it drains.
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!(name = %self.name, %err, "shutdown failed");
            }
        }
    }

    fn handle_read(self: &Arc<Self>, at: Timestamp) {
        let mut input = self.input.lock();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                trace!(name = %self.name, bytes = n, "readable");
                if let Some(cb) = self.message_callback() {
                    cb(self, &mut input, at);
                } else {
                    input.retrieve_all();
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(input);
                error!(name = %self.name, %err, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.is_writing() {
            trace!(fd = self.channel.fd(), "connection is down, no more writing");
            return;
        }
        let mut output = self.output.lock();
        let n = unsafe {
            libc::write(
                self.channel.fd(),
                output.peek().as_ptr() as *const libc::c_void,
                output.readable_bytes(),
            )
        };
        if n > 0 {
            output.retrieve(n as usize);
            if output.readable_bytes() == 0 {
                self.channel.disable_writing();
                if let Some(cb) = self.write_complete_callback() {
                    let conn = self.clone();
                    self.owner.queue_in_loop(move || cb(&conn));
                }
                if self.state() == State::Disconnecting {
                    drop(output);
                    self.shut_down_in_loop();
                }
            }
        } else {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!(name = %self.name, %err, "write failed");
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        info!(name = %self.name, state = ?self.state(), "connection closed");
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        if let Some(cb) = self.connection_callback() {
            cb(self);
        }
        // The close callback carries removal back to the server.
        if let Some(cb) = self.close_callback() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let mut optval: libc::c_int = 0;
        let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let err = if unsafe {
            libc::getsockopt(
                self.channel.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut optval as *mut libc::c_int as *mut libc::c_void,
                &mut optlen,
            )
        } < 0
        {
            io::Error::last_os_error()
        } else {
            io::Error::from_raw_os_error(optval)
        };
        error!(name = %self.name, %err, "socket error");
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        info!(name = %self.name, fd = self.channel.fd(), "connection dropped");
    }
}
