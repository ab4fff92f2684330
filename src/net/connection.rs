//! Socket + ring buffer pair driven by one event loop.
//!
//! # Responsibilities
//! - Read from the socket into the input ring while it has space
//! - Write the output ring to the socket, trying a "quick write" as soon as
//!   data lands before arming write interest
//! - Derive read/write interest from ring buffer edges, never from polling
//! - Close exactly once: run close handlers, detach from rings, release the socket
//!
//! # Interest rules
//! ```text
//! input ring full            → disarm read
//! input ring writable edge   → arm read
//! output ring readable edge  → quick write, arm write if bytes remain
//! output ring drained        → disarm write, handler.drained()
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::SockRef;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::error::LbError;
use crate::event_loop::EventLoop;
use crate::net::ring_buffer::{RingBuffer, RingBufferEtHandler};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Callbacks a connection raises to whoever splices it.
pub trait ConnectionHandler {
    /// The peer shut down its write side.
    fn remote_closed(&self, conn: &Rc<Connection>);

    /// Everything in the output ring reached the socket.
    fn drained(&self, _conn: &Rc<Connection>) {}

    /// Socket failure. The default closes the connection.
    fn exception(&self, conn: &Rc<Connection>, err: io::Error) {
        tracing::debug!(connection = %conn, error = %err, "Connection failed");
        conn.close();
    }

    /// No traffic for the idle timeout. The default closes the connection.
    fn timeout(&self, conn: &Rc<Connection>) {
        conn.close();
    }
}

/// Receives byte counts as they cross a connection.
pub trait NetFlowRecorder {
    fn inc_from_remote_bytes(&self, bytes: u64);
    fn inc_to_remote_bytes(&self, bytes: u64);
}

type CloseHandler = Box<dyn FnOnce(&Connection)>;

/// One non-blocking TCP stream with an input and an output ring.
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    /// `None` once released by `close()`.
    stream: RefCell<Option<Rc<TcpStream>>>,
    in_buffer: RefCell<Rc<RingBuffer>>,
    out_buffer: RefCell<Rc<RingBuffer>>,
    in_handler: Rc<dyn RingBufferEtHandler>,
    out_handler: Rc<dyn RingBufferEtHandler>,
    handler: RefCell<Option<Rc<dyn ConnectionHandler>>>,
    event_loop: RefCell<Option<EventLoop>>,

    read_armed: Cell<bool>,
    write_armed: Cell<bool>,
    /// Wakes the driver when interest changes or the connection closes.
    interest: Notify,

    closed: Cell<bool>,
    remote_closed: Cell<bool>,
    write_shutdown: Cell<bool>,

    timeout: Cell<Duration>,
    last_active: Cell<Instant>,

    from_remote_bytes: Cell<u64>,
    to_remote_bytes: Cell<u64>,
    recorders: RefCell<Vec<Arc<dyn NetFlowRecorder>>>,
    close_handlers: RefCell<Vec<CloseHandler>>,
}

impl Connection {
    /// Wrap `stream`. Bytes read go to `in_buffer`, bytes in `out_buffer` are written.
    pub fn new(
        stream: TcpStream,
        remote: SocketAddr,
        in_buffer: Rc<RingBuffer>,
        out_buffer: Rc<RingBuffer>,
        timeout: Duration,
    ) -> Rc<Self> {
        let local = stream.local_addr().ok();
        let read_armed = in_buffer.free() > 0;
        let write_armed = out_buffer.used() > 0;

        let conn = Rc::new_cyclic(|weak: &Weak<Connection>| {
            let in_handler: Rc<dyn RingBufferEtHandler> = Rc::new(InBufferEtHandler {
                conn: weak.clone(),
            });
            let out_handler: Rc<dyn RingBufferEtHandler> = Rc::new(OutBufferEtHandler {
                conn: weak.clone(),
            });
            Connection {
                id: ConnectionId::new(),
                remote,
                local,
                stream: RefCell::new(Some(Rc::new(stream))),
                in_buffer: RefCell::new(in_buffer),
                out_buffer: RefCell::new(out_buffer),
                in_handler,
                out_handler,
                handler: RefCell::new(None),
                event_loop: RefCell::new(None),
                read_armed: Cell::new(read_armed),
                write_armed: Cell::new(write_armed),
                interest: Notify::new(),
                closed: Cell::new(false),
                remote_closed: Cell::new(false),
                write_shutdown: Cell::new(false),
                timeout: Cell::new(timeout),
                last_active: Cell::new(Instant::now()),
                from_remote_bytes: Cell::new(0),
                to_remote_bytes: Cell::new(0),
                recorders: RefCell::new(Vec::new()),
                close_handlers: RefCell::new(Vec::new()),
            }
        });
        conn.in_buffer().add_handler(conn.in_handler.clone());
        conn.out_buffer().add_handler(conn.out_handler.clone());
        conn
    }

    /// Begin driving the socket on the current loop.
    ///
    /// Must be called from a task running inside an event loop's `LocalSet`.
    pub fn start(self: &Rc<Self>, handler: Rc<dyn ConnectionHandler>) {
        *self.handler.borrow_mut() = Some(handler);
        *self.event_loop.borrow_mut() = EventLoop::current();
        tokio::task::spawn_local(self.clone().drive());
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Ring filled from the socket.
    pub fn in_buffer(&self) -> Rc<RingBuffer> {
        self.in_buffer.borrow().clone()
    }

    /// Ring flushed to the socket.
    pub fn out_buffer(&self) -> Rc<RingBuffer> {
        self.out_buffer.borrow().clone()
    }

    /// The loop driving this connection, while it is open and started.
    pub fn event_loop(&self) -> Option<EventLoop> {
        self.event_loop.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed.get()
    }

    /// True while the socket has not been released.
    pub fn holds_socket(&self) -> bool {
        self.stream.borrow().is_some()
    }

    pub fn from_remote_bytes(&self) -> u64 {
        self.from_remote_bytes.get()
    }

    pub fn to_remote_bytes(&self) -> u64 {
        self.to_remote_bytes.get()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout.set(timeout);
    }

    pub fn add_net_flow_recorder(&self, recorder: Arc<dyn NetFlowRecorder>) {
        self.recorders.borrow_mut().push(recorder);
    }

    /// Register `handler` to run once when the connection closes.
    pub fn add_close_handler<F>(&self, handler: F)
    where
        F: FnOnce(&Connection) + 'static,
    {
        self.close_handlers.borrow_mut().push(Box::new(handler));
    }

    /// Swap both rings. Every ring involved must be empty.
    pub fn replace_buffers(&self, in_buffer: Rc<RingBuffer>, out_buffer: Rc<RingBuffer>) -> Result<(), LbError> {
        let old_in = self.in_buffer();
        let old_out = self.out_buffer();
        old_in.check_switch(&in_buffer)?;
        old_out.check_switch(&out_buffer)?;

        old_in.remove_handler(&self.in_handler);
        old_out.remove_handler(&self.out_handler);
        in_buffer.add_handler(self.in_handler.clone());
        out_buffer.add_handler(self.out_handler.clone());

        let readable = in_buffer.free() > 0 && !self.remote_closed.get();
        *self.in_buffer.borrow_mut() = in_buffer;
        *self.out_buffer.borrow_mut() = out_buffer;
        self.read_armed.set(readable);
        self.write_armed.set(false);
        self.interest.notify_one();
        Ok(())
    }

    /// Shut down the write side once, telling the peer no more bytes follow.
    pub fn close_write(&self) {
        if self.closed.get() || self.write_shutdown.replace(true) {
            return;
        }
        if let Some(stream) = self.stream.borrow().as_ref() {
            if let Err(e) = SockRef::from(stream.as_ref()).shutdown(std::net::Shutdown::Write) {
                tracing::trace!(connection = %self, error = %e, "Write shutdown failed");
            }
        }
    }

    /// Close the connection. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }

        self.recorders.borrow_mut().clear();
        let handlers = std::mem::take(&mut *self.close_handlers.borrow_mut());
        for handler in handlers {
            handler(self);
        }

        self.in_buffer().remove_handler(&self.in_handler);
        self.out_buffer().remove_handler(&self.out_handler);
        self.event_loop.borrow_mut().take();
        self.handler.borrow_mut().take();

        if let Some(stream) = self.stream.borrow_mut().take() {
            // the driver may still hold a clone; shutting down makes the release visible now
            let _ = SockRef::from(stream.as_ref()).shutdown(std::net::Shutdown::Both);
        }
        self.interest.notify_one();
        tracing::trace!(connection = %self, "Connection closed");
    }

    async fn drive(self: Rc<Self>) {
        loop {
            if self.closed.get() {
                break;
            }
            let Some(stream) = self.stream.borrow().clone() else {
                break;
            };
            let interest = match (self.read_armed.get(), self.write_armed.get()) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            };

            tokio::select! {
                _ = self.interest.notified() => {}
                ready = wait_ready(&stream, interest) => match ready {
                    Ok(ready) => self.on_ready(&stream, ready),
                    Err(e) => self.fail(e),
                },
                _ = tokio::time::sleep_until(self.idle_deadline().into()) => self.check_idle(),
            }
        }
    }

    fn on_ready(self: &Rc<Self>, stream: &TcpStream, ready: Ready) {
        if self.read_armed.get() && (ready.is_readable() || ready.is_read_closed()) {
            self.do_read(stream);
        }
        if self.closed.get() {
            return;
        }
        if self.write_armed.get() && (ready.is_writable() || ready.is_write_closed()) {
            self.do_write(stream);
        }
    }

    fn do_read(self: &Rc<Self>, stream: &TcpStream) {
        let buf = self.in_buffer();
        match buf.read_from(stream) {
            Ok((n, eof)) => {
                if n > 0 {
                    self.touch();
                    self.inc_from_remote_bytes(n as u64);
                }
                if self.closed.get() {
                    return;
                }
                if eof {
                    self.read_armed.set(false);
                    self.remote_closed.set(true);
                    if let Some(handler) = self.handler() {
                        handler.remote_closed(self);
                    }
                } else if buf.free() == 0 {
                    self.read_armed.set(false);
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn do_write(self: &Rc<Self>, stream: &TcpStream) {
        let buf = self.out_buffer();
        match buf.write_to(stream) {
            Ok(n) => {
                if n > 0 {
                    self.touch();
                    self.inc_to_remote_bytes(n as u64);
                }
                if self.closed.get() {
                    return;
                }
                if buf.used() == 0 {
                    self.write_armed.set(false);
                    if let Some(handler) = self.handler() {
                        handler.drained(self);
                    }
                }
            }
            Err(e) => self.fail(e),
        }
    }

    /// Output ring became readable: write right away, fall back to write interest.
    fn quick_write(self: &Rc<Self>) {
        if self.closed.get() {
            return;
        }
        let Some(stream) = self.stream.borrow().clone() else {
            return;
        };
        self.touch();

        let buf = self.out_buffer();
        match buf.write_to(&stream) {
            Ok(n) if n > 0 => self.inc_to_remote_bytes(n as u64),
            Ok(_) => {}
            // surfaced again by the driver once write interest is armed
            Err(e) => tracing::trace!(connection = %self, error = %e, "Quick write failed"),
        }
        if self.closed.get() {
            return;
        }
        if buf.used() == 0 {
            if let Some(handler) = self.handler() {
                handler.drained(self);
            }
        } else {
            self.arm_write();
        }
    }

    fn arm_read(&self) {
        if !self.read_armed.replace(true) {
            self.interest.notify_one();
        }
    }

    fn arm_write(&self) {
        if !self.write_armed.replace(true) {
            self.interest.notify_one();
        }
    }

    fn fail(self: &Rc<Self>, err: io::Error) {
        match self.handler() {
            Some(handler) => handler.exception(self, err),
            None => self.close(),
        }
    }

    fn check_idle(self: &Rc<Self>) {
        if self.last_active.get().elapsed() < self.timeout.get() {
            return;
        }
        tracing::debug!(connection = %self, timeout_ms = self.timeout.get().as_millis() as u64, "Connection idle timeout");
        match self.handler() {
            Some(handler) => handler.timeout(self),
            None => self.close(),
        }
    }

    fn idle_deadline(&self) -> Instant {
        let last = self.last_active.get();
        last.checked_add(self.timeout.get())
            .unwrap_or_else(|| last + Duration::from_secs(365 * 24 * 3600))
    }

    fn touch(&self) {
        self.last_active.set(Instant::now());
    }

    fn handler(&self) -> Option<Rc<dyn ConnectionHandler>> {
        self.handler.borrow().clone()
    }

    fn inc_from_remote_bytes(&self, bytes: u64) {
        self.from_remote_bytes.set(self.from_remote_bytes.get() + bytes);
        for r in self.recorders.borrow().iter() {
            r.inc_from_remote_bytes(bytes);
        }
    }

    fn inc_to_remote_bytes(&self, bytes: u64) {
        self.to_remote_bytes.set(self.to_remote_bytes.get() + bytes);
        for r in self.recorders.borrow().iter() {
            r.inc_to_remote_bytes(bytes);
        }
    }
}

async fn wait_ready(stream: &TcpStream, interest: Option<Interest>) -> io::Result<Ready> {
    match interest {
        Some(interest) => stream.ready(interest).await,
        None => std::future::pending().await,
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local {
            Some(local) => write!(f, "Connection({}/{})", self.remote, local)?,
            None => write!(f, "Connection({}/[unbound])", self.remote)?,
        }
        if self.closed.get() {
            write!(f, "[closed]")
        } else {
            write!(f, "[open]")
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("closed", &self.closed.get())
            .finish()
    }
}

struct InBufferEtHandler {
    conn: Weak<Connection>,
}

impl RingBufferEtHandler for InBufferEtHandler {
    fn readable_et(&self) {}

    fn writable_et(&self) {
        if let Some(conn) = self.conn.upgrade() {
            if !conn.closed.get() && !conn.remote_closed.get() {
                conn.arm_read();
            }
        }
    }
}

struct OutBufferEtHandler {
    conn: Weak<Connection>,
}

impl RingBufferEtHandler for OutBufferEtHandler {
    fn readable_et(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.quick_write();
        }
    }

    fn writable_et(&self) {}
}
