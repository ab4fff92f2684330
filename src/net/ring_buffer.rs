//! Bounded byte ring with edge-triggered notifications.
//!
//! # Responsibilities
//! - Hold bytes travelling in one direction of a spliced session
//! - Notify registered handlers exactly once per state transition:
//!   - readable edge: the ring went from empty to non-empty
//!   - writable edge: the ring went from full to non-full
//!
//! # Design Decisions
//! - Owned by one event loop thread; `Rc`/`RefCell` make it `!Send`
//! - Handlers run after the internal borrow is released, so a handler may
//!   read from or write to the same ring
//! - The ring never grows: a full ring is the backpressure signal

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use tokio::net::TcpStream;

use crate::error::LbError;

/// Receives edge notifications from a [`RingBuffer`].
pub trait RingBufferEtHandler {
    /// The ring went from empty to non-empty.
    fn readable_et(&self);
    /// The ring went from full to non-full.
    fn writable_et(&self);
}

#[derive(Debug)]
struct Ring {
    buf: Box<[u8]>,
    /// Index of the first stored byte.
    head: usize,
    /// Number of stored bytes.
    len: usize,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Largest contiguous writable region.
    fn free_slice(&mut self) -> &mut [u8] {
        let cap = self.capacity();
        if self.len == cap {
            return &mut [];
        }
        let tail = (self.head + self.len) % cap;
        let end = if tail >= self.head { cap } else { self.head };
        &mut self.buf[tail..end]
    }

    /// Largest contiguous readable region.
    fn used_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        let end = (self.head + self.len).min(self.capacity());
        &self.buf[self.head..end]
    }

    fn commit_write(&mut self, n: usize) {
        self.len += n;
    }

    fn commit_read(&mut self, n: usize) {
        self.len -= n;
        self.head = if self.len == 0 {
            0
        } else {
            (self.head + n) % self.capacity()
        };
    }
}

enum Edge {
    Readable,
    Writable,
}

/// Fixed-capacity byte ring shared by the two connections of a session.
pub struct RingBuffer {
    ring: RefCell<Ring>,
    handlers: RefCell<Vec<Rc<dyn RingBufferEtHandler>>>,
}

impl RingBuffer {
    /// Create an empty ring able to hold `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: RefCell::new(Ring::with_capacity(capacity.max(1))),
            handlers: RefCell::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.borrow().capacity()
    }

    /// Bytes currently stored.
    pub fn used(&self) -> usize {
        self.ring.borrow().len
    }

    /// Bytes that can still be stored.
    pub fn free(&self) -> usize {
        self.ring.borrow().free()
    }

    pub fn add_handler(&self, handler: Rc<dyn RingBufferEtHandler>) {
        self.handlers.borrow_mut().push(handler);
    }

    /// Remove a handler previously added. Removing an unknown handler is a no-op.
    pub fn remove_handler(&self, handler: &Rc<dyn RingBufferEtHandler>) {
        self.handlers
            .borrow_mut()
            .retain(|h| !std::ptr::addr_eq(Rc::as_ptr(h), Rc::as_ptr(handler)));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    /// Copy as many bytes of `data` as fit. Returns the number stored.
    pub fn store(&self, data: &[u8]) -> usize {
        let mut offset = 0;
        let stored = self.fill_with(|dst| {
            let n = dst.len().min(data.len() - offset);
            dst[..n].copy_from_slice(&data[offset..offset + n]);
            offset += n;
            Ok(n)
        });
        // the closure above never fails
        stored.unwrap_or(0)
    }

    /// Move up to `dst.len()` stored bytes into `dst`. Returns the number moved.
    pub fn fetch(&self, dst: &mut [u8]) -> usize {
        let mut offset = 0;
        let fetched = self.drain_with(|src| {
            let n = src.len().min(dst.len() - offset);
            dst[offset..offset + n].copy_from_slice(&src[..n]);
            offset += n;
            Ok(n)
        });
        fetched.unwrap_or(0)
    }

    /// Fill free space by repeatedly calling `read` on contiguous free regions.
    ///
    /// Stops when the ring is full, when `read` returns fewer bytes than
    /// offered, or on `WouldBlock`. An error is only returned when nothing was
    /// stored; otherwise it resurfaces on the next attempt.
    pub fn fill_with<F>(&self, mut read: F) -> io::Result<usize>
    where
        F: FnMut(&mut [u8]) -> io::Result<usize>,
    {
        let was_empty = self.used() == 0;
        let mut total = 0;
        let mut failure = None;
        {
            let mut ring = self.ring.borrow_mut();
            loop {
                let region = ring.free_slice();
                let offered = region.len();
                if offered == 0 {
                    break;
                }
                match read(region) {
                    Ok(n) => {
                        let n = n.min(offered);
                        ring.commit_write(n);
                        total += n;
                        if n < offered {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if was_empty && total > 0 {
            self.fire(Edge::Readable);
        }
        match failure {
            Some(e) if total == 0 => Err(e),
            _ => Ok(total),
        }
    }

    /// Drain stored bytes by repeatedly calling `write` on contiguous regions.
    ///
    /// Same stopping and error rules as [`RingBuffer::fill_with`].
    pub fn drain_with<F>(&self, mut write: F) -> io::Result<usize>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        let was_full = self.free() == 0;
        let mut total = 0;
        let mut failure = None;
        {
            let mut ring = self.ring.borrow_mut();
            loop {
                let region = ring.used_slice();
                let offered = region.len();
                if offered == 0 {
                    break;
                }
                match write(region) {
                    Ok(n) => {
                        let n = n.min(offered);
                        ring.commit_read(n);
                        total += n;
                        if n < offered {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        if was_full && total > 0 {
            self.fire(Edge::Writable);
        }
        match failure {
            Some(e) if total == 0 => Err(e),
            _ => Ok(total),
        }
    }

    /// Read from a non-blocking socket into the ring.
    ///
    /// Returns `Ok((n, eof))`; `eof` is set when the peer closed its write side.
    pub fn read_from(&self, stream: &TcpStream) -> io::Result<(usize, bool)> {
        let mut eof = false;
        let n = self.fill_with(|dst| match stream.try_read(dst) {
            Ok(0) => {
                eof = true;
                Ok(0)
            }
            other => other,
        })?;
        Ok((n, eof))
    }

    /// Write stored bytes to a non-blocking socket.
    pub fn write_to(&self, stream: &TcpStream) -> io::Result<usize> {
        self.drain_with(|src| stream.try_write(src))
    }

    /// Check that `self` may be switched for `other`: both must be empty.
    pub fn check_switch(&self, other: &RingBuffer) -> Result<(), LbError> {
        if self.used() != 0 || other.used() != 0 {
            return Err(LbError::RejectSwitch);
        }
        Ok(())
    }

    /// Exchange the storage of two empty rings, keeping each ring's handlers.
    pub fn switch_buffer(&self, other: &RingBuffer) -> Result<(), LbError> {
        self.check_switch(other)?;
        std::mem::swap(&mut *self.ring.borrow_mut(), &mut *other.ring.borrow_mut());
        Ok(())
    }

    fn fire(&self, edge: Edge) {
        // snapshot: a handler may add or remove handlers while we iterate
        let handlers: Vec<_> = self.handlers.borrow().clone();
        for h in handlers {
            match edge {
                Edge::Readable => h.readable_et(),
                Edge::Writable => h.writable_et(),
            }
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("handlers", &self.handler_count())
            .finish()
    }
}
