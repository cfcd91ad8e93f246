//! Completion-driven I/O engine.
//!
//! A single [`Ring`] wraps the kernel submission/completion queues and
//! multiplexes socket accepts, socket and file reads/writes, and
//! delimiter-bounded reads across every descriptor in the process. Callers
//! hand each primitive a continuation; the engine owns the continuation and
//! any buffer the kernel may touch from submission until the matching
//! completion is reaped, so nothing the kernel writes into can move or be
//! freed mid-flight.
//!
//! There is no cooperative await anywhere: multi-step operations
//! ([`Ring::read_exact`], [`Ring::write_all`], [`Ring::read_until`]) chain by
//! re-submitting from inside the previous step's continuation, which is also
//! the only ordering guarantee the engine gives.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use io_uring::{opcode, types, IoUring};
use log::warn;
use parking_lot::Mutex;

use crate::sys;

/// Growth step for [`Ring::read_until`] and the transfer engines.
pub const CHUNK_SIZE: usize = 500;

/// Hard cap on a delimiter-bounded read; reaching it completes the read with
/// the whole buffer.
pub const MAX_LINE: usize = 4096;

/// Offset value meaning "use the descriptor's own position" (`-1` to the
/// kernel). Required for pipes and the natural choice for sockets; seekable
/// files take explicit offsets instead.
pub const CURRENT_POS: u64 = u64::MAX;

fn advance(offset: u64, by: usize) -> u64 {
    if offset == CURRENT_POS {
        offset
    } else {
        offset + by as u64
    }
}

/// Continuation for data-carrying operations. Receives the raw kernel result
/// (bytes on success, `-errno` on failure) and ownership of the buffer back.
pub type DataHandler = Box<dyn FnOnce(i32, Vec<u8>) + Send + 'static>;

/// Continuation for accepts: the new descriptor (or `-errno`) and the peer
/// address when the kernel provided one.
pub type AcceptHandler = Box<dyn FnOnce(i32, Option<SocketAddrV4>) + Send + 'static>;

/// Continuation for connects: zero or `-errno`.
pub type StatusHandler = Box<dyn FnOnce(i32) + Send + 'static>;

/// Match predicate for [`Ring::read_until`]: given the bytes accumulated so
/// far, return the length of the matched prefix (delimiter included), or
/// `None` to keep reading.
pub type Predicate = Arc<dyn Fn(&[u8]) -> Option<usize> + Send + Sync>;

/// A reaped completion, ready to run outside the engine lock.
pub type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// Predicate matching through the first occurrence of `delim`.
pub fn delimiter_predicate(delim: &'static [u8]) -> Predicate {
    Arc::new(move |bytes: &[u8]| {
        memchr::memmem::find(bytes, delim).map(|pos| pos + delim.len())
    })
}

/// Predicate matching through the first `\r\n`.
pub fn crlf_predicate() -> Predicate {
    delimiter_predicate(b"\r\n")
}

struct AcceptStorage {
    addr: libc::sockaddr_in,
    len: libc::socklen_t,
}

/// State parked between submission and completion. Owning the buffer (or the
/// sockaddr storage) here is what keeps the kernel's pointers valid.
enum Pending {
    Data { buf: Vec<u8>, cb: DataHandler },
    Accept { storage: Box<AcceptStorage>, cb: AcceptHandler },
    Connect { _storage: Box<libc::sockaddr_in>, cb: StatusHandler },
}

struct Inner {
    ring: IoUring,
    pending: HashMap<u64, Pending>,
    next_token: u64,
}

/// The completion-queue engine. One per server, shared as `Arc<Ring>`.
pub struct Ring {
    inner: Mutex<Inner>,
}

enum IoKind {
    Read,
    Write,
}

impl Ring {
    /// Create an engine whose queues hold `entries` in-flight operations.
    /// `entries` must be a power of two no greater than 4096.
    pub fn new(entries: u32) -> io::Result<Ring> {
        if !entries.is_power_of_two() || entries > 4096 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring size must be a power of two in 1..=4096",
            ));
        }
        let ring = IoUring::new(entries)?;
        Ok(Ring {
            inner: Mutex::new(Inner {
                ring,
                pending: HashMap::new(),
                next_token: 0,
            }),
        })
    }

    /// Push one SQE with its pending record. On a rejected submission the
    /// record (and with it the buffer) is dropped and the error is returned
    /// to the caller synchronously.
    fn submit(&self, entry: io_uring::squeue::Entry, pending: Pending) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        let entry = entry.user_data(token);
        inner.pending.insert(token, pending);

        let pushed = unsafe { inner.ring.submission().push(&entry) };
        if pushed.is_err() {
            // Queue full: flush what is there and retry once.
            if let Err(err) = inner.ring.submit() {
                inner.pending.remove(&token);
                return Err(err);
            }
            if unsafe { inner.ring.submission().push(&entry) }.is_err() {
                inner.pending.remove(&token);
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "submission queue is full",
                ));
            }
        }
        if let Err(err) = inner.ring.submit() {
            inner.pending.remove(&token);
            return Err(err);
        }
        Ok(())
    }

    fn submit_data(
        &self,
        kind: IoKind,
        fd: RawFd,
        buf: Vec<u8>,
        start: usize,
        offset: u64,
        cb: DataHandler,
    ) -> io::Result<()> {
        debug_assert!(start <= buf.len());
        let ptr = buf[start..].as_ptr();
        let len = (buf.len() - start) as u32;
        let entry = match kind {
            IoKind::Read => opcode::Read::new(types::Fd(fd), ptr as *mut u8, len)
                .offset(offset)
                .build(),
            IoKind::Write => opcode::Write::new(types::Fd(fd), ptr, len)
                .offset(offset)
                .build(),
        };
        self.submit(entry, Pending::Data { buf, cb })
    }

    /// Read up to `buf.len()` bytes from `fd` at `offset` into `buf`.
    /// The continuation receives the kernel's byte count and the buffer.
    pub fn read_some(&self, fd: RawFd, buf: Vec<u8>, offset: u64, cb: DataHandler) -> io::Result<()> {
        self.submit_data(IoKind::Read, fd, buf, 0, offset, cb)
    }

    /// Write all of `buf` to `fd` at `offset` in a single submission; the
    /// continuation sees however many bytes the kernel took.
    pub fn write_some(&self, fd: RawFd, buf: Vec<u8>, offset: u64, cb: DataHandler) -> io::Result<()> {
        self.submit_data(IoKind::Write, fd, buf, 0, offset, cb)
    }

    /// Read exactly `buf.len()` bytes, chaining `read_some` from inside each
    /// completion. The continuation receives the total byte count, or the
    /// first non-positive result (`0` = EOF before the buffer filled).
    pub fn read_exact(self: &Arc<Self>, fd: RawFd, buf: Vec<u8>, offset: u64, cb: DataHandler) {
        read_exact_step(Arc::clone(self), fd, buf, 0, offset, cb);
    }

    /// Write all of `buf`, resubmitting the unsent tail until done. The
    /// continuation receives the total byte count or the first error.
    pub fn write_all(self: &Arc<Self>, fd: RawFd, buf: Vec<u8>, offset: u64, cb: DataHandler) {
        write_all_step(Arc::clone(self), fd, buf, 0, offset, cb);
    }

    /// Accumulate bytes from `fd` into `buf` until `pred` reports a match,
    /// the [`MAX_LINE`] cap is hit, or an error occurs. The continuation
    /// receives the match length (or cap, or `-errno`) and the buffer, which
    /// may hold bytes past the match; those are preserved for the caller.
    pub fn read_until(self: &Arc<Self>, fd: RawFd, buf: Vec<u8>, pred: Predicate, cb: DataHandler) {
        read_until_step(Arc::clone(self), fd, buf, pred, cb);
    }

    /// Accept one connection on a listening descriptor.
    pub fn accept(&self, fd: RawFd, cb: AcceptHandler) -> io::Result<()> {
        let mut storage = Box::new(AcceptStorage {
            addr: unsafe { std::mem::zeroed() },
            len: std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        });
        let addr_ptr = &mut storage.addr as *mut libc::sockaddr_in as *mut libc::sockaddr;
        let len_ptr = &mut storage.len as *mut libc::socklen_t;
        let entry = opcode::Accept::new(types::Fd(fd), addr_ptr, len_ptr).build();
        self.submit(entry, Pending::Accept { storage, cb })
    }

    /// Connect a socket to `addr`.
    pub fn connect(&self, fd: RawFd, addr: SocketAddrV4, cb: StatusHandler) -> io::Result<()> {
        let storage = Box::new(sys::sockaddr_of(addr));
        let addr_ptr = &*storage as *const libc::sockaddr_in as *const libc::sockaddr;
        let entry = opcode::Connect::new(
            types::Fd(fd),
            addr_ptr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
        .build();
        self.submit(entry, Pending::Connect { _storage: storage, cb })
    }

    /// Reap one completion. Returns a thunk that invokes the matching
    /// continuation with the result, or `None` when the queue is idle. The
    /// pending record is removed under the lock; the thunk runs without it.
    pub fn poll_one(&self) -> Option<Thunk> {
        let mut inner = self.inner.lock();
        let entry = inner.ring.completion().next()?;
        let (token, result) = (entry.user_data(), entry.result());
        let pending = inner.pending.remove(&token);
        drop(inner);
        let Some(pending) = pending else {
            warn!("completion for unknown token {}", token);
            return None;
        };
        Some(match pending {
            Pending::Data { buf, cb } => Box::new(move || cb(result, buf)),
            Pending::Accept { storage, cb } => Box::new(move || {
                let peer = (result >= 0).then(|| sys::addr_of(&storage.addr));
                cb(result, peer)
            }),
            Pending::Connect { _storage, cb } => Box::new(move || cb(result)),
        })
    }
}

fn read_exact_step(
    ring: Arc<Ring>,
    fd: RawFd,
    buf: Vec<u8>,
    filled: usize,
    offset: u64,
    cb: DataHandler,
) {
    if filled == buf.len() {
        cb(filled as i32, buf);
        return;
    }
    let next = Arc::clone(&ring);
    let submitted = ring.submit_data(
        IoKind::Read,
        fd,
        buf,
        filled,
        advance(offset, filled),
        Box::new(move |res, buf| {
            if res <= 0 {
                cb(res, buf);
            } else {
                read_exact_step(next, fd, buf, filled + res as usize, offset, cb);
            }
        }),
    );
    if let Err(err) = submitted {
        warn!("read_exact resubmission failed: {}", err);
    }
}

fn write_all_step(
    ring: Arc<Ring>,
    fd: RawFd,
    buf: Vec<u8>,
    sent: usize,
    offset: u64,
    cb: DataHandler,
) {
    if sent == buf.len() {
        cb(sent as i32, buf);
        return;
    }
    let next = Arc::clone(&ring);
    let submitted = ring.submit_data(
        IoKind::Write,
        fd,
        buf,
        sent,
        advance(offset, sent),
        Box::new(move |res, buf| {
            if res < 0 {
                cb(res, buf);
            } else {
                write_all_step(next, fd, buf, sent + res as usize, offset, cb);
            }
        }),
    );
    if let Err(err) = submitted {
        warn!("write_all resubmission failed: {}", err);
    }
}

fn read_until_step(ring: Arc<Ring>, fd: RawFd, mut buf: Vec<u8>, pred: Predicate, cb: DataHandler) {
    if let Some(matched) = pred(&buf) {
        cb(matched as i32, buf);
        return;
    }
    if buf.len() >= MAX_LINE {
        cb(buf.len() as i32, buf);
        return;
    }
    let old_len = buf.len();
    let step = CHUNK_SIZE.min(MAX_LINE - old_len);
    buf.resize(old_len + step, 0);

    let next = Arc::clone(&ring);
    let submitted = ring.submit_data(
        IoKind::Read,
        fd,
        buf,
        old_len,
        CURRENT_POS,
        Box::new(move |res, mut buf| {
            if res <= 0 {
                buf.truncate(old_len);
                // 0 = peer closed; both tear the chain down at the caller.
                cb(if res == 0 { -1 } else { res }, buf);
            } else {
                buf.truncate(old_len + res as usize);
                read_until_step(next, fd, buf, pred, cb);
            }
        }),
    );
    if let Err(err) = submitted {
        warn!("read_until resubmission failed: {}", err);
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Ring")
            .field("pending", &inner.pending.len())
            .field("next_token", &inner.next_token)
            .finish()
    }
}
