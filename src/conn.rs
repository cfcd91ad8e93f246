//! Connection tree.
//!
//! Every socket the server touches is a node in a tree rooted at the server's
//! listener: control channels are children of the server, data channels are
//! children of their control channel. Nodes share one lifecycle: adopt a
//! listening descriptor, accept on it (the accepted descriptor replaces the
//! listener in the node), act, and eventually stop — where stopping cascades
//! through the children before the node's own descriptor is closed.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::ring::Ring;
use crate::sys;

/// A close-once socket cell. The descriptor starts out adopted from a parent
/// (not owned), is replaced by the accepted descriptor (owned), and is closed
/// at most once no matter how many paths race to destruction.
#[derive(Debug)]
pub struct SocketFd {
    fd: AtomicI32,
    owned: AtomicBool,
}

impl SocketFd {
    /// A cell holding no descriptor (-1).
    pub fn empty() -> SocketFd {
        SocketFd {
            fd: AtomicI32::new(-1),
            owned: AtomicBool::new(false),
        }
    }

    /// The current descriptor, or -1 once closed.
    pub fn get(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    /// Adopt a descriptor owned elsewhere (a parent's listener). Closing this
    /// cell will not close the descriptor.
    pub fn adopt(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::SeqCst);
        self.owned.store(false, Ordering::SeqCst);
    }

    /// Install an accepted descriptor; from here on the cell owns it.
    pub fn replace(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::SeqCst);
        self.owned.store(true, Ordering::SeqCst);
    }

    /// Close the descriptor if this cell owns one. Safe to call repeatedly.
    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 && self.owned.swap(false, Ordering::SeqCst) {
            sys::close(fd);
        }
    }
}

impl Drop for SocketFd {
    fn drop(&mut self) {
        self.close();
    }
}

/// State common to every node in the connection tree.
pub struct Node {
    fd: SocketFd,
    ring: Arc<Ring>,
    local_addr: Mutex<SocketAddrV4>,
    remote_addr: Mutex<Option<SocketAddrV4>>,
    children: Mutex<Vec<Arc<dyn Conn>>>,
    parent: Mutex<Option<Weak<dyn Conn>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("fd", &self.fd)
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .field("children", &self.children.lock().len())
            .field("stopped", &self.stopped())
            .finish()
    }
}

impl Node {
    /// A detached node: no descriptor yet, no links.
    pub fn new(ring: Arc<Ring>) -> Node {
        Node {
            fd: SocketFd::empty(),
            ring,
            local_addr: Mutex::new(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            remote_addr: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            parent: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Root-node constructor: the server owns its listener outright.
    pub fn with_listener(ring: Arc<Ring>, fd: RawFd, addr: SocketAddrV4) -> Node {
        let node = Node::new(ring);
        node.fd.replace(fd);
        *node.local_addr.lock() = addr;
        node
    }

    /// The node's descriptor cell.
    pub fn fd(&self) -> &SocketFd {
        &self.fd
    }

    /// The shared I/O engine handle.
    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    /// Local address of the node's socket.
    pub fn local_addr(&self) -> SocketAddrV4 {
        *self.local_addr.lock()
    }

    /// Peer address, once a client is connected.
    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        *self.remote_addr.lock()
    }

    /// Whether [`stop`] has run on this node.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The parent node, while it is still alive and linked.
    pub fn parent(&self) -> Option<Arc<dyn Conn>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    fn clear_parent(&self) {
        *self.parent.lock() = None;
    }

    fn child_stopped(&self, child: &Arc<dyn Conn>) {
        let mut children = self.children.lock();
        if let Some(pos) = children.iter().position(|c| Arc::ptr_eq(c, child)) {
            children.remove(pos);
        }
    }

    #[cfg(test)]
    pub(crate) fn child_count(&self) -> usize {
        self.children.lock().len()
    }
}

/// A node in the connection tree. Implementations provide the shared [`Node`]
/// and the component-specific behavior that runs once a peer is connected.
pub trait Conn: Send + Sync {
    /// The tree-lifecycle state shared by every connection type.
    fn node(&self) -> &Node;

    /// Called after [`start`] has swapped the accepted descriptor in.
    fn on_ready(self: Arc<Self>);

    /// Hook invoked at the beginning of [`stop`], before the cascade; for
    /// per-component teardown such as closing a passive listener.
    fn on_stop(&self) {}
}

/// Begin the accept-then-act lifecycle: asynchronously accept on the node's
/// descriptor, replace it with the accepted one, and hand off to `on_ready`.
/// Any failure stops the node.
pub fn start(conn: Arc<dyn Conn>) {
    let node = conn.node();
    let fd = node.fd().get();
    if fd < 0 || node.stopped() {
        stop(&conn);
        return;
    }
    let accepted = {
        let conn = Arc::clone(&conn);
        node.ring().accept(
            fd,
            Box::new(move |res, peer| {
                if res < 0 || conn.node().stopped() {
                    debug!("accept on fd {} ended: {}", fd, res);
                    stop(&conn);
                    return;
                }
                let node = conn.node();
                node.fd().replace(res);
                *node.remote_addr.lock() = peer;
                if let Ok(addr) = sys::local_addr(res) {
                    *node.local_addr.lock() = addr;
                }
                Arc::clone(&conn).on_ready();
            }),
        )
    };
    if let Err(err) = accepted {
        warn!("failed to post accept: {}", err);
        stop(&conn);
    }
}

/// Stop a node: idempotent, cascades to children one at a time (the children
/// lock is never held across the recursion), closes the owned descriptor
/// exactly once, and deregisters from the parent.
pub fn stop(conn: &Arc<dyn Conn>) {
    let node = conn.node();
    if node.stopped.swap(true, Ordering::SeqCst) {
        return;
    }
    conn.on_stop();
    loop {
        let child = node.children.lock().pop();
        match child {
            Some(child) => {
                child.node().clear_parent();
                stop(&child);
            }
            None => break,
        }
    }
    node.fd.close();
    if let Some(parent) = node.parent() {
        parent.node().child_stopped(conn);
    }
}

/// Adopt `fd` into `child`, link it under `parent`, and start it.
pub fn enqueue_child(parent: &Arc<dyn Conn>, fd: RawFd, child: Arc<dyn Conn>) {
    child.node().fd.adopt(fd);
    match sys::local_addr(fd) {
        Ok(addr) => *child.node().local_addr.lock() = addr,
        Err(err) => debug!("getsockname({}) failed: {}", fd, err),
    }
    *child.node().parent.lock() = Some(Arc::downgrade(parent));
    parent.node().children.lock().push(Arc::clone(&child));
    start(child);
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    struct Idle {
        node: Node,
    }

    impl Conn for Idle {
        fn node(&self) -> &Node {
            &self.node
        }
        fn on_ready(self: Arc<Self>) {}
    }

    fn idle_node() -> Arc<dyn Conn> {
        let ring = Arc::new(Ring::new(4).expect("io_uring unavailable"));
        Arc::new(Idle { node: Node::new(ring) })
    }

    #[test]
    fn stop_is_idempotent() {
        let Ok(ring) = Ring::new(4) else {
            eprintln!("skipping: io_uring unavailable");
            return;
        };
        let ring = Arc::new(ring);
        let (sock, _peer) = UnixStream::pair().unwrap();
        let conn: Arc<dyn Conn> = Arc::new(Idle { node: Node::new(ring) });
        conn.node().fd().replace(sock.into_raw_fd());

        stop(&conn);
        assert_eq!(conn.node().fd().get(), -1);
        assert!(conn.node().stopped());
        // Second stop must be a no-op on an already-closed descriptor.
        stop(&conn);
        assert_eq!(conn.node().fd().get(), -1);
    }

    #[test]
    fn stop_cascades_and_deregisters() {
        if Ring::new(4).is_err() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        let parent = idle_node();
        let child = idle_node();
        let (sock, _peer) = UnixStream::pair().unwrap();
        child.node().fd().replace(sock.into_raw_fd());
        *child.node().parent.lock() = Some(Arc::downgrade(&parent));
        parent.node().children.lock().push(Arc::clone(&child));

        stop(&parent);
        assert!(child.node().stopped());
        assert_eq!(child.node().fd().get(), -1);
        assert_eq!(parent.node().child_count(), 0);
    }

    #[test]
    fn child_stop_deregisters_from_parent() {
        if Ring::new(4).is_err() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        let parent = idle_node();
        let child = idle_node();
        *child.node().parent.lock() = Some(Arc::downgrade(&parent));
        parent.node().children.lock().push(Arc::clone(&child));

        stop(&child);
        assert_eq!(parent.node().child_count(), 0);
        assert!(!parent.node().stopped());
    }

    #[test]
    fn adopted_descriptor_is_not_closed() {
        if Ring::new(4).is_err() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        let conn = idle_node();
        let listener = UnixStream::pair().unwrap().0.into_raw_fd();
        conn.node().fd().adopt(listener);
        stop(&conn);
        // The cell forgot the descriptor but did not close it.
        assert_eq!(conn.node().fd().get(), -1);
        assert!(sys::local_addr(listener).is_ok());
        sys::close(listener);
    }
}
