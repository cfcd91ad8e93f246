//! Server lifecycle: the listening socket at the root of the connection
//! tree, and the worker pool that drives the completion queue.
//!
//! Workers are plain OS threads. Each one repeatedly reaps a completion from
//! the engine and runs its continuation inline to completion — continuations
//! post their own follow-up work, so there is nothing else to schedule.

use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::conn::{self, Conn, Node};
use crate::control::ControlChannel;
use crate::ring::Ring;
use crate::store::FileStore;
use crate::sys;
use crate::Config;

/// Completion/submission queue depth.
const RING_ENTRIES: u32 = 4096;

/// Control-listener backlog.
const BACKLOG: i32 = 20;

/// How long an idle worker parks before peeking the queue again.
const IDLE_PARK: Duration = Duration::from_micros(50);

/// Root of the connection tree. Owns the control listener; never accepts on
/// it itself — control channels are enqueued onto it instead.
pub(crate) struct ServerNode {
    node: Node,
}

impl Conn for ServerNode {
    fn node(&self) -> &Node {
        &self.node
    }

    fn on_ready(self: Arc<Self>) {}
}

/// A running (or startable) FTP server.
pub struct Server {
    root_conn: Arc<ServerNode>,
    ring: Arc<Ring>,
    store: Arc<FileStore>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl Server {
    /// Bind the control listener and seed the file store. The server does
    /// not accept anything until [`Server::start`].
    pub fn new(config: Config) -> io::Result<Server> {
        config.validate()?;
        let ring = Arc::new(Ring::new(RING_ENTRIES)?);
        let store = Arc::new(FileStore::new(&config.root)?);

        let listener = sys::tcp_listener(SocketAddrV4::new(config.bind, config.port), BACKLOG)?;
        let local = sys::local_addr(listener)?;
        let root_conn = Arc::new(ServerNode {
            node: Node::with_listener(Arc::clone(&ring), listener, local),
        });

        Ok(Server {
            root_conn,
            ring,
            store,
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            threads: config.threads,
        })
    }

    /// The address the control listener is actually bound to (useful when
    /// configured with port 0).
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.root_conn.node.local_addr()
    }

    /// Spin up the worker pool and arm the first control accept.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();
        for idx in 0..self.threads {
            let ring = Arc::clone(&self.ring);
            let running = Arc::clone(&self.running);
            let handle = thread::Builder::new()
                .name(format!("ftpring-worker-{}", idx))
                .spawn(move || loop {
                    match ring.poll_one() {
                        Some(thunk) => thunk(),
                        None => {
                            if !running.load(Ordering::SeqCst) {
                                break;
                            }
                            thread::sleep(IDLE_PARK);
                        }
                    }
                });
            match handle {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!("failed to spawn worker {}: {}", idx, err),
            }
        }
        drop(workers);

        let parent = Arc::clone(&self.root_conn) as Arc<dyn Conn>;
        let listener = self.root_conn.node.fd().get();
        let control = ControlChannel::new(
            Node::new(Arc::clone(&self.ring)),
            Arc::clone(&self.store),
        );
        conn::enqueue_child(&parent, listener, control);
        info!(
            "listening on {} with {} workers",
            self.local_addr(),
            self.threads
        );
    }

    /// Cascade a stop through the connection tree, drain the workers, and
    /// reconcile the file store. Idempotent.
    pub fn stop(&self) {
        conn::stop(&(Arc::clone(&self.root_conn) as Arc<dyn Conn>));
        self.running.store(false, Ordering::SeqCst);
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!("a worker panicked during shutdown");
            }
        }
        self.store.shutdown();
        info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("threads", &self.threads)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}
