//! Data-channel transfer engine.
//!
//! One [`DataChannel`] exists per passive-mode listener. It idles after its
//! accept until the control channel posts a job, then pumps bytes between the
//! socket and a file-store descriptor (or an `ls -l` pipe) in fixed-size
//! steps, each step submitted from inside the previous step's completion.

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::ascii;
use crate::conn::{self, Conn, Node};
use crate::ring::{CHUNK_SIZE, CURRENT_POS};
use crate::store::FileStore;

/// What a transfer moves and in which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// File store to socket (`RETR`).
    Sender,
    /// Socket to a fresh file version (`STOR`).
    Receiver,
    /// Directory listing pipe to socket (`LIST`).
    Lister,
}

/// A transfer request posted by the control channel.
pub struct Job {
    /// Root-relative path of the file or directory involved.
    pub logical: PathBuf,
    /// Direction and source of the transfer.
    pub kind: TransferKind,
    /// ASCII representation: translate line endings. Image mode leaves the
    /// byte stream untouched.
    pub ascii: bool,
    /// Invoked exactly once when the transfer ends, success or not; the
    /// control channel uses it to send its completion reply.
    pub on_end: Box<dyn FnOnce() + Send>,
}

struct Transfer {
    kind: TransferKind,
    ascii: bool,
    /// Store descriptor (Sender/Receiver) or the listing pipe (Lister).
    source_fd: RawFd,
    /// The spawned `ls` while a listing runs; dropping it releases the pipe.
    lister: Option<Child>,
    /// Source bytes consumed so far; doubles as the file offset.
    moved: u64,
    on_end: Option<Box<dyn FnOnce() + Send>>,
}

/// An ephemeral data connection, child of a control channel.
pub struct DataChannel {
    node: Node,
    store: Arc<FileStore>,
    /// Set once the passive accept has produced a peer socket.
    ready: AtomicBool,
    /// A job that arrived before the peer connected; run on accept.
    parked: Mutex<Option<Job>>,
    xfer: Mutex<Option<Transfer>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("logical", &self.logical)
            .field("kind", &self.kind)
            .field("ascii", &self.ascii)
            .finish()
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("node", &self.node)
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .field("active", &self.xfer.lock().is_some())
            .finish()
    }
}

impl DataChannel {
    /// A data channel waiting for its passive-mode accept.
    pub fn new(node: Node, store: Arc<FileStore>) -> Arc<DataChannel> {
        Arc::new(DataChannel {
            node,
            store,
            ready: AtomicBool::new(false),
            parked: Mutex::new(None),
            xfer: Mutex::new(None),
        })
    }

    /// Entry point for the control channel. If the client has not finished
    /// connecting yet the job is parked and picked up by `on_ready`, so a
    /// fast `RETR` right after `PASV` cannot race the accept.
    pub fn command(self: &Arc<Self>, job: Job) {
        if self.ready.load(Ordering::SeqCst) {
            self.begin(job);
        } else {
            *self.parked.lock() = Some(job);
        }
    }

    fn begin(self: &Arc<Self>, job: Job) {
        let Job {
            logical,
            kind,
            ascii,
            on_end,
        } = job;

        let (source_fd, lister) = match kind {
            TransferKind::Sender => match self.store.open_read(&logical) {
                Ok(fd) => (fd, None),
                Err(err) => {
                    warn!("cannot open {} for sending: {}", logical.display(), err);
                    on_end();
                    conn::stop(&(Arc::clone(self) as Arc<dyn Conn>));
                    return;
                }
            },
            TransferKind::Receiver => match self.store.open_write(&logical) {
                Ok(fd) => (fd, None),
                Err(err) => {
                    warn!("cannot open {} for receiving: {}", logical.display(), err);
                    on_end();
                    conn::stop(&(Arc::clone(self) as Arc<dyn Conn>));
                    return;
                }
            },
            TransferKind::Lister => {
                let target = self.store.root().join(&logical);
                match Command::new("ls")
                    .arg("-l")
                    .arg(&target)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .spawn()
                {
                    Ok(child) => {
                        let fd = child
                            .stdout
                            .as_ref()
                            .map(|out| out.as_raw_fd())
                            .unwrap_or(-1);
                        (fd, Some(child))
                    }
                    Err(err) => {
                        warn!("cannot list {}: {}", target.display(), err);
                        on_end();
                        conn::stop(&(Arc::clone(self) as Arc<dyn Conn>));
                        return;
                    }
                }
            }
        };

        *self.xfer.lock() = Some(Transfer {
            kind,
            ascii,
            source_fd,
            lister,
            moved: 0,
            on_end: Some(on_end),
        });
        self.pump(0);
    }

    /// One step of the transmission loop. `last` is the result of the
    /// previous socket/file operation; anything negative tears down.
    fn pump(self: &Arc<Self>, last: i32) {
        if last < 0 {
            self.finish();
            return;
        }
        let (kind, ascii, source_fd, moved) = {
            let xfer = self.xfer.lock();
            let Some(xfer) = xfer.as_ref() else { return };
            (xfer.kind, xfer.ascii, xfer.source_fd, xfer.moved)
        };
        let sock_fd = self.node.fd().get();
        let ring = Arc::clone(self.node.ring());
        let this = Arc::clone(self);

        let submitted = match kind {
            TransferKind::Sender | TransferKind::Lister => {
                // Files read at the running offset; the listing pipe is not
                // seekable.
                let offset = if kind == TransferKind::Sender {
                    moved
                } else {
                    CURRENT_POS
                };
                ring.read_some(
                    source_fd,
                    vec![0; CHUNK_SIZE],
                    offset,
                    Box::new(move |res, mut buf| {
                        if res <= 0 {
                            this.finish();
                            return;
                        }
                        buf.truncate(res as usize);
                        let out = if ascii { ascii::expand_lf(&buf) } else { buf };
                        if let Some(xfer) = this.xfer.lock().as_mut() {
                            xfer.moved += res as u64;
                        }
                        let next = Arc::clone(&this);
                        this.node.ring().write_all(
                            sock_fd,
                            out,
                            CURRENT_POS,
                            Box::new(move |res, _| next.pump(res)),
                        );
                    }),
                )
            }
            TransferKind::Receiver => ring.read_some(
                sock_fd,
                vec![0; CHUNK_SIZE],
                CURRENT_POS,
                Box::new(move |res, mut buf| {
                    if res <= 0 {
                        this.finish();
                        return;
                    }
                    buf.truncate(res as usize);
                    let out = if ascii { ascii::collapse_crlf(&buf) } else { buf };
                    let offset = {
                        let mut xfer = this.xfer.lock();
                        let Some(xfer) = xfer.as_mut() else { return };
                        let offset = xfer.moved;
                        xfer.moved += out.len() as u64;
                        offset
                    };
                    let next = Arc::clone(&this);
                    this.node.ring().write_all(
                        source_fd,
                        out,
                        offset,
                        Box::new(move |res, _| next.pump(res)),
                    );
                }),
            ),
        };
        if let Err(err) = submitted {
            warn!("transfer step submission failed: {}", err);
            self.finish();
        }
    }

    /// Tear the transfer down: release the source, fire the end callback,
    /// stop the node. Runs at most once per job.
    fn finish(self: &Arc<Self>) {
        let Some(mut xfer) = self.xfer.lock().take() else { return };
        match xfer.kind {
            TransferKind::Sender | TransferKind::Receiver => self.store.close(xfer.source_fd),
            TransferKind::Lister => {
                if let Some(mut child) = xfer.lister.take() {
                    if let Err(err) = child.wait() {
                        debug!("ls did not exit cleanly: {}", err);
                    }
                }
            }
        }
        if let Some(on_end) = xfer.on_end.take() {
            on_end();
        }
        conn::stop(&(Arc::clone(self) as Arc<dyn Conn>));
    }
}

impl Conn for DataChannel {
    fn node(&self) -> &Node {
        &self.node
    }

    fn on_ready(self: Arc<Self>) {
        debug!("data channel connected from {:?}", self.node.remote_addr());
        self.ready.store(true, Ordering::SeqCst);
        let parked = self.parked.lock().take();
        if let Some(job) = parked {
            self.begin(job);
        }
    }

    fn on_stop(&self) {
        // A cascade stop mid-transfer must still release the source and let
        // the control channel make progress.
        if let Some(mut xfer) = self.xfer.lock().take() {
            match xfer.kind {
                TransferKind::Sender | TransferKind::Receiver => self.store.close(xfer.source_fd),
                TransferKind::Lister => {
                    if let Some(mut child) = xfer.lister.take() {
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                }
            }
            if let Some(on_end) = xfer.on_end.take() {
                on_end();
            }
        }
    }
}
