//! Control-channel protocol engine.
//!
//! One [`ControlChannel`] per client. Commands are pulled off the socket one
//! CRLF-terminated line at a time; every reply's write completion re-arms the
//! next read, so a control socket never has overlapping operations in
//! flight. Dispatch is a match over the session sum type: before login only
//! `USER`, `NOOP` and `QUIT` do anything, afterwards the full command set is
//! live.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::conn::{self, Conn, Node};
use crate::data::{DataChannel, Job, TransferKind};
use crate::paths::safe_path;
use crate::reply;
use crate::ring::{crlf_predicate, CURRENT_POS};
use crate::store::FileStore;
use crate::sys;
use crate::{FileStructure, Representation, TransferMode};

/// Backlog for passive-mode listeners.
const PASV_BACKLOG: i32 = 20;

/// Verbs that exist but are refused before login.
const LOGIN_REQUIRED: &[&str] = &[
    "CWD", "CDUP", "TYPE", "STRU", "MODE", "PWD", "PASV", "PORT", "RETR", "STOR", "LIST",
];

/// Per-connection protocol state.
enum Session {
    NotLoggedIn,
    LoggedIn(SessionState),
}

struct SessionState {
    /// Working directory, root-relative; empty means the root.
    pwd: PathBuf,
    repr: Representation,
    structure: FileStructure,
    mode: TransferMode,
    /// Passive-mode listener descriptor, owned here; -1 when absent.
    pasv_fd: i32,
    /// The data channel spawned by the last `PASV`.
    pasv: Option<Arc<DataChannel>>,
}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            pwd: PathBuf::new(),
            repr: Representation::Ascii,
            structure: FileStructure::File,
            mode: TransferMode::Stream,
            pasv_fd: -1,
            pasv: None,
        }
    }
}

impl SessionState {
    fn close_pasv(&mut self) {
        if self.pasv_fd >= 0 {
            sys::close(self.pasv_fd);
            self.pasv_fd = -1;
        }
        self.pasv = None;
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.close_pasv();
    }
}

/// The per-client command connection.
pub struct ControlChannel {
    node: Node,
    store: Arc<FileStore>,
    session: Mutex<Session>,
    /// Command accumulation buffer; `None` while a read owns it. Reused
    /// across commands so pipelined input is never lost.
    line: Mutex<Option<Vec<u8>>>,
}

/// Split one command line (without its CRLF) into an upper-cased verb and
/// the raw argument.
fn split_command(line: &[u8]) -> (String, String) {
    let (verb, arg) = match memchr::memchr(b' ', line) {
        Some(space) => (&line[..space], &line[space + 1..]),
        None => (line, &line[..0]),
    };
    (
        String::from_utf8_lossy(verb).to_ascii_uppercase(),
        String::from_utf8_lossy(arg).into_owned(),
    )
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("node", &self.node)
            .field(
                "logged_in",
                &matches!(&*self.session.lock(), Session::LoggedIn(_)),
            )
            .finish()
    }
}

impl ControlChannel {
    /// A fresh, unconnected control channel.
    pub fn new(node: Node, store: Arc<FileStore>) -> Arc<ControlChannel> {
        Arc::new(ControlChannel {
            node,
            store,
            session: Mutex::new(Session::NotLoggedIn),
            line: Mutex::new(Some(Vec::new())),
        })
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> Option<T> {
        match &mut *self.session.lock() {
            Session::LoggedIn(state) => Some(f(state)),
            Session::NotLoggedIn => None,
        }
    }

    /// Write a reply; once it drains, pull the next command. Any write
    /// failure tears the connection down.
    fn send_reply(self: &Arc<Self>, text: impl Into<Vec<u8>>) {
        self.send_then(text, |this| this.next_command());
    }

    /// Write a reply and run `then` from inside the write's completion.
    fn send_then(
        self: &Arc<Self>,
        text: impl Into<Vec<u8>>,
        then: impl FnOnce(&Arc<ControlChannel>) + Send + 'static,
    ) {
        let fd = self.node.fd().get();
        if fd < 0 {
            return;
        }
        let this = Arc::clone(self);
        self.node.ring().write_all(
            fd,
            text.into(),
            CURRENT_POS,
            Box::new(move |res, _| {
                if res < 0 || this.node.stopped() {
                    conn::stop(&(Arc::clone(&this) as Arc<dyn Conn>));
                    return;
                }
                then(&this);
            }),
        );
    }

    /// Re-arm the CRLF-bounded command read on the shared line buffer.
    fn next_command(self: &Arc<Self>) {
        let fd = self.node.fd().get();
        if fd < 0 || self.node.stopped() {
            return;
        }
        let Some(buf) = self.line.lock().take() else {
            debug!("command read already in flight");
            return;
        };
        let this = Arc::clone(self);
        self.node.ring().read_until(
            fd,
            buf,
            crlf_predicate(),
            Box::new(move |res, buf| {
                *this.line.lock() = Some(buf);
                if res <= 0 {
                    conn::stop(&(Arc::clone(&this) as Arc<dyn Conn>));
                    return;
                }
                this.process();
            }),
        );
    }

    /// Consume one line from the buffer (through its CRLF) and dispatch it.
    fn process(self: &Arc<Self>) {
        let parsed = {
            let mut guard = self.line.lock();
            let buf = guard.as_mut().expect("line buffer parked");
            match memchr::memmem::find(buf, b"\r\n") {
                Some(pos) => {
                    let (verb, arg) = split_command(&buf[..pos]);
                    buf.drain(..pos + 2);
                    Some((verb, arg))
                }
                None => {
                    // Line cap reached without a delimiter; drop the garbage.
                    buf.clear();
                    None
                }
            }
        };
        match parsed {
            Some((verb, arg)) => self.dispatch(&verb, &arg),
            None => self.send_reply(reply::INCORRECT_COMMAND),
        }
    }

    fn dispatch(self: &Arc<Self>, verb: &str, arg: &str) {
        debug!("command {} {:?}", verb, arg);
        let logged_in = matches!(&*self.session.lock(), Session::LoggedIn(_));
        match verb {
            "NOOP" => self.send_reply(reply::OK),
            "QUIT" => self.quit(),
            "USER" => self.user(arg),
            _ if !logged_in => {
                if LOGIN_REQUIRED.contains(&verb) {
                    self.send_reply(reply::NOT_LOGGED_IN)
                } else {
                    self.send_reply(reply::INCORRECT_COMMAND)
                }
            }
            "CWD" => self.cwd(arg),
            "CDUP" => self.cdup(),
            "TYPE" => self.set_type(arg),
            "STRU" => self.set_structure(arg),
            "MODE" => self.set_mode(arg),
            "PWD" => self.print_pwd(),
            "PASV" => self.pasv(),
            "PORT" => self.send_reply(reply::COMMAND_UNAVAILABLE),
            "RETR" => self.transfer(arg, TransferKind::Sender),
            "STOR" => self.transfer(arg, TransferKind::Receiver),
            "LIST" => self.list(arg),
            _ => self.send_reply(reply::INCORRECT_COMMAND),
        }
    }

    /// Only the literal (case-sensitive) `anonymous` is accepted. A wrong
    /// name always lands the session back in the unauthenticated state.
    fn user(self: &Arc<Self>, name: &str) {
        let ok = name == "anonymous";
        {
            let mut session = self.session.lock();
            if ok {
                match &mut *session {
                    Session::LoggedIn(state) => state.pwd = PathBuf::new(),
                    state @ Session::NotLoggedIn => {
                        *state = Session::LoggedIn(SessionState::default())
                    }
                }
            } else {
                *session = Session::NotLoggedIn;
            }
        }
        self.send_reply(if ok {
            reply::USER_OK
        } else {
            reply::USER_INCORRECT
        });
    }

    fn quit(self: &Arc<Self>) {
        // The goodbye must drain before the descriptor closes.
        self.send_then(reply::BYE, |this| {
            conn::stop(&(Arc::clone(this) as Arc<dyn Conn>));
        });
    }

    fn cwd(self: &Arc<Self>, arg: &str) {
        let pwd = self.with_session(|s| s.pwd.clone()).unwrap_or_default();
        let path = match safe_path(&pwd, arg) {
            Ok(path) => path,
            Err(_) => return self.send_reply(reply::ILLEGAL_PATH),
        };
        let full = self.store.root().join(&path);
        if !full.exists() {
            self.send_reply(reply::FILE_DOES_NOT_EXIST)
        } else if !full.is_dir() {
            self.send_reply(reply::NOT_A_DIRECTORY)
        } else {
            self.with_session(|s| s.pwd = path);
            self.send_reply(reply::DIRECTORY_CHANGED)
        }
    }

    fn cdup(self: &Arc<Self>) {
        let moved = self
            .with_session(|s| {
                if s.pwd.as_os_str().is_empty() {
                    false
                } else {
                    s.pwd.pop();
                    true
                }
            })
            .unwrap_or(false);
        self.send_reply(if moved {
            reply::DIRECTORY_CHANGED
        } else {
            reply::PATH_NOT_FOUND
        });
    }

    fn set_type(self: &Arc<Self>, arg: &str) {
        let repr = match arg {
            "A" | "A N" | "AN" => Some(Representation::Ascii),
            "I" => Some(Representation::Image),
            _ => None,
        };
        match repr {
            Some(repr) => {
                self.with_session(|s| s.repr = repr);
                self.send_reply(reply::TYPE_CHANGED)
            }
            None => self.send_reply(reply::INVALID_TYPE),
        }
    }

    fn set_structure(self: &Arc<Self>, arg: &str) {
        let structure = match arg {
            "F" => Some(FileStructure::File),
            "R" => Some(FileStructure::Record),
            _ => None,
        };
        match structure {
            Some(structure) => {
                self.with_session(|s| s.structure = structure);
                self.send_reply(reply::STRUCTURE_CHANGED)
            }
            None => self.send_reply(reply::INVALID_STRUCTURE),
        }
    }

    fn set_mode(self: &Arc<Self>, arg: &str) {
        if arg == "S" {
            self.with_session(|s| s.mode = TransferMode::Stream);
            self.send_reply(reply::MODE_CHANGED)
        } else {
            self.send_reply(reply::INVALID_MODE)
        }
    }

    fn print_pwd(self: &Arc<Self>) {
        let pwd = self.with_session(|s| s.pwd.clone()).unwrap_or_default();
        self.send_reply(reply::working_directory(&pwd));
    }

    /// Open a fresh ephemeral listener on the control socket's own address,
    /// announce it, and — once the announcement has drained — arm a data
    /// channel on it.
    fn pasv(self: &Arc<Self>) {
        self.with_session(|s| s.close_pasv());

        let local_ip = *self.node.local_addr().ip();
        let listener = match sys::tcp_listener(SocketAddrV4::new(local_ip, 0), PASV_BACKLOG) {
            Ok(fd) => fd,
            Err(err) => {
                error!("cannot open passive listener: {}", err);
                return self.send_reply(reply::COMMAND_UNAVAILABLE);
            }
        };
        let bound = match sys::local_addr(listener) {
            Ok(addr) => SocketAddrV4::new(local_ip, addr.port()),
            Err(err) => {
                error!("cannot resolve passive listener address: {}", err);
                sys::close(listener);
                return self.send_reply(reply::COMMAND_UNAVAILABLE);
            }
        };

        let child = DataChannel::new(
            Node::new(Arc::clone(self.node.ring())),
            Arc::clone(&self.store),
        );
        self.with_session(|s| {
            s.pasv_fd = listener;
            s.pasv = Some(Arc::clone(&child));
        });

        self.send_then(reply::entering_passive_mode(bound), move |this| {
            let parent = Arc::clone(this) as Arc<dyn Conn>;
            conn::enqueue_child(&parent, listener, child as Arc<dyn Conn>);
            this.next_command();
        });
    }

    /// `RETR` / `STOR`: validate the path against the live filesystem, then
    /// hand the transfer to the passive data channel. The `150` goes out
    /// first; the data channel's end callback produces the `250`, which in
    /// turn re-arms the command pump.
    fn transfer(self: &Arc<Self>, arg: &str, kind: TransferKind) {
        let pwd = self.with_session(|s| s.pwd.clone()).unwrap_or_default();
        let path = match safe_path(&pwd, arg) {
            Ok(path) => path,
            Err(_) => return self.send_reply(reply::DATA_ILLEGAL_PATH),
        };
        let full = self.store.root().join(&path);
        if full.is_dir() {
            return self.send_reply(reply::DATA_IS_A_DIRECTORY);
        }
        // The canonical file may have been reclaimed while a newer version
        // lives under `.tmp`; the store knows either way.
        if !full.exists() && !self.store.has_version(&path) {
            return self.send_reply(reply::DATA_FILE_DOES_NOT_EXIST);
        }
        self.run_on_data_channel(path, kind);
    }

    fn list(self: &Arc<Self>, arg: &str) {
        let pwd = self.with_session(|s| s.pwd.clone()).unwrap_or_default();
        let path = match safe_path(&pwd, arg) {
            Ok(path) => path,
            Err(_) => return self.send_reply(reply::DATA_ILLEGAL_PATH),
        };
        if !self.store.root().join(&path).is_dir() {
            return self.send_reply(reply::LIST_NOT_A_DIRECTORY);
        }
        self.run_on_data_channel(path, TransferKind::Lister);
    }

    fn run_on_data_channel(self: &Arc<Self>, path: PathBuf, kind: TransferKind) {
        let channel = self
            .with_session(|s| s.pasv.clone())
            .flatten()
            .filter(|c| !c.node().stopped());
        let Some(channel) = channel else {
            return self.send_reply(reply::USE_PASV_FIRST);
        };
        let ascii = self
            .with_session(|s| s.repr == Representation::Ascii)
            .unwrap_or(false);

        self.send_then(reply::OPENED_DATA_CONNECTION, move |this| {
            let end: Box<dyn FnOnce() + Send> = {
                let this = Arc::clone(this);
                Box::new(move || {
                    // The data connection is consumed; the next transfer
                    // needs a fresh PASV.
                    this.with_session(|s| s.close_pasv());
                    this.send_reply(reply::OPERATION_SUCCESSFUL);
                })
            };
            channel.command(Job {
                logical: path,
                kind,
                ascii,
                on_end: end,
            });
        });
    }
}

impl Conn for ControlChannel {
    fn node(&self) -> &Node {
        &self.node
    }

    /// A client is connected: hand the listener back to a fresh sibling so
    /// the next client can be accepted, then greet this one.
    fn on_ready(self: Arc<Self>) {
        if let Some(parent) = self.node.parent() {
            let listener = parent.node().fd().get();
            if listener >= 0 {
                let next = ControlChannel::new(
                    Node::new(Arc::clone(self.node.ring())),
                    Arc::clone(&self.store),
                );
                conn::enqueue_child(&parent, listener, next);
            }
        }
        info!("control connection from {:?}", self.node.remote_addr());
        self.send_reply(reply::GREETING);
    }

    fn on_stop(&self) {
        if let Some(addr) = self.node.remote_addr() {
            info!("control connection from {} closed", addr);
        }
        self.with_session(|s| s.close_pasv());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_verb_and_argument() {
        let (verb, arg) = split_command(b"USER anonymous");
        assert_eq!(verb, "USER");
        assert_eq!(arg, "anonymous");
    }

    #[test]
    fn verb_matching_is_case_insensitive() {
        for raw in [&b"user anonymous"[..], b"USER anonymous", b"UsEr anonymous"] {
            let (verb, arg) = split_command(raw);
            assert_eq!(verb, "USER");
            assert_eq!(arg, "anonymous");
        }
    }

    #[test]
    fn argument_case_is_preserved() {
        let (_, arg) = split_command(b"user Anonymous");
        assert_eq!(arg, "Anonymous");
    }

    #[test]
    fn bare_verb_has_empty_argument() {
        let (verb, arg) = split_command(b"pasv");
        assert_eq!(verb, "PASV");
        assert_eq!(arg, "");
    }

    #[test]
    fn argument_may_contain_spaces() {
        let (verb, arg) = split_command(b"TYPE A N");
        assert_eq!(verb, "TYPE");
        assert_eq!(arg, "A N");
    }
}
