//! Versioned file store.
//!
//! The store maps client-visible (logical) paths to one or more physical
//! files. The newest physical file is the current version; older ones are
//! snapshots kept alive only while a reader still holds them open. Writers
//! never touch the file a reader is using: every write goes to a fresh file
//! under `root/.tmp/<logical>/<timestamp>` and becomes current when the
//! writer closes. On shutdown the newest version of every path is renamed
//! onto its canonical location and everything else is unlinked.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::sys;

/// Directory under the root that holds in-flight and superseded versions.
/// Reserved: client paths may never traverse it.
pub const TMP_DIR: &str = ".tmp";

/// One physical realization of a logical path. `readers` counts descriptors
/// currently open on it; a superseded version with zero readers is garbage.
#[derive(Debug)]
struct Version {
    physical: PathBuf,
    readers: usize,
}

#[derive(Debug)]
struct OpenRef {
    logical: PathBuf,
    physical: PathBuf,
}

#[derive(Debug, Default)]
struct Inner {
    /// Per logical path, physical versions ordered by mtime ascending; the
    /// last entry is current.
    versions: HashMap<PathBuf, Vec<Version>>,
    /// Read-open descriptors.
    readers: HashMap<RawFd, OpenRef>,
    /// Write-open descriptors (always a fresh `.tmp` file).
    writers: HashMap<RawFd, OpenRef>,
    /// In-flight writes by logical path; suppresses reclamation of a file
    /// that is still being produced.
    writing: HashMap<PathBuf, PathBuf>,
}

/// The store. One per server, shared as `Arc<FileStore>`; a single mutex
/// serializes the whole public API.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    inner: Mutex<Inner>,
}

/// Strictly increasing stamp for naming `.tmp` versions, so two writes in the
/// same nanosecond cannot collide.
fn monotonic_stamp() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let prev = LAST
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
            Some(prev.max(now).max(prev.wrapping_add(1)))
        })
        .unwrap_or(0);
    prev.max(now).max(prev.wrapping_add(1))
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl FileStore {
    /// Open a store over `root`, seeding the version table from disk.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<FileStore> {
        let root = root.into();
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("store root {} is not a directory", root.display()),
            ));
        }
        let store = FileStore {
            root,
            inner: Mutex::new(Inner::default()),
        };
        {
            let mut inner = store.inner.lock();
            store.load(&mut inner, Path::new(""))?;
        }
        Ok(store)
    }

    /// The directory tree being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the logical path currently resolves to at least one live
    /// version. The canonical on-disk file may already have been reclaimed
    /// while a newer version exists under `.tmp`.
    pub fn has_version(&self, logical: &Path) -> bool {
        self.inner
            .lock()
            .versions
            .get(logical)
            .is_some_and(|list| !list.is_empty())
    }

    /// Walk the tree under `root/rel`, seeding version lists for every
    /// regular file. The `.tmp` hierarchy is handled by `update`, not walked.
    fn load(&self, inner: &mut Inner, rel: &Path) -> io::Result<()> {
        for entry in fs::read_dir(self.root.join(rel))? {
            let entry = entry?;
            let name = entry.file_name();
            let kind = entry.file_type()?;
            if kind.is_dir() {
                if name != TMP_DIR {
                    self.load(inner, &rel.join(&name))?;
                }
            } else if kind.is_file() {
                self.update(inner, &rel.join(&name));
            }
        }
        Ok(())
    }

    /// Rebuild the version list for one logical path from disk: collect the
    /// canonical file and everything under `.tmp/<logical>/`, order by mtime,
    /// drop stale files that nothing can reference any more. A file an
    /// in-flight writer is still producing is never touched.
    fn update(&self, inner: &mut Inner, logical: &Path) {
        let canonical = self.root.join(logical);
        let tmp_dir = self.root.join(TMP_DIR).join(logical);

        let mut found: Vec<(PathBuf, SystemTime)> = Vec::new();
        if canonical.is_file() {
            if let Some(mtime) = mtime_of(&canonical) {
                found.push((canonical.clone(), mtime));
            }
        }
        if tmp_dir.is_dir() {
            if let Ok(entries) = fs::read_dir(&tmp_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if let Some(mtime) = mtime_of(&path) {
                        found.push((path, mtime));
                    }
                }
            }
        }
        found.sort_by_key(|(_, mtime)| *mtime);

        let in_flight = inner.writing.get(logical).cloned();
        let last = found.last().map(|(path, _)| path.clone());
        let mut list = Vec::new();
        for (path, _) in found {
            if Some(&path) == in_flight.as_ref() {
                continue;
            }
            if path != canonical && Some(&path) != last.as_ref() {
                debug!("dropping stale version {}", path.display());
                if let Err(err) = fs::remove_file(&path) {
                    warn!("failed to remove {}: {}", path.display(), err);
                }
            } else {
                list.push(Version {
                    physical: path,
                    readers: 0,
                });
            }
        }
        if list.is_empty() {
            inner.versions.remove(logical);
        } else {
            inner.versions.insert(logical.to_path_buf(), list);
        }
    }

    /// Open the newest version of `logical` for reading.
    pub fn open_read(&self, logical: &Path) -> io::Result<RawFd> {
        let mut inner = self.inner.lock();
        if !inner.versions.contains_key(logical) {
            self.update(&mut inner, logical);
        }
        let current = inner
            .versions
            .get_mut(logical)
            .and_then(|list| list.last_mut())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no version on disk"))?;

        let file = OpenOptions::new().read(true).open(&current.physical)?;
        let fd = file.into_raw_fd();
        current.readers += 1;
        let physical = current.physical.clone();
        inner.readers.insert(
            fd,
            OpenRef {
                logical: logical.to_path_buf(),
                physical,
            },
        );
        Ok(fd)
    }

    /// Open a fresh version of `logical` for writing. The new file lives
    /// under `.tmp` and is promoted to current when the descriptor is closed.
    pub fn open_write(&self, logical: &Path) -> io::Result<RawFd> {
        let mut inner = self.inner.lock();
        let physical = self
            .root
            .join(TMP_DIR)
            .join(logical)
            .join(monotonic_stamp().to_string());
        if let Some(parent) = physical.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .open(&physical)?;
        let fd = file.into_raw_fd();
        inner.writers.insert(
            fd,
            OpenRef {
                logical: logical.to_path_buf(),
                physical: physical.clone(),
            },
        );
        inner.writing.insert(logical.to_path_buf(), physical);
        Ok(fd)
    }

    /// Close a store descriptor and reconcile versions.
    ///
    /// Closing a reader reclaims its version if it was superseded and no one
    /// else still reads it. Closing a writer purges every unreferenced
    /// superseded version (the canonical file is left for shutdown to
    /// overwrite) and promotes the written file to current.
    pub fn close(&self, fd: RawFd) {
        let mut inner = self.inner.lock();
        if let Some(open) = inner.readers.remove(&fd) {
            sys::close(fd);
            if let Some(list) = inner.versions.get_mut(&open.logical) {
                if let Some(pos) = list.iter().position(|v| v.physical == open.physical) {
                    list[pos].readers = list[pos].readers.saturating_sub(1);
                    let superseded = pos + 1 != list.len();
                    if superseded && list[pos].readers == 0 {
                        let stale = list.remove(pos);
                        debug!("reclaiming {}", stale.physical.display());
                        if let Err(err) = fs::remove_file(&stale.physical) {
                            warn!("failed to remove {}: {}", stale.physical.display(), err);
                        }
                    }
                }
            }
        } else if let Some(open) = inner.writers.remove(&fd) {
            sys::close(fd);
            let canonical = self.root.join(&open.logical);
            let list = inner.versions.entry(open.logical.clone()).or_default();
            list.retain(|v| {
                if v.readers == 0 && v.physical != canonical {
                    if let Err(err) = fs::remove_file(&v.physical) {
                        warn!("failed to remove {}: {}", v.physical.display(), err);
                    }
                    false
                } else {
                    true
                }
            });
            list.push(Version {
                physical: open.physical,
                readers: 0,
            });
            inner.writing.remove(&open.logical);
        } else {
            debug!("close on unknown store fd {}", fd);
        }
    }

    /// Reconcile the tree: rename the newest version of every path onto its
    /// canonical location, unlink all other versions, and sweep the empty
    /// `.tmp` scaffolding. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        let versions = std::mem::take(&mut inner.versions);
        for (logical, list) in versions {
            let canonical = self.root.join(&logical);
            let count = list.len();
            for (pos, version) in list.into_iter().enumerate() {
                if pos + 1 == count {
                    if version.physical != canonical {
                        if let Err(err) = fs::rename(&version.physical, &canonical) {
                            warn!(
                                "failed to promote {} to {}: {}",
                                version.physical.display(),
                                canonical.display(),
                                err
                            );
                        }
                    }
                } else if version.physical != canonical {
                    if let Err(err) = fs::remove_file(&version.physical) {
                        warn!("failed to remove {}: {}", version.physical.display(), err);
                    }
                }
            }
        }
        if inner.writing.is_empty() {
            let tmp_root = self.root.join(TMP_DIR);
            if tmp_root.is_dir() {
                if let Err(err) = fs::remove_dir_all(&tmp_root) {
                    warn!("failed to sweep {}: {}", tmp_root.display(), err);
                }
            }
        }
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
