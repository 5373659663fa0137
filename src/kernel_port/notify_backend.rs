//! Portable [`KernelPort`] backend built on the `notify` crate.
//!
//! `notify` is a continuous watcher: once you watch a path you keep getting
//! events until you unwatch it. The original single-shot primitive is the
//! opposite — one delivery, then silence until re-armed. This backend
//! closes that gap itself: on every delivered event matching a live
//! association, it unwatches the path immediately, so a second write before
//! the Port Layer re-associates produces no further `notify` callback (the
//! same "go quiet until re-armed" contract `port_getn` gives for free).
//!
//! Grounded on the teacher's `scanner/watcher.rs`, which already wires a
//! `RecommendedWatcher` through a channel into async code; the pattern here
//! is the same, minus the tokio channel since [`KernelPort::getn`] is a
//! synchronous, blocking-with-timeout call invoked from a dedicated pump
//! task (spec.md §5).

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Error, Result};
use crate::event::KernelEventMask;

use super::{AssociationId, KernelPort, RawKernelEvent};

pub struct NotifyPort {
    watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
    associations: HashMap<PathBuf, AssociationId>,
}

impl NotifyPort {
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| Error::Associate {
            path: PathBuf::new(),
            source: io::Error::other(e),
        })?;
        Ok(Self {
            watcher,
            rx,
            associations: HashMap::new(),
        })
    }

    fn translate(kind: &EventKind) -> KernelEventMask {
        match kind {
            EventKind::Create(_) => KernelEventMask::MODIFIED,
            EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => KernelEventMask::ATTRIB,
            EventKind::Modify(_) => KernelEventMask::MODIFIED,
            EventKind::Remove(_) => KernelEventMask::DELETE,
            _ => KernelEventMask::empty(),
        }
    }
}

impl KernelPort for NotifyPort {
    fn associate(&mut self, path: &Path, _mask: KernelEventMask, cookie: AssociationId) -> Result<()> {
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Associate {
                path: path.to_path_buf(),
                source: io::Error::other(e),
            })?;
        self.associations.insert(path.to_path_buf(), cookie);
        Ok(())
    }

    fn dissociate(&mut self, path: &Path) -> Result<()> {
        // Best-effort: notify errors if the path was never watched, which is
        // exactly the ENOENT-is-not-an-error case the trait documents.
        let _ = self.watcher.unwatch(path);
        self.associations.remove(path);
        Ok(())
    }

    fn getn(&mut self, max: usize, timeout: Duration) -> Result<Vec<RawKernelEvent>> {
        let mut drained = Vec::new();
        let deadline = Instant::now() + timeout;
        while drained.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(Ok(event)) => {
                    for path in &event.paths {
                        // A direct hit means `path` itself is associated; a
                        // hit via its parent means `path`'s *directory* is
                        // associated and this is a child appearing inside
                        // it — the Port Layer sees that as a MODIFIED on
                        // the directory, same as the original treats a
                        // directory's own FILE_MODIFIED as "go re-scan your
                        // children" (fen-helper.c's ScanKnownChildren).
                        let watched = if self.associations.contains_key(path) {
                            Some(path.clone())
                        } else {
                            path.parent()
                                .filter(|p| self.associations.contains_key(*p))
                                .map(|p| p.to_path_buf())
                        };
                        let Some(watched) = watched else {
                            continue;
                        };
                        let cookie = self.associations[&watched];
                        let mask = Self::translate(&event.kind);
                        if mask.is_empty() {
                            continue;
                        }
                        drained.push(RawKernelEvent { cookie, mask });
                        let _ = self.watcher.unwatch(&watched);
                        self.associations.remove(&watched);
                    }
                }
                Ok(Err(_)) => continue,
                Err(_) => break,
            }
        }
        Ok(drained)
    }
}
