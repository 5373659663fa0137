//! The [`KernelPort`] abstraction (spec.md §4.2) and its backends.
//!
//! `KernelPort` is the Rust shape of the single-shot, single-association
//! kernel primitive the rest of the engine is built against: associate a
//! path for a mask, get back at most one delivery, re-associate to keep
//! watching. On illumos a real `port(3)` backs it; everywhere else
//! [`notify_backend::NotifyPort`] emulates the same contract on top of the
//! platform watcher the teacher already depended on.

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::event::KernelEventMask;

pub mod notify_backend;

#[cfg(target_os = "illumos")]
pub mod illumos;

pub use notify_backend::NotifyPort;

#[cfg(target_os = "illumos")]
pub use illumos::IllumosPort;

/// Opaque token the port layer assigns to an association when it is
/// created; handed back verbatim on the matching [`RawKernelEvent`] so the
/// caller never has to look anything up by path. Mirrors `portev_object`
/// carrying the association's address in the original.
pub type AssociationId = u64;

/// A single delivered, not-yet-normalized kernel event.
#[derive(Debug, Clone)]
pub struct RawKernelEvent {
    pub cookie: AssociationId,
    pub mask: KernelEventMask,
}

/// The single-shot, single-association-per-path notification primitive.
///
/// Every `associate` call replaces whatever association the path already
/// had — there is no "add another watch" on top of an existing one, which
/// is exactly the constraint the Port Layer above this trait exists to work
/// around.
pub trait KernelPort: Send {
    fn associate(&mut self, path: &Path, mask: KernelEventMask, cookie: AssociationId) -> Result<()>;

    /// Re-arms an association after a delivery, without the fresh stat
    /// `associate` performs. Backends that already cache everything
    /// `associate` would recompute (illumos keeps the `FileObj` around
    /// until dissociate) reuse it here instead of re-reading the path;
    /// the default behavior for a backend that caches nothing is simply
    /// to call `associate` again.
    fn reassociate(&mut self, path: &Path, cookie: AssociationId) -> Result<()> {
        self.associate(path, KernelEventMask::empty(), cookie)
    }

    /// Cancels a pending association. Not an error if the kernel had
    /// already consumed it (`ENOENT` in the original) — callers treat that
    /// as a no-op, not a failure.
    fn dissociate(&mut self, path: &Path) -> Result<()>;

    /// Drains up to `max` delivered events, waiting at most `timeout` for
    /// the first one.
    fn getn(&mut self, max: usize, timeout: Duration) -> Result<Vec<RawKernelEvent>>;
}

/// Builds a fresh [`KernelPort`] backend. The Port Layer calls this each
/// time its pool needs another port (spec.md §4.2's "new port is created"
/// on saturation) rather than being handed one pre-built instance.
pub type KernelPortFactory = Box<dyn Fn() -> Result<Box<dyn KernelPort>> + Send + Sync>;
