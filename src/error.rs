//! Error taxonomy for the FEN core (spec.md §7).
//!
//! None of these variants ever escape the public subscription API: a failed
//! association or a failed stat turns into a `DELETED` event on the stream,
//! not a `Result::Err` the caller has to handle. They exist so internal code
//! can distinguish retryable conditions from ones that should fall through to
//! the deletion path, and so `tracing` call sites have something structured
//! to log.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kernel primitive refused to associate {path}: {source}")]
    Associate { path: PathBuf, source: io::Error },

    #[error("kernel primitive refused to dissociate {path}: {source}")]
    Dissociate { path: PathBuf, source: io::Error },

    #[error("stat failed for {path}: {source}")]
    Stat { path: PathBuf, source: io::Error },

    #[error("port is saturated at {max} associations")]
    PortSaturated { max: usize },
}

impl Error {
    /// Transient kernel errors are worth retrying on the next pump tick;
    /// everything else is treated as the path having disappeared (§7).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Associate { source, .. } | Error::Dissociate { source, .. }
                if source.kind() == io::ErrorKind::Interrupted
        )
    }
}
