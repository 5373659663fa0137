//! Raw and semantic event types, and the injected raw→semantic mapper
//! (spec.md §6, §9).
//!
//! The kernel primitive delivers a bitmask (`port_event_t.portev_events` in
//! the original); [`KernelEventMask`] models that bitmask directly rather
//! than pulling in a bitflags crate for eight bits. [`normalize`] turns a raw
//! mask into the post-normalization [`RawKind`] the rest of the core works
//! with, exactly mirroring `fen-kernel.c`'s `port_add_kevent`.

use std::fmt;

use crate::fdata::FDataId;

/// Bits as delivered by the kernel primitive, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelEventMask(u16);

impl KernelEventMask {
    pub const DELETE: Self = Self(1 << 0);
    pub const RENAME_FROM: Self = Self(1 << 1);
    pub const RENAME_TO: Self = Self(1 << 2);
    pub const MODIFIED: Self = Self(1 << 3);
    pub const ATTRIB: Self = Self(1 << 4);
    pub const ACCESS: Self = Self(1 << 5);
    pub const UNMOUNTED: Self = Self(1 << 6);
    pub const MOUNTEDOVER: Self = Self(1 << 7);
    pub const FILE_EXCEPTION: Self = Self(1 << 8);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for KernelEventMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for KernelEventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for KernelEventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut push = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
            if !first {
                write!(f, "|")?;
            }
            first = false;
            write!(f, "{name}")
        };
        if self.contains(Self::DELETE) {
            push(f, "DELETE")?;
        }
        if self.contains(Self::RENAME_FROM) {
            push(f, "RENAME_FROM")?;
        }
        if self.contains(Self::RENAME_TO) {
            push(f, "RENAME_TO")?;
        }
        if self.contains(Self::MODIFIED) {
            push(f, "MODIFIED")?;
        }
        if self.contains(Self::ATTRIB) {
            push(f, "ATTRIB")?;
        }
        if self.contains(Self::ACCESS) {
            push(f, "ACCESS")?;
        }
        if self.contains(Self::UNMOUNTED) {
            push(f, "UNMOUNTED")?;
        }
        if self.contains(Self::MOUNTEDOVER) {
            push(f, "MOUNTEDOVER")?;
        }
        if self.contains(Self::FILE_EXCEPTION) {
            push(f, "FILE_EXCEPTION")?;
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/// Raw event kind after Port Layer normalization (spec.md §4.2). Never
/// `RENAME_FROM`/`RENAME_TO`/`ACCESS` — those are rejected or rewritten
/// before a `RawKind` is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Delete,
    Modified,
    Attrib,
    Unmounted,
    MountedOver,
}

impl fmt::Display for RawKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RawKind::Delete => "DELETE",
            RawKind::Modified => "MODIFIED",
            RawKind::Attrib => "ATTRIB",
            RawKind::Unmounted => "UNMOUNTED",
            RawKind::MountedOver => "MOUNTEDOVER",
        };
        f.write_str(s)
    }
}

/// Normalizes a raw kernel bitmask into `(kind, has_twin)`.
///
/// Mirrors `fen-kernel.c:port_add_kevent`: an ATTRIB bit riding along with
/// any other bit is stripped and remembered as a twin; RENAME_FROM becomes
/// DELETE, RENAME_TO becomes MODIFIED. Panics on ACCESS or any mask that
/// doesn't reduce to exactly one known kind — the design deliberately
/// refuses accesses and treats anything else as an invariant violation
/// (spec.md §8: "the system aborts").
pub fn normalize(mut mask: KernelEventMask) -> (RawKind, bool) {
    let mut has_twin = false;
    if mask.contains(KernelEventMask::ATTRIB) && mask != KernelEventMask::ATTRIB {
        mask = mask.without(KernelEventMask::ATTRIB);
        has_twin = true;
    }
    if mask == KernelEventMask::RENAME_FROM {
        mask = KernelEventMask::DELETE;
    }
    if mask == KernelEventMask::RENAME_TO {
        mask = KernelEventMask::MODIFIED;
    }

    let kind = if mask == KernelEventMask::DELETE {
        RawKind::Delete
    } else if mask == KernelEventMask::MODIFIED {
        RawKind::Modified
    } else if mask == KernelEventMask::ATTRIB {
        RawKind::Attrib
    } else if mask == KernelEventMask::UNMOUNTED {
        RawKind::Unmounted
    } else if mask == KernelEventMask::MOUNTEDOVER {
        RawKind::MountedOver
    } else {
        panic!("invariant violation: unhandled raw kernel event mask {mask}");
    };
    (kind, has_twin)
}

/// A queued event for one FData, as described in spec.md §3 "Node Event".
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub kind: RawKind,
    pub has_twin: bool,
    pub is_pending: bool,
    pub timestamp: std::time::Instant,
    pub owner: FDataId,
}

impl NodeEvent {
    pub fn new(kind: RawKind, has_twin: bool, owner: FDataId) -> Self {
        Self {
            kind,
            has_twin,
            is_pending: false,
            timestamp: std::time::Instant::now(),
            owner,
        }
    }
}

/// What gets fed into the injected mapper: either a genuine raw kind or the
/// synthetic `CREATED` the core manufactures itself (never delivered by the
/// kernel primitive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappableEvent {
    Created,
    Raw(RawKind),
}

/// High-level event kinds the external adapter understands (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticKind {
    Created,
    Deleted,
    Changed,
    AttributeChanged,
    Unmounted,
}

/// Injected raw→semantic mapping (spec.md §9): lets one core target two
/// external client protocols.
pub trait EventMapper: Send + Sync {
    fn map(&self, event: MappableEvent) -> SemanticKind;
}

/// Mapping A — distinguishes UNMOUNTED and ATTRIB from plain CHANGED.
#[derive(Debug, Clone, Copy, Default)]
pub struct MappingA;

impl EventMapper for MappingA {
    fn map(&self, event: MappableEvent) -> SemanticKind {
        match event {
            MappableEvent::Created => SemanticKind::Created,
            MappableEvent::Raw(RawKind::Delete) => SemanticKind::Deleted,
            MappableEvent::Raw(RawKind::Unmounted) => SemanticKind::Unmounted,
            MappableEvent::Raw(RawKind::Attrib) => SemanticKind::AttributeChanged,
            MappableEvent::Raw(RawKind::MountedOver) | MappableEvent::Raw(RawKind::Modified) => {
                SemanticKind::Changed
            }
        }
    }
}

/// Mapping B — collapses UNMOUNTED and ATTRIB into CHANGED as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct MappingB;

impl EventMapper for MappingB {
    fn map(&self, event: MappableEvent) -> SemanticKind {
        match event {
            MappableEvent::Created => SemanticKind::Created,
            MappableEvent::Raw(RawKind::Delete) => SemanticKind::Deleted,
            MappableEvent::Raw(_) => SemanticKind::Changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_plain_kinds() {
        assert_eq!(normalize(KernelEventMask::DELETE), (RawKind::Delete, false));
        assert_eq!(
            normalize(KernelEventMask::MODIFIED),
            (RawKind::Modified, false)
        );
        assert_eq!(normalize(KernelEventMask::ATTRIB), (RawKind::Attrib, false));
    }

    #[test]
    fn normalize_rename_from_becomes_delete() {
        assert_eq!(
            normalize(KernelEventMask::RENAME_FROM),
            (RawKind::Delete, false)
        );
    }

    #[test]
    fn normalize_rename_to_becomes_modified() {
        assert_eq!(
            normalize(KernelEventMask::RENAME_TO),
            (RawKind::Modified, false)
        );
    }

    #[test]
    fn normalize_strips_attrib_combined_with_modified() {
        let mask = KernelEventMask::MODIFIED | KernelEventMask::ATTRIB;
        assert_eq!(normalize(mask), (RawKind::Modified, true));
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn normalize_rejects_access() {
        let _ = normalize(KernelEventMask::ACCESS);
    }

    #[test]
    fn mapping_a_distinguishes_attrib_and_unmounted() {
        let m = MappingA;
        assert_eq!(
            m.map(MappableEvent::Raw(RawKind::Attrib)),
            SemanticKind::AttributeChanged
        );
        assert_eq!(
            m.map(MappableEvent::Raw(RawKind::Unmounted)),
            SemanticKind::Unmounted
        );
    }

    #[test]
    fn mapping_b_collapses_everything_non_delete_into_changed() {
        let m = MappingB;
        assert_eq!(
            m.map(MappableEvent::Raw(RawKind::Attrib)),
            SemanticKind::Changed
        );
        assert_eq!(
            m.map(MappableEvent::Raw(RawKind::Unmounted)),
            SemanticKind::Changed
        );
    }
}
