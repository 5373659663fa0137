//! Subscription Façade (spec.md §4.4), grounded on `fen-helper.c`.
//!
//! This is the seam the rest of the engine is built to serve: resolve a
//! path to a node, create or reuse its `FData`, associate it through the
//! Port Layer (or park it on the Missing List if it doesn't exist yet), and
//! for directories, enumerate existing children so a brand-new subscriber
//! sees `CREATED` for everything already there instead of only future
//! changes (`scan_children_init` in the original).
//!
//! Nothing here returns `Result` — spec.md §7 requires that no internal
//! error ever escapes the public subscription API. A failed Associate turns
//! into a synthesized `DELETED` for the new subscriber plus a Missing List
//! entry, not an `Err` the caller has to unwrap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::event::{EventMapper, KernelEventMask, MappableEvent, RawKind};
use crate::fdata::{EventSink, FDataId, SubscriberId};
use crate::node::NodeId;
use crate::state::EngineState;

pub(crate) const WATCH_MASK: KernelEventMask = KernelEventMask::MODIFIED
    .union(KernelEventMask::ATTRIB)
    .union(KernelEventMask::DELETE)
    .union(KernelEventMask::RENAME_FROM)
    .union(KernelEventMask::RENAME_TO)
    .union(KernelEventMask::UNMOUNTED)
    .union(KernelEventMask::MOUNTEDOVER);

/// A live subscription. Dropping this without calling [`remove`] leaks the
/// association — callers are expected to hold it for exactly as long as
/// they want events, the same lifetime discipline the original's
/// `fen_helper_t*` handle has.
pub struct Subscription {
    pub(crate) fdata: FDataId,
    pub(crate) subscriber: SubscriberId,
    pub(crate) path: PathBuf,
    /// Whether this subscription opted into directory-monitor semantics at
    /// `Add` time — stored here rather than re-passed at `Remove` so the
    /// caller cannot accidentally mismatch the two.
    pub(crate) is_dir_monitor: bool,
}

impl Subscription {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn ensure_fdata_for_node(state: &mut EngineState, node: NodeId, path: &Path) -> FDataId {
    match state.nodes.data(node) {
        Some(existing) => existing,
        None => {
            let is_dir = path.is_dir();
            let id = state.fdata.create(node, is_dir);
            state.nodes.set_data(node, Some(id));
            id
        }
    }
}

fn resolve_or_create(state: &mut EngineState, path: &Path) -> FDataId {
    let path_str = path.to_string_lossy().to_string();
    let node = state
        .nodes
        .find_or_create(&path_str, |tree, parent, comp| Some(tree.insert(parent, comp)))
        .expect("find_or_create hook always returns Some");
    ensure_fdata_for_node(state, node, path)
}

/// `Add(path, subscriber, is_dir_monitor)`: subscribes `sink` (through
/// `mapper`) to events on `path`. On success the new subscriber alone gets
/// an immediate `CREATED`, plus a `ScanChildrenForInit` bracket if `path` is
/// a directory. On failure (the path does not exist right now) the
/// subscriber is still registered, the parent-chain walk runs, and a
/// synthesized `DELETED` is delivered to this subscriber alone — the path
/// is not lost, it simply starts out on the Missing List.
pub fn add(
    state: &mut EngineState,
    path: &Path,
    mapper: Arc<dyn EventMapper>,
    sink: Arc<dyn EventSink>,
    is_dir_monitor: bool,
) -> Subscription {
    let fdata = resolve_or_create(state, path);
    if is_dir_monitor {
        state.fdata.bump_direct_monitors(fdata);
    }

    let subscriber = match state.ports.associate(path, WATCH_MASK, fdata) {
        Ok(cookie) => {
            state.fdata.set_association(fdata, Some(cookie));
            state.wake_port_pump();
            let subscriber = state.fdata.subscribe(fdata, mapper, sink);
            let path_str = path.to_string_lossy();
            state.fdata.emit_created_to(fdata, subscriber, &path_str);
            if state.fdata.get(fdata).is_directory {
                scan_children(state, fdata, path, subscriber);
            }
            subscriber
        }
        Err(err) => {
            debug!(path = %path.display(), %err, "associate failed, parking on missing list");
            let subscriber = state.fdata.subscribe(fdata, mapper, sink);
            adjust_deleted(state, fdata, path);
            let path_str = path.to_string_lossy();
            state
                .fdata
                .emit_mappable_to(fdata, subscriber, &path_str, MappableEvent::Raw(RawKind::Delete));
            subscriber
        }
    };

    Subscription {
        fdata,
        subscriber,
        path: path.to_path_buf(),
        is_dir_monitor,
    }
}

/// `Remove(path, subscriber, is_dir_monitor)`: ends a subscription. If the
/// FData becomes passive (no subscribers, no direct monitor left), its
/// association is dissociated and the node is requested for removal.
pub fn remove(state: &mut EngineState, sub: Subscription) {
    state.fdata.unsubscribe(sub.fdata, sub.subscriber);
    if sub.is_dir_monitor {
        state.fdata.release_direct_monitor(sub.fdata);
    }
    if !state.fdata.is_passive(sub.fdata) {
        return;
    }
    state.missing.remove(sub.fdata);
    if let Some(cookie) = state.fdata.get(sub.fdata).association() {
        state.ports.dissociate(cookie);
    }
    let node = state.fdata.get(sub.fdata).node;
    state.nodes.set_data(node, None);
    state.fdata.remove(sub.fdata);
    state.nodes.pending_remove(node);
}

/// `AdjustDeleted`: called the moment a path is found gone, whether via a
/// DELETE delivery, a stat failure on a change-settle tick, or a failed
/// Associate at `Add` time. Always tries to keep an ancestor directory
/// associated (so its own MODIFIED can later reveal the path's
/// recreation), recursing upward on failure; separately decides whether
/// this exact FData still matters enough to track on the Missing List or
/// can be torn down outright.
pub fn adjust_deleted(state: &mut EngineState, fdata: FDataId, path: &Path) {
    state.fdata.set_association(fdata, None);
    let node = state.fdata.get(fdata).node;

    if let Some(parent_node) = state.nodes.parent(node) {
        let parent_path = PathBuf::from(state.nodes.filename(parent_node));
        let parent_fdata = ensure_fdata_for_node(state, parent_node, &parent_path);
        match state.ports.associate(&parent_path, WATCH_MASK, parent_fdata) {
            Ok(cookie) => {
                state.fdata.set_association(parent_fdata, Some(cookie));
                state.wake_port_pump();
            }
            Err(_) => adjust_deleted(state, parent_fdata, &parent_path),
        }
    }

    let interesting = state.fdata.get(fdata).has_subscribers()
        || state.nodes.children_len(node) > 0
        || !state.fdata.get(fdata).is_passive();
    if interesting {
        state.missing.add(fdata, path.to_path_buf());
        state.wake_missing_scan();
    } else {
        state.missing.remove(fdata);
        state.nodes.set_data(node, None);
        state.fdata.remove(fdata);
        state.nodes.pending_remove(node);
    }
}

/// `ScanChildren`: enumerates a directory's current entries and delivers a
/// `CREATED` bracket to `subscriber` alone for each, so a subscriber that
/// attaches to an already-populated directory sees its existing contents
/// without those entries being broadcast to every other subscriber of the
/// same directory (they already know about them).
pub fn scan_children(state: &mut EngineState, parent: FDataId, dir: &Path, subscriber: SubscriberId) {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };
    let parent_node = state.fdata.get(parent).node;
    for entry in read_dir.flatten() {
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else {
            continue;
        };
        let child_node = state.nodes.insert(parent_node, name_str);
        let child_path = dir.join(&name);
        let child_fdata = ensure_fdata_for_node(state, child_node, &child_path);
        if state.fdata.get(child_fdata).association().is_none() {
            if let Ok(cookie) = state.ports.associate(&child_path, WATCH_MASK, child_fdata) {
                state.fdata.set_association(child_fdata, Some(cookie));
                state.wake_port_pump();
            }
        }
        let path_str = child_path.to_string_lossy();
        state.fdata.emit_created_to(child_fdata, subscriber, &path_str);
    }
}

/// `ScanKnownChildren`: re-walks a directory's already-known children after
/// a directory-level event, creating FData for anything genuinely new
/// (broadcast to all of the directory's subscribers, not just one) and
/// re-associating existing passive children rather than the
/// single-subscriber bracket `scan_children` performs at subscribe-time.
pub fn scan_known_children(state: &mut EngineState, parent: FDataId, dir: &Path) {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };
    let parent_node = state.fdata.get(parent).node;
    for entry in read_dir.flatten() {
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else {
            continue;
        };
        let child_path = dir.join(&name);
        if let Some(child_node) = state.nodes.child(parent_node, name_str) {
            if let Some(child_fdata) = state.nodes.data(child_node) {
                if state.fdata.get(child_fdata).association().is_none() {
                    if let Ok(cookie) = state.ports.associate(&child_path, WATCH_MASK, child_fdata) {
                        state.fdata.set_association(child_fdata, Some(cookie));
                        state.wake_port_pump();
                    }
                }
                continue;
            }
        }
        let child_node = state.nodes.insert(parent_node, name_str);
        let id = ensure_fdata_for_node(state, child_node, &child_path);
        if let Ok(cookie) = state.ports.associate(&child_path, WATCH_MASK, id) {
            state.fdata.set_association(id, Some(cookie));
            state.wake_port_pump();
        }
        state.fdata.emit_created(id, &child_path.to_string_lossy());
    }
}
