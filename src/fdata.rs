//! Per-path event engine (spec.md §4.3), grounded on `fen-data.c`.
//!
//! Each monitored path gets one [`FData`]: a FIFO of coalesced [`NodeEvent`]s
//! plus the bookkeeping needed to debounce a burst of writes into a single
//! `CHANGED`. `FData` itself holds no timer — scheduling a settle check or a
//! pump tick is the caller's job (`src/lib.rs`, backed by `src/timer.rs`),
//! the same split the original draws between `fdata.c`'s pure state
//! transitions and `fen-kernel.c`'s timer plumbing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::Config;
use crate::event::{EventMapper, MappableEvent, NodeEvent, RawKind, SemanticKind};
use crate::kernel_port::AssociationId;
use crate::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FDataId(u32);

/// Delivery surface for semantic events. Mirrors the original's two emit
/// callbacks: `emit_all` fans an event out to every subscriber of a path
/// (the common case — `default_emit_event_cb`), `emit_one` targets a single
/// subscriber (used for the initial-enumeration bracket in
/// `scan_children_init` — `default_emit_once_event_cb`).
pub trait EventSink: Send + Sync {
    fn emit_all(&self, path: &str, kind: SemanticKind);
    fn emit_one(&self, subscriber: SubscriberId, path: &str, kind: SemanticKind);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
    id: SubscriberId,
    mapper: Arc<dyn EventMapper>,
    sink: Arc<dyn EventSink>,
}

/// State for one monitored path (spec.md §3 "FData").
pub struct FData {
    pub node: NodeId,
    pub is_directory: bool,
    /// Number of direct (non-inherited) monitor requests on this exact path.
    pub direct_monitors: u32,
    /// The Port Layer association currently watching this path, if the
    /// path exists. `None` while the path is absent (tracked instead in the
    /// Missing List) or not yet associated.
    association: Option<AssociationId>,
    subscribers: Vec<Subscriber>,
    queue: VecDeque<NodeEvent>,
    /// Consecutive MODIFIED-family events seen since the last settle —
    /// `BASE_NUM`'s exponent in the original's `fdata_adjust_changed`.
    consecutive_modified: u32,
    settle_deadline: Option<Instant>,
    /// Last stat'd size, compared on every change-settle tick to decide
    /// whether the file is still being written.
    cached_size: Option<u64>,
    /// Set once a DELETE has been emitted; further AddEvent calls are
    /// rejected (`fdata->is_cancel` in the original).
    cancelled: bool,
}

impl FData {
    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn association(&self) -> Option<AssociationId> {
        self.association
    }

    /// spec.md §8's invariant: `is_monitoring(f)` ⇔ associated with the
    /// kernel OR a settle timer is active.
    pub fn is_monitoring(&self) -> bool {
        self.association.is_some() || self.settle_deadline.is_some()
    }

    /// No subscriber and no direct-monitor request is keeping this path
    /// alive on its own merits — it only still exists because something
    /// underneath it (a child, or a subscriber of a descendant) does.
    pub fn is_passive(&self) -> bool {
        self.subscribers.is_empty() && self.direct_monitors == 0
    }
}

pub struct FDataArena {
    slots: Vec<Option<FData>>,
    free: Vec<u32>,
    next_subscriber: u64,
}

impl FDataArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_subscriber: 0,
        }
    }

    fn slot(&self, id: FDataId) -> &FData {
        self.slots[id.0 as usize].as_ref().expect("dangling FDataId")
    }

    fn slot_mut(&mut self, id: FDataId) -> &mut FData {
        self.slots[id.0 as usize].as_mut().expect("dangling FDataId")
    }

    pub fn get(&self, id: FDataId) -> &FData {
        self.slot(id)
    }

    pub fn set_association(&mut self, id: FDataId, association: Option<AssociationId>) {
        self.slot_mut(id).association = association;
    }

    pub fn cached_size(&self, id: FDataId) -> Option<u64> {
        self.slot(id).cached_size
    }

    pub fn set_cached_size(&mut self, id: FDataId, size: Option<u64>) {
        self.slot_mut(id).cached_size = size;
    }

    pub fn is_monitoring(&self, id: FDataId) -> bool {
        self.slot(id).is_monitoring()
    }

    pub fn is_passive(&self, id: FDataId) -> bool {
        self.slot(id).is_passive()
    }

    pub fn bump_direct_monitors(&mut self, id: FDataId) {
        self.slot_mut(id).direct_monitors += 1;
    }

    pub fn release_direct_monitor(&mut self, id: FDataId) {
        let fdata = self.slot_mut(id);
        fdata.direct_monitors = fdata.direct_monitors.saturating_sub(1);
    }

    pub fn create(&mut self, node: NodeId, is_directory: bool) -> FDataId {
        let fdata = FData {
            node,
            is_directory,
            direct_monitors: 0,
            association: None,
            subscribers: Vec::new(),
            queue: VecDeque::new(),
            consecutive_modified: 0,
            settle_deadline: None,
            cached_size: None,
            cancelled: false,
        };
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(fdata);
            FDataId(idx)
        } else {
            self.slots.push(Some(fdata));
            FDataId((self.slots.len() - 1) as u32)
        }
    }

    pub fn remove(&mut self, id: FDataId) {
        trace!(node = ?self.slot(id).node, "fdata freed");
        self.slots[id.0 as usize] = None;
        self.free.push(id.0);
    }

    pub fn subscribe(
        &mut self,
        id: FDataId,
        mapper: Arc<dyn EventMapper>,
        sink: Arc<dyn EventSink>,
    ) -> SubscriberId {
        let subscriber_id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        self.slot_mut(id).subscribers.push(Subscriber {
            id: subscriber_id,
            mapper,
            sink,
        });
        subscriber_id
    }

    /// Removes one subscription. Whether the FData can now be torn down is
    /// a separate question — callers check [`FData::is_passive`] (and
    /// whether the Node still has children) themselves.
    pub fn unsubscribe(&mut self, id: FDataId, subscriber: SubscriberId) {
        self.slot_mut(id).subscribers.retain(|s| s.id != subscriber);
    }

    fn emit(&self, id: FDataId, node_event: &NodeEvent, path: &str) {
        let fdata = self.slot(id);
        let mappable = MappableEvent::Raw(node_event.kind);
        for subscriber in &fdata.subscribers {
            if node_event.has_twin && matches!(node_event.kind, RawKind::Modified) {
                let attrib_kind = subscriber.mapper.map(MappableEvent::Raw(RawKind::Attrib));
                subscriber.sink.emit_all(path, attrib_kind);
            }
            let kind = subscriber.mapper.map(mappable);
            subscriber.sink.emit_all(path, kind);
        }
    }

    pub fn emit_mappable_to(&self, id: FDataId, subscriber: SubscriberId, path: &str, mappable: MappableEvent) {
        let fdata = self.slot(id);
        if let Some(s) = fdata.subscribers.iter().find(|s| s.id == subscriber) {
            let kind = s.mapper.map(mappable);
            s.sink.emit_one(subscriber, path, kind);
        }
    }

    pub fn emit_created(&self, id: FDataId, path: &str) {
        let fdata = self.slot(id);
        for subscriber in &fdata.subscribers {
            let kind = subscriber.mapper.map(MappableEvent::Created);
            subscriber.sink.emit_all(path, kind);
        }
    }

    pub fn emit_created_to(&self, id: FDataId, subscriber: SubscriberId, path: &str) {
        self.emit_mappable_to(id, subscriber, path, MappableEvent::Created);
    }

    /// `_fdata_add_event`: enqueues a raw kernel event, applying the
    /// original's pair-merging rules against the queue tail. Returns `true`
    /// if `kind` was DELETE — DELETE is never queued, it is emitted
    /// synchronously right here and the caller (`src/lib.rs`) must run the
    /// parent-chain walk (`facade::adjust_deleted`) immediately afterwards.
    ///
    /// - If the FData is already cancelled, the event is dropped outright —
    ///   there is a window where the kernel may still have buffered events
    ///   for an already-dissociated file.
    /// - DELETE clears the queue, cancels the FData so later stray kernel
    ///   events are dropped, and emits synchronously instead of enqueuing.
    /// - Equal kind on the tail merges (twin flags OR together).
    /// - A MODIFIED arriving over a tail ATTRIB is twinned and replaces it.
    /// - An ATTRIB arriving while a change-settle timer is active twins the
    ///   tail and is itself dropped, rather than queuing a second entry.
    pub fn add_event(&mut self, id: FDataId, kind: RawKind, has_twin: bool, path: &str) -> bool {
        if self.slot(id).cancelled {
            trace!(node = ?self.slot(id).node, %kind, "event dropped, fdata cancelled");
            return false;
        }

        if kind == RawKind::Delete {
            debug!(node = ?self.slot(id).node, "delete preempts queued events, emitting synchronously");
            let fdata = self.slot_mut(id);
            fdata.queue.clear();
            fdata.cancelled = true;
            fdata.settle_deadline = None;
            fdata.consecutive_modified = 0;
            let event = NodeEvent::new(kind, has_twin, id);
            self.emit(id, &event, path);
            return true;
        }

        if matches!(kind, RawKind::Modified | RawKind::Unmounted | RawKind::MountedOver) {
            self.slot_mut(id).consecutive_modified += 1;
        }

        let fdata = self.slot_mut(id);
        let tail_kind = fdata.queue.back().map(|t| t.kind);
        match tail_kind {
            Some(tk) if tk == kind => {
                fdata.queue.back_mut().unwrap().has_twin |= has_twin;
                return false;
            }
            Some(RawKind::Attrib) if kind == RawKind::Modified => {
                fdata.queue.pop_back();
                fdata.queue.push_back(NodeEvent::new(kind, true, id));
                return false;
            }
            Some(_) if kind == RawKind::Attrib && fdata.settle_deadline.is_some() => {
                fdata.queue.back_mut().unwrap().has_twin = true;
                return false;
            }
            _ => {}
        }
        fdata.queue.push_back(NodeEvent::new(kind, has_twin, id));
        false
    }

    /// `fdata_adjust_changed`: schedules the next change-settle check using
    /// the scalable backoff, but only if one is not already pending — the
    /// pump's post-emission state machine calls this after a MODIFIED-family
    /// event is delivered, and a burst of such events while a timer is
    /// already armed must not keep pushing the deadline out.
    pub fn schedule_settle_if_needed(&mut self, id: FDataId, cfg: &Config, now: Instant) {
        let fdata = self.slot_mut(id);
        if fdata.settle_deadline.is_some() {
            return;
        }
        let delay = settle_delay(fdata, cfg);
        fdata.settle_deadline = Some(now + delay);
    }

    /// Re-arms the settle timer for another round, advancing the backoff —
    /// used by the change-settle tick itself when a stat shows the file's
    /// size is still moving.
    pub fn reschedule_settle(&mut self, id: FDataId, cfg: &Config, now: Instant) {
        let fdata = self.slot_mut(id);
        fdata.consecutive_modified = fdata.consecutive_modified.saturating_add(1);
        let delay = settle_delay(fdata, cfg);
        fdata.settle_deadline = Some(now + delay);
    }

    pub fn settle_deadline(&self, id: FDataId) -> Option<Instant> {
        self.slot(id).settle_deadline
    }

    /// FData ids with queued events that are clear to deliver right now:
    /// either nothing is settling, or the settle deadline has passed.
    pub fn ready_to_pump(&self, now: Instant) -> Vec<FDataId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let fdata = slot.as_ref()?;
                let ready = !fdata.queue.is_empty()
                    && fdata.settle_deadline.is_none_or(|d| d <= now);
                ready.then(|| FDataId(idx as u32))
            })
            .collect()
    }

    pub fn clear_settle(&mut self, id: FDataId) {
        let fdata = self.slot_mut(id);
        fdata.settle_deadline = None;
        fdata.consecutive_modified = 0;
    }

    /// Drains and delivers all queued events for `id`. Called by the
    /// engine's event pump on its fixed tick (`PROCESS_EVENTQ_TIME`); the
    /// post-emission state machine (schedule a settle check, re-associate
    /// after ATTRIB, hand a DELETE off to `adjust_deleted`) lives in
    /// `src/lib.rs`, which has the Port Layer and Node Tree access this
    /// arena deliberately does not.
    pub fn pump(&mut self, id: FDataId, path: &str) -> Vec<NodeEvent> {
        let events: Vec<NodeEvent> = {
            let fdata = self.slot_mut(id);
            fdata.queue.drain(..).collect()
        };
        for event in &events {
            self.emit(id, event, path);
        }
        events
    }
}

/// `SCAN_CHANGINGS_TIME`/`_MIN_TIME`/`_MAX_TIME`: interval doubles with each
/// consecutive MODIFIED-family event, clamped to `[min, max]`.
fn settle_delay(fdata: &FData, cfg: &Config) -> Duration {
    const INIT_CHANGES_NUM: u32 = 2;
    if fdata.consecutive_modified < INIT_CHANGES_NUM {
        cfg.settle_backoff_base
    } else {
        cfg.settle_backoff_min.max(cfg.settle_backoff_base).min(cfg.settle_backoff_max)
    }
}

impl Default for FDataArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MappingA;
    use std::sync::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<(String, SemanticKind)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }
    }

    impl EventSink for RecordingSink {
        fn emit_all(&self, path: &str, kind: SemanticKind) {
            self.events.lock().unwrap().push((path.to_string(), kind));
        }
        fn emit_one(&self, _subscriber: SubscriberId, path: &str, kind: SemanticKind) {
            self.events.lock().unwrap().push((path.to_string(), kind));
        }
    }

    fn dummy_node() -> NodeId {
        crate::node::NodeTree::new().root()
    }

    #[test]
    fn duplicate_modified_collapses_into_single_queue_entry() {
        let mut arena = FDataArena::new();
        let id = arena.create(dummy_node(), false);
        arena.add_event(id, RawKind::Modified, false, "/a");
        arena.add_event(id, RawKind::Modified, false, "/a");
        assert_eq!(arena.get(id).queue_len(), 1);
    }

    #[test]
    fn delete_emits_synchronously_and_cancels() {
        let mut arena = FDataArena::new();
        let id = arena.create(dummy_node(), false);
        let sink = Arc::new(RecordingSink::new());
        arena.subscribe(id, Arc::new(MappingA), sink.clone());
        arena.add_event(id, RawKind::Modified, false, "/a");
        assert_eq!(arena.get(id).queue_len(), 1);
        let deleted = arena.add_event(id, RawKind::Delete, false, "/a");
        assert!(deleted);
        assert_eq!(arena.get(id).queue_len(), 0);
        assert!(arena.get(id).is_cancelled());
        assert_eq!(
            sink.events.lock().unwrap().as_slice(),
            &[("/a".to_string(), SemanticKind::Deleted)]
        );
        arena.add_event(id, RawKind::Modified, false, "/a");
        assert_eq!(arena.get(id).queue_len(), 0);
    }

    #[test]
    fn attrib_then_modified_merges_into_single_twinned_entry() {
        let mut arena = FDataArena::new();
        let id = arena.create(dummy_node(), false);
        arena.add_event(id, RawKind::Attrib, false, "/f");
        arena.add_event(id, RawKind::Modified, false, "/f");
        assert_eq!(arena.get(id).queue_len(), 1);
    }

    #[test]
    fn attrib_while_settling_twins_tail_instead_of_queuing() {
        let mut arena = FDataArena::new();
        let id = arena.create(dummy_node(), false);
        arena.add_event(id, RawKind::Modified, false, "/f");
        let cfg = Config::default();
        arena.schedule_settle_if_needed(id, &cfg, Instant::now());
        arena.add_event(id, RawKind::Attrib, false, "/f");
        assert_eq!(arena.get(id).queue_len(), 1);
    }

    #[test]
    fn pump_emits_to_all_subscribers() {
        let mut arena = FDataArena::new();
        let id = arena.create(dummy_node(), false);
        let sink = Arc::new(RecordingSink::new());
        arena.subscribe(id, Arc::new(MappingA), sink.clone());
        arena.add_event(id, RawKind::Modified, false, "/a");
        let delivered = arena.pump(id, "/a");
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            sink.events.lock().unwrap().as_slice(),
            &[("/a".to_string(), SemanticKind::Changed)]
        );
    }

    #[test]
    fn schedule_settle_escalates_after_two_consecutive_events() {
        let mut arena = FDataArena::new();
        let id = arena.create(dummy_node(), false);
        let cfg = Config::default();
        let now = Instant::now();
        arena.add_event(id, RawKind::Modified, false, "/a");
        arena.schedule_settle_if_needed(id, &cfg, now);
        assert_eq!(arena.settle_deadline(id), Some(now + cfg.settle_backoff_base));
        arena.clear_settle(id);
        arena.add_event(id, RawKind::Modified, false, "/a");
        arena.add_event(id, RawKind::Modified, false, "/a");
        // second MODIFIED on a fresh queue still merges into one entry, but
        // the counter itself has now seen two consecutive increments.
        arena.reschedule_settle(id, &cfg, now);
        assert_eq!(
            arena.settle_deadline(id),
            Some(now + cfg.settle_backoff_min.max(cfg.settle_backoff_base).min(cfg.settle_backoff_max))
        );
    }

    #[test]
    fn unsubscribe_and_is_passive() {
        let mut arena = FDataArena::new();
        let id = arena.create(dummy_node(), false);
        let sink = Arc::new(RecordingSink::new());
        let sub = arena.subscribe(id, Arc::new(MappingA), sink);
        assert!(!arena.is_passive(id));
        arena.unsubscribe(id, sub);
        assert!(arena.is_passive(id));
    }
}
