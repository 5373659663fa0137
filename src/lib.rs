//! A user-space file event notification engine bridging a single-shot,
//! single-association-per-path kernel primitive to a coalesced,
//! directory-aware event stream.
//!
//! [`Engine`] is the embedding point: construct one, call
//! [`Engine::subscribe`] for each path of interest, and receive semantic
//! events (`CREATED`, `CHANGED`, `ATTRIBUTE_CHANGED`, `DELETED`,
//! `UNMOUNTED`) through an injected [`EventSink`]. Internally it runs four
//! periodic tasks — the event pump, the port pump, the missing-path scan,
//! and the deferred node-removal sweep — against one `parking_lot`-guarded
//! state struct, matching the single-threaded cooperative model the
//! original backend used.

mod config;
mod error;
mod event;
mod facade;
mod fdata;
mod kernel_port;
mod missing;
mod node;
mod port_layer;
mod state;
mod timer;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{EventMapper, MappableEvent, MappingA, MappingB, SemanticKind};
pub use facade::Subscription;
pub use fdata::{EventSink, SubscriberId};
pub use kernel_port::KernelPort;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use event::RawKind;
use fdata::FDataId;
use kernel_port::KernelPortFactory;
#[cfg(target_os = "illumos")]
use kernel_port::IllumosPort;
#[cfg(not(target_os = "illumos"))]
use kernel_port::NotifyPort;
use state::EngineState;
use timer::PeriodicTimer;

/// Entry point: owns the engine's background tasks and the lock guarding
/// its shared state.
pub struct Engine {
    state: Arc<Mutex<EngineState>>,
    _event_pump: PeriodicTimer,
    _port_pump: PeriodicTimer,
    _missing_scan: PeriodicTimer,
    _node_sweep: PeriodicTimer,
}

impl Engine {
    /// Builds an engine with the default config and platform kernel
    /// backend: a real `port(3)` on illumos, the portable `notify`-backed
    /// emulation everywhere else.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Self::with_kernel(default_kernel_factory(), config)
    }

    /// Builds an engine against an explicit [`KernelPortFactory`] — the
    /// seam tests use to run against something other than the real
    /// platform watcher. Fallible because the first port is opened
    /// eagerly, at construction time.
    pub fn with_kernel(factory: KernelPortFactory, config: Config) -> Result<Self> {
        let state = Arc::new(Mutex::new(EngineState::new(factory, config.clone())?));

        let event_pump = {
            let state = state.clone();
            PeriodicTimer::spawn(config.event_pump_interval, move || {
                tick_event_pump(&state);
            })
        };
        let (port_pump, port_pump_control) = {
            let state = state.clone();
            PeriodicTimer::spawn_controlled(config.port_pump_interval, move || {
                tick_port_pump(&state);
            })
        };
        let (missing_scan, missing_control) = {
            let state = state.clone();
            PeriodicTimer::spawn_controlled(config.missing_scan_interval, move || {
                tick_missing_scan(&state);
            })
        };
        let node_sweep = {
            let state = state.clone();
            PeriodicTimer::spawn(config.node_sweep_interval, move || {
                tick_node_sweep(&state);
            })
        };

        {
            let mut guard = state.lock();
            guard.port_pump_timer = Some(port_pump_control);
            guard.missing_timer = Some(missing_control);
            // Both start paused: nothing is associated or missing yet, and
            // every call site that populates either queue resumes it.
            guard.port_pump_timer.as_ref().unwrap().pause();
            guard.missing_timer.as_ref().unwrap().pause();
        }

        Ok(Self {
            state,
            _event_pump: event_pump,
            _port_pump: port_pump,
            _missing_scan: missing_scan,
            _node_sweep: node_sweep,
        })
    }

    /// `Add`: subscribes to events on `path` through `mapper`, delivered to
    /// `sink`. `is_dir_monitor` opts this subscriber into directory-monitor
    /// semantics (it keeps the directory's own association alive via the
    /// direct-monitor count, independent of whether `path` happens to be a
    /// directory on disk). Never fails: a path that doesn't exist yet gets
    /// a `DELETED` synthesized immediately and is parked on the Missing
    /// List until it appears (spec.md §7 — nothing escapes this API as an
    /// error).
    pub fn subscribe(
        &self,
        path: impl AsRef<Path>,
        mapper: Arc<dyn EventMapper>,
        sink: Arc<dyn EventSink>,
        is_dir_monitor: bool,
    ) -> Subscription {
        let mut guard = self.state.lock();
        facade::add(&mut guard, path.as_ref(), mapper, sink, is_dir_monitor)
    }

    /// `Remove`: ends a subscription. Tears down the underlying
    /// association once it was the last subscriber of its path.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut guard = self.state.lock();
        facade::remove(&mut guard, subscription);
    }
}

fn default_kernel_factory() -> KernelPortFactory {
    #[cfg(target_os = "illumos")]
    {
        Box::new(|| Ok(Box::new(IllumosPort::new()?) as Box<dyn KernelPort>))
    }
    #[cfg(not(target_os = "illumos"))]
    {
        Box::new(|| Ok(Box::new(NotifyPort::new()?) as Box<dyn KernelPort>))
    }
}

/// Delivers every queued-and-settled event across all FDatas. An id whose
/// settle deadline just elapsed gets a genuine change-settle tick
/// ([`run_settle_check`]) rather than a blind drain, so a file still being
/// written gets its deadline extended instead of a premature `CHANGED`.
fn tick_event_pump(state: &Arc<Mutex<EngineState>>) {
    let mut guard = state.lock();
    let now = Instant::now();
    for id in guard.fdata.ready_to_pump(now) {
        if guard.fdata.settle_deadline(id).is_some() {
            run_settle_check(&mut guard, id, now);
        } else {
            drain_and_emit(&mut guard, id);
        }
    }
}

/// Drains and delivers whatever is queued for `id`, then runs the
/// post-emission state machine spec.md §4.3 describes for each kind:
/// MODIFIED-family events arm the settle timer (if none is running yet);
/// ATTRIB re-associates immediately, falling through to a synthesized
/// DELETE if that fails. DELETE itself never reaches here — it is emitted
/// synchronously by `FDataArena::add_event` and handled at the call site.
fn drain_and_emit(state: &mut EngineState, id: FDataId) {
    let node = state.fdata.get(id).node;
    let path = state.nodes.filename(node).to_string();
    let events = state.fdata.pump(id, &path);
    let now = Instant::now();
    let cfg = state.config.clone();
    for event in &events {
        match event.kind {
            RawKind::Modified | RawKind::Unmounted | RawKind::MountedOver => {
                state.fdata.schedule_settle_if_needed(id, &cfg, now);
            }
            RawKind::Attrib => {
                reassociate_or_delete(state, id, &path);
            }
            RawKind::Delete => unreachable!("DELETE is emitted synchronously, never queued"),
        }
    }
}

/// Re-associates `id` (no fresh stat — spec.md §4.2's `Reassociate`). On
/// failure, synthesizes a DELETE and runs the parent-chain walk, the same
/// fallback the change-settle tick uses.
fn reassociate_or_delete(state: &mut EngineState, id: FDataId, path: &str) {
    let Some(cookie) = state.fdata.get(id).association() else {
        return;
    };
    match state.ports.reassociate(Path::new(path), cookie) {
        Ok(()) => state.wake_port_pump(),
        Err(err) => {
            warn!(path = %path, %err, "re-associate failed, synthesizing deleted");
            if state.fdata.add_event(id, RawKind::Delete, false, path) {
                facade::adjust_deleted(state, id, Path::new(path));
            }
        }
    }
}

/// spec.md §4.3's change-settle tick: stats the path, compares against the
/// cached size, and either extends the settle deadline (still changing) or
/// finalizes (stable): directory children are rescanned, a now-empty
/// passive intermediate is dissociated, and the primary association is
/// re-armed via `Reassociate`.
fn run_settle_check(state: &mut EngineState, id: FDataId, now: Instant) {
    let node = state.fdata.get(id).node;
    let path = state.nodes.filename(node).to_string();
    let cfg = state.config.clone();

    let meta = match std::fs::symlink_metadata(&path) {
        Ok(meta) => meta,
        Err(err) => {
            warn!(path = %path, %err, "stat failed during settle check, treating as deleted");
            state.fdata.clear_settle(id);
            if state.fdata.add_event(id, RawKind::Delete, false, &path) {
                facade::adjust_deleted(state, id, Path::new(&path));
            }
            return;
        }
    };

    let size = meta.len();
    if state.fdata.cached_size(id) != Some(size) {
        state.fdata.set_cached_size(id, Some(size));
        state.fdata.reschedule_settle(id, &cfg, now);
        return;
    }

    state.fdata.clear_settle(id);
    let node_has_children = state.nodes.children_len(node) > 0;
    if state.fdata.get(id).is_directory && state.fdata.get(id).direct_monitors > 0 {
        facade::scan_known_children(state, id, Path::new(&path));
    } else if state.fdata.is_passive(id) && !node_has_children {
        if let Some(cookie) = state.fdata.get(id).association() {
            state.ports.dissociate(cookie);
            state.fdata.set_association(id, None);
        }
    }
    reassociate_or_delete(state, id, &path);
}

/// Drains the deferred node-removal queue (spec.md §5's "deferred-node-delete"
/// idle scan): anything requested via [`facade::remove`] at least
/// `node_removal_cooloff` ago and still childless/dataless is unlinked,
/// pruning empty ancestors along the way.
fn tick_node_sweep(state: &Arc<Mutex<EngineState>>) {
    let mut guard = state.lock();
    if !guard.nodes.has_pending() {
        return;
    }
    let cool_off = guard.config.node_removal_cooloff;
    let mut pre_delete = |_: &mut crate::node::NodeTree, _: crate::node::NodeId| true;
    guard.nodes.sweep_pending(cool_off, &mut pre_delete);
}

/// Drains the Port Layer's coalesced delivery queue and routes each
/// normalized event into its FData's queue. A directory's own MODIFIED
/// means its membership changed, not its content — it is rescanned for new
/// children instead of being queued as a semantic event for the
/// directory's own subscribers. Pauses itself once nothing is associated
/// anywhere (spec.md §4.2's "stop re-scheduling the timer when the port's
/// ref-count drops to zero").
fn tick_port_pump(state: &Arc<Mutex<EngineState>>) {
    let mut guard = state.lock();
    let deliveries = match guard.ports.pump() {
        Ok(d) => d,
        Err(err) => {
            warn!(%err, "port pump failed");
            return;
        }
    };
    for delivery in deliveries {
        let is_directory = guard.fdata.get(delivery.fdata).is_directory;
        let node = guard.fdata.get(delivery.fdata).node;
        let path = guard.nodes.filename(node).to_string();

        if is_directory && delivery.kind == RawKind::Modified {
            facade::scan_known_children(&mut guard, delivery.fdata, Path::new(&path));
            reassociate_or_delete(&mut guard, delivery.fdata, &path);
            continue;
        }

        let deleted = guard.fdata.add_event(delivery.fdata, delivery.kind, delivery.has_twin, &path);
        if deleted {
            facade::adjust_deleted(&mut guard, delivery.fdata, Path::new(&path));
        }
    }
    if guard.ports.active_count() == 0 {
        if let Some(control) = guard.port_pump_timer.clone() {
            control.pause();
        }
    }
}

/// Rechecks every path on the Missing List; anything that now exists gets
/// re-associated and a `CREATED` broadcast to all of its subscribers.
/// Pauses itself once the list is empty (spec.md §4.5).
fn tick_missing_scan(state: &Arc<Mutex<EngineState>>) {
    let mut guard = state.lock();
    let interval = guard.config.missing_scan_interval;
    for (fdata, path) in guard.missing.due(interval) {
        if !path.exists() {
            continue;
        }
        guard.missing.remove(fdata);
        match guard.ports.associate(&path, facade::WATCH_MASK, fdata) {
            Ok(cookie) => {
                guard.fdata.set_association(fdata, Some(cookie));
                guard.wake_port_pump();
                guard.fdata.emit_created(fdata, &path.to_string_lossy());
                if guard.fdata.get(fdata).is_directory {
                    facade::scan_known_children(&mut guard, fdata, &path);
                }
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "re-associate on recreation failed");
                guard.missing.add(fdata, path);
            }
        }
    }
    if guard.missing.is_empty() {
        if let Some(control) = guard.missing_timer.clone() {
            control.pause();
        }
    }
}
