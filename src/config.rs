//! Engine tunables.
//!
//! There is no config *file* — the core persists nothing (spec.md Non-goals).
//! `Config` is a plain struct the embedding adapter builds in-process, the
//! same way the original `gio` FEN backend reads its numbers from compiled-in
//! constants and a single `getrctl("process.max-port-events", ...)` call
//! rather than a settings file.

use std::time::Duration;

/// Mirrors the constants scattered across `fen-data.c`, `fen-kernel.c` and
/// `fen-missing.c` in the original source.
#[derive(Debug, Clone)]
pub struct Config {
    /// `PROCESS_EVENTQ_TIME` — interval of the per-FData event-pump timer.
    pub event_pump_interval: Duration,
    /// `SCAN_CHANGINGS_TIME` (`BASE_NUM` is fixed at 2 in the original; we
    /// bake the base into `settle_backoff_base` directly).
    pub settle_backoff_base: Duration,
    /// `SCAN_CHANGINGS_MIN_TIME`.
    pub settle_backoff_min: Duration,
    /// `SCAN_CHANGINGS_MAX_TIME`.
    pub settle_backoff_max: Duration,
    /// `PROCESS_PORT_EVENTS_TIME` — per-port kernel event pump interval.
    pub port_pump_interval: Duration,
    /// `SCAN_MISSING_INTERVAL`.
    pub missing_scan_interval: Duration,
    /// `max_port_events`, normally discovered from the platform at init
    /// (`getrctl("process.max-port-events", ...)` on the original); defaults
    /// to 512 the way the source does when the rctl lookup fails.
    pub max_port_events: usize,
    /// Maximum raw kernel events drained per port per pump tick
    /// (`PE_ALLOC` in `fen-kernel.c`).
    pub port_drain_batch: usize,
    /// How long a pending node removal waits before the deferred sweep
    /// actually unlinks it, and how often that sweep runs.
    pub node_removal_cooloff: Duration,
    pub node_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_pump_interval: Duration::from_millis(10),
            settle_backoff_base: Duration::from_millis(50),
            settle_backoff_min: Duration::from_millis(400),
            settle_backoff_max: Duration::from_millis(400),
            port_pump_interval: Duration::from_millis(400),
            missing_scan_interval: Duration::from_millis(4000),
            max_port_events: 512,
            port_drain_batch: 64,
            node_removal_cooloff: Duration::from_millis(100),
            node_sweep_interval: Duration::from_millis(100),
        }
    }
}
