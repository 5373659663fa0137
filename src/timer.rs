//! Thin tokio task wrapper for the engine's periodic timers.
//!
//! Grounded on the teacher's `scanner/watcher.rs`, which drives its watch
//! loop from a spawned tokio task rather than a bare thread; here the same
//! shape backs the FData event pump, the port event pump, the missing list
//! scan, and the deferred node-removal sweep, all of which are just "do X
//! every N" in the original C.
//!
//! spec.md §4.2/§4.5 ask the port pump and the missing-list scan to stop
//! rescheduling themselves once their queue empties rather than spinning
//! forever. Tearing the tokio task down and respawning it on demand would
//! need a join handle threaded back through `EngineState`, so instead each
//! controlled timer carries a shared flag: the tick body is skipped while
//! paused, and whoever re-populates the queue flips it back on. The
//! underlying tokio interval keeps ticking either way — only the work it
//! triggers is actually suspended.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Shared pause/resume switch for a [`PeriodicTimer`] spawned via
/// [`PeriodicTimer::spawn_controlled`]. Cheap to clone; cloning shares the
/// same underlying flag.
#[derive(Clone)]
pub struct TimerControl(Arc<AtomicBool>);

impl TimerControl {
    pub fn pause(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// A cancellable recurring timer. Dropping it aborts the underlying task,
/// the same as calling [`Self::cancel`] explicitly.
pub struct PeriodicTimer {
    handle: JoinHandle<()>,
}

impl PeriodicTimer {
    pub fn spawn<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick();
            }
        });
        Self { handle }
    }

    /// Like [`Self::spawn`], but the tick body only runs while the returned
    /// [`TimerControl`] is active. Starts active.
    pub fn spawn_controlled<F>(period: Duration, mut tick: F) -> (Self, TimerControl)
    where
        F: FnMut() + Send + 'static,
    {
        let control = TimerControl(Arc::new(AtomicBool::new(true)));
        let running = control.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if running.0.load(Ordering::Relaxed) {
                    tick();
                }
            }
        });
        (Self { handle }, control)
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
