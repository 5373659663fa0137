//! The engine's single piece of shared, lockable state (spec.md §5).
//!
//! Every mutation — a subscription being added, a kernel event being
//! pumped, a settle timer firing — goes through one `parking_lot::Mutex`
//! wrapping this struct. That matches the original's single-threaded
//! cooperative model: there is never more than one piece of logic touching
//! the Node Tree, the FData arena or the Port Layer at a time, so none of
//! those types need their own internal synchronization.

use crate::config::Config;
use crate::error::Result;
use crate::fdata::FDataArena;
use crate::kernel_port::KernelPortFactory;
use crate::missing::MissingList;
use crate::node::NodeTree;
use crate::port_layer::PortLayer;
use crate::timer::TimerControl;

pub struct EngineState {
    pub nodes: NodeTree,
    pub fdata: FDataArena,
    pub ports: PortLayer,
    pub missing: MissingList,
    pub config: Config,
    /// Pause/resume handle for the missing-list scan timer — spec.md §4.5's
    /// "the timer stops itself when the list empties". `None` until the
    /// engine wires it up at construction.
    pub missing_timer: Option<TimerControl>,
    /// Pause/resume handle for the port event pump — spec.md §4.2's "stop
    /// re-scheduling the timer when the port's ref-count drops to zero".
    pub port_pump_timer: Option<TimerControl>,
}

impl EngineState {
    pub fn new(factory: KernelPortFactory, config: Config) -> Result<Self> {
        Ok(Self {
            nodes: NodeTree::new(),
            fdata: FDataArena::new(),
            ports: PortLayer::new(factory, &config)?,
            missing: MissingList::new(),
            config,
            missing_timer: None,
            port_pump_timer: None,
        })
    }

    /// Call whenever the missing list gains an entry — a paused scan timer
    /// needs to resume, an already-running one is a no-op.
    pub fn wake_missing_scan(&self) {
        if let Some(control) = &self.missing_timer {
            control.resume();
        }
    }

    /// Call whenever a port association is created or re-armed — the pump
    /// that drains it may currently be paused.
    pub fn wake_port_pump(&self) {
        if let Some(control) = &self.port_pump_timer {
            control.resume();
        }
    }
}
