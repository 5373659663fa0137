//! Port pool and association bookkeeping on top of [`KernelPort`] (spec.md
//! §4.2), grounded on `fen-kernel.c`.
//!
//! The kernel primitive is single-shot: once it delivers an event for a
//! path, that path is no longer being watched until something re-associates
//! it. Unlike an earlier draft of this layer, `PortLayer` does *not*
//! auto-rearm on every delivery — a delivery just flips the association to
//! inactive, and it is up to the FData-level state machine (`src/fdata.rs`'s
//! post-emission handling in `src/lib.rs`) to decide when and whether to
//! call [`PortLayer::reassociate`]. What `PortLayer` does hide is the
//! platform's cap on live associations per port: each port holds at most
//! `max_port_events` (read from `getrctl("process.max-port-events", ...)` in
//! the original), and once one fills up, `associate` opens another rather
//! than failing.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{normalize, KernelEventMask, RawKind};
use crate::fdata::FDataId;
use crate::kernel_port::{AssociationId, KernelPort, KernelPortFactory, RawKernelEvent};

type PortId = u32;

struct PortEntry {
    kernel: Box<dyn KernelPort>,
    count: usize,
}

struct Association {
    port: PortId,
    path: PathBuf,
    mask: KernelEventMask,
    /// Whether the kernel currently has this path armed. A delivery clears
    /// it; [`PortLayer::reassociate`] sets it back.
    active: bool,
    /// `None` once a dissociate has raced a still-buffered kernel delivery
    /// (or failed outright) — the record is kept only so that delivery can
    /// be recognized and discarded instead of misrouted to a reused
    /// `FDataId`.
    owner: Option<FDataId>,
}

/// A delivered, normalized event ready to be handed to the matching FData.
pub struct PortDelivery {
    pub fdata: FDataId,
    pub kind: RawKind,
    pub has_twin: bool,
}

/// Pool of open ports plus the association table shared across all of them.
pub struct PortLayer {
    factory: KernelPortFactory,
    ports: HashMap<PortId, PortEntry>,
    /// Ports with room for at least one more association.
    available: VecDeque<PortId>,
    /// Ports already holding `max_events` associations.
    full: Vec<PortId>,
    next_port_id: PortId,
    associations: HashMap<AssociationId, Association>,
    next_cookie: u64,
    max_events: usize,
    drain_batch: usize,
}

impl PortLayer {
    pub fn new(factory: KernelPortFactory, cfg: &Config) -> Result<Self> {
        let mut layer = Self {
            factory,
            ports: HashMap::new(),
            available: VecDeque::new(),
            full: Vec::new(),
            next_port_id: 0,
            associations: HashMap::new(),
            next_cookie: 0,
            max_events: cfg.max_port_events.max(1),
            drain_batch: cfg.port_drain_batch,
        };
        layer.open_port()?;
        Ok(layer)
    }

    fn open_port(&mut self) -> Result<PortId> {
        let kernel = (self.factory)()?;
        let id = self.next_port_id;
        self.next_port_id += 1;
        self.ports.insert(id, PortEntry { kernel, count: 0 });
        self.available.push_back(id);
        debug!(port = id, "opened a new port");
        Ok(id)
    }

    pub fn active_count(&self) -> usize {
        self.associations.len()
    }

    /// Associates `path` on behalf of `fdata`. Picks the head of the
    /// available-ports queue, opening a fresh port if none has room —
    /// spec.md §4.2/§8's "the next Associate on a new subscriber creates a
    /// second port" boundary case.
    pub fn associate(&mut self, path: &Path, mask: KernelEventMask, fdata: FDataId) -> Result<AssociationId> {
        let port_id = match self.available.front().copied() {
            Some(id) => id,
            None => self.open_port()?,
        };
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        {
            let entry = self.ports.get_mut(&port_id).expect("available port is tracked");
            entry.kernel.associate(path, mask, cookie)?;
            entry.count += 1;
            if entry.count >= self.max_events {
                self.available.pop_front();
                self.full.push(port_id);
                trace!(port = port_id, "port reached max_port_events, moved to full");
            }
        }
        self.associations.insert(
            cookie,
            Association {
                port: port_id,
                path: path.to_path_buf(),
                mask,
                active: true,
                owner: Some(fdata),
            },
        );
        trace!(path = %path.display(), cookie, port = port_id, "associated");
        Ok(cookie)
    }

    /// Re-arms an already-known association without a fresh stat, the
    /// no-stat `Reassociate` operation spec.md §4.2 distinguishes from
    /// `Associate`. Used after an ATTRIB event and after a change-settle
    /// tick finds the path stable.
    pub fn reassociate(&mut self, path: &Path, cookie: AssociationId) -> Result<()> {
        let Some(assoc) = self.associations.get_mut(&cookie) else {
            return Err(Error::Associate {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such association"),
            });
        };
        let port_id = assoc.port;
        let entry = self.ports.get_mut(&port_id).expect("association always points at a live port");
        entry.kernel.reassociate(path, cookie)?;
        assoc.active = true;
        Ok(())
    }

    /// Dissociates an association. Best-effort: any failure — transient or
    /// not — still marks the record (`owner = None`) and leaves it in the
    /// map rather than propagating, since the caller (`facade::remove`) is
    /// about to free the `FDataId` this association points at regardless.
    /// A later stray delivery for the same cookie is then recognized and
    /// discarded by [`Self::pump`] instead of being routed to whatever
    /// reuses that slot.
    pub fn dissociate(&mut self, cookie: AssociationId) {
        let Some(assoc) = self.associations.get(&cookie) else {
            return;
        };
        if !assoc.active {
            // Nothing armed in the kernel right now to cancel.
            self.remove_association(cookie);
            return;
        }
        let port_id = assoc.port;
        let path = assoc.path.clone();
        let entry = self.ports.get_mut(&port_id).expect("association always points at a live port");
        match entry.kernel.dissociate(&path) {
            Ok(()) => self.remove_association(cookie),
            Err(err) => {
                if err.is_transient() {
                    debug!(cookie, "dissociate raced a buffered event, marking");
                } else {
                    warn!(cookie, %err, "dissociate failed, marking association anyway");
                }
                if let Some(assoc) = self.associations.get_mut(&cookie) {
                    assoc.owner = None;
                }
            }
        }
    }

    fn remove_association(&mut self, cookie: AssociationId) {
        if let Some(assoc) = self.associations.remove(&cookie) {
            self.release_slot(assoc.port);
        }
    }

    fn release_slot(&mut self, port_id: PortId) {
        let Some(entry) = self.ports.get_mut(&port_id) else {
            return;
        };
        let was_full = entry.count >= self.max_events;
        entry.count = entry.count.saturating_sub(1);
        if was_full && entry.count < self.max_events {
            if let Some(pos) = self.full.iter().position(|&id| id == port_id) {
                self.full.remove(pos);
                self.available.push_back(port_id);
                trace!(port = port_id, "port has room again, moved to available");
            }
        }
    }

    /// Drains every port once, normalizing each delivery and folding it
    /// into a single coalesced queue before handing it back (spec.md §4.2's
    /// "global event queue with on-the-fly coalescing"): consecutive
    /// deliveries for the same FData merge equal kinds, let a MODIFIED
    /// absorb a preceding untwinned ATTRIB (and vice versa). A delivery
    /// against a marked (owner-less) association is discarded outright. A
    /// terminal kind (DELETE/UNMOUNTED) retires the association; anything
    /// else is just marked inactive — re-arming it is the caller's job.
    pub fn pump(&mut self) -> Result<Vec<PortDelivery>> {
        let mut staged: Vec<PortDelivery> = Vec::new();
        let port_ids: Vec<PortId> = self.ports.keys().copied().collect();
        for port_id in port_ids {
            let raw: Vec<RawKernelEvent> = {
                let entry = self.ports.get_mut(&port_id).expect("tracked port");
                entry.kernel.getn(self.drain_batch, Duration::from_millis(0))?
            };
            for event in raw {
                let Some(assoc) = self.associations.get(&event.cookie) else {
                    continue;
                };
                let Some(owner) = assoc.owner else {
                    trace!(cookie = event.cookie, "discarding delivery for marked association");
                    self.remove_association(event.cookie);
                    continue;
                };
                let (kind, has_twin) = normalize(event.mask);
                let terminal = matches!(kind, RawKind::Delete | RawKind::Unmounted);
                if let Some(assoc) = self.associations.get_mut(&event.cookie) {
                    assoc.active = false;
                }
                if terminal {
                    self.remove_association(event.cookie);
                }
                push_coalesced(&mut staged, owner, kind, has_twin);
            }
        }
        Ok(staged)
    }
}

/// Implements spec.md §4.2's tail-inspection rules against the global
/// staging queue, gated on the tail belonging to the same FData: equal
/// kinds merge (twin flags OR together); a MODIFIED absorbs a preceding
/// untwinned ATTRIB tail; an ATTRIB is absorbed as a twin into a preceding
/// untwinned MODIFIED tail. RENAME normalization and the ATTRIB-stripping
/// twin rule already happened inside `normalize()` before this runs.
fn push_coalesced(staged: &mut Vec<PortDelivery>, fdata: FDataId, kind: RawKind, has_twin: bool) {
    if let Some(tail) = staged.last_mut() {
        if tail.fdata == fdata {
            if tail.kind == kind {
                tail.has_twin |= has_twin;
                return;
            }
            if kind == RawKind::Modified && tail.kind == RawKind::Attrib && !tail.has_twin {
                tail.kind = RawKind::Modified;
                tail.has_twin = true;
                return;
            }
            if kind == RawKind::Attrib && tail.kind == RawKind::Modified && !tail.has_twin {
                tail.has_twin = true;
                return;
            }
        }
    }
    staged.push(PortDelivery { fdata, kind, has_twin });
}
