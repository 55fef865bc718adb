//! Host ⇄ VM messages.
//!
//! Host/control threads push [`Msg`] values onto the VM's SPSC message ring;
//! the run loop drains the ring once per iteration, applies each message and
//! pushes a [`Reply`]. Message effects are visible to all subsequent ticks.

use std::sync::Arc;

use crate::code::VmCode;
use crate::shred::ShredId;
use crate::shreduler::VmStatus;

/// Control message, applied by the audio thread between ticks.
#[derive(Debug, Clone)]
pub enum Msg {
    /// Spork `code` as a new top-level shred.
    Add { code: Arc<VmCode>, args: Vec<String> },
    Remove(ShredId),
    RemoveAll,
    /// Swap the code running under `id`; the new shred inherits the id.
    Replace { id: ShredId, code: Arc<VmCode> },
    Status,
    Pause(bool),
    Exit,
    Time,
    ResetId,
    Abort,
    ClearVm,
    ClearGlobals,
}

/// VM → host reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Added(ShredId),
    Removed(ShredId),
    RemovedAll(usize),
    Replaced(ShredId),
    Status(VmStatus),
    /// Previous pause state.
    Paused(bool),
    Time(f64),
    Aborted(ShredId),
    Cleared(usize),
    ClearedGlobals,
    /// The VM went idle with halt-on-empty set.
    Done,
    Error(String),
}
