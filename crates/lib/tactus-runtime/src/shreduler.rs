//! The shreduler: time-ordered scheduling of shreds onto the sample clock.
//!
//! Runnable shreds are keyed by (wake time, admission sequence) so the pick
//! order is earliest-wake-first with FIFO tie-break within a tick, and
//! arbitrary shreds can be removed without list surgery. Event-blocked
//! shreds live in a separate set; the removed-blocked path here is the single
//! site that drops a shred's event back-reference retain.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use itertools::Itertools;

use crate::event;
use crate::object::{ObjId, ObjectStore};
use crate::shred::{Shred, ShredId, ShredTable};

/// Sample time in the VM's clock. Durations share the unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Time(pub f64);

impl Eq for Time {}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Status of one live shred, as reported to the host.
#[derive(Debug, Clone)]
pub struct ShredStatus {
    pub id: ShredId,
    pub name: String,
    pub start: f64,
    pub has_event: bool,
}

/// Snapshot of the VM's scheduling state.
#[derive(Debug, Clone)]
pub struct VmStatus {
    pub srate: u32,
    pub now_system: f64,
    pub t_second: u64,
    pub t_minute: u64,
    pub t_hour: u64,
    pub list: Vec<ShredStatus>,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "now: {:.0} samps ({}h {}m {}s) @ {} Hz, {} shred(s)",
            self.now_system,
            self.t_hour,
            self.t_minute,
            self.t_second,
            self.srate,
            self.list.len()
        )?;
        let lines = self
            .list
            .iter()
            .map(|s| {
                format!(
                    "  [shred id: {} \"{}\" spork time: {:.0}{}]",
                    s.id,
                    s.name,
                    s.start,
                    if s.has_event { " (waiting on event)" } else { "" }
                )
            })
            .join("\n");
        write!(f, "{lines}")
    }
}

/// Time-ordered runnable list plus the event-blocked set.
pub struct Shreduler {
    /// The language's `now`: current time in samples.
    pub now_system: f64,
    runnable: BTreeMap<(Time, u64), ShredId>,
    index: HashMap<ShredId, (Time, u64)>,
    seq: u64,
    blocked: HashSet<ShredId>,
    /// Shred currently in the instruction loop, if any.
    pub current: Option<ShredId>,

    pub dac: Option<ObjId>,
    pub adc: Option<ObjId>,
    pub bunghole: Option<ObjId>,
    pub num_dac_channels: u32,
    pub num_adc_channels: u32,

    adaptive: bool,
    max_block_size: u64,
}

impl Default for Shreduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Shreduler {
    pub fn new() -> Self {
        Self {
            now_system: 0.0,
            runnable: BTreeMap::new(),
            index: HashMap::new(),
            seq: 0,
            blocked: HashSet::new(),
            current: None,
            dac: None,
            adc: None,
            bunghole: None,
            num_dac_channels: 0,
            num_adc_channels: 0,
            adaptive: false,
            max_block_size: 1,
        }
    }

    /// Enable adaptive block processing up to `max_block_size` frames;
    /// 0 disables it.
    pub fn set_adaptive(&mut self, max_block_size: u64) {
        self.adaptive = max_block_size > 0;
        self.max_block_size = max_block_size.max(1);
    }

    /// Admit a shred at `wake_time`. Re-shreduling an already-queued shred
    /// is an internal inconsistency; it is reported and refused.
    pub fn shredule(&mut self, id: ShredId, wake_time: f64) -> bool {
        if self.index.contains_key(&id) {
            log::error!("(internal error) shred {id} already shreduled");
            return false;
        }
        let key = (Time(wake_time), self.seq);
        self.seq += 1;
        self.runnable.insert(key, id);
        self.index.insert(id, key);
        log::trace!("shredule {id} at {wake_time}");
        true
    }

    /// Pop the next shred due at or before `now_system`.
    pub fn get_next(&mut self) -> Option<ShredId> {
        let (&(wake, seq), &id) = self.runnable.first_key_value()?;
        if wake.0 > self.now_system {
            return None;
        }
        self.runnable.remove(&(wake, seq));
        self.index.remove(&id);
        Some(id)
    }

    /// Earliest scheduled wake time, if any shred is runnable.
    pub fn earliest_wake(&self) -> Option<f64> {
        self.runnable.keys().next().map(|(t, _)| t.0)
    }

    /// Samples until the next shred is due; `None` when nothing is queued.
    pub fn samps_until_next(&self) -> Option<f64> {
        self.earliest_wake().map(|w| (w - self.now_system).max(0.0))
    }

    /// Frames to process in one block: `min(samps_until_next,
    /// max_block_size, frames_left)`, at least 1. Without adaptive mode the
    /// block is a single frame, so no shred ever observes a `now_system`
    /// later than its own wake time.
    pub fn next_block(&self, frames_left: u64) -> u64 {
        if !self.adaptive {
            return 1;
        }
        let until = self
            .samps_until_next()
            .map_or(self.max_block_size, |s| s.ceil() as u64);
        until.min(self.max_block_size).min(frames_left).max(1)
    }

    /// Advance the sample clock.
    pub fn advance(&mut self, frames: u64) {
        self.now_system += frames as f64;
    }

    /// Remove a shred from the runnable list.
    pub fn remove(&mut self, id: ShredId) -> bool {
        match self.index.remove(&id) {
            Some(key) => {
                self.runnable.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Re-slot a shred id for the host's edit-and-replace: whatever occupied
    /// the id's runnable slot is dropped and the id is shreduled at `now`.
    /// Blocked occupants are the caller's responsibility (the event
    /// back-reference must be released through the removed-blocked path).
    pub fn replace(&mut self, id: ShredId) -> bool {
        self.remove(id);
        self.shredule(id, self.now_system)
    }

    pub fn is_runnable(&self, id: ShredId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn is_blocked(&self, id: ShredId) -> bool {
        self.blocked.contains(&id)
    }

    /// Track a shred suspended on an event.
    pub fn add_blocked(&mut self, id: ShredId) -> bool {
        self.blocked.insert(id)
    }

    /// Signal-path unblock: the event has already cleared the shred's back
    /// reference, only the set membership remains.
    pub(crate) fn unblock(&mut self, id: ShredId) -> bool {
        self.blocked.remove(&id)
    }

    /// Removed-blocked path, used when a blocked shred is killed or
    /// replaced: splice the shred out of its event's wait queue, then drop
    /// the back-reference retain. This is the single drop site for that
    /// retain.
    pub fn remove_blocked(&mut self, store: &mut ObjectStore, shred: &mut Shred) -> bool {
        if !self.blocked.remove(&shred.id) {
            return false;
        }
        if let Some(ev) = shred.event.take() {
            event::remove_shred(store, ev, shred.id);
            store.release(ev);
        }
        true
    }

    /// Highest shred id among runnable, blocked and current.
    pub fn highest(&self) -> Option<ShredId> {
        self.index
            .keys()
            .chain(self.blocked.iter())
            .chain(self.current.iter())
            .copied()
            .max()
    }

    /// Build a status snapshot; entries are sorted by id.
    pub fn status(&self, shreds: &ShredTable, srate: u32) -> VmStatus {
        let samps = self.now_system as u64;
        let seconds = if srate > 0 { samps / srate as u64 } else { 0 };
        let list = shreds
            .values()
            .sorted_by_key(|s| s.id)
            .map(|s| ShredStatus {
                id: s.id,
                name: s.name.clone(),
                start: s.start,
                has_event: s.event.is_some(),
            })
            .collect();
        VmStatus {
            srate,
            now_system: self.now_system,
            t_second: seconds % 60,
            t_minute: (seconds / 60) % 60,
            t_hour: seconds / 3600,
            list,
        }
    }

    pub fn num_runnable(&self) -> usize {
        self.runnable.len()
    }

    pub fn num_blocked(&self) -> usize {
        self.blocked.len()
    }
}
