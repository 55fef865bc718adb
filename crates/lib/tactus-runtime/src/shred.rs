//! Shreds: the language's cooperative tasks.
//!
//! A shred owns two fixed-capacity stacks (call-frame memory and expression
//! registers), its code, the ugens it created, a retention list of objects
//! that must outlive a sporked member call, and a loop-counter stack for
//! nested language-level loops. Suspension state (wake time, blocked-on
//! event) is driven by the shreduler and the instruction loop.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::code::VmCode;
use crate::object::{ObjId, ObjectStore, RawVal};

/// Memory (call-frame) stack size in words.
pub const MEM_STACK_WORDS: usize = 1 << 16;
/// Register (expression) stack size in words.
pub const REG_STACK_WORDS: usize = 1 << 14;

/// Numeric shred id, monotonically allocated per VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShredId(pub u64);

impl fmt::Display for ShredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live shreds keyed by id.
pub type ShredTable = HashMap<ShredId, Shred>;

#[derive(Debug, Error)]
#[error("shred stack overflow")]
pub struct StackOverflow;

/// Fixed-capacity word stack. Growth is not supported: overflow is a fault
/// of the source program and terminates the shred, never the VM.
#[derive(Debug)]
pub struct VmStack {
    data: Vec<RawVal>,
    max: usize,
}

impl VmStack {
    pub fn new(max: usize) -> Self {
        Self {
            data: Vec::new(),
            max,
        }
    }

    pub fn push(&mut self, v: RawVal) -> Result<(), StackOverflow> {
        if self.data.len() == self.max {
            return Err(StackOverflow);
        }
        self.data.push(v);
        Ok(())
    }

    pub fn push_f64(&mut self, v: f64) -> Result<(), StackOverflow> {
        self.push(v.to_bits())
    }

    pub fn pop(&mut self) -> Option<RawVal> {
        self.data.pop()
    }

    pub fn pop_f64(&mut self) -> Option<f64> {
        self.pop().map(f64::from_bits)
    }

    pub fn top(&self) -> Option<RawVal> {
        self.data.last().copied()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[RawVal] {
        &self.data
    }
}

/// One cooperative task.
pub struct Shred {
    pub id: ShredId,
    pub name: String,
    pub args: Vec<String>,

    pub code: Arc<VmCode>,
    /// The code handle released when the shred is reclaimed; `code` may be
    /// swapped during execution, `code_orig` never is.
    pub code_orig: Arc<VmCode>,
    pub pc: usize,
    pub next_pc: usize,

    pub mem: VmStack,
    pub reg: VmStack,

    pub parent: Option<ShredId>,
    pub children: BTreeSet<ShredId>,

    /// Shred-local view of `now`, refreshed each time the shred runs.
    pub now: f64,
    pub start: f64,
    pub wake_time: f64,

    pub is_done: bool,
    pub is_running: bool,
    pub is_abort: bool,
    pub is_dumped: bool,

    /// Event this shred is blocked on; holds an extra retain (dropped by the
    /// shreduler's remove-blocked path) so the handle stays valid while the
    /// shred tells the event to forget it.
    pub event: Option<ObjId>,

    ugens: HashSet<ObjId>,
    parent_objects: Vec<ObjId>,
    loop_counters: Vec<u64>,
}

impl Shred {
    pub fn new(id: ShredId, code: Arc<VmCode>, args: Vec<String>) -> Self {
        let name = code.name.clone();
        Self {
            id,
            name,
            args,
            code_orig: code.clone(),
            code,
            pc: 0,
            next_pc: 0,
            mem: VmStack::new(MEM_STACK_WORDS),
            reg: VmStack::new(REG_STACK_WORDS),
            parent: None,
            children: BTreeSet::new(),
            now: 0.0,
            start: 0.0,
            wake_time: 0.0,
            is_done: false,
            is_running: false,
            is_abort: false,
            is_dumped: false,
            event: None,
            ugens: HashSet::new(),
            parent_objects: Vec::new(),
            loop_counters: Vec::new(),
        }
    }

    /// Register a ugen created within this shred. The shred holds one retain
    /// per registered ugen so teardown can detach it from the graph.
    pub fn add_ugen(&mut self, store: &mut ObjectStore, ugen: ObjId) -> bool {
        if !self.ugens.insert(ugen) {
            return false;
        }
        store.retain(ugen);
        true
    }

    pub fn remove_ugen(&mut self, store: &mut ObjectStore, ugen: ObjId) -> bool {
        if !self.ugens.remove(&ugen) {
            return false;
        }
        store.release(ugen);
        true
    }

    pub fn ugens(&self) -> impl Iterator<Item = ObjId> + '_ {
        self.ugens.iter().copied()
    }

    /// Keep `obj` alive for the duration of this shred (e.g. the receiver of
    /// a sporked member call).
    pub fn add_parent_ref(&mut self, store: &mut ObjectStore, obj: ObjId) {
        store.retain(obj);
        self.parent_objects.push(obj);
    }

    pub fn push_loop_counter(&mut self) -> &mut u64 {
        self.loop_counters.push(0);
        self.loop_counters.last_mut().expect("just pushed")
    }

    pub fn current_loop_counter(&mut self) -> Option<&mut u64> {
        self.loop_counters.last_mut()
    }

    pub fn pop_loop_counter(&mut self) -> bool {
        self.loop_counters.pop().is_some()
    }

    /// Detach and hand back every object this shred was keeping alive.
    /// Called by the VM when the shred is reclaimed; the event back-reference
    /// is not included here, the shreduler's removed-blocked path owns it.
    pub(crate) fn take_owned_objects(&mut self) -> (Vec<ObjId>, Vec<ObjId>) {
        let ugens: Vec<ObjId> = self.ugens.drain().collect();
        let parents = std::mem::take(&mut self.parent_objects);
        (ugens, parents)
    }
}
