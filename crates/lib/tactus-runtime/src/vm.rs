//! The virtual machine: run loop, spork, messages, reclamation.
//!
//! The audio thread owns the VM outright. Host threads talk to it through
//! two kinds of SPSC rings: the message ring (with a reply ring back) and
//! event-delivery rings created on demand; the run loop drains all of them
//! once per iteration, so message effects are visible to all subsequent
//! ticks and an event queued during tick *k* is observed no earlier than
//! tick *k*+1.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use thiserror::Error;

use crate::code::{int_to_raw, Op, VmCode};
use crate::event;
use crate::io::ConsoleSink;
use crate::object::{ObjId, ObjectStore, RawVal};
use crate::shred::{Shred, ShredId, ShredTable};
use crate::shreduler::{Shreduler, VmStatus};

pub mod msg;
pub use msg::{Msg, Reply};

#[cfg(test)]
mod test;

const MSG_BUFFER_CAP: usize = 256;
const EVENT_BUFFER_CAP: usize = 1024;

/// VM construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub sample_rate: u32,
    pub dac_channels: u32,
    pub adc_channels: u32,
    /// Maximum adaptive block size in frames; 0 disables adaptive mode.
    pub adaptive: u64,
    /// Stop the VM once no shred is runnable or blocked.
    pub halt_on_empty: bool,
    pub rng_seed: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            dac_channels: 2,
            adc_channels: 2,
            adaptive: 0,
            halt_on_empty: true,
            rng_seed: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("no shred with id {0}")]
    NoSuchShred(ShredId),
    #[error("no shred currently running")]
    NoCurrentShred,
}

/// Host-side handle for the message/reply rings. Single producer: hand it
/// to one control thread.
pub struct VmController {
    msg_tx: HeapProd<Msg>,
    reply_rx: HeapCons<Reply>,
}

impl VmController {
    pub fn queue_msg(&mut self, msg: Msg) -> bool {
        self.msg_tx.try_push(msg).is_ok()
    }

    pub fn try_reply(&mut self) -> Option<Reply> {
        self.reply_rx.try_pop()
    }
}

/// Host-side producer for one event-delivery ring. Pushing an event here is
/// the only safe way for a non-VM thread to request a broadcast; the run
/// loop performs `broadcast_local` at its next tick.
pub struct EventBufferProducer {
    tx: HeapProd<ObjId>,
}

impl EventBufferProducer {
    /// Queue `n` broadcast requests for `ev`.
    pub fn queue_event(&mut self, ev: ObjId, n: usize) -> bool {
        let mut ok = true;
        for _ in 0..n.max(1) {
            ok &= self.tx.try_push(ev).is_ok();
        }
        ok
    }
}

enum Disposition {
    Ready(f64),
    Blocked,
    Done,
}

/// One tactus virtual machine.
pub struct Vm {
    config: VmConfig,
    pub store: ObjectStore,
    pub shreduler: Shreduler,
    shreds: ShredTable,
    shred_id: u64,
    is_init: bool,
    is_running: bool,
    paused: bool,
    dump: Vec<Shred>,
    msg_rx: HeapCons<Msg>,
    reply_tx: HeapProd<Reply>,
    event_queues: Vec<HeapCons<ObjId>>,
    chout: ObjId,
    cherr: ObjId,
    globals_hook: Option<Box<dyn FnMut()>>,
    pub rng: SmallRng,
    last_error: String,
}

impl Vm {
    /// Build a VM and the controller for its message rings. Console sinks
    /// and the dac/adc/bunghole stubs are created and locked here.
    pub fn new(config: VmConfig) -> (Self, VmController) {
        log::info!(
            "initializing virtual machine... srate: {}, dac: {}, adc: {}, adaptive: {}, halt: {}",
            config.sample_rate,
            config.dac_channels,
            config.adc_channels,
            config.adaptive,
            config.halt_on_empty
        );
        let (msg_tx, msg_rx) = HeapRb::<Msg>::new(MSG_BUFFER_CAP).split();
        let (reply_tx, reply_rx) = HeapRb::<Reply>::new(MSG_BUFFER_CAP).split();

        let mut store = ObjectStore::new();
        let chout = store.new_console(ConsoleSink::chout());
        let cherr = store.new_console(ConsoleSink::cherr());
        for id in [chout, cherr] {
            store.retain(id);
            store.lock(id);
        }

        let mut shreduler = Shreduler::new();
        shreduler.set_adaptive(config.adaptive);
        let dac = store.new_ugen("dac");
        let adc = store.new_ugen("adc");
        let bunghole = store.new_ugen("blackhole");
        for id in [dac, adc, bunghole] {
            store.retain(id);
            store.lock(id);
        }
        shreduler.dac = Some(dac);
        shreduler.adc = Some(adc);
        shreduler.bunghole = Some(bunghole);
        shreduler.num_dac_channels = config.dac_channels;
        shreduler.num_adc_channels = config.adc_channels;

        let vm = Self {
            config,
            store,
            shreduler,
            shreds: ShredTable::new(),
            shred_id: 0,
            is_init: true,
            is_running: false,
            paused: false,
            dump: Vec::new(),
            msg_rx,
            reply_tx,
            event_queues: Vec::new(),
            chout,
            cherr,
            globals_hook: None,
            rng: SmallRng::seed_from_u64(config.rng_seed),
            last_error: String::new(),
        };
        (vm, VmController { msg_tx, reply_rx })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn srate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn chout(&self) -> ObjId {
        self.chout
    }

    pub fn cherr(&self) -> ObjId {
        self.cherr
    }

    /// Install the hook `CLEARGLOBALS` delegates to; the globals manager
    /// itself is an external collaborator.
    pub fn set_globals_hook(&mut self, hook: Box<dyn FnMut()>) {
        self.globals_hook = Some(hook);
    }

    pub fn has_init(&self) -> bool {
        self.is_init
    }

    pub fn start(&mut self) -> bool {
        if self.is_running {
            return false;
        }
        log::info!("starting virtual machine...");
        self.is_running = true;
        true
    }

    pub fn running(&self) -> bool {
        self.is_running
    }

    pub fn stop(&mut self) -> bool {
        log::info!("stopping virtual machine...");
        let was = self.is_running;
        self.is_running = false;
        was
    }

    /// Create an event-delivery ring, keeping the consumer end. The
    /// returned producer may be moved to any one host thread.
    pub fn create_event_buffer(&mut self) -> EventBufferProducer {
        let (tx, rx) = HeapRb::<ObjId>::new(EVENT_BUFFER_CAP).split();
        self.event_queues.push(rx);
        EventBufferProducer { tx }
    }

    pub fn shred(&self, id: ShredId) -> Option<&Shred> {
        self.shreds.get(&id)
    }

    pub fn shred_mut(&mut self, id: ShredId) -> Option<&mut Shred> {
        self.shreds.get_mut(&id)
    }

    pub fn num_shreds(&self) -> usize {
        self.shreds.len()
    }

    pub fn num_dumped_shreds(&self) -> usize {
        self.dump.len()
    }

    pub fn last_id(&self) -> ShredId {
        ShredId(self.shred_id)
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn status(&self) -> VmStatus {
        self.shreduler.status(&self.shreds, self.config.sample_rate)
    }

    fn alloc_id(&mut self) -> ShredId {
        self.shred_id += 1;
        ShredId(self.shred_id)
    }

    /// Rewind the id allocator to the highest live id.
    pub fn reset_id(&mut self) {
        let highest = self
            .shreds
            .keys()
            .map(|s| s.0)
            .max()
            .or(self.shreduler.highest().map(|s| s.0))
            .unwrap_or(0);
        log::info!("resetting shred id to {highest}");
        self.shred_id = highest;
    }

    /// Spork `code` as a new shred. The shred is admitted at the current
    /// time; with `immediate` its first slice also runs before returning.
    pub fn spork(&mut self, code: Arc<VmCode>, parent: Option<ShredId>, immediate: bool) -> ShredId {
        self.spork_with_args(code, Vec::new(), parent, immediate)
    }

    pub fn spork_with_args(
        &mut self,
        code: Arc<VmCode>,
        args: Vec<String>,
        parent: Option<ShredId>,
        immediate: bool,
    ) -> ShredId {
        let id = self.alloc_id();
        let now = self.shreduler.now_system;
        let mut shred = Shred::new(id, code, args);
        shred.start = now;
        shred.now = now;
        shred.wake_time = now;
        if let Some(p) = parent {
            shred.parent = Some(p);
            if let Some(ps) = self.shreds.get_mut(&p) {
                ps.children.insert(id);
            }
        }
        log::info!("sporking incoming shred: {id} ({})", shred.name);
        self.shreds.insert(id, shred);
        self.shreduler.shredule(id, now);
        if immediate {
            self.run_shred_now(id);
        }
        id
    }

    fn run_shred_now(&mut self, id: ShredId) {
        if !self.shreduler.remove(id) {
            return;
        }
        let saved = self.shreduler.current;
        self.shreduler.current = Some(id);
        self.execute_shred(id);
        self.shreduler.current = saved;
    }

    /// Compute all frames the host asked for. Returns false once the VM has
    /// stopped (exit message or halt-on-empty); the remaining output is
    /// zero-filled either way. The DSP graph itself is an external
    /// collaborator, so the frames produced here are silence.
    pub fn run(&mut self, frames: usize, input: &[f64], output: &mut [f64]) -> bool {
        let out_ch = self.config.dac_channels as usize;
        let in_ch = self.config.adc_channels as usize;
        debug_assert!(input.len() >= frames * in_ch);
        debug_assert!(output.len() >= frames * out_ch);
        output[..frames * out_ch].fill(0.0);
        if !self.is_running {
            return false;
        }
        let mut frame = 0usize;
        while frame < frames {
            self.process_messages();
            self.deliver_queued_events();
            if !self.is_running {
                return false;
            }
            if self.paused {
                return true;
            }
            if !self.compute() {
                log::info!("no more shreds... halting");
                self.is_running = false;
                let _ = self.reply_tx.try_push(Reply::Done);
                return false;
            }
            let block = self.shreduler.next_block((frames - frame) as u64) as usize;
            let _input_block = &input[frame * in_ch..(frame + block) * in_ch];
            self.shreduler.advance(block as u64);
            frame += block;
        }
        true
    }

    /// Run every shred due at the current time. Returns false when
    /// halt-on-empty is set and nothing is left to run or wake.
    pub fn compute(&mut self) -> bool {
        while let Some(sid) = self.shreduler.get_next() {
            self.shreduler.current = Some(sid);
            self.execute_shred(sid);
            self.shreduler.current = None;
        }
        !(self.config.halt_on_empty && self.shreds.is_empty())
    }

    /// Flag the shred in the instruction loop for termination at its next
    /// op boundary; mid-op kills would break stack invariants.
    pub fn abort_current_shred(&mut self) -> Result<ShredId, VmError> {
        let Some(cur) = self.shreduler.current else {
            return Err(VmError::NoCurrentShred);
        };
        if let Some(s) = self.shreds.get_mut(&cur) {
            s.is_abort = true;
        }
        log::info!("abort requested for shred {cur}");
        Ok(cur)
    }

    fn report_user_fault(&mut self, msg: &str) {
        self.last_error = msg.to_string();
        self.store.console_mut(self.cherr).write_line(msg);
    }

    fn push_reg(&mut self, shred: &mut Shred, v: RawVal) -> bool {
        if shred.reg.push(v).is_err() {
            self.report_user_fault(&format!("shred[{}]: register stack overflow", shred.id));
            return false;
        }
        true
    }

    fn pop_event_operand(&mut self, shred: &mut Shred) -> Option<ObjId> {
        let v = shred.reg.pop().unwrap_or(0);
        let id = ObjId::from_raw(v);
        if id.is_none() {
            self.report_user_fault(&format!("shred[{}]: null event reference", shred.id));
        }
        id
    }

    fn spork_child(&mut self, code: Arc<VmCode>, parent: &mut Shred) -> ShredId {
        let id = self.alloc_id();
        let now = self.shreduler.now_system;
        let mut child = Shred::new(id, code, Vec::new());
        child.start = now;
        child.now = now;
        child.wake_time = now;
        child.parent = Some(parent.id);
        parent.children.insert(id);
        log::info!("sporking incoming shred: {id} ({})", child.name);
        self.shreds.insert(id, child);
        self.shreduler.shredule(id, now);
        id
    }

    /// The instruction loop: run one shred until it suspends, blocks or
    /// finishes. The shred is taken out of the table for the duration so
    /// event and spork ops can borrow the rest of the VM freely.
    fn execute_shred(&mut self, sid: ShredId) {
        let Some(mut shred) = self.shreds.remove(&sid) else {
            log::error!("(internal error) shreduled shred {sid} not in shred table");
            return;
        };
        shred.is_running = true;
        shred.now = self.shreduler.now_system;
        let code = shred.code.clone();

        let disposition = loop {
            if shred.is_abort {
                log::info!("aborting shred: {sid} ({})", shred.name);
                break Disposition::Done;
            }
            let Some(op) = code.ops.get(shred.pc) else {
                break Disposition::Done;
            };
            shred.next_pc = shred.pc + 1;
            match op {
                Op::PushInt(v) => {
                    if !self.push_reg(&mut shred, int_to_raw(*v)) {
                        break Disposition::Done;
                    }
                }
                Op::PushFloat(v) => {
                    if !self.push_reg(&mut shred, v.to_bits()) {
                        break Disposition::Done;
                    }
                }
                Op::PushObj(id) => {
                    if !self.push_reg(&mut shred, id.to_raw()) {
                        break Disposition::Done;
                    }
                }
                Op::Pop => {
                    shred.reg.pop();
                }
                Op::Advance(dur) => {
                    let wake = self.shreduler.now_system + dur.max(0.0);
                    shred.pc = shred.next_pc;
                    break Disposition::Ready(wake);
                }
                Op::Yield => {
                    shred.pc = shred.next_pc;
                    break Disposition::Ready(self.shreduler.now_system);
                }
                Op::WaitEvent => match self.pop_event_operand(&mut shred) {
                    Some(ev) => {
                        if event::wait(&mut self.store, &mut self.shreduler, &mut shred, ev) {
                            shred.pc = shred.next_pc;
                            break Disposition::Blocked;
                        }
                    }
                    None => break Disposition::Done,
                },
                Op::SignalEvent => match self.pop_event_operand(&mut shred) {
                    Some(ev) => event::signal_local(
                        &mut self.store,
                        &mut self.shreds,
                        &mut self.shreduler,
                        ev,
                    ),
                    None => break Disposition::Done,
                },
                Op::BroadcastEvent => match self.pop_event_operand(&mut shred) {
                    Some(ev) => event::broadcast_local(
                        &mut self.store,
                        &mut self.shreds,
                        &mut self.shreduler,
                        ev,
                    ),
                    None => break Disposition::Done,
                },
                Op::Jump(target) => {
                    shred.next_pc = *target;
                }
                Op::Spork(child_code) => {
                    let child = self.spork_child(child_code.clone(), &mut shred);
                    if !self.push_reg(&mut shred, int_to_raw(child.0 as i64)) {
                        break Disposition::Done;
                    }
                }
                Op::Print(s) => {
                    self.store.console_mut(self.chout).write_line(s);
                }
                Op::PrintErr(s) => {
                    self.store.console_mut(self.cherr).write_line(s);
                }
                Op::Exit => break Disposition::Done,
            }
            shred.pc = shred.next_pc;
        };

        shred.is_running = false;
        match disposition {
            Disposition::Ready(wake) => {
                shred.wake_time = wake;
                self.shreduler.shredule(sid, wake);
                self.shreds.insert(sid, shred);
            }
            Disposition::Blocked => {
                self.shreds.insert(sid, shred);
            }
            Disposition::Done => {
                shred.is_done = true;
                self.shreds.insert(sid, shred);
                self.free_shred(sid, true);
            }
        }
    }

    /// Remove a shred (and, cascading, its children), moving it to the dump
    /// list for deferred reclamation.
    pub fn remove_shred(&mut self, id: ShredId) -> Result<(), VmError> {
        if !self.shreds.contains_key(&id) {
            self.last_error = format!("no shred with id {id}");
            return Err(VmError::NoSuchShred(id));
        }
        self.free_shred(id, true);
        Ok(())
    }

    fn free_shred(&mut self, id: ShredId, cascade: bool) {
        if cascade {
            let children: Vec<ShredId> = self
                .shreds
                .get(&id)
                .map(|s| s.children.iter().copied().collect())
                .unwrap_or_default();
            for c in children {
                self.free_shred(c, true);
            }
        }
        let Some(mut shred) = self.shreds.remove(&id) else {
            return;
        };
        if let Some(p) = shred.parent {
            if let Some(ps) = self.shreds.get_mut(&p) {
                ps.children.remove(&id);
            }
        }
        if !cascade {
            for c in shred.children.clone() {
                if let Some(cs) = self.shreds.get_mut(&c) {
                    cs.parent = None;
                }
            }
        }
        self.shreduler.remove(id);
        self.shreduler.remove_blocked(&mut self.store, &mut shred);
        shred.is_done = true;
        shred.is_dumped = true;
        log::info!("dumping shred: {id} ({})", shred.name);
        self.dump.push(shred);
    }

    /// Remove every live shred; returns how many were dumped.
    pub fn remove_all(&mut self) -> usize {
        let mut ids: Vec<ShredId> = self.shreds.keys().copied().collect();
        ids.sort();
        let before = self.dump.len();
        for id in ids {
            self.free_shred(id, true);
        }
        self.dump.len() - before
    }

    /// Swap the code running under `id`; the incoming shred inherits the id
    /// along with the old shred's family links.
    pub fn replace_shred(&mut self, id: ShredId, code: Arc<VmCode>) -> Result<(), VmError> {
        let Some(mut old) = self.shreds.remove(&id) else {
            self.last_error = format!("no shred with id {id}");
            return Err(VmError::NoSuchShred(id));
        };
        self.shreduler.remove_blocked(&mut self.store, &mut old);
        let now = self.shreduler.now_system;
        let mut incoming = Shred::new(id, code, std::mem::take(&mut old.args));
        incoming.parent = old.parent;
        incoming.children = std::mem::take(&mut old.children);
        incoming.start = now;
        incoming.now = now;
        incoming.wake_time = now;
        old.is_done = true;
        old.is_dumped = true;
        self.dump.push(old);
        log::info!("replacing shred {id}");
        self.shreds.insert(id, incoming);
        self.shreduler.replace(id);
        Ok(())
    }

    /// Release up to `amount` dumped shreds' worth of objects.
    pub fn gc_amount(&mut self, amount: usize) {
        for _ in 0..amount {
            let Some(mut shred) = self.dump.pop() else {
                return;
            };
            log::trace!("reclaiming dumped shred: {}", shred.id);
            let (ugens, parents) = shred.take_owned_objects();
            for u in ugens {
                self.store.ugen_mut(u).detach();
                self.store.release(u);
            }
            for o in parents {
                self.store.release(o);
            }
        }
    }

    /// Drain the dump list.
    pub fn gc(&mut self) {
        self.gc_amount(self.dump.len());
    }

    fn process_messages(&mut self) {
        while let Some(msg) = self.msg_rx.try_pop() {
            if let Some(reply) = self.process_msg(msg) {
                if self.reply_tx.try_push(reply).is_err() {
                    log::warn!("reply buffer full; dropping reply");
                }
            }
        }
    }

    /// Apply one control message, producing its reply.
    pub fn process_msg(&mut self, msg: Msg) -> Option<Reply> {
        match msg {
            Msg::Add { code, args } => {
                let id = self.spork_with_args(code, args, None, false);
                Some(Reply::Added(id))
            }
            Msg::Remove(id) => match self.remove_shred(id) {
                Ok(()) => Some(Reply::Removed(id)),
                Err(e) => Some(Reply::Error(e.to_string())),
            },
            Msg::RemoveAll => Some(Reply::RemovedAll(self.remove_all())),
            Msg::Replace { id, code } => match self.replace_shred(id, code) {
                Ok(()) => Some(Reply::Replaced(id)),
                Err(e) => Some(Reply::Error(e.to_string())),
            },
            Msg::Status => Some(Reply::Status(self.status())),
            Msg::Pause(p) => {
                let prev = self.paused;
                self.paused = p;
                Some(Reply::Paused(prev))
            }
            Msg::Exit => {
                log::info!("VM exit requested");
                self.is_running = false;
                None
            }
            Msg::Time => Some(Reply::Time(self.shreduler.now_system)),
            Msg::ResetId => {
                self.reset_id();
                None
            }
            Msg::Abort => match self.abort_current_shred() {
                Ok(id) => Some(Reply::Aborted(id)),
                Err(e) => Some(Reply::Error(e.to_string())),
            },
            Msg::ClearVm => {
                log::info!("clearing VM...");
                let n = self.remove_all();
                self.reset_id();
                Some(Reply::Cleared(n))
            }
            Msg::ClearGlobals => {
                if let Some(hook) = &mut self.globals_hook {
                    hook();
                }
                Some(Reply::ClearedGlobals)
            }
        }
    }

    fn deliver_queued_events(&mut self) {
        let mut due: Vec<ObjId> = Vec::new();
        for q in &mut self.event_queues {
            while let Some(ev) = q.try_pop() {
                due.push(ev);
            }
        }
        for ev in due {
            if !self.store.contains(ev) {
                log::warn!("queued event {ev:?} is no longer live; dropping");
                continue;
            }
            event::broadcast_local(&mut self.store, &mut self.shreds, &mut self.shreduler, ev);
        }
    }

    /// Tear the VM down: dump and reclaim every shred, then release the
    /// locked roots. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.is_init {
            return;
        }
        log::info!("shutting down virtual machine...");
        self.is_init = false;
        self.is_running = false;
        self.remove_all();
        self.gc();
        self.store.unlock_all();
        let roots = [
            Some(self.chout),
            Some(self.cherr),
            self.shreduler.dac.take(),
            self.shreduler.adc.take(),
            self.shreduler.bunghole.take(),
        ];
        for id in roots.into_iter().flatten() {
            self.store.release(id);
        }
    }
}
