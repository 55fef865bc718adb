//! Events: condition variables whose waiters are shreds (local) or
//! host-registered callbacks (global).
//!
//! The waiter queue is strictly FIFO and is touched only by the audio
//! thread. The listener queue is shared with host threads and sits behind
//! the event's own mutex; listeners are fired on whichever thread signaled.
//! The two queues are independent: local signaling never touches listeners
//! and global signaling never touches shreds.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::object::{ObjId, ObjectStore};
use crate::shred::{Shred, ShredId, ShredTable};
use crate::shreduler::Shreduler;

/// Host callback variants for global listeners.
#[derive(Debug, Clone)]
pub enum ListenerCallback {
    Plain(fn()),
    Named(String, fn(&str)),
    Id(i64, fn(i64)),
}

impl ListenerCallback {
    fn fire(&self) {
        match self {
            ListenerCallback::Plain(cb) => cb(),
            ListenerCallback::Named(name, cb) => cb(name),
            ListenerCallback::Id(id, cb) => cb(*id),
        }
    }
}

/// One registered global listener.
#[derive(Debug, Clone)]
pub struct GlobalListener {
    pub callback: ListenerCallback,
    pub listen_forever: bool,
}

/// Per-event state: the shred wait queue plus the global listener queue.
#[derive(Debug, Default)]
pub struct EventState {
    waiters: VecDeque<ShredId>,
    listeners: Mutex<VecDeque<GlobalListener>>,
}

impl EventState {
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn waiters(&self) -> impl Iterator<Item = ShredId> + '_ {
        self.waiters.iter().copied()
    }

    pub(crate) fn push_waiter(&mut self, id: ShredId) {
        self.waiters.push_back(id);
    }

    pub(crate) fn pop_waiter(&mut self) -> Option<ShredId> {
        self.waiters.pop_front()
    }

    pub(crate) fn remove_waiter(&mut self, id: ShredId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|&w| w != id);
        self.waiters.len() != before
    }

    /// Register a global listener; `listen_forever` keeps it enqueued after
    /// each firing.
    pub fn global_listen(&self, callback: ListenerCallback, listen_forever: bool) {
        self.listeners.lock().expect("listener queue poisoned").push_back(GlobalListener {
            callback,
            listen_forever,
        });
    }

    pub fn remove_listen_plain(&self, cb: fn()) -> bool {
        self.remove_listen(|l| matches!(l.callback, ListenerCallback::Plain(f) if f == cb))
    }

    pub fn remove_listen_named(&self, cb: fn(&str)) -> bool {
        self.remove_listen(|l| matches!(l.callback, ListenerCallback::Named(_, f) if f == cb))
    }

    pub fn remove_listen_id(&self, cb: fn(i64)) -> bool {
        self.remove_listen(|l| matches!(l.callback, ListenerCallback::Id(_, f) if f == cb))
    }

    fn remove_listen(&self, matches: impl Fn(&GlobalListener) -> bool) -> bool {
        let mut queue = self.listeners.lock().expect("listener queue poisoned");
        let before = queue.len();
        queue.retain(|l| !matches(l));
        queue.len() != before
    }

    /// Fire the oldest listener; forever-listeners are re-enqueued after
    /// firing. Callbacks run outside the lock.
    pub fn signal_global(&self) {
        let listener = self.listeners.lock().expect("listener queue poisoned").pop_front();
        if let Some(listener) = listener {
            listener.callback.fire();
            if listener.listen_forever {
                self.listeners
                    .lock()
                    .expect("listener queue poisoned")
                    .push_back(listener);
            }
        }
    }

    /// Fire every registered listener once, keeping forever-listeners.
    pub fn broadcast_global(&self) {
        let fired: Vec<GlobalListener> = {
            let mut queue = self.listeners.lock().expect("listener queue poisoned");
            queue.drain(..).collect()
        };
        let mut keep = VecDeque::new();
        for listener in fired {
            listener.callback.fire();
            if listener.listen_forever {
                keep.push_back(listener);
            }
        }
        if !keep.is_empty() {
            self.listeners
                .lock()
                .expect("listener queue poisoned")
                .append(&mut keep);
        }
    }
}

/// Suspend `shred` on `ev`. Consults the type's `can_wait` slot first; when
/// waiting is refused the current time is pushed onto the shred's register
/// stack and the shred keeps running. Returns whether the shred suspended.
pub fn wait(
    store: &mut ObjectStore,
    shreduler: &mut Shreduler,
    shred: &mut Shred,
    ev: ObjId,
) -> bool {
    log::debug!("shred '{}' wait on event {ev:?}", shred.id);
    let can_wait = {
        let cell = store.cell(ev).expect("invalid event handle");
        store
            .types()
            .resolve_can_wait(cell.type_id)
            .is_none_or(|f| f(&cell.payload))
    };
    if !can_wait {
        if shred.reg.push_f64(shreduler.now_system).is_err() {
            shred.is_abort = true;
        }
        return false;
    }
    shred.is_running = false;
    store.event_state_mut(ev).push_waiter(shred.id);
    debug_assert!(shred.event.is_none(), "shred already waiting on an event");
    shred.event = Some(ev);
    store.retain(ev);
    shreduler.add_blocked(shred.id);
    true
}

/// Wake the oldest waiter: drop its back-reference retain, unblock it and
/// shredule it at the current time, pushing `now_system` onto its register
/// stack. Strictly FIFO within one event.
pub fn signal_local(
    store: &mut ObjectStore,
    shreds: &mut ShredTable,
    shreduler: &mut Shreduler,
    ev: ObjId,
) {
    let Some(w) = store.event_state_mut(ev).pop_waiter() else {
        return;
    };
    let Some(shred) = shreds.get_mut(&w) else {
        log::error!("(internal error) waiting shred {w} not in shred table");
        return;
    };
    shred.event = None;
    store.release(ev);
    let now = shreduler.now_system;
    shreduler.unblock(w);
    shreduler.shredule(w, now);
    if shred.reg.push_f64(now).is_err() {
        log::error!("shred[{w}]: register stack overflow on event wake");
        shred.is_abort = true;
    }
}

/// Wake every waiter; all of them observe the same `now_system`.
pub fn broadcast_local(
    store: &mut ObjectStore,
    shreds: &mut ShredTable,
    shreduler: &mut Shreduler,
    ev: ObjId,
) {
    while store.event_state(ev).waiter_count() > 0 {
        signal_local(store, shreds, shreduler, ev);
    }
}

/// Splice one shred out of the event's wait queue. The back-reference retain
/// is deliberately *not* dropped here — the shred still needs the handle to
/// finish the removal; the shreduler's removed-blocked path owns the drop.
pub fn remove_shred(store: &mut ObjectStore, ev: ObjId, id: ShredId) -> bool {
    store.event_state_mut(ev).remove_waiter(id)
}
