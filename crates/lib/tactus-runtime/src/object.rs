//! Reference-counted object substrate.
//!
//! Every long-lived runtime value (arrays, events, strings, console sinks,
//! file handles, ugen stubs) lives in an [`ObjectStore`] cell with an explicit
//! reference count. Objects are created with count 0 and promoted by the
//! first [`retain`](ObjectStore::retain); the 1→0 transition runs the type's
//! destructor chain and reclaims the cell.
//!
//! Built-in singletons the host registers at start-up (console sinks, the
//! dac/adc/bunghole stubs) are *locked roots*: while the store's lockdown
//! flag is in effect, releasing a locked object to zero is a fatal internal
//! error rather than a reclamation.

use slotmap::{DefaultKey, SlotMap};

use crate::array::{Complex, TypedArray, Vec3, Vec4};
use crate::event::EventState;
use crate::io::file::FileIo;
use crate::io::ConsoleSink;

/// One machine word of stack or array payload.
pub type RawVal = u64;

/// Handle to an object cell in an [`ObjectStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(pub DefaultKey);

impl ObjId {
    /// Encode the handle as a stack word. The null word is reserved.
    pub fn to_raw(self) -> RawVal {
        debug_assert!(std::mem::size_of::<ObjId>() == 8, "ObjId must be word sized");
        unsafe { std::mem::transmute_copy::<ObjId, RawVal>(&self) }
    }

    /// Decode a stack word back into a handle; 0 is the null object.
    pub fn from_raw(v: RawVal) -> Option<ObjId> {
        if v == 0 {
            return None;
        }
        Some(unsafe { std::mem::transmute_copy::<RawVal, ObjId>(&v) })
    }
}

/// Index into the per-store type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeId(pub usize);

/// Native destructor hook. Runs while the cell is being reclaimed; any
/// objects the payload was keeping alive are pushed onto the worklist and
/// released after the hook returns, so cascades never recurse into the store.
pub type DtorFn = fn(&mut Payload, &mut Vec<ObjId>);

/// The event vtable slot consulted by `Event.wait`.
pub type CanWaitFn = fn(&Payload) -> bool;

/// Per-type descriptor: parent link for the destructor spine plus the
/// function slots the runtime dispatches through.
pub struct TypeInfo {
    pub name: String,
    pub parent: Option<TypeId>,
    pub has_destructor: bool,
    pub dtor: Option<DtorFn>,
    pub can_wait: Option<CanWaitFn>,
}

impl TypeInfo {
    pub fn plain(name: &str, parent: Option<TypeId>) -> Self {
        Self {
            name: name.to_string(),
            parent,
            has_destructor: false,
            dtor: None,
            can_wait: None,
        }
    }
}

/// Type ids for the built-in runtime types, registered at store creation.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinTypes {
    pub object: TypeId,
    pub string: TypeId,
    pub array: TypeId,
    pub event: TypeId,
    pub ugen: TypeId,
    pub console: TypeId,
    pub file: TypeId,
}

/// Registry of type descriptors, owned by the store for the VM's lifetime.
pub struct TypeRegistry {
    types: Vec<TypeInfo>,
    builtins: BuiltinTypes,
}

fn event_can_wait(_payload: &Payload) -> bool {
    true
}

impl TypeRegistry {
    fn with_builtins() -> Self {
        let mut types = Vec::new();
        let mut register = |info: TypeInfo| {
            types.push(info);
            TypeId(types.len() - 1)
        };
        let object = register(TypeInfo::plain("Object", None));
        let string = register(TypeInfo::plain("String", Some(object)));
        let array = register(TypeInfo::plain("Array", Some(object)));
        let event = register(TypeInfo {
            can_wait: Some(event_can_wait),
            ..TypeInfo::plain("Event", Some(object))
        });
        let ugen = register(TypeInfo::plain("UGen", Some(object)));
        let console = register(TypeInfo::plain("Console", Some(object)));
        let file = register(TypeInfo::plain("FileIO", Some(object)));
        Self {
            types,
            builtins: BuiltinTypes {
                object,
                string,
                array,
                event,
                ugen,
                console,
                file,
            },
        }
    }

    /// Register a new type descriptor, returning its id.
    pub fn register(&mut self, info: TypeInfo) -> TypeId {
        self.types.push(info);
        TypeId(self.types.len() - 1)
    }

    pub fn get(&self, id: TypeId) -> &TypeInfo {
        &self.types[id.0]
    }

    pub fn builtins(&self) -> BuiltinTypes {
        self.builtins
    }

    /// Walk the parent spine from `id` upward looking for a `can_wait` slot.
    pub fn resolve_can_wait(&self, id: TypeId) -> Option<CanWaitFn> {
        let mut cur = Some(id);
        while let Some(t) = cur {
            let info = self.get(t);
            if let Some(f) = info.can_wait {
                return Some(f);
            }
            cur = info.parent;
        }
        None
    }
}

/// Payload storage for one object cell.
pub enum Payload {
    /// Untyped word buffer sized by the (external) type system.
    Raw(Vec<RawVal>),
    Str(String),
    ArrayWord(TypedArray<RawVal>),
    ArrayFloat(TypedArray<f64>),
    ArrayComplex(TypedArray<Complex>),
    ArrayVec3(TypedArray<Vec3>),
    ArrayVec4(TypedArray<Vec4>),
    Event(EventState),
    Console(ConsoleSink),
    File(FileIo),
    Ugen(Ugen),
}

impl Payload {
    /// Collect every object reference the payload holds, for release during
    /// reclamation. Word arrays contribute both views; a file contributes its
    /// completion event.
    fn collect_refs(&mut self, out: &mut Vec<ObjId>) {
        match self {
            Payload::ArrayWord(a) if a.is_obj() => {
                for v in a.drain_all() {
                    if let Some(id) = ObjId::from_raw(v) {
                        out.push(id);
                    }
                }
            }
            Payload::File(f) => out.push(f.event()),
            _ => {}
        }
    }
}

/// Stub for a DSP-graph node. The graph itself is an external collaborator;
/// the core only tracks ownership and detach-on-teardown.
pub struct Ugen {
    pub name: String,
    pub connected: bool,
}

impl Ugen {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connected: true,
        }
    }

    pub fn detach(&mut self) {
        self.connected = false;
    }
}

/// One reference-counted cell.
pub struct ObjectCell {
    pub refcount: u64,
    pub locked: bool,
    pub pooled: bool,
    pub type_id: TypeId,
    pub payload: Payload,
}

/// Arena of reference-counted objects plus the type registry.
pub struct ObjectStore {
    objects: SlotMap<DefaultKey, ObjectCell>,
    types: TypeRegistry,
    locks_in_effect: bool,
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore {
    pub fn new() -> Self {
        Self {
            objects: SlotMap::new(),
            types: TypeRegistry::with_builtins(),
            locks_in_effect: true,
        }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    pub fn builtins(&self) -> BuiltinTypes {
        self.types.builtins
    }

    /// Insert a fresh cell. Objects begin life with count 0; the first
    /// retain promotes them.
    pub fn insert(&mut self, type_id: TypeId, payload: Payload) -> ObjId {
        let key = self.objects.insert(ObjectCell {
            refcount: 0,
            locked: false,
            pooled: false,
            type_id,
            payload,
        });
        ObjId(key)
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.objects.contains_key(id.0)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn cell(&self, id: ObjId) -> Option<&ObjectCell> {
        self.objects.get(id.0)
    }

    pub fn cell_mut(&mut self, id: ObjId) -> Option<&mut ObjectCell> {
        self.objects.get_mut(id.0)
    }

    pub fn refcount(&self, id: ObjId) -> u64 {
        self.cell(id).map_or(0, |c| c.refcount)
    }

    /// Add a reference.
    pub fn retain(&mut self, id: ObjId) {
        let Some(cell) = self.objects.get_mut(id.0) else {
            log::error!("(internal error) retain on reclaimed object {id:?}");
            panic!("retain on reclaimed object");
        };
        cell.refcount += 1;
        log::trace!("retain {:?} refcount -> {}", id, cell.refcount);
    }

    /// Remove a reference; reclaim on the 1→0 transition, running the
    /// destructor chain leaf-first along the type's parent spine, then
    /// releasing everything the payload still held.
    pub fn release(&mut self, id: ObjId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(cell) = self.objects.get_mut(id.0) else {
                log::error!("(internal error) release on reclaimed object {id:?}");
                panic!("release on reclaimed object");
            };
            if cell.refcount == 0 {
                log::error!("(internal error) Object.release() refcount == 0 for {id:?}");
                panic!("object refcount underflow");
            }
            cell.refcount -= 1;
            log::trace!("release {:?} refcount -> {}", id, cell.refcount);
            if cell.refcount > 0 {
                continue;
            }
            if self.locks_in_effect && cell.locked {
                log::error!("(internal error) releasing locked object {id:?}");
                panic!("releasing locked object under lockdown");
            }
            let mut cell = self.objects.remove(id.0).expect("cell vanished during release");
            log::trace!("reclaiming {:?} ({})", id, self.types.get(cell.type_id).name);
            let mut ty = Some(cell.type_id);
            while let Some(t) = ty {
                let info = self.types.get(t);
                if info.has_destructor {
                    if let Some(dtor) = info.dtor {
                        dtor(&mut cell.payload, &mut pending);
                    }
                }
                ty = info.parent;
            }
            cell.payload.collect_refs(&mut pending);
        }
    }

    /// Mark an object as a never-reclaim root.
    pub fn lock(&mut self, id: ObjId) {
        if let Some(cell) = self.objects.get_mut(id.0) {
            cell.locked = true;
        }
    }

    pub fn unlock(&mut self, id: ObjId) {
        if let Some(cell) = self.objects.get_mut(id.0) {
            cell.locked = false;
        }
    }

    /// Disallow reclamation of locked objects.
    pub fn lock_all(&mut self) {
        log::info!("locking down special objects...");
        self.locks_in_effect = true;
    }

    /// Allow reclamation of locked objects again (shutdown path).
    pub fn unlock_all(&mut self) {
        log::info!("unlocking special objects...");
        self.locks_in_effect = false;
    }

    pub fn locks_in_effect(&self) -> bool {
        self.locks_in_effect
    }
}

// constructors for the built-in payload kinds
impl ObjectStore {
    pub fn new_raw(&mut self, type_id: TypeId, words: usize) -> ObjId {
        self.insert(type_id, Payload::Raw(vec![0; words]))
    }

    pub fn new_string(&mut self, s: &str) -> ObjId {
        let ty = self.types.builtins.string;
        self.insert(ty, Payload::Str(s.to_string()))
    }

    pub fn new_event(&mut self) -> ObjId {
        let ty = self.types.builtins.event;
        self.insert(ty, Payload::Event(EventState::default()))
    }

    /// An event of a derived type, e.g. one overriding the `can_wait` slot.
    pub fn new_event_of(&mut self, type_id: TypeId) -> ObjId {
        self.insert(type_id, Payload::Event(EventState::default()))
    }

    pub fn new_array_word(&mut self, is_obj: bool, capacity: usize) -> ObjId {
        let ty = self.types.builtins.array;
        let arr = if is_obj {
            TypedArray::with_objects(capacity)
        } else {
            TypedArray::new(capacity)
        };
        self.insert(ty, Payload::ArrayWord(arr))
    }

    pub fn new_array_float(&mut self, capacity: usize) -> ObjId {
        let ty = self.types.builtins.array;
        self.insert(ty, Payload::ArrayFloat(TypedArray::new(capacity)))
    }

    pub fn new_array_complex(&mut self, capacity: usize) -> ObjId {
        let ty = self.types.builtins.array;
        self.insert(ty, Payload::ArrayComplex(TypedArray::new(capacity)))
    }

    pub fn new_array_vec3(&mut self, capacity: usize) -> ObjId {
        let ty = self.types.builtins.array;
        self.insert(ty, Payload::ArrayVec3(TypedArray::new(capacity)))
    }

    pub fn new_array_vec4(&mut self, capacity: usize) -> ObjId {
        let ty = self.types.builtins.array;
        self.insert(ty, Payload::ArrayVec4(TypedArray::new(capacity)))
    }

    pub fn new_ugen(&mut self, name: &str) -> ObjId {
        let ty = self.types.builtins.ugen;
        self.insert(ty, Payload::Ugen(Ugen::new(name)))
    }

    pub fn new_console(&mut self, sink: ConsoleSink) -> ObjId {
        let ty = self.types.builtins.console;
        self.insert(ty, Payload::Console(sink))
    }

    /// Create a file object together with its completion event. The file
    /// holds the one retain on the event.
    pub fn new_file(&mut self) -> ObjId {
        let event = self.new_event();
        self.retain(event);
        let ty = self.types.builtins.file;
        self.insert(ty, Payload::File(FileIo::new(event)))
    }
}

// typed payload accessors; a kind mismatch is an internal error
impl ObjectStore {
    pub fn event_state(&self, id: ObjId) -> &EventState {
        match &self.cell(id).expect("invalid event handle").payload {
            Payload::Event(e) => e,
            _ => panic!("object {id:?} is not an event"),
        }
    }

    pub fn event_state_mut(&mut self, id: ObjId) -> &mut EventState {
        match &mut self.cell_mut(id).expect("invalid event handle").payload {
            Payload::Event(e) => e,
            _ => panic!("object {id:?} is not an event"),
        }
    }

    pub fn string(&self, id: ObjId) -> &str {
        match &self.cell(id).expect("invalid string handle").payload {
            Payload::Str(s) => s,
            _ => panic!("object {id:?} is not a string"),
        }
    }

    pub fn string_mut(&mut self, id: ObjId) -> &mut String {
        match &mut self.cell_mut(id).expect("invalid string handle").payload {
            Payload::Str(s) => s,
            _ => panic!("object {id:?} is not a string"),
        }
    }

    pub fn array_word(&self, id: ObjId) -> &TypedArray<RawVal> {
        match &self.cell(id).expect("invalid array handle").payload {
            Payload::ArrayWord(a) => a,
            _ => panic!("object {id:?} is not a word array"),
        }
    }

    pub fn array_word_mut(&mut self, id: ObjId) -> &mut TypedArray<RawVal> {
        match &mut self.cell_mut(id).expect("invalid array handle").payload {
            Payload::ArrayWord(a) => a,
            _ => panic!("object {id:?} is not a word array"),
        }
    }

    pub fn array_float_mut(&mut self, id: ObjId) -> &mut TypedArray<f64> {
        match &mut self.cell_mut(id).expect("invalid array handle").payload {
            Payload::ArrayFloat(a) => a,
            _ => panic!("object {id:?} is not a float array"),
        }
    }

    pub fn array_complex_mut(&mut self, id: ObjId) -> &mut TypedArray<Complex> {
        match &mut self.cell_mut(id).expect("invalid array handle").payload {
            Payload::ArrayComplex(a) => a,
            _ => panic!("object {id:?} is not a complex array"),
        }
    }

    pub fn array_vec3_mut(&mut self, id: ObjId) -> &mut TypedArray<Vec3> {
        match &mut self.cell_mut(id).expect("invalid array handle").payload {
            Payload::ArrayVec3(a) => a,
            _ => panic!("object {id:?} is not a vec3 array"),
        }
    }

    pub fn array_vec4_mut(&mut self, id: ObjId) -> &mut TypedArray<Vec4> {
        match &mut self.cell_mut(id).expect("invalid array handle").payload {
            Payload::ArrayVec4(a) => a,
            _ => panic!("object {id:?} is not a vec4 array"),
        }
    }

    pub fn console_mut(&mut self, id: ObjId) -> &mut ConsoleSink {
        match &mut self.cell_mut(id).expect("invalid console handle").payload {
            Payload::Console(c) => c,
            _ => panic!("object {id:?} is not a console sink"),
        }
    }

    pub fn file_mut(&mut self, id: ObjId) -> &mut FileIo {
        match &mut self.cell_mut(id).expect("invalid file handle").payload {
            Payload::File(f) => f,
            _ => panic!("object {id:?} is not a file"),
        }
    }

    pub fn ugen_mut(&mut self, id: ObjId) -> &mut Ugen {
        match &mut self.cell_mut(id).expect("invalid ugen handle").payload {
            Payload::Ugen(u) => u,
            _ => panic!("object {id:?} is not a ugen"),
        }
    }
}

// reference-counting façade over word arrays: the only container variant
// whose slots may hold object references
impl ObjectStore {
    fn adjust_word_refs(&mut self, is_obj: bool, incoming: RawVal, outgoing: Option<RawVal>) {
        if !is_obj {
            return;
        }
        if let Some(id) = ObjId::from_raw(incoming) {
            self.retain(id);
        }
        if let Some(id) = outgoing.and_then(ObjId::from_raw) {
            self.release(id);
        }
    }

    fn release_words(&mut self, is_obj: bool, outgoing: Vec<RawVal>) {
        if !is_obj {
            return;
        }
        for v in outgoing {
            if let Some(id) = ObjId::from_raw(v) {
                self.release(id);
            }
        }
    }

    /// `set(i, v)`: out-of-range is a no-op returning 0.
    pub fn array_set(&mut self, arr: ObjId, i: i64, v: RawVal) -> i64 {
        let a = self.array_word_mut(arr);
        let is_obj = a.is_obj();
        let Some(old) = a.set(i, v) else {
            return 0;
        };
        self.adjust_word_refs(is_obj, v, Some(old));
        1
    }

    /// `set(key, v)`: for the word variant, v == 0 erases the key.
    pub fn array_set_key(&mut self, arr: ObjId, key: &str, v: RawVal) -> i64 {
        let a = self.array_word_mut(arr);
        let is_obj = a.is_obj();
        let old = if v == 0 {
            a.erase_key(key)
        } else {
            a.set_key(key, v)
        };
        self.adjust_word_refs(is_obj, v, old);
        1
    }

    pub fn array_push_back(&mut self, arr: ObjId, v: RawVal) -> i64 {
        let a = self.array_word_mut(arr);
        let is_obj = a.is_obj();
        a.push_back(v);
        self.adjust_word_refs(is_obj, v, None);
        1
    }

    pub fn array_pop_back(&mut self, arr: ObjId) -> i64 {
        let a = self.array_word_mut(arr);
        let is_obj = a.is_obj();
        let Some(old) = a.pop_back() else {
            return 0;
        };
        self.adjust_word_refs(is_obj, 0, Some(old));
        1
    }

    pub fn array_pop_out(&mut self, arr: ObjId, pos: i64) -> i64 {
        let a = self.array_word_mut(arr);
        let is_obj = a.is_obj();
        let Some(old) = a.pop_out(pos) else {
            return 0;
        };
        self.adjust_word_refs(is_obj, 0, Some(old));
        1
    }

    pub fn array_erase(&mut self, arr: ObjId, key: &str) -> i64 {
        let a = self.array_word_mut(arr);
        let is_obj = a.is_obj();
        let Some(old) = a.erase_key(key) else {
            return 0;
        };
        self.adjust_word_refs(is_obj, 0, Some(old));
        1
    }

    pub fn array_clear(&mut self, arr: ObjId) {
        let a = self.array_word_mut(arr);
        let is_obj = a.is_obj();
        let removed = a.clear();
        self.release_words(is_obj, removed);
    }

    pub fn array_set_size(&mut self, arr: ObjId, size: i64) -> i64 {
        let a = self.array_word_mut(arr);
        let is_obj = a.is_obj();
        let (n, removed) = a.set_size(size);
        self.release_words(is_obj, removed);
        n
    }

    pub fn array_set_capacity(&mut self, arr: ObjId, capacity: i64) -> i64 {
        let a = self.array_word_mut(arr);
        let is_obj = a.is_obj();
        let (n, removed) = a.set_capacity(capacity);
        self.release_words(is_obj, removed);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn ensure_objid_word_sized() {
        assert_eq!(std::mem::size_of::<ObjId>(), std::mem::size_of::<RawVal>());
    }

    #[test]
    fn objid_raw_roundtrip() {
        let mut store = ObjectStore::new();
        let id = store.new_string("x");
        assert_eq!(ObjId::from_raw(id.to_raw()), Some(id));
        assert_eq!(ObjId::from_raw(0), None);
    }

    #[test]
    fn retain_release_lifecycle() {
        let mut store = ObjectStore::new();
        let id = store.new_string("hello");
        assert_eq!(store.refcount(id), 0);
        store.retain(id);
        store.retain(id);
        assert_eq!(store.refcount(id), 2);
        store.release(id);
        assert_eq!(store.refcount(id), 1);
        store.release(id);
        assert!(!store.contains(id));
    }

    #[test]
    #[should_panic(expected = "release on reclaimed object")]
    fn release_after_reclaim_is_fatal() {
        let mut store = ObjectStore::new();
        let id = store.new_string("x");
        store.retain(id);
        store.release(id);
        store.release(id);
    }

    #[test]
    #[should_panic(expected = "releasing locked object")]
    fn releasing_locked_root_is_fatal() {
        let mut store = ObjectStore::new();
        let id = store.new_string("root");
        store.retain(id);
        store.lock(id);
        store.release(id);
    }

    #[test]
    fn unlock_all_permits_root_reclaim() {
        let mut store = ObjectStore::new();
        let id = store.new_string("root");
        store.retain(id);
        store.lock(id);
        store.unlock_all();
        store.release(id);
        assert!(!store.contains(id));
    }

    static DTOR_LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn base_dtor(_p: &mut Payload, _out: &mut Vec<ObjId>) {
        DTOR_LOG.lock().unwrap().push("base");
    }

    fn derived_dtor(_p: &mut Payload, _out: &mut Vec<ObjId>) {
        DTOR_LOG.lock().unwrap().push("derived");
    }

    #[test]
    fn destructor_chain_runs_leaf_first() {
        let mut store = ObjectStore::new();
        let object = store.builtins().object;
        let base = store.types_mut().register(TypeInfo {
            has_destructor: true,
            dtor: Some(base_dtor),
            ..TypeInfo::plain("Base", Some(object))
        });
        let derived = store.types_mut().register(TypeInfo {
            has_destructor: true,
            dtor: Some(derived_dtor),
            ..TypeInfo::plain("Derived", Some(base))
        });
        let id = store.new_raw(derived, 2);
        store.retain(id);
        DTOR_LOG.lock().unwrap().clear();
        store.release(id);
        assert_eq!(*DTOR_LOG.lock().unwrap(), vec!["derived", "base"]);
    }

    #[test]
    fn array_destruction_cascades() {
        let mut store = ObjectStore::new();
        let inner = store.new_string("inner");
        store.retain(inner);
        let arr = store.new_array_word(true, 0);
        store.retain(arr);
        store.array_push_back(arr, inner.to_raw());
        assert_eq!(store.refcount(inner), 2);
        store.release(arr);
        assert_eq!(store.refcount(inner), 1);
        store.release(inner);
        assert!(!store.contains(inner));
    }

    #[test]
    fn nested_arrays_release_iteratively() {
        let mut store = ObjectStore::new();
        let mut innermost = store.new_array_word(true, 0);
        store.retain(innermost);
        for _ in 0..64 {
            let outer = store.new_array_word(true, 0);
            store.retain(outer);
            store.array_push_back(outer, innermost.to_raw());
            store.release(innermost);
            innermost = outer;
        }
        store.release(innermost);
        assert!(store.is_empty());
    }
}
