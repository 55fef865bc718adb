//! Container primitives.
//!
//! One generic [`TypedArray`] covers all five element kinds the language
//! exposes: machine word, f64, 2-f64 complex, and 3-/4-f64 vectors. Payload
//! widths and zero values differ per kind, and only the word kind ever
//! carries object references (the retain/release discipline for that case
//! lives in the store façade, see
//! [`crate::object::ObjectStore::array_set`] and friends).
//!
//! Every instance is simultaneously an ordered sequence and a by-name
//! mapping; the views are independent. Index-based operations clamp to the
//! current size — out of range is a zero/no-op return, not a fault; that is
//! the language's observable contract.

use std::collections::HashMap;

use rand::Rng;

use crate::object::RawVal;

/// An element kind storable in a [`TypedArray`].
pub trait Element: Copy + Default + PartialEq + std::fmt::Debug + 'static {
    /// Payload width in machine words.
    const WORD_SIZE: usize;

    fn zero() -> Self {
        Self::default()
    }
}

impl Element for RawVal {
    const WORD_SIZE: usize = 1;
}

impl Element for f64 {
    const WORD_SIZE: usize = 1;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Element for Complex {
    const WORD_SIZE: usize = 2;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Element for Vec3 {
    const WORD_SIZE: usize = 3;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec4 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Element for Vec4 {
    const WORD_SIZE: usize = 4;
}

/// Ordered sequence plus by-name mapping over one element kind.
///
/// Operations that can displace elements return them to the caller; for the
/// reference-bearing word variant the store façade releases the displaced
/// references so the container's contribution to each object's count always
/// equals its number of live occurrences.
#[derive(Debug, Clone)]
pub struct TypedArray<E: Element> {
    vec: Vec<E>,
    map: HashMap<String, E>,
    is_obj: bool,
}

impl<E: Element> Default for TypedArray<E> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<E: Element> TypedArray<E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            vec: vec![E::zero(); capacity],
            map: HashMap::new(),
            is_obj: false,
        }
    }

    /// A word array whose slots hold object references.
    pub fn with_objects(capacity: usize) -> Self {
        Self {
            is_obj: true,
            ..Self::new(capacity)
        }
    }

    pub fn is_obj(&self) -> bool {
        self.is_obj
    }

    pub fn len(&self) -> usize {
        self.vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    fn in_range(&self, i: i64) -> Option<usize> {
        if i < 0 || i as usize >= self.vec.len() {
            None
        } else {
            Some(i as usize)
        }
    }

    /// Stable view of slot `i`; `None` when out of range.
    pub fn slot_mut(&mut self, i: i64) -> Option<&mut E> {
        let i = self.in_range(i)?;
        Some(&mut self.vec[i])
    }

    /// Mapping slot for `key`, inserting a zeroed entry if absent.
    pub fn entry(&mut self, key: &str) -> &mut E {
        self.map.entry(key.to_string()).or_insert_with(E::zero)
    }

    pub fn get(&self, i: i64) -> Option<E> {
        self.in_range(i).map(|i| self.vec[i])
    }

    /// Mapped value, or the kind's zero when absent.
    pub fn get_key(&self, key: &str) -> E {
        self.map.get(key).copied().unwrap_or_else(E::zero)
    }

    /// Replace slot `i`, returning the displaced element; `None` (no-op)
    /// when out of range.
    pub fn set(&mut self, i: i64, v: E) -> Option<E> {
        let i = self.in_range(i)?;
        Some(std::mem::replace(&mut self.vec[i], v))
    }

    /// Insert or replace a mapping entry, returning the displaced value.
    pub fn set_key(&mut self, key: &str, v: E) -> Option<E> {
        self.map.insert(key.to_string(), v)
    }

    pub fn erase_key(&mut self, key: &str) -> Option<E> {
        self.map.remove(key)
    }

    pub fn find(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// All mapping keys; traversal order is unspecified.
    pub fn get_keys(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    pub fn push_back(&mut self, v: E) {
        self.vec.push(v);
    }

    pub fn pop_back(&mut self) -> Option<E> {
        self.vec.pop()
    }

    pub fn back(&self) -> Option<E> {
        self.vec.last().copied()
    }

    /// Remove the element at `pos`, shifting the tail down.
    pub fn pop_out(&mut self, pos: i64) -> Option<E> {
        let pos = self.in_range(pos)?;
        Some(self.vec.remove(pos))
    }

    pub fn reverse(&mut self) {
        self.vec.reverse();
    }

    /// In-place Fisher–Yates over the caller's generator (the VM's PRNG).
    pub fn shuffle(&mut self, rng: &mut impl Rng) {
        for i in (1..self.vec.len()).rev() {
            let j = rng.gen_range(0..=i);
            self.vec.swap(i, j);
        }
    }

    /// Zero the range `[0, size)` and truncate, returning the displaced
    /// elements. The mapping view is untouched.
    pub fn clear(&mut self) -> Vec<E> {
        self.vec.drain(..).collect()
    }

    /// Resize the sequence; shrinking returns the displaced tail, growth
    /// zero-fills.
    pub fn set_size(&mut self, size: i64) -> (i64, Vec<E>) {
        let size = size.max(0) as usize;
        let removed = if size < self.vec.len() {
            self.vec.drain(size..).collect()
        } else {
            self.vec.resize(size, E::zero());
            Vec::new()
        };
        (self.vec.len() as i64, removed)
    }

    /// Reserve storage; shrinking below the current size drops (and returns)
    /// the displaced tail first.
    pub fn set_capacity(&mut self, capacity: i64) -> (i64, Vec<E>) {
        let capacity = capacity.max(0) as usize;
        let removed = if capacity < self.vec.len() {
            self.vec.drain(capacity..).collect()
        } else {
            self.vec.reserve(capacity - self.vec.len());
            Vec::new()
        };
        (self.vec.capacity() as i64, removed)
    }

    /// Drain every element from both views; used when the container itself
    /// is reclaimed.
    pub fn drain_all(&mut self) -> Vec<E> {
        let mut out: Vec<E> = self.vec.drain(..).collect();
        out.extend(self.map.drain().map(|(_, v)| v));
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.vec.iter()
    }
}
