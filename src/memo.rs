// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Memo tables: the identity <-> index mapping both ends keep in step.

use std::collections::HashMap;

use crate::value::{Global, Value};

/// What identifies a value for memoization.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum MemoKey {
    /// Address of a shared container or object.
    Address(usize),
    /// Globals are the same object whenever their names are equal.
    Global(Global),
}

impl MemoKey {
    /// The key of a value, or `None` for values without identity.
    pub fn of(value: &Value) -> Option<MemoKey> {
        match *value {
            Value::Global(ref g) => Some(MemoKey::Global(g.clone())),
            ref other => other.address().map(MemoKey::Address),
        }
    }
}

/// Encoder side memo.
///
/// Each entry keeps a handle to its value, so that the address cannot be
/// freed and reused by another value while the memo lives.
#[derive(Default)]
pub(crate) struct Memo {
    entries: HashMap<MemoKey, (u32, Value)>,
}

impl Memo {
    pub fn get(&self, key: &MemoKey) -> Option<u32> {
        self.entries.get(key).map(|&(index, _)| index)
    }

    /// Assigns the next index to a value not yet in the memo.
    pub fn put(&mut self, key: MemoKey, value: &Value) -> u32 {
        let index = self.entries.len() as u32;
        let previous = self.entries.insert(key, (index, value.clone()));
        debug_assert!(previous.is_none(), "value memoized twice");
        index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Forgets every entry assigned at or after `len`, so that the next
    /// index handed out is `len` again.
    pub fn truncate(&mut self, len: usize) {
        self.entries.retain(|_, &mut (index, _)| (index as usize) < len);
    }
}

/// Decoder side memo.
///
/// Indices normally arrive in order, but PUT opcodes may name any index,
/// so this is a map rather than a vector.
#[derive(Default)]
pub(crate) struct MemoStore {
    values: HashMap<u32, Value>,
}

impl MemoStore {
    pub fn save(&mut self, index: u32, value: Value) {
        self.values.insert(index, value);
    }

    pub fn fetch(&self, index: u32) -> Option<&Value> {
        self.values.get(&index)
    }

    /// Index used by MEMOIZE, which stores under the current memo size.
    pub fn next_index(&self) -> u32 {
        self.values.len() as u32
    }
}
