use crate::{MValue, Result, ValueKey};
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use std::{
    cell::RefCell,
    hash::BuildHasherDefault,
    rc::Rc,
};

// Integer keys above this go to the hash part even when contiguous
const MAX_ARRAY_INDEX: i64 = 67108864;

type HashMapType = IndexMap<ValueKey, MValue, BuildHasherDefault<FxHasher>>;

#[derive(Default)]
struct TableData {
    array: Vec<MValue>,
    hash: HashMapType,
    metatable: Option<MTable>,
}

/// The table type used in Milk
///
/// A table is a hybrid container: positive integer keys starting at 1 live in a
/// contiguous array part, everything else goes to an insertion-ordered hash part,
/// which is what makes `next` iteration deterministic. Tables are shared
/// references; cloning aliases the same data.
#[derive(Clone, Default)]
pub struct MTable {
    data: Rc<RefCell<TableData>>,
}

impl MTable {
    /// Makes an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes an empty table with capacity hints for the array and hash parts
    pub fn with_capacity(array: usize, hash: usize) -> Self {
        Self {
            data: Rc::new(RefCell::new(TableData {
                array: Vec::with_capacity(array),
                hash: HashMapType::with_capacity_and_hasher(hash, Default::default()),
                metatable: None,
            })),
        }
    }

    /// An address that identifies the table
    pub fn ptr_id(&self) -> usize {
        Rc::as_ptr(&self.data) as usize
    }

    /// True if both values alias the same table
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// The table's metatable
    pub fn metatable(&self) -> Option<MTable> {
        self.data.borrow().metatable.clone()
    }

    /// Replaces the table's metatable
    pub fn set_metatable(&self, metatable: Option<MTable>) {
        self.data.borrow_mut().metatable = metatable;
    }

    /// Reads `t[key]` without metamethods, returning nil for missing keys
    pub fn raw_get(&self, key: &MValue) -> MValue {
        match ValueKey::new(key.clone()) {
            Ok(key) => self.raw_get_key(&key),
            Err(_) => MValue::Nil,
        }
    }

    /// Reads `t[key]` for a checked key
    pub fn raw_get_key(&self, key: &ValueKey) -> MValue {
        let data = self.data.borrow();
        if let Some(i) = key.as_int() {
            if i >= 1 && i as usize <= data.array.len() {
                return data.array[i as usize - 1].clone();
            }
        }
        data.hash.get(key).cloned().unwrap_or_default()
    }

    /// Reads `t[i]` without metamethods
    pub fn raw_get_int(&self, i: i64) -> MValue {
        self.raw_get_key(&ValueKey::int(i))
    }

    /// Reads `t[key]` for a string key without metamethods
    pub fn raw_get_str(&self, key: &str) -> MValue {
        self.raw_get_key(&ValueKey::str(key))
    }

    /// Writes `t[key] = value` without metamethods
    ///
    /// Storing nil deletes the entry. Fails for nil and NaN keys.
    pub fn raw_set(&self, key: MValue, value: MValue) -> Result<()> {
        self.raw_set_key(ValueKey::new(key)?, value);
        Ok(())
    }

    /// Writes `t[key] = value` for a checked key
    pub fn raw_set_key(&self, key: ValueKey, value: MValue) {
        let mut data = self.data.borrow_mut();

        if let Some(i) = key.as_int() {
            if i >= 1 && i as usize <= data.array.len() {
                data.array[i as usize - 1] = value;
                return;
            }
            if i >= 1 && i as usize == data.array.len() + 1 && i <= MAX_ARRAY_INDEX {
                if value.is_nil() {
                    data.hash.shift_remove(&key);
                    return;
                }
                data.array.push(value);
                // entries that have become contiguous migrate out of the hash part
                loop {
                    let next = ValueKey::int(data.array.len() as i64 + 1);
                    match data.hash.shift_remove(&next) {
                        Some(migrated) => data.array.push(migrated),
                        None => break,
                    }
                }
                return;
            }
        }

        if value.is_nil() {
            data.hash.shift_remove(&key);
        } else {
            data.hash.insert(key, value);
        }
    }

    /// Writes `t[i] = value` without metamethods
    pub fn raw_set_int(&self, i: i64, value: MValue) {
        self.raw_set_key(ValueKey::int(i), value);
    }

    /// Writes `t[key] = value` for a string key without metamethods
    pub fn raw_set_str(&self, key: &str, value: MValue) {
        self.raw_set_key(ValueKey::str(key), value);
    }

    /// The table's border: an n where `t[n]` is non-nil and `t[n + 1]` is nil
    pub fn len(&self) -> i64 {
        let data = self.data.borrow();
        let mut n = data.array.len();
        while n > 0 && data.array[n - 1].is_nil() {
            n -= 1;
        }
        n as i64
    }

    /// True if the table has no entries at all
    pub fn is_empty(&self) -> bool {
        let data = self.data.borrow();
        data.hash.is_empty() && data.array.iter().all(MValue::is_nil)
    }

    /// The largest positive integer key present in the table
    pub fn max_n(&self) -> i64 {
        let data = self.data.borrow();
        let mut result = 0;
        for (i, value) in data.array.iter().enumerate() {
            if !value.is_nil() {
                result = i as i64 + 1;
            }
        }
        for key in data.hash.keys() {
            if let Some(i) = key.as_int() {
                if i > result {
                    result = i;
                }
            }
        }
        result
    }

    /// The key/value pair following the given key in iteration order
    ///
    /// A nil key starts the traversal; every non-nil pair is visited exactly once.
    /// Fails when the key isn't present in the table.
    pub fn next(&self, key: &MValue) -> Result<Option<(MValue, MValue)>> {
        let data = self.data.borrow();

        // the array part comes first, then the hash part in insertion order
        let array_start = match key {
            MValue::Nil => Some(0),
            _ => match ValueKey::new(key.clone()) {
                Ok(key) => match key.as_int() {
                    Some(i) if i >= 1 && (i as usize) <= data.array.len() => Some(i as usize),
                    _ => None,
                },
                Err(_) => None,
            },
        };

        if let Some(start) = array_start {
            for (i, value) in data.array.iter().enumerate().skip(start) {
                if !value.is_nil() {
                    return Ok(Some((MValue::Number(i as f64 + 1.0), value.clone())));
                }
            }
            match data.hash.get_index(0) {
                Some((k, v)) => return Ok(Some((k.value(), v.clone()))),
                None => return Ok(None),
            }
        }

        let key = ValueKey::new(key.clone())?;
        match data.hash.get_index_of(&key) {
            Some(index) => match data.hash.get_index(index + 1) {
                Some((k, v)) => Ok(Some((k.value(), v.clone()))),
                None => Ok(None),
            },
            None => Err(crate::Error::from("invalid key to 'next'")),
        }
    }

    /// A snapshot of the table's non-nil pairs in iteration order
    pub fn pairs(&self) -> Vec<(MValue, MValue)> {
        let data = self.data.borrow();
        let mut result = Vec::with_capacity(data.array.len() + data.hash.len());
        for (i, value) in data.array.iter().enumerate() {
            if !value.is_nil() {
                result.push((MValue::Number(i as f64 + 1.0), value.clone()));
            }
        }
        for (key, value) in data.hash.iter() {
            result.push((key.value(), value.clone()));
        }
        result
    }

    /// Inserts a value at the given position, shifting later elements up
    pub fn insert(&self, pos: i64, value: MValue) {
        let array_len = self.data.borrow().array.len() as i64;
        if pos >= 1 && pos <= array_len {
            self.data.borrow_mut().array.insert(pos as usize - 1, value);
        } else {
            self.raw_set_int(pos, value);
        }
    }

    /// Appends a value after the table's border
    pub fn append(&self, value: MValue) {
        let next = self.len() + 1;
        self.raw_set_int(next, value);
    }

    /// Removes and returns the value at the given position, shifting later elements down
    ///
    /// A position of -1 removes the last element; out of range positions return nil.
    pub fn remove(&self, pos: i64) -> MValue {
        let mut data = self.data.borrow_mut();
        let len = data.array.len() as i64;
        let pos = if pos == -1 { len } else { pos };
        if pos < 1 || pos > len {
            return MValue::Nil;
        }
        data.array.remove(pos as usize - 1)
    }

    pub(crate) fn take_array(&self) -> Vec<MValue> {
        std::mem::take(&mut self.data.borrow_mut().array)
    }

    pub(crate) fn set_array(&self, array: Vec<MValue>) {
        self.data.borrow_mut().array = array;
    }
}
