//! The object heap: arena allocation, payload types and the mark-and-sweep
//! garbage collector.
//!
//! Heap records live in a slot arena addressed by [`HeapId`]. Freed slots go
//! onto a free list and are reused by later allocations. Collection is
//! stop-the-world: the VM enumerates its roots, the heap marks everything
//! reachable (plus pinned records) and sweeps the rest.

use std::{any::Any, fmt, hash::{Hash, Hasher}, rc::Rc};

use ahash::AHashMap;
use indexmap::{Equivalent, IndexMap};
use smallvec::SmallVec;

use crate::{
    bytecode::CompilationUnit,
    error::{RunResult, Traceback},
    io::StdoutWriter,
    value::{Value, ValueKind, format_number},
};

/// Index of a record in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A hashable map key. Keys own their content (string keys store a copy of
/// the string, numbers store their IEEE bits) so lookup and iteration never
/// need the heap. Only numbers, bools and strings are hashable; the VM
/// rejects other key types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapKey {
    Bool(bool),
    /// IEEE-754 bits of the number; `-0.0` is normalized to `0.0` so the two
    /// zeroes are the same key.
    Number(u64),
    Str(Box<str>),
}

impl MapKey {
    /// Converts a value to a key, or `None` when the value is not hashable.
    pub fn from_value(value: Value, heap: &Heap) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::Number(n) => {
                let n = if n == 0.0 { 0.0 } else { n };
                Some(Self::Number(n.to_bits()))
            }
            Value::Ref(id) => match heap.get(id) {
                HeapData::Str(s) => Some(Self::Str(s.as_str().into())),
                _ => None,
            },
            Value::Null => None,
        }
    }

    pub fn from_str(key: &str) -> Self {
        Self::Str(key.into())
    }

    /// Materializes the key back into a value, allocating for string keys.
    pub fn to_value(&self, heap: &mut Heap) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(bits) => Value::Number(f64::from_bits(*bits)),
            Self::Str(s) => heap.alloc_string(s.as_ref()),
        }
    }

    /// Renders the key the way container serialization does (strings quoted).
    pub fn write_to(&self, out: &mut String) {
        match self {
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Number(bits) => out.push_str(&format_number(f64::from_bits(*bits))),
            Self::Str(s) => {
                out.push('"');
                out.push_str(s);
                out.push('"');
            }
        }
    }
}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Bool(b) => {
                state.write_u8(0);
                b.hash(state);
            }
            Self::Number(bits) => {
                state.write_u8(1);
                bits.hash(state);
            }
            Self::Str(s) => {
                state.write_u8(2);
                (**s).hash(state);
            }
        }
    }
}

/// Borrowed key used to look up string keys without allocating.
struct StrKey<'a>(&'a str);

impl Hash for StrKey<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(2);
        self.0.hash(state);
    }
}

impl Equivalent<MapKey> for StrKey<'_> {
    fn equivalent(&self, key: &MapKey) -> bool {
        matches!(key, MapKey::Str(s) if &**s == self.0)
    }
}

/// An insertion-ordered dictionary from hashable keys to values.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    entries: IndexMap<MapKey, Value, ahash::RandomState>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity_and_hasher(capacity, ahash::RandomState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &MapKey) -> Option<Value> {
        self.entries.get(key).copied()
    }

    pub fn get_str(&self, key: &str) -> Option<Value> {
        self.entries.get(&StrKey(key)).copied()
    }

    /// Inserts preserving the insertion position of an existing key.
    pub fn insert(&mut self, key: MapKey, value: Value) {
        self.entries.insert(key, value);
    }

    pub fn contains(&self, key: &MapKey) -> bool {
        self.entries.contains_key(key)
    }

    /// The entry at insertion position `index`.
    pub fn get_at(&self, index: usize) -> Option<(&MapKey, Value)> {
        self.entries.get_index(index).map(|(k, v)| (k, *v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MapKey, &Value)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }
}

/// A compiled script function, either a constants-pool prototype (no
/// captures) or a closure built by the `Function` opcode.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub name: Option<Rc<str>>,
    pub unit: Rc<CompilationUnit>,
    pub num_locals: u16,
    pub num_args: u8,
    /// Captured free values, in resolution order. Up to four are stored
    /// inline.
    pub free: SmallVec<[Value; 4]>,
}

impl ScriptFunction {
    pub fn name_or_anonymous(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }
}

/// Context handed to native functions: heap access for allocation and
/// mutation plus the script output writer.
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub stdout: &'a mut dyn StdoutWriter,
}

/// Implementation type of a native (host) function.
pub type NativeFnImpl = dyn Fn(&mut NativeCtx<'_>, &[Value]) -> RunResult<Value>;

/// A host-provided function callable from scripts.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: Rc<str>,
    pub func: Rc<NativeFnImpl>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// An error value as seen by scripts (produced by `recover` and the `error`
/// builtin).
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub message: String,
    pub traceback: Option<Traceback>,
}

/// Copy hook for external data, used by deep copy.
pub type ExternalCopyFn = dyn Fn(&Rc<dyn Any>) -> Rc<dyn Any>;

/// Opaque host data carried through the VM untouched. Dropping the record
/// releases the data (`Drop` is the destroy hook); the optional copy hook
/// is consulted by deep copy.
#[derive(Clone)]
pub struct ExternalData {
    pub data: Rc<dyn Any>,
    pub copy_fn: Option<Rc<ExternalCopyFn>>,
}

impl fmt::Debug for ExternalData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalData").finish_non_exhaustive()
    }
}

/// Payload of a heap record.
#[derive(Debug, Clone)]
pub enum HeapData {
    Str(String),
    Array(Vec<Value>),
    Map(ValueMap),
    Function(ScriptFunction),
    Native(NativeFunction),
    Error(ErrorValue),
    External(ExternalData),
    /// A shared variable cell backing a captured local. Cells never escape
    /// to script-visible values: local and free accesses read and write
    /// through them.
    Cell(Value),
}

impl HeapData {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Str(_) => ValueKind::String,
            Self::Array(_) => ValueKind::Array,
            Self::Map(_) => ValueKind::Map,
            Self::Function(_) => ValueKind::Function,
            Self::Native(_) => ValueKind::NativeFunction,
            Self::Error(_) => ValueKind::Error,
            Self::External(_) => ValueKind::External,
            Self::Cell(_) => unreachable!("variable cells are not script-visible values"),
        }
    }
}

#[derive(Debug)]
struct Slot {
    data: HeapData,
    marked: bool,
    pins: u32,
}

/// The object heap.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        let slot = Slot {
            data,
            marked: false,
            pins: 0,
        };
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(slot);
            HeapId(index)
        } else {
            self.slots.push(Some(slot));
            HeapId((self.slots.len() - 1) as u32)
        }
    }

    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.slots[id.index()]
            .as_ref()
            .expect("stale heap id")
            .data
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.slots[id.index()]
            .as_mut()
            .expect("stale heap id")
            .data
    }

    pub fn alloc_string(&mut self, s: impl Into<String>) -> Value {
        Value::Ref(self.alloc(HeapData::Str(s.into())))
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> Value {
        Value::Ref(self.alloc(HeapData::Array(items)))
    }

    pub fn alloc_map(&mut self, map: ValueMap) -> Value {
        Value::Ref(self.alloc(HeapData::Map(map)))
    }

    pub fn alloc_function(&mut self, function: ScriptFunction) -> Value {
        Value::Ref(self.alloc(HeapData::Function(function)))
    }

    pub fn alloc_native(&mut self, name: &str, func: Rc<NativeFnImpl>) -> Value {
        Value::Ref(self.alloc(HeapData::Native(NativeFunction {
            name: name.into(),
            func,
        })))
    }

    pub fn alloc_error(&mut self, message: impl Into<String>, traceback: Option<Traceback>) -> Value {
        Value::Ref(self.alloc(HeapData::Error(ErrorValue {
            message: message.into(),
            traceback,
        })))
    }

    pub fn alloc_external(&mut self, data: Rc<dyn Any>) -> Value {
        Value::Ref(self.alloc(HeapData::External(ExternalData {
            data,
            copy_fn: None,
        })))
    }

    pub fn alloc_cell(&mut self, inner: Value) -> Value {
        Value::Ref(self.alloc(HeapData::Cell(inner)))
    }

    /// The inner value of a variable cell, or `None` for anything else.
    pub fn cell_value(&self, value: Value) -> Option<Value> {
        match value {
            Value::Ref(id) => match self.get(id) {
                HeapData::Cell(inner) => Some(*inner),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn set_cell_value(&mut self, cell: Value, inner: Value) {
        if let Value::Ref(id) = cell
            && let HeapData::Cell(slot) = self.get_mut(id)
        {
            *slot = inner;
        }
    }

    /// The string payload of a record known to be a string.
    pub fn str_of(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Str(s) => s,
            other => panic!("expected string record, got {}", other.kind().name()),
        }
    }

    pub fn as_str(&self, value: Value) -> Option<&str> {
        match value {
            Value::Ref(id) => match self.get(id) {
                HeapData::Str(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_array(&self, value: Value) -> Option<&Vec<Value>> {
        match value {
            Value::Ref(id) => match self.get(id) {
                HeapData::Array(items) => Some(items),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self, value: Value) -> Option<&mut Vec<Value>> {
        match value {
            Value::Ref(id) => match self.get_mut(id) {
                HeapData::Array(items) => Some(items),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_map(&self, value: Value) -> Option<&ValueMap> {
        match value {
            Value::Ref(id) => match self.get(id) {
                HeapData::Map(map) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self, value: Value) -> Option<&mut ValueMap> {
        match value {
            Value::Ref(id) => match self.get_mut(id) {
                HeapData::Map(map) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_function(&self, value: Value) -> Option<&ScriptFunction> {
        match value {
            Value::Ref(id) => match self.get(id) {
                HeapData::Function(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self, value: Value) -> Option<&mut ScriptFunction> {
        match value {
            Value::Ref(id) => match self.get_mut(id) {
                HeapData::Function(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_native(&self, value: Value) -> Option<&NativeFunction> {
        match value {
            Value::Ref(id) => match self.get(id) {
                HeapData::Native(n) => Some(n),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_error(&self, value: Value) -> Option<&ErrorValue> {
        match value {
            Value::Ref(id) => match self.get(id) {
                HeapData::Error(e) => Some(e),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_external(&self, value: Value) -> Option<&ExternalData> {
        match value {
            Value::Ref(id) => match self.get(id) {
                HeapData::External(e) => Some(e),
                _ => None,
            },
            _ => None,
        }
    }

    /// Pins a record so it survives collection even when unreachable.
    /// Pins nest; each `pin` needs a matching `unpin`.
    pub fn pin(&mut self, value: Value) {
        if let Value::Ref(id) = value
            && let Some(slot) = self.slots[id.index()].as_mut()
        {
            slot.pins += 1;
        }
    }

    pub fn unpin(&mut self, value: Value) {
        if let Value::Ref(id) = value
            && let Some(slot) = self.slots[id.index()].as_mut()
        {
            slot.pins = slot.pins.saturating_sub(1);
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_live(&self, id: HeapId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(Option::is_some)
    }

    /// Runs a full mark-and-sweep collection over the given roots. Pinned
    /// records are treated as additional roots (their children survive too).
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Value>) {
        let mut work: Vec<HeapId> = Vec::new();
        for slot in self.slots.iter_mut().flatten() {
            slot.marked = false;
        }
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot
                && slot.pins > 0
            {
                work.push(HeapId(index as u32));
            }
        }
        for root in roots {
            if let Value::Ref(id) = root {
                work.push(id);
            }
        }

        while let Some(id) = work.pop() {
            let Some(slot) = self.slots[id.index()].as_mut() else {
                continue;
            };
            if slot.marked {
                continue;
            }
            slot.marked = true;
            let mut children: SmallVec<[HeapId; 8]> = SmallVec::new();
            fn add(value: &Value, children: &mut SmallVec<[HeapId; 8]>) {
                if let Value::Ref(child) = value {
                    children.push(*child);
                }
            }
            match &slot.data {
                HeapData::Array(items) => {
                    for item in items {
                        add(item, &mut children);
                    }
                }
                HeapData::Map(map) => {
                    for value in map.values() {
                        add(value, &mut children);
                    }
                }
                HeapData::Function(function) => {
                    for free in &function.free {
                        add(free, &mut children);
                    }
                }
                HeapData::Cell(inner) => add(inner, &mut children),
                HeapData::Str(_)
                | HeapData::Native(_)
                | HeapData::Error(_)
                | HeapData::External(_) => {}
            }
            work.extend(children);
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let dead = matches!(slot, Some(s) if !s.marked);
            if dead {
                *slot = None;
                self.free.push(index as u32);
            }
        }
    }

    /// One-level copy: containers get a fresh record sharing their element
    /// handles; strings are re-allocated; functions, natives and errors are
    /// shared.
    pub fn copy_value(&mut self, value: Value) -> Value {
        let Value::Ref(id) = value else {
            return value;
        };
        match self.get(id).clone() {
            HeapData::Str(s) => self.alloc_string(s),
            HeapData::Array(items) => self.alloc_array(items),
            HeapData::Map(map) => self.alloc_map(map),
            HeapData::Function(_)
            | HeapData::Native(_)
            | HeapData::Error(_)
            | HeapData::Cell(_) => value,
            HeapData::External(external) => self.copy_external(&external),
        }
    }

    /// Recursive copy that memoizes already-copied records so cyclic graphs
    /// terminate and shared substructure stays shared in the copy.
    pub fn deep_copy_value(&mut self, value: Value) -> Value {
        let mut copies: AHashMap<HeapId, Value> = AHashMap::new();
        self.deep_copy_inner(value, &mut copies)
    }

    fn deep_copy_inner(&mut self, value: Value, copies: &mut AHashMap<HeapId, Value>) -> Value {
        let Value::Ref(id) = value else {
            return value;
        };
        if let Some(copy) = copies.get(&id) {
            return *copy;
        }
        match self.get(id).clone() {
            HeapData::Str(s) => {
                let copy = self.alloc_string(s);
                copies.insert(id, copy);
                copy
            }
            HeapData::Array(items) => {
                // register the empty copy first so cycles resolve to it
                let copy = self.alloc_array(Vec::with_capacity(items.len()));
                copies.insert(id, copy);
                for item in items {
                    let item_copy = self.deep_copy_inner(item, copies);
                    if let Some(target) = self.as_array_mut(copy) {
                        target.push(item_copy);
                    }
                }
                copy
            }
            HeapData::Map(map) => {
                let copy = self.alloc_map(ValueMap::with_capacity(map.len()));
                copies.insert(id, copy);
                let entries: Vec<(MapKey, Value)> =
                    map.iter().map(|(k, v)| (k.clone(), *v)).collect();
                for (key, val) in entries {
                    let val_copy = self.deep_copy_inner(val, copies);
                    if let Some(target) = self.as_map_mut(copy) {
                        target.insert(key, val_copy);
                    }
                }
                copy
            }
            HeapData::Function(function) => {
                let copy = self.alloc_function(ScriptFunction {
                    free: SmallVec::new(),
                    ..function.clone()
                });
                copies.insert(id, copy);
                for free in function.free {
                    let free_copy = self.deep_copy_inner(free, copies);
                    if let Some(target) = self.as_function_mut(copy) {
                        target.free.push(free_copy);
                    }
                }
                copy
            }
            HeapData::Native(_) => {
                copies.insert(id, value);
                value
            }
            HeapData::Cell(inner) => {
                let copy = self.alloc_cell(Value::Null);
                copies.insert(id, copy);
                let inner_copy = self.deep_copy_inner(inner, copies);
                self.set_cell_value(copy, inner_copy);
                copy
            }
            HeapData::Error(err) => {
                let copy = Value::Ref(self.alloc(HeapData::Error(err)));
                copies.insert(id, copy);
                copy
            }
            HeapData::External(external) => {
                let copy = self.copy_external(&external);
                copies.insert(id, copy);
                copy
            }
        }
    }

    fn copy_external(&mut self, external: &ExternalData) -> Value {
        let data = match &external.copy_fn {
            Some(copy_fn) => copy_fn(&external.data),
            None => Rc::clone(&external.data),
        };
        Value::Ref(self.alloc(HeapData::External(ExternalData {
            data,
            copy_fn: external.copy_fn.clone(),
        })))
    }
}
