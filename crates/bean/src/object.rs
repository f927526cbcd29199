//! The host-facing value type.
//!
//! [`Object`] is a deep, self-contained copy of a script value: engine entry
//! points accept and return it so hosts never hold references into the GC'd
//! heap. Functions cross the boundary as opaque named descriptors; invoke
//! them with [`Engine::call`](crate::Engine::call).

use std::fmt;

use ahash::AHashSet;

use crate::{
    heap::{Heap, HeapData, MapKey, ValueMap},
    value::{Value, format_number},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Object>),
    /// Key/value pairs in insertion order.
    Map(Vec<(Object, Object)>),
    /// A script function, by name only; call it through the engine.
    Function { name: String },
    NativeFunction { name: String },
    Error { message: String, traceback: String },
    /// Opaque host data; not convertible across the boundary.
    External,
}

impl Object {
    /// Deep-converts a script value. Cycles resolve to `Null` at the point
    /// of re-entry.
    pub(crate) fn from_value(value: Value, heap: &Heap) -> Self {
        let mut visiting = AHashSet::new();
        Self::from_value_inner(value, heap, &mut visiting)
    }

    fn from_value_inner(
        value: Value,
        heap: &Heap,
        visiting: &mut AHashSet<crate::heap::HeapId>,
    ) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::Ref(id) => {
                if !visiting.insert(id) {
                    return Self::Null;
                }
                let object = match heap.get(id) {
                    HeapData::Str(s) => Self::String(s.clone()),
                    HeapData::Array(items) => Self::Array(
                        items
                            .iter()
                            .map(|item| Self::from_value_inner(*item, heap, visiting))
                            .collect(),
                    ),
                    HeapData::Map(map) => Self::Map(
                        map.iter()
                            .map(|(key, value)| {
                                let key = match key {
                                    MapKey::Bool(b) => Self::Bool(*b),
                                    MapKey::Number(bits) => Self::Number(f64::from_bits(*bits)),
                                    MapKey::Str(s) => Self::String(s.to_string()),
                                };
                                (key, Self::from_value_inner(*value, heap, visiting))
                            })
                            .collect(),
                    ),
                    HeapData::Function(function) => Self::Function {
                        name: function.name_or_anonymous().to_owned(),
                    },
                    HeapData::Native(native) => Self::NativeFunction {
                        name: native.name.to_string(),
                    },
                    HeapData::Error(err) => {
                        let mut traceback = String::new();
                        if let Some(tb) = &err.traceback {
                            tb.render(&mut traceback);
                        }
                        Self::Error {
                            message: err.message.clone(),
                            traceback,
                        }
                    }
                    HeapData::External(_) => Self::External,
                    HeapData::Cell(inner) => Self::from_value_inner(*inner, heap, visiting),
                };
                visiting.remove(&id);
                object
            }
        }
    }

    /// Converts back into a script value, allocating containers on the
    /// heap. Function descriptors, native descriptors and externals have no
    /// value form and become `null`.
    pub(crate) fn to_value(&self, heap: &mut Heap) -> Value {
        match self {
            Self::Null | Self::Function { .. } | Self::NativeFunction { .. } | Self::External => {
                Value::Null
            }
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(*n),
            Self::String(s) => heap.alloc_string(s.as_str()),
            Self::Array(items) => {
                let values = items.iter().map(|item| item.to_value(heap)).collect();
                heap.alloc_array(values)
            }
            Self::Map(pairs) => {
                let mut map = ValueMap::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = match key {
                        Self::Bool(b) => MapKey::Bool(*b),
                        Self::Number(n) => {
                            let n = if *n == 0.0 { 0.0 } else { *n };
                            MapKey::Number(n.to_bits())
                        }
                        Self::String(s) => MapKey::Str(s.as_str().into()),
                        // non-hashable keys cannot come back from a script
                        // value; drop them rather than guess
                        _ => continue,
                    };
                    let value = value.to_value(heap);
                    map.insert(key, value);
                }
                heap.alloc_map(map)
            }
            Self::Error { message, .. } => heap.alloc_error(message.clone(), None),
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{}", format_number(*n)),
            Self::String(s) => write!(f, "{s}"),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt_quoted(f)?;
                }
                write!(f, "]")
            }
            Self::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    key.fmt_quoted(f)?;
                    write!(f, ": ")?;
                    value.fmt_quoted(f)?;
                }
                write!(f, "}}")
            }
            Self::Function { name } => write!(f, "CompiledFunction: {name}"),
            Self::NativeFunction { .. } => write!(f, "NATIVE_FUNCTION"),
            Self::Error { message, .. } => write!(f, "ERROR: {message}"),
            Self::External => write!(f, "EXTERNAL"),
        }
    }
}

impl Object {
    fn fmt_quoted(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Self::String(s) = self {
            write!(f, "\"{s}\"")
        } else {
            fmt::Display::fmt(self, f)
        }
    }
}

impl From<f64> for Object {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Object {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Object {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Object {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}
