//! Runtime values.
//!
//! `Value` is a small `Copy` tagged union: immediates (`null`, bools,
//! numbers) are stored inline while strings, arrays, maps, functions and the
//! other heap payloads live in the [`Heap`](crate::heap::Heap) arena behind a
//! `Ref(HeapId)` handle.

use std::fmt::Write as _;

use ahash::AHashSet;
use strum::IntoStaticStr;

use crate::{
    bytecode::disassemble,
    heap::{Heap, HeapData, HeapId},
};

/// A runtime value. Immediate variants are self-contained; `Ref` points into
/// the heap arena, whose record discriminates the remaining types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Ref(HeapId),
}

/// The observable type of a value, as surfaced by diagnostics and the host
/// API. Names are total via strum (`"NUMBER"`, `"NATIVE_FUNCTION"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Map,
    Function,
    NativeFunction,
    Error,
    External,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl Value {
    pub fn kind(self, heap: &Heap) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::Ref(id) => heap.get(id).kind(),
        }
    }

    pub fn type_name(self, heap: &Heap) -> &'static str {
        self.kind(heap).name()
    }

    /// Truthiness used by conditional jumps: `null`, `false` and `0` are
    /// falsy, everything else (including every heap value) is truthy.
    pub fn is_truthy(self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => b,
            Self::Number(n) => n != 0.0,
            Self::Ref(_) => true,
        }
    }

    /// Whether the value participates in arithmetic (numbers and bools).
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Number(_) | Self::Bool(_))
    }

    /// Numeric coercion used by arithmetic and ordered comparison:
    /// bools become 0/1, `null` becomes 0.
    pub fn coerced_number(self) -> f64 {
        match self {
            Self::Number(n) => n,
            Self::Bool(b) => f64::from(u8::from(b)),
            Self::Null | Self::Ref(_) => 0.0,
        }
    }

    pub fn is_callable(self, heap: &Heap) -> bool {
        matches!(
            self.kind(heap),
            ValueKind::Function | ValueKind::NativeFunction
        )
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

fn kind_rank(kind: ValueKind) -> i32 {
    match kind {
        ValueKind::Null => 0,
        ValueKind::Bool => 1,
        ValueKind::Number => 2,
        ValueKind::String => 3,
        ValueKind::Array => 4,
        ValueKind::Map => 5,
        ValueKind::Function => 6,
        ValueKind::NativeFunction => 7,
        ValueKind::Error => 8,
        ValueKind::External => 9,
    }
}

/// Three-way comparison returning a number whose sign is the ordering.
///
/// Numbers, bools and `null` compare by numeric coercion; two strings
/// compare lexicographically; any other pair of heap values compares by
/// identity distance, and remaining mixed pairs by type rank. Only the sign
/// (and zero-ness) of the result is meaningful.
pub fn compare(left: Value, right: Value, heap: &Heap) -> f64 {
    if let (Value::Ref(a), Value::Ref(b)) = (left, right)
        && a == b
    {
        return 0.0;
    }
    let left_kind = left.kind(heap);
    let right_kind = right.kind(heap);
    let ordered = |k: ValueKind| {
        matches!(k, ValueKind::Number | ValueKind::Bool | ValueKind::Null)
    };
    if ordered(left_kind) && ordered(right_kind) {
        return left.coerced_number() - right.coerced_number();
    }
    if left_kind == ValueKind::String && right_kind == ValueKind::String {
        let (Value::Ref(a), Value::Ref(b)) = (left, right) else {
            return 0.0;
        };
        return match heap.str_of(a).cmp(heap.str_of(b)) {
            std::cmp::Ordering::Less => -1.0,
            std::cmp::Ordering::Equal => 0.0,
            std::cmp::Ordering::Greater => 1.0,
        };
    }
    if let (Value::Ref(a), Value::Ref(b)) = (left, right) {
        return f64::from(a.index() as i32 - b.index() as i32);
    }
    f64::from(kind_rank(left_kind) - kind_rank(right_kind))
}

/// Structural value equality, as exposed to hosts: types must match,
/// numbers/bools/null compare numerically, strings by content, arrays and
/// maps element-wise, and everything else by identity.
///
/// This is deliberately stronger than the `==` operator scripts observe
/// (which consumes a `compare` result, so containers compare by identity):
/// a deep copy is `equals` to its source.
pub fn equals(left: Value, right: Value, heap: &Heap) -> bool {
    let mut visiting = AHashSet::new();
    equals_inner(left, right, heap, &mut visiting)
}

fn equals_inner(
    left: Value,
    right: Value,
    heap: &Heap,
    visiting: &mut AHashSet<(HeapId, HeapId)>,
) -> bool {
    if left.kind(heap) != right.kind(heap) {
        return false;
    }
    match (left, right) {
        (Value::Ref(a), Value::Ref(b)) => {
            if a == b {
                return true;
            }
            // a pair already being compared is equal-so-far; recursing again
            // would only re-walk the same cycle
            if !visiting.insert((a, b)) {
                return true;
            }
            let result = match (heap.get(a), heap.get(b)) {
                (HeapData::Str(l), HeapData::Str(r)) => l == r,
                (HeapData::Array(l), HeapData::Array(r)) => {
                    l.len() == r.len()
                        && l.iter()
                            .zip(r.iter())
                            .all(|(lv, rv)| equals_inner(*lv, *rv, heap, visiting))
                }
                (HeapData::Map(l), HeapData::Map(r)) => {
                    l.len() == r.len()
                        && l.iter().zip(r.iter()).all(|((lk, lv), (rk, rv))| {
                            lk == rk && equals_inner(*lv, *rv, heap, visiting)
                        })
                }
                _ => false,
            };
            visiting.remove(&(a, b));
            result
        }
        _ => compare(left, right, heap).abs() < f64::EPSILON,
    }
}

/// Formats a number the way scripts observe it: integral values print bare,
/// everything else uses shortest round-trip notation.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_owned();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    if n == n.trunc() && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    ryu::Buffer::new().format(n).to_owned()
}

/// Renders a value into `out`. `quote_strings` controls whether top-level
/// strings are quoted; strings inside containers are always quoted.
pub fn write_value(out: &mut String, value: Value, heap: &Heap, quote_strings: bool) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&format_number(n)),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => {
                if quote_strings {
                    let _ = write!(out, "\"{s}\"");
                } else {
                    out.push_str(s);
                }
            }
            HeapData::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write_value(out, *item, heap, true);
                }
                out.push(']');
            }
            HeapData::Map(map) => {
                out.push('{');
                for (i, (key, val)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.write_to(out);
                    out.push_str(": ");
                    write_value(out, *val, heap, true);
                }
                out.push('}');
            }
            HeapData::Function(function) => {
                let _ = writeln!(out, "CompiledFunction: {}", function.name_or_anonymous());
                out.push_str(&disassemble(&function.unit));
            }
            HeapData::Native(_) => out.push_str("NATIVE_FUNCTION"),
            HeapData::Error(err) => {
                let _ = writeln!(out, "ERROR: {}", err.message);
                if let Some(traceback) = &err.traceback {
                    out.push_str("Traceback:\n");
                    traceback.render(out);
                }
            }
            HeapData::External(_) => out.push_str("EXTERNAL"),
            // cells never reach display paths; render through for safety
            HeapData::Cell(inner) => write_value(out, *inner, heap, quote_strings),
        },
    }
}

/// Serializes a value to its literal-like form (strings quoted).
pub fn serialize(value: Value, heap: &Heap) -> String {
    let mut out = String::new();
    write_value(&mut out, value, heap, true);
    out
}

/// Renders a value for display (top-level strings unquoted), as used by
/// `print`/`to_str` and the REPL.
pub fn to_display_string(value: Value, heap: &Heap) -> String {
    let mut out = String::new();
    write_value(&mut out, value, heap, false);
    out
}
