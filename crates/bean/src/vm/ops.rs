//! Operator evaluation helpers: numeric/bitwise computation, indexed
//! access, and the magic map keys consulted for operator overloading.

use super::check_assign;
use crate::{
    bytecode::Opcode,
    error::{RunError, RunResult},
    heap::{Heap, MapKey, ValueMap},
    value::{Value, ValueKind},
};

/// The map key a VM operator consults when one of its operands is a map.
/// A callable value under the key replaces the built-in behavior.
pub(super) fn overload_key(op: Opcode) -> Option<&'static str> {
    let key = match op {
        Opcode::Add => "__operator_add__",
        Opcode::Sub => "__operator_sub__",
        Opcode::Mul => "__operator_mul__",
        Opcode::Div => "__operator_div__",
        Opcode::Mod => "__operator_mod__",
        Opcode::Or => "__operator_or__",
        Opcode::Xor => "__operator_xor__",
        Opcode::And => "__operator_and__",
        Opcode::Lshift => "__operator_lshift__",
        Opcode::Rshift => "__operator_rshift__",
        Opcode::Minus => "__operator_minus__",
        Opcode::Bang => "__operator_bang__",
        Opcode::Compare => "__cmp__",
        _ => return None,
    };
    Some(key)
}

/// Computes a numeric binary operation. Bitwise forms truncate to i64 and
/// mask shift amounts into range.
pub(super) fn numeric_binary(op: Opcode, left: f64, right: f64) -> f64 {
    let left_int = left as i64;
    let right_int = right as i64;
    match op {
        Opcode::Add => left + right,
        Opcode::Sub => left - right,
        Opcode::Mul => left * right,
        Opcode::Div => left / right,
        Opcode::Mod => left % right,
        Opcode::Or => (left_int | right_int) as f64,
        Opcode::Xor => (left_int ^ right_int) as f64,
        Opcode::And => (left_int & right_int) as f64,
        Opcode::Lshift => left_int.wrapping_shl(right_int as u32) as f64,
        Opcode::Rshift => left_int.wrapping_shr(right_int as u32) as f64,
        _ => unreachable!("not a numeric binary opcode"),
    }
}

pub(super) fn get_index(heap: &mut Heap, left: Value, index: Value) -> RunResult<Value> {
    let left_kind = left.kind(heap);
    match left_kind {
        ValueKind::Array => {
            let Value::Number(n) = index else {
                return Err(RunError::new(format!(
                    "Cannot index {} with {}",
                    left_kind.name(),
                    index.type_name(heap)
                )));
            };
            let items = heap.as_array(left).expect("array value");
            let mut ix = n as i64;
            if ix < 0 {
                ix += items.len() as i64;
            }
            if ix >= 0 && (ix as usize) < items.len() {
                Ok(items[ix as usize])
            } else {
                Ok(Value::Null)
            }
        }
        ValueKind::Map => {
            let map = heap.as_map(left).expect("map value");
            Ok(MapKey::from_value(index, heap)
                .and_then(|key| map.get(&key))
                .unwrap_or(Value::Null))
        }
        ValueKind::String => {
            let ch = match index {
                Value::Number(n) if n >= 0.0 => heap
                    .as_str(left)
                    .and_then(|s| s.chars().nth(n as usize))
                    .map(String::from),
                _ => None,
            };
            Ok(match ch {
                Some(ch) => heap.alloc_string(ch),
                None => Value::Null,
            })
        }
        _ => Err(RunError::new(format!(
            "Type {} is not indexable",
            left_kind.name()
        ))),
    }
}

pub(super) fn get_value_at(heap: &mut Heap, left: Value, index: Value) -> RunResult<Value> {
    let left_kind = left.kind(heap);
    if !matches!(
        left_kind,
        ValueKind::Array | ValueKind::Map | ValueKind::String
    ) {
        return Err(RunError::new(format!(
            "Type {} is not indexable",
            left_kind.name()
        )));
    }
    let Value::Number(n) = index else {
        return Err(RunError::new(format!(
            "Cannot index {} with {}",
            left_kind.name(),
            index.type_name(heap)
        )));
    };
    let ix = n as i64;
    if ix < 0 {
        return Ok(Value::Null);
    }
    let ix = ix as usize;
    match left_kind {
        ValueKind::Array => Ok(heap
            .as_array(left)
            .and_then(|items| items.get(ix).copied())
            .unwrap_or(Value::Null)),
        ValueKind::Map => {
            let entry = heap
                .as_map(left)
                .and_then(|map| map.get_at(ix))
                .map(|(key, value)| (key.clone(), value));
            match entry {
                Some((key, value)) => {
                    let key_value = key.to_value(heap);
                    let mut pair = ValueMap::with_capacity(2);
                    pair.insert(MapKey::from_str("key"), key_value);
                    pair.insert(MapKey::from_str("value"), value);
                    Ok(heap.alloc_map(pair))
                }
                None => Ok(Value::Null),
            }
        }
        _ => {
            let ch = heap
                .as_str(left)
                .and_then(|s| s.chars().nth(ix))
                .map(String::from);
            Ok(match ch {
                Some(ch) => heap.alloc_string(ch),
                None => Value::Null,
            })
        }
    }
}

pub(super) fn set_index(
    heap: &mut Heap,
    left: Value,
    index: Value,
    new_value: Value,
) -> RunResult<()> {
    let left_kind = left.kind(heap);
    match left_kind {
        ValueKind::Array => {
            let Value::Number(n) = index else {
                return Err(RunError::new(format!(
                    "Cannot index {} with {}",
                    left_kind.name(),
                    index.type_name(heap)
                )));
            };
            let items = heap.as_array_mut(left).expect("array value");
            let ix = n as i64;
            if ix < 0 || ix as usize >= items.len() {
                return Err(RunError::new("Setting array item failed (out of bounds?)"));
            }
            items[ix as usize] = new_value;
            Ok(())
        }
        ValueKind::Map => {
            let Some(key) = MapKey::from_value(index, heap) else {
                return Err(RunError::new(format!(
                    "Key of type {} is not hashable",
                    index.type_name(heap)
                )));
            };
            let old_value = heap
                .as_map(left)
                .and_then(|map| map.get(&key))
                .unwrap_or(Value::Null);
            check_assign(heap, old_value, new_value)?;
            heap.as_map_mut(left)
                .expect("map value")
                .insert(key, new_value);
            Ok(())
        }
        _ => Err(RunError::new(format!(
            "Type {} is not indexable",
            left_kind.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_overloadable_opcode_has_a_key() {
        for op in [
            Opcode::Add,
            Opcode::Sub,
            Opcode::Mul,
            Opcode::Div,
            Opcode::Mod,
            Opcode::Or,
            Opcode::Xor,
            Opcode::And,
            Opcode::Lshift,
            Opcode::Rshift,
            Opcode::Minus,
            Opcode::Bang,
            Opcode::Compare,
        ] {
            assert!(overload_key(op).is_some(), "{op:?}");
        }
        assert_eq!(overload_key(Opcode::Pop), None);
    }

    #[test]
    fn arithmetic_and_bitwise() {
        assert_eq!(numeric_binary(Opcode::Add, 2.0, 3.0), 5.0);
        assert_eq!(numeric_binary(Opcode::Mod, 7.0, 4.0), 3.0);
        assert_eq!(numeric_binary(Opcode::Or, 5.0, 3.0), 7.0);
        assert_eq!(numeric_binary(Opcode::Lshift, 1.0, 4.0), 16.0);
        assert_eq!(numeric_binary(Opcode::Rshift, 16.0, 2.0), 4.0);
        // division by zero follows IEEE semantics
        assert!(numeric_binary(Opcode::Div, 1.0, 0.0).is_infinite());
        // shift amounts wrap rather than panic
        assert_eq!(numeric_binary(Opcode::Lshift, 1.0, 64.0), 1.0);
    }
}
