//! The built-in native function library.
//!
//! Builtins are plain native functions registered into the VM's registry at
//! engine construction; the symbol table binds their names in every file
//! scope. Two of them get special treatment from the VM's native call path:
//! `crash` raises as if from script code, and `error` produces error values
//! whose traceback does not name the builtin itself.

use std::rc::Rc;

use crate::{
    error::{RunError, RunResult},
    heap::{Heap, NativeCtx, NativeFnImpl},
    value::{Value, ValueKind, to_display_string},
    vm::Vm,
};

type BuiltinFn = fn(&mut NativeCtx<'_>, &[Value]) -> RunResult<Value>;

/// Registers every builtin and returns their names in registry order.
pub fn register_all(vm: &mut Vm, heap: &mut Heap) -> Vec<String> {
    let entries: &[(&str, BuiltinFn)] = &[
        ("len", len),
        ("println", println),
        ("print", print),
        ("to_str", to_str),
        ("to_num", to_num),
        ("range", range),
        ("append", append),
        ("remove", remove),
        ("keys", keys),
        ("values", values),
        ("concat", concat),
        ("reverse", reverse),
        ("copy", copy),
        ("deep_copy", deep_copy),
        ("assert", assert_),
        ("error", error),
        ("crash", crash),
        ("sqrt", sqrt),
        ("pow", pow),
        ("abs", abs),
        ("floor", floor),
        ("ceil", ceil),
    ];
    let mut names = Vec::with_capacity(entries.len());
    for (name, func) in entries {
        let func: Rc<NativeFnImpl> = Rc::new(*func);
        vm.register_native(heap, name, func);
        names.push((*name).to_owned());
    }
    names
}

fn expect_args(name: &str, args: &[Value], expected: usize) -> RunResult<()> {
    if args.len() != expected {
        return Err(RunError::new(format!(
            "Invalid number of arguments to \"{name}\", expected {expected}, got {}",
            args.len()
        )));
    }
    Ok(())
}

fn number_arg(ctx: &NativeCtx<'_>, name: &str, args: &[Value], ix: usize) -> RunResult<f64> {
    match args[ix] {
        Value::Number(n) => Ok(n),
        other => Err(RunError::new(format!(
            "Invalid argument {ix} to \"{name}\", expected NUMBER, got {}",
            other.type_name(ctx.heap)
        ))),
    }
}

fn len(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("len", args, 1)?;
    let length = if let Some(items) = ctx.heap.as_array(args[0]) {
        items.len()
    } else if let Some(map) = ctx.heap.as_map(args[0]) {
        map.len()
    } else if let Some(s) = ctx.heap.as_str(args[0]) {
        s.chars().count()
    } else {
        return Err(RunError::new(format!(
            "Cannot get length of {}",
            args[0].type_name(ctx.heap)
        )));
    };
    Ok(Value::Number(length as f64))
}

fn println(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            ctx.stdout.write(" ");
        }
        let text = to_display_string(*arg, ctx.heap);
        ctx.stdout.write(&text);
    }
    ctx.stdout.write("\n");
    Ok(Value::Null)
}

fn print(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            ctx.stdout.write(" ");
        }
        let text = to_display_string(*arg, ctx.heap);
        ctx.stdout.write(&text);
    }
    Ok(Value::Null)
}

fn to_str(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("to_str", args, 1)?;
    let text = to_display_string(args[0], ctx.heap);
    Ok(ctx.heap.alloc_string(text))
}

fn to_num(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("to_num", args, 1)?;
    match args[0] {
        Value::Number(n) => Ok(Value::Number(n)),
        Value::Bool(b) => Ok(Value::Number(f64::from(u8::from(b)))),
        value => {
            let parsed = ctx.heap.as_str(value).and_then(|s| s.trim().parse::<f64>().ok());
            match parsed {
                Some(n) => Ok(Value::Number(n)),
                None => Err(RunError::new(format!(
                    "Cannot convert {} to NUMBER",
                    value.type_name(ctx.heap)
                ))),
            }
        }
    }
}

/// `range(end)`, `range(start, end)` or `range(start, end, step)`.
fn range(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    let (start, end, step) = match args.len() {
        1 => (0.0, number_arg(ctx, "range", args, 0)?, 1.0),
        2 => (
            number_arg(ctx, "range", args, 0)?,
            number_arg(ctx, "range", args, 1)?,
            1.0,
        ),
        3 => (
            number_arg(ctx, "range", args, 0)?,
            number_arg(ctx, "range", args, 1)?,
            number_arg(ctx, "range", args, 2)?,
        ),
        n => {
            return Err(RunError::new(format!(
                "Invalid number of arguments to \"range\", expected 1 to 3, got {n}"
            )));
        }
    };
    if step == 0.0 {
        return Err(RunError::new("range() step cannot be 0"));
    }
    let mut items = Vec::new();
    let mut current = start;
    while (step > 0.0 && current < end) || (step < 0.0 && current > end) {
        items.push(Value::Number(current));
        current += step;
    }
    Ok(ctx.heap.alloc_array(items))
}

/// Appends in place; returns the new length.
fn append(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("append", args, 2)?;
    let Some(items) = ctx.heap.as_array_mut(args[0]) else {
        return Err(RunError::new(format!(
            "Invalid argument 0 to \"append\", expected ARRAY, got {}",
            args[0].type_name(ctx.heap)
        )));
    };
    items.push(args[1]);
    Ok(Value::Number(items.len() as f64))
}

/// Removes and returns the element at an index; null when out of range.
fn remove(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("remove", args, 2)?;
    let ix = number_arg(ctx, "remove", args, 1)? as i64;
    let Some(items) = ctx.heap.as_array_mut(args[0]) else {
        return Err(RunError::new(format!(
            "Invalid argument 0 to \"remove\", expected ARRAY, got {}",
            args[0].type_name(ctx.heap)
        )));
    };
    if ix < 0 || ix as usize >= items.len() {
        return Ok(Value::Null);
    }
    Ok(items.remove(ix as usize))
}

fn keys(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("keys", args, 1)?;
    let Some(map) = ctx.heap.as_map(args[0]) else {
        return Err(RunError::new(format!(
            "Invalid argument 0 to \"keys\", expected MAP, got {}",
            args[0].type_name(ctx.heap)
        )));
    };
    let map_keys: Vec<_> = map.iter().map(|(k, _)| k.clone()).collect();
    let items = map_keys
        .into_iter()
        .map(|key| key.to_value(ctx.heap))
        .collect();
    Ok(ctx.heap.alloc_array(items))
}

fn values(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("values", args, 1)?;
    let Some(map) = ctx.heap.as_map(args[0]) else {
        return Err(RunError::new(format!(
            "Invalid argument 0 to \"values\", expected MAP, got {}",
            args[0].type_name(ctx.heap)
        )));
    };
    let items: Vec<Value> = map.values().copied().collect();
    Ok(ctx.heap.alloc_array(items))
}

fn concat(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("concat", args, 2)?;
    if let (Some(left), Some(right)) = (ctx.heap.as_array(args[0]), ctx.heap.as_array(args[1])) {
        let mut items = left.clone();
        items.extend_from_slice(right);
        return Ok(ctx.heap.alloc_array(items));
    }
    if let (Some(left), Some(right)) = (ctx.heap.as_str(args[0]), ctx.heap.as_str(args[1])) {
        let joined = format!("{left}{right}");
        return Ok(ctx.heap.alloc_string(joined));
    }
    Err(RunError::new(format!(
        "Invalid operand types for \"concat\", got {} and {}",
        args[0].type_name(ctx.heap),
        args[1].type_name(ctx.heap)
    )))
}

/// Returns a reversed copy of an array or string.
fn reverse(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("reverse", args, 1)?;
    if let Some(items) = ctx.heap.as_array(args[0]) {
        let reversed: Vec<Value> = items.iter().rev().copied().collect();
        return Ok(ctx.heap.alloc_array(reversed));
    }
    if let Some(s) = ctx.heap.as_str(args[0]) {
        let reversed: String = s.chars().rev().collect();
        return Ok(ctx.heap.alloc_string(reversed));
    }
    Err(RunError::new(format!(
        "Invalid argument 0 to \"reverse\", expected ARRAY or STRING, got {}",
        args[0].type_name(ctx.heap)
    )))
}

fn copy(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("copy", args, 1)?;
    Ok(ctx.heap.copy_value(args[0]))
}

fn deep_copy(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("deep_copy", args, 1)?;
    Ok(ctx.heap.deep_copy_value(args[0]))
}

fn assert_(_ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("assert", args, 1)?;
    if args[0].is_truthy() {
        Ok(Value::Bool(true))
    } else {
        Err(RunError::new("assertion failed"))
    }
}

/// Builds an error value without raising it; pairs with `recover`.
fn error(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("error", args, 1)?;
    let message = match args[0].kind(ctx.heap) {
        ValueKind::String => ctx.heap.as_str(args[0]).unwrap_or_default().to_owned(),
        _ => to_display_string(args[0], ctx.heap),
    };
    Ok(ctx.heap.alloc_error(message, None))
}

/// Raises a runtime error at the call site.
fn crash(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("crash", args, 1)?;
    let message = match args[0].kind(ctx.heap) {
        ValueKind::String => ctx.heap.as_str(args[0]).unwrap_or_default().to_owned(),
        _ => to_display_string(args[0], ctx.heap),
    };
    Err(RunError::new(message))
}

fn sqrt(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("sqrt", args, 1)?;
    Ok(Value::Number(number_arg(ctx, "sqrt", args, 0)?.sqrt()))
}

fn pow(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("pow", args, 2)?;
    let base = number_arg(ctx, "pow", args, 0)?;
    let exponent = number_arg(ctx, "pow", args, 1)?;
    Ok(Value::Number(base.powf(exponent)))
}

fn abs(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("abs", args, 1)?;
    Ok(Value::Number(number_arg(ctx, "abs", args, 0)?.abs()))
}

fn floor(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("floor", args, 1)?;
    Ok(Value::Number(number_arg(ctx, "floor", args, 0)?.floor()))
}

fn ceil(ctx: &mut NativeCtx<'_>, args: &[Value]) -> RunResult<Value> {
    expect_args("ceil", args, 1)?;
    Ok(Value::Number(number_arg(ctx, "ceil", args, 0)?.ceil()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::CollectString;

    fn ctx_parts() -> (Heap, CollectString) {
        (Heap::new(), CollectString::new())
    }

    #[test]
    fn registry_order_matches_returned_names() {
        let mut vm = Vm::new();
        let mut heap = Heap::new();
        let names = register_all(&mut vm, &mut heap);
        assert_eq!(names[0], "len");
        for (ix, name) in names.iter().enumerate() {
            let value = vm.native_function(ix).expect("registered builtin");
            assert_eq!(&*heap.as_native(value).expect("native").name, name.as_str());
        }
    }

    #[test]
    fn len_counts_chars_elements_and_entries() {
        let (mut heap, mut out) = ctx_parts();
        let s = heap.alloc_string("héllo");
        let mut ctx = NativeCtx {
            heap: &mut heap,
            stdout: &mut out,
        };
        assert_eq!(len(&mut ctx, &[s]).expect("len"), Value::Number(5.0));
        let err = len(&mut ctx, &[Value::Number(1.0)]).expect_err("numbers have no length");
        assert_eq!(err.message, "Cannot get length of NUMBER");
    }

    #[test]
    fn range_variants() {
        let (mut heap, mut out) = ctx_parts();
        let mut ctx = NativeCtx {
            heap: &mut heap,
            stdout: &mut out,
        };
        let r = range(&mut ctx, &[Value::Number(3.0)]).expect("range");
        assert_eq!(ctx.heap.as_array(r).expect("array").len(), 3);
        let r = range(
            &mut ctx,
            &[Value::Number(4.0), Value::Number(0.0), Value::Number(-2.0)],
        )
        .expect("range");
        assert_eq!(
            ctx.heap.as_array(r).expect("array"),
            &vec![Value::Number(4.0), Value::Number(2.0)]
        );
        assert!(range(&mut ctx, &[Value::Number(1.0), Value::Number(2.0), Value::Number(0.0)]).is_err());
    }

    #[test]
    fn println_joins_with_spaces() {
        let (mut heap, mut out) = ctx_parts();
        let s = heap.alloc_string("x");
        {
            let mut ctx = NativeCtx {
                heap: &mut heap,
                stdout: &mut out,
            };
            println(&mut ctx, &[s, Value::Number(2.0)]).expect("println");
        }
        assert_eq!(out.as_str(), "x 2\n");
    }

    #[test]
    fn append_mutates_in_place() {
        let (mut heap, mut out) = ctx_parts();
        let arr = heap.alloc_array(vec![Value::Number(1.0)]);
        let mut ctx = NativeCtx {
            heap: &mut heap,
            stdout: &mut out,
        };
        let new_len = append(&mut ctx, &[arr, Value::Number(2.0)]).expect("append");
        assert_eq!(new_len, Value::Number(2.0));
        assert_eq!(ctx.heap.as_array(arr).expect("array").len(), 2);
    }
}
