//! The virtual machine: a stack interpreter over compiled units.
//!
//! The dispatch loop caches the current frame's unit and instruction pointer
//! in locals and reloads them whenever the frame stack changes (calls,
//! returns, recover transfers). Runtime errors unwind to the innermost frame
//! with an armed recover target, or escape to the caller with a traceback.

mod ops;

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    bytecode::{CompilationUnit, Opcode},
    error::{EngineError, ErrorKind, RunError, RunResult, Traceback},
    heap::{Heap, HeapData, MapKey, NativeCtx, NativeFnImpl, ScriptFunction, ValueMap},
    io::StdoutWriter,
    position::Position,
    value::{Value, ValueKind, compare},
};

pub const VALUE_STACK_SIZE: usize = 2048;
pub const THIS_STACK_SIZE: usize = 2048;
pub const MAX_FRAMES: usize = 2048;
pub const MAX_GLOBALS: usize = 2048;
/// Instructions between garbage collections; negative disables collection.
pub const DEFAULT_GC_INTERVAL: i64 = 10_000;

/// One function activation.
#[derive(Debug)]
struct Frame {
    function: Value,
    unit: Rc<CompilationUnit>,
    ip: usize,
    base_pointer: usize,
    num_locals: usize,
    recover_ip: Option<usize>,
    is_recovering: bool,
}

impl Frame {
    fn new(function: Value, unit: Rc<CompilationUnit>, base_pointer: usize, num_locals: usize) -> Self {
        Self {
            function,
            unit,
            ip: 0,
            base_pointer,
            num_locals,
            recover_ip: None,
            is_recovering: false,
        }
    }
}

/// What the dispatch loop should do after an instruction.
enum Flow {
    Normal,
    /// The frame stack changed; re-cache the current frame.
    Reload,
    /// The outermost frame returned.
    Halt,
}

macro_rules! fetch_u8 {
    ($unit:expr, $ip:ident) => {{
        let byte = $unit.bytecode[$ip];
        $ip += 1;
        byte
    }};
}

macro_rules! fetch_u16 {
    ($unit:expr, $ip:ident) => {{
        let hi = $unit.bytecode[$ip];
        let lo = $unit.bytecode[$ip + 1];
        $ip += 2;
        u16::from_be_bytes([hi, lo])
    }};
}

macro_rules! fetch_u64 {
    ($unit:expr, $ip:ident) => {{
        let bytes: [u8; 8] = $unit.bytecode[$ip..$ip + 8]
            .try_into()
            .expect("u64 operand");
        $ip += 8;
        u64::from_be_bytes(bytes)
    }};
}

macro_rules! reload_frame {
    ($vm:expr, $ip:ident, $unit:ident, $base:ident) => {{
        let frame = $vm.frames.last().expect("no frame to reload");
        $ip = frame.ip;
        $unit = Rc::clone(&frame.unit);
        $base = frame.base_pointer;
    }};
}

pub struct Vm {
    stack: Vec<Value>,
    this_stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: Vec<Value>,
    globals_count: usize,
    native_functions: Vec<Value>,
    last_popped: Value,
    running: bool,
    gc_interval: i64,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(64),
            this_stack: Vec::new(),
            frames: Vec::with_capacity(16),
            globals: vec![Value::Null; MAX_GLOBALS],
            globals_count: 0,
            native_functions: Vec::new(),
            last_popped: Value::Null,
            running: false,
            gc_interval: DEFAULT_GC_INTERVAL,
        }
    }

    pub fn set_gc_interval(&mut self, interval: i64) {
        self.gc_interval = interval;
    }

    /// Clears the value, "this" and frame stacks; globals survive.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.this_stack.clear();
        self.frames.clear();
    }

    pub fn last_popped(&self) -> Value {
        self.last_popped
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Registers a native function and returns its registry index.
    pub fn register_native(&mut self, heap: &mut Heap, name: &str, func: Rc<NativeFnImpl>) -> u16 {
        let value = heap.alloc_native(name, func);
        self.native_functions.push(value);
        (self.native_functions.len() - 1) as u16
    }

    pub fn native_function(&self, index: usize) -> Option<Value> {
        self.native_functions.get(index).copied()
    }

    pub fn get_global(&self, index: usize) -> Value {
        self.globals.get(index).copied().unwrap_or(Value::Null)
    }

    pub fn set_global(&mut self, index: usize, value: Value) -> RunResult<()> {
        if index >= MAX_GLOBALS {
            return Err(RunError::new("Global write out of range"));
        }
        self.globals[index] = value;
        if index >= self.globals_count {
            self.globals_count = index + 1;
        }
        Ok(())
    }

    /// Runs a compiled program: wraps the unit in a synthetic `main`
    /// function and executes it to completion.
    pub fn run_program(
        &mut self,
        heap: &mut Heap,
        constants: &[Value],
        stdout: &mut dyn StdoutWriter,
        unit: &Rc<CompilationUnit>,
    ) -> Result<(), EngineError> {
        let old_sp = self.stack.len();
        let old_this_sp = self.this_stack.len();
        let old_frames = self.frames.len();

        let main = heap.alloc_function(ScriptFunction {
            name: Some("main".into()),
            unit: Rc::clone(unit),
            num_locals: 0,
            num_args: 0,
            free: SmallVec::new(),
        });
        self.stack.push(main);

        let result = self.execute_function(heap, constants, stdout, main);

        while self.frames.len() > old_frames {
            self.pop_frame();
        }
        self.this_stack.truncate(old_this_sp);
        if result.is_ok() {
            debug_assert_eq!(self.stack.len(), old_sp);
        }
        self.stack.truncate(old_sp);
        result
    }

    /// Calls a callable value with the given arguments and returns the
    /// result.
    pub fn call_function(
        &mut self,
        heap: &mut Heap,
        constants: &[Value],
        stdout: &mut dyn StdoutWriter,
        callee: Value,
        args: &[Value],
    ) -> Result<Value, EngineError> {
        match callee.kind(heap) {
            ValueKind::Function => {
                let old_sp = self.stack.len();
                let old_this_sp = self.this_stack.len();
                let old_frames = self.frames.len();

                self.stack.push(callee);
                self.stack.extend_from_slice(args);
                let result = self.execute_function(heap, constants, stdout, callee);

                while self.frames.len() > old_frames {
                    self.pop_frame();
                }
                self.this_stack.truncate(old_this_sp);
                self.stack.truncate(old_sp);
                result?;
                Ok(self.last_popped)
            }
            ValueKind::NativeFunction => self
                .call_native(heap, stdout, callee, Position::invalid(), args)
                .map_err(|err| self.escape_error(heap, err)),
            _ => Err(EngineError::new(
                ErrorKind::User,
                Position::invalid(),
                "Object is not callable",
            )),
        }
    }

    fn execute_function(
        &mut self,
        heap: &mut Heap,
        constants: &[Value],
        stdout: &mut dyn StdoutWriter,
        function: Value,
    ) -> Result<(), EngineError> {
        if self.running {
            return Err(EngineError::new(
                ErrorKind::User,
                Position::invalid(),
                "VM is already executing code",
            ));
        }

        let (unit, num_args, num_locals) = {
            let script = heap
                .as_function(function)
                .expect("execute_function requires a function value");
            (
                Rc::clone(&script.unit),
                script.num_args as usize,
                script.num_locals as usize,
            )
        };
        let base_pointer = self.stack.len() - num_args;
        let frame = Frame::new(function, unit, base_pointer, num_locals);
        if let Err(err) = self.push_frame(frame) {
            return Err(EngineError::new(ErrorKind::User, Position::invalid(), err.message));
        }

        self.running = true;
        self.last_popped = Value::Null;
        let result = self.dispatch(heap, constants, stdout);
        self.collect_garbage(heap, constants);
        self.running = false;
        result
    }

    fn dispatch(
        &mut self,
        heap: &mut Heap,
        constants: &[Value],
        stdout: &mut dyn StdoutWriter,
    ) -> Result<(), EngineError> {
        let (mut ip, mut unit, mut base) = {
            let frame = self.frames.last().expect("dispatch without a frame");
            (frame.ip, Rc::clone(&frame.unit), frame.base_pointer)
        };
        let mut ticks: i64 = 0;

        loop {
            if ip >= unit.bytecode.len() {
                break;
            }
            let op_ip = ip;
            let byte = fetch_u8!(unit, ip);
            let Some(op) = Opcode::from_byte(byte) else {
                self.sync_ip(ip);
                self.handle_error(
                    heap,
                    RunError::new(format!("Unknown opcode: {byte:#x}")),
                    unit.position_at(op_ip),
                )?;
                reload_frame!(self, ip, unit, base);
                continue;
            };

            let result: RunResult<Flow> = match op {
                Opcode::Constant => {
                    let ix = fetch_u16!(unit, ip) as usize;
                    match constants.get(ix) {
                        Some(value) => self.push(*value).map(|()| Flow::Normal),
                        None => Err(RunError::new(format!("Constant at {ix} not found"))),
                    }
                }
                Opcode::Number => {
                    let bits = fetch_u64!(unit, ip);
                    self.push(Value::Number(f64::from_bits(bits))).map(|()| Flow::Normal)
                }
                Opcode::True => self.push(Value::Bool(true)).map(|()| Flow::Normal),
                Opcode::False => self.push(Value::Bool(false)).map(|()| Flow::Normal),
                Opcode::Null => self.push(Value::Null).map(|()| Flow::Normal),
                Opcode::Pop => self.pop().map(|_| Flow::Normal),
                Opcode::Dup => {
                    let value = self.get(0);
                    value.and_then(|v| self.push(v)).map(|()| Flow::Normal)
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Or
                | Opcode::Xor
                | Opcode::And
                | Opcode::Lshift
                | Opcode::Rshift => {
                    self.sync_ip(ip);
                    self.binary_op(heap, stdout, op)
                }
                Opcode::Minus | Opcode::Bang => {
                    self.sync_ip(ip);
                    self.unary_op(heap, stdout, op)
                }
                Opcode::Compare => {
                    self.sync_ip(ip);
                    self.compare_op(heap, stdout)
                }
                Opcode::Equal
                | Opcode::NotEqual
                | Opcode::GreaterThan
                | Opcode::GreaterThanEqual => self.pop().and_then(|value| {
                    let ordering = value.coerced_number();
                    let result = match op {
                        Opcode::Equal => ordering.abs() < f64::EPSILON,
                        Opcode::NotEqual => ordering.abs() >= f64::EPSILON,
                        Opcode::GreaterThan => ordering > 0.0,
                        _ => ordering > 0.0 || ordering.abs() < f64::EPSILON,
                    };
                    self.push(Value::Bool(result)).map(|()| Flow::Normal)
                }),
                Opcode::Jump => {
                    let target = fetch_u16!(unit, ip) as usize;
                    ip = target;
                    Ok(Flow::Normal)
                }
                Opcode::JumpIfFalse => {
                    let target = fetch_u16!(unit, ip) as usize;
                    self.pop().map(|test| {
                        if !test.is_truthy() {
                            ip = target;
                        }
                        Flow::Normal
                    })
                }
                Opcode::JumpIfTrue => {
                    let target = fetch_u16!(unit, ip) as usize;
                    self.pop().map(|test| {
                        if test.is_truthy() {
                            ip = target;
                        }
                        Flow::Normal
                    })
                }
                Opcode::DefineGlobal => {
                    let ix = fetch_u16!(unit, ip) as usize;
                    self.pop()
                        .and_then(|value| self.set_global(ix, value))
                        .map(|()| Flow::Normal)
                }
                Opcode::SetGlobal => {
                    let ix = fetch_u16!(unit, ip) as usize;
                    self.pop().and_then(|value| {
                        check_assign(heap, self.get_global(ix), value)?;
                        self.set_global(ix, value).map(|()| Flow::Normal)
                    })
                }
                Opcode::GetGlobal => {
                    let ix = fetch_u16!(unit, ip) as usize;
                    let value = self.get_global(ix);
                    self.push(value).map(|()| Flow::Normal)
                }
                Opcode::DefineLocal => {
                    let slot = fetch_u8!(unit, ip) as usize;
                    self.pop().map(|value| {
                        self.stack[base + slot] = value;
                        Flow::Normal
                    })
                }
                Opcode::SetLocal => {
                    let slot = fetch_u8!(unit, ip) as usize;
                    self.pop().and_then(|value| {
                        let slot_value = self.stack[base + slot];
                        if let Some(inner) = heap.cell_value(slot_value) {
                            check_assign(heap, inner, value)?;
                            heap.set_cell_value(slot_value, value);
                        } else {
                            check_assign(heap, slot_value, value)?;
                            self.stack[base + slot] = value;
                        }
                        Ok(Flow::Normal)
                    })
                }
                Opcode::GetLocal => {
                    let slot = fetch_u8!(unit, ip) as usize;
                    let value = self.stack[base + slot];
                    let value = heap.cell_value(value).unwrap_or(value);
                    self.push(value).map(|()| Flow::Normal)
                }
                Opcode::GetNativeFunction => {
                    let ix = fetch_u16!(unit, ip) as usize;
                    match self.native_functions.get(ix).copied() {
                        Some(value) => self.push(value).map(|()| Flow::Normal),
                        None => Err(RunError::new(format!("Native function {ix} not found"))),
                    }
                }
                Opcode::GetFree => {
                    let ix = fetch_u8!(unit, ip) as usize;
                    let function = self.current_frame().function;
                    let value = heap
                        .as_function(function)
                        .and_then(|f| f.free.get(ix).copied());
                    match value {
                        Some(value) => {
                            let value = heap.cell_value(value).unwrap_or(value);
                            self.push(value).map(|()| Flow::Normal)
                        }
                        None => Err(RunError::new(format!("Free value {ix} not found"))),
                    }
                }
                Opcode::SetFree => {
                    let ix = fetch_u8!(unit, ip) as usize;
                    let function = self.current_frame().function;
                    self.pop().and_then(|value| {
                        let slot = heap
                            .as_function(function)
                            .and_then(|f| f.free.get(ix).copied());
                        match slot {
                            Some(cell) if heap.cell_value(cell).is_some() => {
                                heap.set_cell_value(cell, value);
                                Ok(Flow::Normal)
                            }
                            Some(_) => {
                                if let Some(slot) = heap
                                    .as_function_mut(function)
                                    .and_then(|f| f.free.get_mut(ix))
                                {
                                    *slot = value;
                                }
                                Ok(Flow::Normal)
                            }
                            None => Err(RunError::new(format!("Free value {ix} not found"))),
                        }
                    })
                }
                Opcode::CaptureLocal => {
                    let slot = fetch_u8!(unit, ip) as usize;
                    let value = self.stack[base + slot];
                    let cell = if heap.cell_value(value).is_some() {
                        value
                    } else {
                        let cell = heap.alloc_cell(value);
                        self.stack[base + slot] = cell;
                        cell
                    };
                    self.push(cell).map(|()| Flow::Normal)
                }
                Opcode::CaptureFree => {
                    let ix = fetch_u8!(unit, ip) as usize;
                    let function = self.current_frame().function;
                    let cell = heap
                        .as_function(function)
                        .and_then(|f| f.free.get(ix).copied());
                    match cell {
                        Some(cell) => self.push(cell).map(|()| Flow::Normal),
                        None => Err(RunError::new(format!("Free value {ix} not found"))),
                    }
                }
                Opcode::CurrentFunction => {
                    let function = self.current_frame().function;
                    self.push(function).map(|()| Flow::Normal)
                }
                Opcode::GetThis => self.this_top().and_then(|value| {
                    self.push(value).map(|()| Flow::Normal)
                }),
                Opcode::Array => {
                    let count = fetch_u16!(unit, ip) as usize;
                    let start = self.stack.len() - count;
                    let items = self.stack.split_off(start);
                    let array = heap.alloc_array(items);
                    self.push(array).map(|()| Flow::Normal)
                }
                Opcode::MapStart => {
                    let count = fetch_u16!(unit, ip) as usize;
                    let map = heap.alloc_map(ValueMap::with_capacity(count / 2));
                    self.this_push(map).map(|()| Flow::Normal)
                }
                Opcode::MapEnd => {
                    let count = fetch_u16!(unit, ip) as usize;
                    self.finish_map_literal(heap, count).map(|()| Flow::Normal)
                }
                Opcode::GetIndex => self.exec_get_index(heap),
                Opcode::GetValueAt => self.exec_get_value_at(heap),
                Opcode::SetIndex => self.exec_set_index(heap),
                Opcode::Call => {
                    let num_args = fetch_u8!(unit, ip) as usize;
                    self.sync_ip(ip);
                    self.exec_call(heap, stdout, num_args)
                }
                Opcode::ReturnValue => self.exec_return_value(),
                Opcode::Return => self.exec_return(),
                Opcode::Function => {
                    let constant_ix = fetch_u16!(unit, ip) as usize;
                    let num_free = fetch_u8!(unit, ip) as usize;
                    self.build_closure(heap, constants, constant_ix, num_free)
                        .map(|()| Flow::Normal)
                }
                Opcode::Len => self.exec_len(heap),
                Opcode::SetRecover => {
                    let target = fetch_u16!(unit, ip) as usize;
                    self.current_frame_mut().recover_ip = Some(target);
                    Ok(Flow::Normal)
                }
            };

            match result {
                Ok(Flow::Normal) => {}
                Ok(Flow::Reload) => reload_frame!(self, ip, unit, base),
                Ok(Flow::Halt) => break,
                Err(err) => {
                    self.sync_ip(ip);
                    self.handle_error(heap, err, unit.position_at(op_ip))?;
                    reload_frame!(self, ip, unit, base);
                }
            }

            if self.gc_interval >= 0 {
                if ticks >= self.gc_interval {
                    self.collect_garbage(heap, constants);
                    ticks = 0;
                } else {
                    ticks += 1;
                }
            }
        }
        Ok(())
    }

    // ----- operator execution -----

    fn binary_op(
        &mut self,
        heap: &mut Heap,
        stdout: &mut dyn StdoutWriter,
        op: Opcode,
    ) -> RunResult<Flow> {
        let right = self.pop()?;
        let left = self.pop()?;

        if left.is_numeric() && right.is_numeric() {
            let result = ops::numeric_binary(op, left.coerced_number(), right.coerced_number());
            self.push(Value::Number(result))?;
            return Ok(Flow::Normal);
        }

        if op == Opcode::Add {
            // concatenation; error operands contribute their message, so
            // recovered errors compose directly into strings
            let text = |v: Value| {
                heap.as_str(v)
                    .or_else(|| heap.as_error(v).map(|e| e.message.as_str()))
            };
            let concatenated = if heap.as_str(left).is_some() || heap.as_str(right).is_some() {
                match (text(left), text(right)) {
                    (Some(l), Some(r)) => Some(format!("{l}{r}")),
                    _ => None,
                }
            } else {
                None
            };
            if let Some(s) = concatenated {
                let value = heap.alloc_string(s);
                self.push(value)?;
                return Ok(Flow::Normal);
            }
        }

        if self.try_overload(heap, stdout, left, right, op)? {
            return Ok(Flow::Reload);
        }

        Err(RunError::new(format!(
            "Invalid operand types for {}, got {} and {}",
            op.name(),
            left.type_name(heap),
            right.type_name(heap)
        )))
    }

    fn unary_op(
        &mut self,
        heap: &mut Heap,
        stdout: &mut dyn StdoutWriter,
        op: Opcode,
    ) -> RunResult<Flow> {
        let operand = self.pop()?;
        if op == Opcode::Minus {
            if let Value::Number(n) = operand {
                self.push(Value::Number(-n))?;
                return Ok(Flow::Normal);
            }
        } else {
            match operand {
                Value::Bool(b) => {
                    self.push(Value::Bool(!b))?;
                    return Ok(Flow::Normal);
                }
                Value::Null => {
                    self.push(Value::Bool(true))?;
                    return Ok(Flow::Normal);
                }
                _ => {}
            }
        }

        if self.try_overload(heap, stdout, operand, Value::Null, op)? {
            return Ok(Flow::Reload);
        }

        if op == Opcode::Minus {
            Err(RunError::new(format!(
                "Invalid operand type for MINUS, got {}",
                operand.type_name(heap)
            )))
        } else {
            // `!` on any remaining value is simply false
            self.push(Value::Bool(false))?;
            Ok(Flow::Normal)
        }
    }

    fn compare_op(&mut self, heap: &mut Heap, stdout: &mut dyn StdoutWriter) -> RunResult<Flow> {
        let right = self.pop()?;
        let left = self.pop()?;
        if self.try_overload(heap, stdout, left, right, Opcode::Compare)? {
            return Ok(Flow::Reload);
        }
        self.push(Value::Number(compare(left, right, heap)))?;
        Ok(Flow::Normal)
    }

    /// Looks up the operator's magic key on a map operand (left first) and
    /// calls it in place of the built-in behavior. Returns whether an
    /// overload was found and invoked.
    fn try_overload(
        &mut self,
        heap: &mut Heap,
        stdout: &mut dyn StdoutWriter,
        left: Value,
        right: Value,
        op: Opcode,
    ) -> RunResult<bool> {
        let Some(key) = ops::overload_key(op) else {
            return Ok(false);
        };
        let num_operands = if matches!(op, Opcode::Minus | Opcode::Bang) {
            1
        } else {
            2
        };

        let mut callee = Value::Null;
        if let Some(map) = heap.as_map(left) {
            callee = map.get_str(key).unwrap_or(Value::Null);
        }
        if !callee.is_callable(heap) {
            if let Some(map) = heap.as_map(right) {
                callee = map.get_str(key).unwrap_or(Value::Null);
            }
        }
        if !callee.is_callable(heap) {
            return Ok(false);
        }

        self.push(callee)?;
        self.push(left)?;
        if num_operands == 2 {
            self.push(right)?;
        }
        self.call_object(heap, stdout, callee, num_operands)?;
        Ok(true)
    }

    // ----- indexing -----

    fn exec_get_index(&mut self, heap: &mut Heap) -> RunResult<Flow> {
        let index = self.pop()?;
        let left = self.pop()?;
        let value = ops::get_index(heap, left, index)?;
        self.push(value)?;
        Ok(Flow::Normal)
    }

    fn exec_get_value_at(&mut self, heap: &mut Heap) -> RunResult<Flow> {
        let index = self.pop()?;
        let left = self.pop()?;
        let value = ops::get_value_at(heap, left, index)?;
        self.push(value)?;
        Ok(Flow::Normal)
    }

    fn exec_set_index(&mut self, heap: &mut Heap) -> RunResult<Flow> {
        let index = self.pop()?;
        let left = self.pop()?;
        let new_value = self.pop()?;
        ops::set_index(heap, left, index, new_value)?;
        Ok(Flow::Normal)
    }

    fn exec_len(&mut self, heap: &mut Heap) -> RunResult<Flow> {
        let value = self.pop()?;
        let length = match value {
            Value::Ref(id) => match heap.get(id) {
                HeapData::Array(items) => Some(items.len()),
                HeapData::Map(map) => Some(map.len()),
                HeapData::Str(s) => Some(s.chars().count()),
                _ => None,
            },
            _ => None,
        };
        match length {
            Some(length) => {
                self.push(Value::Number(length as f64))?;
                Ok(Flow::Normal)
            }
            None => Err(RunError::new(format!(
                "Cannot get length of {}",
                value.type_name(heap)
            ))),
        }
    }

    fn exec_call(
        &mut self,
        heap: &mut Heap,
        stdout: &mut dyn StdoutWriter,
        num_args: usize,
    ) -> RunResult<Flow> {
        let callee = self.get(num_args)?;
        self.call_object(heap, stdout, callee, num_args)?;
        Ok(Flow::Reload)
    }

    fn exec_return_value(&mut self) -> RunResult<Flow> {
        let result = self.pop()?;
        if self.pop_frame() {
            self.push(result)?;
            Ok(Flow::Reload)
        } else {
            Ok(Flow::Halt)
        }
    }

    fn exec_return(&mut self) -> RunResult<Flow> {
        let has_more = self.pop_frame();
        self.push(Value::Null)?;
        if has_more {
            Ok(Flow::Reload)
        } else {
            self.pop()?;
            Ok(Flow::Halt)
        }
    }

    fn finish_map_literal(&mut self, heap: &mut Heap, count: usize) -> RunResult<()> {
        let map = self.this_pop()?;
        let start = self.stack.len() - count;
        let mut entries = Vec::with_capacity(count / 2);
        for pair in self.stack[start..].chunks(2) {
            let Some(key) = MapKey::from_value(pair[0], heap) else {
                return Err(RunError::new(format!(
                    "Key of type {} is not hashable",
                    pair[0].type_name(heap)
                )));
            };
            entries.push((key, pair[1]));
        }
        self.stack.truncate(start);
        let target = heap.as_map_mut(map).expect("map literal under construction");
        for (key, value) in entries {
            target.insert(key, value);
        }
        self.push(map)
    }

    // ----- calls -----

    fn call_object(
        &mut self,
        heap: &mut Heap,
        stdout: &mut dyn StdoutWriter,
        callee: Value,
        num_args: usize,
    ) -> RunResult<()> {
        if let Some(function) = heap.as_function(callee) {
            let expected = function.num_args as usize;
            if num_args != expected {
                return Err(RunError::new(format!(
                    "Invalid number of arguments to \"{}\", expected {expected}, got {num_args}",
                    function.name_or_anonymous()
                )));
            }
            let unit = Rc::clone(&function.unit);
            let num_locals = function.num_locals as usize;
            let base_pointer = self.stack.len() - num_args;
            self.push_frame(Frame::new(callee, unit, base_pointer, num_locals))
        } else if heap.as_native(callee).is_some() {
            let position = self.current_position();
            let args: SmallVec<[Value; 8]> = self.stack[self.stack.len() - num_args..]
                .iter()
                .copied()
                .collect();
            let result = self.call_native(heap, stdout, callee, position, &args)?;
            self.stack.truncate(self.stack.len() - num_args - 1);
            self.push(result)
        } else {
            Err(RunError::new(format!(
                "{} object is not callable",
                callee.type_name(heap)
            )))
        }
    }

    fn call_native(
        &mut self,
        heap: &mut Heap,
        stdout: &mut dyn StdoutWriter,
        callee: Value,
        position: Position,
        args: &[Value],
    ) -> RunResult<Value> {
        let native = heap.as_native(callee).cloned().expect("native callee");
        let result = {
            let mut ctx = NativeCtx {
                heap: &mut *heap,
                stdout: &mut *stdout,
            };
            (native.func)(&mut ctx, args)
        };
        match result {
            Err(mut err) => {
                // `crash` raises as if from script code; every other native
                // error is annotated with the callee
                if &*native.name != "crash" {
                    err.position = position;
                    let mut traceback = Traceback::new();
                    traceback.append(&*native.name, Position::invalid());
                    err.traceback = Some(traceback);
                }
                Err(err)
            }
            Ok(value) => {
                if heap.as_error(value).is_some() {
                    let mut traceback = Traceback::new();
                    // the `error` builtin's own frame is not interesting
                    if &*native.name != "error" {
                        traceback.append(&*native.name, Position::invalid());
                    }
                    self.frames_traceback(heap, &mut traceback);
                    if let Value::Ref(id) = value
                        && let HeapData::Error(err) = heap.get_mut(id)
                    {
                        err.traceback = Some(traceback);
                    }
                }
                Ok(value)
            }
        }
    }

    fn build_closure(
        &mut self,
        heap: &mut Heap,
        constants: &[Value],
        constant_ix: usize,
        num_free: usize,
    ) -> RunResult<()> {
        let Some(constant) = constants.get(constant_ix).copied() else {
            return Err(RunError::new(format!("Constant {constant_ix} not found")));
        };
        let Some(prototype) = heap.as_function(constant) else {
            return Err(RunError::new(format!(
                "{} is not a function",
                constant.type_name(heap)
            )));
        };
        let mut function = prototype.clone();
        let start = self.stack.len() - num_free;
        function.free = self.stack[start..].iter().copied().collect();
        self.stack.truncate(start);
        let closure = heap.alloc_function(function);
        self.push(closure)
    }

    // ----- error handling -----

    /// Routes a runtime error to the innermost armed recover frame, or
    /// converts it to an engine error when none exists.
    fn handle_error(
        &mut self,
        heap: &mut Heap,
        mut err: RunError,
        op_position: Position,
    ) -> Result<(), EngineError> {
        if !err.position.is_valid() {
            err.position = op_position;
        }

        let recover_ix = self
            .frames
            .iter()
            .rposition(|f| f.recover_ip.is_some() && !f.is_recovering);
        let Some(recover_ix) = recover_ix else {
            return Err(self.escape_error(heap, err));
        };

        let mut traceback = err.traceback.take().unwrap_or_default();
        self.frames_traceback(heap, &mut traceback);

        while self.frames.len() > recover_ix + 1 {
            self.pop_frame();
        }

        let error_value = heap.alloc_error(err.message, Some(traceback));
        self.push(error_value)
            .map_err(|overflow| self.escape_error(heap, overflow))?;

        let frame = self.frames.last_mut().expect("recover frame");
        frame.ip = frame.recover_ip.expect("armed recover frame");
        frame.is_recovering = true;
        Ok(())
    }

    /// Finalizes an unrecovered runtime error with a frame-stack traceback.
    fn escape_error(&self, heap: &Heap, mut err: RunError) -> EngineError {
        let mut traceback = err.traceback.take().unwrap_or_default();
        self.frames_traceback(heap, &mut traceback);
        EngineError {
            kind: ErrorKind::Runtime,
            message: err.message,
            position: err.position,
            traceback: Some(traceback),
        }
    }

    fn frames_traceback(&self, heap: &Heap, traceback: &mut Traceback) {
        for frame in self.frames.iter().rev() {
            let name = heap
                .as_function(frame.function)
                .map_or_else(|| "?".to_owned(), |f| f.name_or_anonymous().to_owned());
            traceback.append(name, frame.unit.position_at(frame.ip));
        }
    }

    // ----- stack and frame plumbing -----

    fn push(&mut self, value: Value) -> RunResult<()> {
        if self.stack.len() >= VALUE_STACK_SIZE {
            return Err(RunError::new("Stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> RunResult<Value> {
        match self.stack.pop() {
            Some(value) => {
                self.last_popped = value;
                Ok(value)
            }
            None => Err(RunError::new("Stack underflow")),
        }
    }

    fn get(&self, nth: usize) -> RunResult<Value> {
        let len = self.stack.len();
        if nth >= len {
            return Err(RunError::new(format!("Invalid stack index: {nth}")));
        }
        Ok(self.stack[len - 1 - nth])
    }

    fn this_push(&mut self, value: Value) -> RunResult<()> {
        if self.this_stack.len() >= THIS_STACK_SIZE {
            return Err(RunError::new("this stack overflow"));
        }
        self.this_stack.push(value);
        Ok(())
    }

    fn this_pop(&mut self) -> RunResult<Value> {
        self.this_stack
            .pop()
            .ok_or_else(|| RunError::new("this stack underflow"))
    }

    fn this_top(&self) -> RunResult<Value> {
        self.this_stack
            .last()
            .copied()
            .ok_or_else(|| RunError::new("this stack underflow"))
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("VM has no active frame")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("VM has no active frame")
    }

    fn current_position(&self) -> Position {
        self.frames
            .last()
            .map_or_else(Position::invalid, |f| f.unit.position_at(f.ip))
    }

    fn sync_ip(&mut self, ip: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = ip;
        }
    }

    fn push_frame(&mut self, frame: Frame) -> RunResult<()> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(RunError::new("Pushing frame failed in call_object"));
        }
        let target_sp = frame.base_pointer + frame.num_locals;
        if target_sp > VALUE_STACK_SIZE {
            return Err(RunError::new("Stack overflow"));
        }
        // local slots beyond the arguments start out null
        while self.stack.len() < target_sp {
            self.stack.push(Value::Null);
        }
        self.frames.push(frame);
        Ok(())
    }

    fn pop_frame(&mut self) -> bool {
        if let Some(frame) = self.frames.pop() {
            self.stack.truncate(frame.base_pointer.saturating_sub(1));
        }
        !self.frames.is_empty()
    }

    // ----- garbage collection -----

    /// Runs a full collection over every VM root: constants, the native
    /// registry, live globals, frame functions, both stacks and the
    /// last-popped value. Pinned records are handled by the heap itself.
    fn collect_garbage(&self, heap: &mut Heap, constants: &[Value]) {
        let roots = constants
            .iter()
            .copied()
            .chain(self.native_functions.iter().copied())
            .chain(self.globals[..self.globals_count].iter().copied())
            .chain(self.frames.iter().map(|f| f.function))
            .chain(self.stack.iter().copied())
            .chain(self.this_stack.iter().copied())
            .chain(std::iter::once(self.last_popped));
        heap.collect(roots);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Variables keep their type: assignment requires the old and new values to
/// have matching types unless either side is null.
fn check_assign(heap: &Heap, old_value: Value, new_value: Value) -> RunResult<()> {
    let old_kind = old_value.kind(heap);
    let new_kind = new_value.kind(heap);
    if old_kind == ValueKind::Null || new_kind == ValueKind::Null {
        return Ok(());
    }
    if old_kind != new_kind {
        return Err(RunError::new(format!(
            "Trying to assign variable of type {} to {}",
            new_kind.name(),
            old_kind.name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeBuilder;
    use crate::io::CollectString;

    fn run_unit(build: impl FnOnce(&mut CodeBuilder)) -> (Vm, Heap, Value) {
        let mut builder = CodeBuilder::new();
        build(&mut builder);
        let unit = Rc::new(builder.build());
        let mut vm = Vm::new();
        let mut heap = Heap::new();
        let mut stdout = CollectString::new();
        vm.run_program(&mut heap, &[], &mut stdout, &unit)
            .expect("run failed");
        let result = vm.last_popped();
        (vm, heap, result)
    }

    #[test]
    fn arithmetic_leaves_stack_empty() {
        let pos = Position::invalid();
        let (vm, _heap, result) = run_unit(|b| {
            b.emit_u64(Opcode::Number, 2.0_f64.to_bits(), &pos);
            b.emit_u64(Opcode::Number, 3.0_f64.to_bits(), &pos);
            b.emit(Opcode::Add, &pos);
            b.emit(Opcode::Pop, &pos);
        });
        assert_eq!(result, Value::Number(5.0));
        assert_eq!(vm.stack_len(), 0);
    }

    #[test]
    fn compare_then_specialize() {
        let pos = Position::invalid();
        // 3 > 2: push 3, push 2, COMPARE, GREATER_THAN
        let (_vm, _heap, result) = run_unit(|b| {
            b.emit_u64(Opcode::Number, 3.0_f64.to_bits(), &pos);
            b.emit_u64(Opcode::Number, 2.0_f64.to_bits(), &pos);
            b.emit(Opcode::Compare, &pos);
            b.emit(Opcode::GreaterThan, &pos);
            b.emit(Opcode::Pop, &pos);
        });
        assert_eq!(result, Value::Bool(true));
    }

    #[test]
    fn jump_if_false_takes_the_jump_on_null() {
        let pos = Position::invalid();
        let (_vm, _heap, result) = run_unit(|b| {
            b.emit(Opcode::Null, &pos);
            let jump = b.emit_jump(Opcode::JumpIfFalse, &pos);
            b.emit(Opcode::True, &pos);
            b.emit(Opcode::Pop, &pos);
            let target = b.ip();
            b.patch_u16(jump, target as u16);
            b.emit(Opcode::False, &pos);
            b.emit(Opcode::Pop, &pos);
        });
        assert_eq!(result, Value::Bool(false));
    }

    #[test]
    fn unrecovered_error_escapes_with_runtime_kind() {
        let pos = Position::invalid();
        let mut builder = CodeBuilder::new();
        // LEN on a number is a runtime error
        builder.emit_u64(Opcode::Number, 1.0_f64.to_bits(), &pos);
        builder.emit(Opcode::Len, &pos);
        builder.emit(Opcode::Pop, &pos);
        let unit = Rc::new(builder.build());
        let mut vm = Vm::new();
        let mut heap = Heap::new();
        let mut stdout = CollectString::new();
        let err = vm
            .run_program(&mut heap, &[], &mut stdout, &unit)
            .expect_err("expected runtime error");
        assert_eq!(err.kind, ErrorKind::Runtime);
        assert_eq!(err.message, "Cannot get length of NUMBER");
        let traceback = err.traceback.expect("traceback");
        assert_eq!(traceback.items[0].function_name, "main");
    }

    #[test]
    fn globals_persist_across_runs() {
        let pos = Position::invalid();
        let mut builder = CodeBuilder::new();
        builder.emit_u64(Opcode::Number, 7.0_f64.to_bits(), &pos);
        builder.emit_u16(Opcode::DefineGlobal, 0, &pos);
        let unit = Rc::new(builder.build());
        let mut vm = Vm::new();
        let mut heap = Heap::new();
        let mut stdout = CollectString::new();
        vm.run_program(&mut heap, &[], &mut stdout, &unit)
            .expect("first run");
        assert_eq!(vm.get_global(0), Value::Number(7.0));

        let mut builder = CodeBuilder::new();
        builder.emit_u16(Opcode::GetGlobal, 0, &pos);
        builder.emit(Opcode::Pop, &pos);
        let unit = Rc::new(builder.build());
        vm.run_program(&mut heap, &[], &mut stdout, &unit)
            .expect("second run");
        assert_eq!(vm.last_popped(), Value::Number(7.0));
    }

    #[test]
    fn type_checked_assignment() {
        let heap = Heap::new();
        assert!(check_assign(&heap, Value::Number(1.0), Value::Number(2.0)).is_ok());
        assert!(check_assign(&heap, Value::Null, Value::Number(2.0)).is_ok());
        assert!(check_assign(&heap, Value::Number(1.0), Value::Null).is_ok());
        let err = check_assign(&heap, Value::Number(1.0), Value::Bool(true))
            .expect_err("type mismatch");
        assert_eq!(
            err.message,
            "Trying to assign variable of type BOOL to NUMBER"
        );
    }
}
