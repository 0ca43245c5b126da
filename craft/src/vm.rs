//! The stack-based bytecode interpreter.
//!
//! One [`Vm`] owns the value stack, the call-frame stack, the global
//! variable table, and the [`Heap`]. Every allocation the VM performs during
//! execution (string concatenation, closures, classes, instances, bound
//! methods) runs through [`Heap::maybe_collect`] first, passing a closure
//! that marks this VM's roots — exactly the same protocol the compiler uses
//! for its own mid-compile roots in [`crate::compiler`].

use std::fmt;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunk::OpCode;
use crate::compiler;
use crate::heap::Heap;
use crate::object::{
    BoundMethod, Class, Closure, Function, Instance, NativeFn, NativeFunction, ObjKind, ObjRef, Upvalue,
};
use crate::reporting::Location;
use crate::table::Table;
use crate::trace_interpreter;
use crate::trace_interpreter_stack;
use crate::value::Value;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    stack_base: usize,
}

impl CallFrame {
    fn function(&self) -> &Function {
        self.closure.get().as_closure().unwrap().function.get().as_function().unwrap()
    }
}

/// One line of a runtime error's stack trace, rendered top (innermost) first.
#[derive(Debug)]
pub struct StackTraceFrame {
    pub line: usize,
    pub name: String,
}

#[derive(Debug)]
pub enum RuntimeErrorType {
    TypeError(String),
    UndefinedVariable(String),
    UndefinedProperty(String),
    NotCallable,
    WrongArity { expected: usize, got: usize },
    StackOverflow,
    SetPropertyOnNonInstance,
    SuperclassMustBeClass,
    GetPropertyOnNonInstance,
    Native(String),
}

impl fmt::Display for RuntimeErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeErrorType::TypeError(m) => write!(f, "{}", m),
            RuntimeErrorType::UndefinedVariable(name) => write!(f, "Undefined variable '{}'.", name),
            RuntimeErrorType::UndefinedProperty(name) => write!(f, "Undefined property '{}'.", name),
            RuntimeErrorType::NotCallable => write!(f, "Can only call functions and classes."),
            RuntimeErrorType::WrongArity { expected, got } => write!(f, "Expected {} arguments but got {}.", expected, got),
            RuntimeErrorType::StackOverflow => write!(f, "Stack overflow."),
            RuntimeErrorType::SetPropertyOnNonInstance => write!(f, "Only instances have fields."),
            RuntimeErrorType::SuperclassMustBeClass => write!(f, "Superclass must be a class."),
            RuntimeErrorType::GetPropertyOnNonInstance => write!(f, "Only instances have properties."),
            RuntimeErrorType::Native(m) => write!(f, "{}", m),
        }
    }
}

#[derive(Debug)]
pub struct RuntimeError {
    pub error: RuntimeErrorType,
    pub location: Location,
    pub stack_trace: Vec<StackTraceFrame>,
}

#[derive(Debug)]
pub enum InterpretResult {
    Ok,
    CompileError(Vec<compiler::ParserError>),
    RuntimeError(RuntimeError),
}

/// Generic over the output sink so tests can capture printed output instead
/// of writing to real stdout, the same shape the teacher's own VM uses for
/// its `IO` parameter.
pub struct Vm<W: Write> {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    heap: Heap,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    out: W,
}

impl<W: Write> Vm<W> {
    pub fn new(out: W) -> Vm<W> {
        let mut heap = Heap::new();
        let init_string = heap.intern_string("init");
        let mut vm = Vm {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            heap,
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            out,
        };
        vm.define_native("clock", 0, native_clock);
        vm
    }

    pub fn into_output(self) -> W {
        self.out
    }

    pub fn output_mut(&mut self) -> &mut W {
        &mut self.out
    }

    fn define_native(&mut self, name: &'static str, arity: usize, function: NativeFn) {
        let obj = self.heap.alloc(ObjKind::Native(NativeFunction { name, arity, function }));
        let interned = self.heap.intern_string(name);
        self.globals.set(interned, Value::Obj(obj));
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let compiled = match compiler::compile(source, &mut self.heap) {
            Ok(function) => function,
            Err(errors) => return InterpretResult::CompileError(errors),
        };

        self.stack.push(Value::Obj(compiled));
        let closure_ref = self.alloc(ObjKind::Closure(Closure { function: compiled, upvalues: Vec::new() }));
        self.stack.pop();
        self.stack.push(Value::Obj(closure_ref));

        if let Err(err) = self.call(closure_ref, 0) {
            self.stack.clear();
            self.frames.clear();
            return InterpretResult::RuntimeError(err);
        }

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(err) => {
                self.stack.clear();
                self.frames.clear();
                InterpretResult::RuntimeError(err)
            }
        }
    }

    // ----- GC root marking -----

    /// Roots come from `stack`, `frames`, `open_upvalues`, `globals` and
    /// `init_string` — every field but `heap` itself. Borrowing those fields
    /// directly (rather than `self`) lets this closure run concurrently with
    /// the `&mut self.heap` borrow `collect_garbage` needs.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = &self.open_upvalues;
        let globals = &self.globals;
        let init_string = self.init_string;
        self.heap.collect_garbage(|heap| {
            for v in stack {
                heap.mark_value(*v);
            }
            for frame in frames {
                heap.mark_object(frame.closure);
            }
            for u in open_upvalues {
                heap.mark_object(*u);
            }
            let mut entries = Vec::new();
            globals.for_each(|k, v| entries.push((k, v)));
            for (k, v) in entries {
                heap.mark_object(k);
                heap.mark_value(v);
            }
            heap.mark_object(init_string);
        });
    }

    // ----- allocation helpers -----

    fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        self.maybe_collect();
        self.heap.alloc(kind)
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.intern_string(s)
    }

    // ----- the interpreter loop -----

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if cfg!(feature = "trace_interpreter") {
                let frame = self.frame();
                let mut line = Vec::new();
                crate::debug::disassemble_instruction(frame.function(), frame.ip, false, &mut line);
                trace_interpreter!("{}", line.join(""));
            }
            trace_interpreter_stack!("{:?}", self.stack.iter().map(|v| v.to_string()).collect::<Vec<_>>());

            let byte = self.read_byte();
            let op = OpCode::from_byte(byte);

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().stack_base;
                    self.push(self.stack[base + slot])?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().stack_base;
                    self.stack[base + slot] = *self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(v) => self.push(v)?,
                        None => return Err(self.runtime_error(RuntimeErrorType::UndefinedVariable(self.obj_name(name)))),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = *self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = *self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        return Err(self.runtime_error(RuntimeErrorType::UndefinedVariable(self.obj_name(name))));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue_ref = self.frame().closure.get().as_closure().unwrap().upvalues[slot];
                    let value = self.read_upvalue(upvalue_ref);
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue_ref = self.frame().closure.get().as_closure().unwrap().upvalues[slot];
                    let value = *self.peek(0);
                    self.write_upvalue(upvalue_ref, value);
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = *self.peek(0);
                    let instance = match receiver.as_obj().and_then(|o| o.as_instance()) {
                        Some(i) => i,
                        None => return Err(self.runtime_error(RuntimeErrorType::GetPropertyOnNonInstance)),
                    };
                    let field = instance.fields.borrow().get(name);
                    if let Some(value) = field {
                        self.pop();
                        self.push(value)?;
                    } else {
                        let class = instance.class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let value = *self.peek(0);
                    let receiver = *self.peek(1);
                    let instance = match receiver.as_obj().and_then(|o| o.as_instance()) {
                        Some(i) => i,
                        None => return Err(self.runtime_error(RuntimeErrorType::SetPropertyOnNonInstance)),
                    };
                    instance.fields.borrow_mut().set(name, value);
                    self.pop();
                    self.pop();
                    self.push(value)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let class_ref = match self.pop() {
                        Value::Obj(r) => r,
                        _ => unreachable!("superclass operand is always a class object"),
                    };
                    self.bind_method(class_ref, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number(|a, b| a - b)?,
                OpCode::Multiply => self.binary_number(|a, b| a * b)?,
                OpCode::Divide => self.binary_number(|a, b| a / b)?,
                OpCode::Exponent => self.binary_number(|a, b| a.powf(b))?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()))?;
                }
                OpCode::Negate => {
                    let v = *self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n))?;
                        }
                        None => return Err(self.runtime_error(RuntimeErrorType::TypeError("Operand must be a number.".to_string()))),
                    }
                }
                OpCode::Print => {
                    let v = self.pop();
                    writeln!(self.out, "{}", v).ok();
                }
                OpCode::Jump => {
                    let offset = self.read_short();
                    self.frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    self.frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = *self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop();
                    let class_ref = match superclass {
                        Value::Obj(r) => r,
                        _ => unreachable!(),
                    };
                    self.invoke_from_class(class_ref, name, argc)?;
                }
                OpCode::Closure => {
                    let function_value = self.read_constant();
                    let function_ref = match function_value {
                        Value::Obj(r) => r,
                        _ => unreachable!("closure operand is always a function constant"),
                    };
                    let upvalue_count = function_ref.get().as_function().unwrap().upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frame().stack_base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let enclosing = self.frame().closure.get().as_closure().unwrap();
                            upvalues.push(enclosing.upvalues[index]);
                        }
                    }
                    let closure_ref = self.alloc(ObjKind::Closure(Closure { function: function_ref, upvalues }));
                    self.push(Value::Obj(closure_ref))?;
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.stack_base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.stack_base);
                    self.push(result)?;
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class_name = self.obj_name(name);
                    let class_ref = self.alloc(ObjKind::Class(Class::new(class_name)));
                    self.push(Value::Obj(class_ref))?;
                }
                OpCode::Inherit => {
                    let superclass = *self.peek(1);
                    let super_class = match superclass.as_obj().and_then(|o| o.as_class()) {
                        Some(c) => c,
                        None => return Err(self.runtime_error(RuntimeErrorType::SuperclassMustBeClass)),
                    };
                    let subclass = self.peek(0).as_obj().unwrap().as_class().unwrap();
                    let mut entries = Vec::new();
                    super_class.methods.borrow().for_each(|k, v| entries.push((k, v)));
                    for (k, v) in entries {
                        subclass.methods.borrow_mut().set(k, v);
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = *self.peek(0);
                    let class_value = *self.peek(1);
                    let class = class_value.as_obj().unwrap().as_class().unwrap();
                    class.methods.borrow_mut().set(name, method);
                    self.pop();
                }
            }
        }
    }

    // ----- stack helpers -----

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error(RuntimeErrorType::StackOverflow));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow indicates a compiler bug")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.closure.get().as_closure().unwrap().function.get().as_function().unwrap().chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.frame().function().chunk.constants[index]
    }

    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("string operand is always interned by the compiler"),
        }
    }

    fn obj_name(&self, obj: ObjRef) -> String {
        obj.get().as_string().map(|s| s.value.clone()).unwrap_or_default()
    }

    // ----- arithmetic -----

    fn binary_number(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = *self.peek(0);
        let a = *self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(f(a, b)))
            }
            _ => Err(self.runtime_error(RuntimeErrorType::TypeError("Operands must be numbers.".to_string()))),
        }
    }

    fn binary_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = *self.peek(0);
        let a = *self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Bool(f(a, b)))
            }
            _ => Err(self.runtime_error(RuntimeErrorType::TypeError("Operands must be numbers.".to_string()))),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = *self.peek(0);
        let a = *self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                return self.push(Value::Number(a + b));
            }
            _ => {}
        }
        let a_str = a.as_obj().and_then(|o| o.as_string());
        let b_str = b.as_obj().and_then(|o| o.as_string());
        if let (Some(a_str), Some(b_str)) = (a_str, b_str) {
            let mut joined = String::with_capacity(a_str.value.len() + b_str.value.len());
            joined.push_str(&a_str.value);
            joined.push_str(&b_str.value);
            self.pop();
            self.pop();
            let interned = self.intern(&joined);
            return self.push(Value::Obj(interned));
        }
        Err(self.runtime_error(RuntimeErrorType::TypeError("Operands must be two numbers or two strings.".to_string())))
    }

    // ----- calls -----

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        if let Value::Obj(obj) = callee {
            match &obj.get().kind {
                ObjKind::Closure(_) => return self.call(obj, argc),
                ObjKind::Native(native) => {
                    let native = NativeFunction { name: native.name, arity: native.arity, function: native.function };
                    return self.call_native(native, argc);
                }
                ObjKind::Class(_) => {
                    let instance_ref = self.alloc(ObjKind::Instance(Instance::new(obj)));
                    let base = self.stack.len() - argc - 1;
                    self.stack[base] = Value::Obj(instance_ref);
                    let class = obj.get().as_class().unwrap();
                    if let Some(init) = class.methods.borrow().get(self.init_string) {
                        let init_ref = match init {
                            Value::Obj(r) => r,
                            _ => unreachable!(),
                        };
                        return self.call(init_ref, argc);
                    } else if argc != 0 {
                        return Err(self.runtime_error(RuntimeErrorType::WrongArity { expected: 0, got: argc }));
                    }
                    return Ok(());
                }
                ObjKind::BoundMethod(bound) => {
                    let bound = BoundMethod { receiver: bound.receiver, method: bound.method };
                    let base = self.stack.len() - argc - 1;
                    self.stack[base] = bound.receiver;
                    return self.call(bound.method, argc);
                }
                _ => {}
            }
        }
        Err(self.runtime_error(RuntimeErrorType::NotCallable))
    }

    /// Unlike closures, native arity is not validated here — `clock` simply
    /// ignores extra arguments, matching the original's native-call path.
    fn call_native(&mut self, native: NativeFunction, argc: usize) -> Result<(), RuntimeError> {
        let start = self.stack.len() - argc;
        let result = (native.function)(&self.stack[start..]);
        self.stack.truncate(start - 1);
        match result {
            Ok(value) => self.push(value),
            Err(message) => Err(self.runtime_error(RuntimeErrorType::Native(message))),
        }
    }

    fn call(&mut self, closure_ref: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let arity = closure_ref.get().as_closure().unwrap().function.get().as_function().unwrap().arity;
        if argc != arity {
            return Err(self.runtime_error(RuntimeErrorType::WrongArity { expected: arity, got: argc }));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error(RuntimeErrorType::StackOverflow));
        }
        let stack_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, stack_base });
        Ok(())
    }

    fn invoke(&mut self, name: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let receiver = *self.peek(argc);
        let instance = match receiver.as_obj().and_then(|o| o.as_instance()) {
            Some(i) => i,
            None => return Err(self.runtime_error(RuntimeErrorType::GetPropertyOnNonInstance)),
        };
        if let Some(value) = instance.fields.borrow().get(name) {
            let base = self.stack.len() - argc - 1;
            self.stack[base] = value;
            return self.call_value(value, argc);
        }
        let class = instance.class;
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(&mut self, class_ref: ObjRef, name: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let class = class_ref.get().as_class().unwrap();
        let method = class.methods.borrow().get(name);
        match method {
            Some(Value::Obj(method_ref)) => self.call(method_ref, argc),
            _ => Err(self.runtime_error(RuntimeErrorType::UndefinedProperty(self.obj_name(name)))),
        }
    }

    fn bind_method(&mut self, class_ref: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let class = class_ref.get().as_class().unwrap();
        let method = class.methods.borrow().get(name);
        let method_ref = match method {
            Some(Value::Obj(r)) => r,
            _ => return Err(self.runtime_error(RuntimeErrorType::UndefinedProperty(self.obj_name(name)))),
        };
        let receiver = self.pop();
        let bound_ref = self.alloc(ObjKind::BoundMethod(BoundMethod { receiver, method: method_ref }));
        self.push(Value::Obj(bound_ref))
    }

    // ----- upvalues -----

    /// Maintains `open_upvalues` in strictly-decreasing stack-slot order,
    /// mirroring the original's sorted linked list — insertion and lookup
    /// both rely on that invariant.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        if let Some(existing) = self.open_upvalues.iter().find(|u| matches!(u.get().as_upvalue(), Some(Upvalue::Open(s)) if *s == slot)) {
            return *existing;
        }
        let upvalue_ref = self.alloc(ObjKind::Upvalue(Upvalue::Open(slot)));
        let position = self.open_upvalues.iter().position(|u| match u.get().as_upvalue() {
            Some(Upvalue::Open(s)) => *s < slot,
            _ => false,
        });
        match position {
            Some(i) => self.open_upvalues.insert(i, upvalue_ref),
            None => self.open_upvalues.push(upvalue_ref),
        }
        upvalue_ref
    }

    fn read_upvalue(&self, upvalue_ref: ObjRef) -> Value {
        match upvalue_ref.get().as_upvalue().unwrap() {
            Upvalue::Open(slot) => self.stack[*slot],
            Upvalue::Closed(value) => *value,
        }
    }

    fn write_upvalue(&mut self, upvalue_ref: ObjRef, value: Value) {
        match upvalue_ref.get().as_upvalue().unwrap() {
            Upvalue::Open(slot) => self.stack[*slot] = value,
            Upvalue::Closed(_) => {
                // SAFETY: `kind` is not behind a `Cell`, but closing an
                // upvalue only ever narrows `Open` to `Closed`; no live
                // reference to the old payload survives this write.
                unsafe {
                    (*upvalue_ref.0).kind = ObjKind::Upvalue(Upvalue::Closed(value));
                }
            }
        }
    }

    /// Closes every open upvalue pointing at or above `threshold`, copying
    /// the stack value into the upvalue itself before the frame that owns
    /// that slot goes away.
    fn close_upvalues(&mut self, threshold: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let upvalue_ref = self.open_upvalues[i];
            let slot = match upvalue_ref.get().as_upvalue().unwrap() {
                Upvalue::Open(s) => *s,
                Upvalue::Closed(_) => {
                    i += 1;
                    continue;
                }
            };
            if slot < threshold {
                i += 1;
                continue;
            }
            let value = self.stack[slot];
            unsafe {
                (*upvalue_ref.0).kind = ObjKind::Upvalue(Upvalue::Closed(value));
            }
            self.open_upvalues.remove(i);
        }
    }

    // ----- errors -----

    fn runtime_error(&self, error: RuntimeErrorType) -> RuntimeError {
        let mut stack_trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = frame.closure.get().as_closure().unwrap().function.get().as_function().unwrap();
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let name = function.name.clone().unwrap_or_else(|| "script".to_string());
            stack_trace.push(StackTraceFrame { line, name });
        }
        let location = stack_trace.first().map(|f| Location::new(f.line)).unwrap_or(Location::new(0));
        RuntimeError { error, location, stack_trace }
    }
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| e.to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_str(source: &str) -> (InterpretResult, String) {
        let buf: Vec<u8> = Vec::new();
        let mut vm = Vm::new(buf);
        let result = vm.interpret(source);
        let out = vm.into_output();
        (result, String::from_utf8(out).unwrap())
    }

    fn assert_ok_output(source: &str, expected: &str) {
        let (result, output) = run_str(source);
        assert!(matches!(result, InterpretResult::Ok), "expected Ok, program: {}", source);
        assert_eq!(output, expected);
    }

    #[test]
    fn test_arithmetic() {
        assert_ok_output("print 1 + 2 * 3;", "7\n");
    }

    #[test]
    fn test_string_concat() {
        assert_ok_output("print \"foo\" + \"bar\";", "foobar\n");
    }

    #[test]
    fn test_global_variables() {
        assert_ok_output("var x = 10; x = x + 1; print x;", "11\n");
    }

    #[test]
    fn test_if_else() {
        assert_ok_output("if (1 < 2) { print \"yes\"; } else { print \"no\"; }", "yes\n");
    }

    #[test]
    fn test_while_loop() {
        assert_ok_output("var i = 0; while (i < 3) { print i; i = i + 1; }", "0\n1\n2\n");
    }

    #[test]
    fn test_for_loop() {
        assert_ok_output("for (var i = 0; i < 3; i = i + 1) { print i; }", "0\n1\n2\n");
    }

    #[test]
    fn test_functions_and_closures() {
        let source = r#"
            fun makeCounter() {
                var i = 0;
                fun count() {
                    i = i + 1;
                    print i;
                }
                return count;
            }
            var counter = makeCounter();
            counter();
            counter();
        "#;
        assert_ok_output(source, "1\n2\n");
    }

    #[test]
    fn test_classes_and_methods() {
        let source = r#"
            class Counter {
                init() { this.count = 0; }
                increment() { this.count = this.count + 1; return this.count; }
            }
            var c = Counter();
            print c.increment();
            print c.increment();
        "#;
        assert_ok_output(source, "1\n2\n");
    }

    #[test]
    fn test_inheritance_and_super() {
        let source = r#"
            class Animal {
                speak() { print "..."; }
            }
            class Dog < Animal {
                speak() {
                    super.speak();
                    print "Woof";
                }
            }
            Dog().speak();
        "#;
        assert_ok_output(source, "...\nWoof\n");
    }

    #[test]
    fn test_undefined_variable_is_runtime_error() {
        let (result, _) = run_str("print x;");
        assert!(matches!(result, InterpretResult::RuntimeError(_)));
    }

    #[test]
    fn test_compile_error_reported() {
        let (result, _) = run_str("var = 1;");
        assert!(matches!(result, InterpretResult::CompileError(_)));
    }

    #[test]
    fn test_recursive_fibonacci() {
        let source = r#"
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 1) + fib(n - 2);
            }
            print fib(10);
        "#;
        assert_ok_output(source, "55\n");
    }
}
