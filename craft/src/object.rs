//! Heap-allocated object kinds.
//!
//! Every [`Obj`] carries a GC mark bit in its header; the variant payload
//! lives in [`ObjKind`]. [`ObjRef`] is the raw pointer wrapper stored inside
//! [`crate::value::Value::Obj`] — it is `Copy` so values can be pushed and
//! popped off the VM stack cheaply, the same way a tagged pointer would be
//! in the original C implementation.

use std::cell::{Cell, RefCell};
use std::fmt;

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

#[derive(Clone, Copy)]
pub struct ObjRef(pub *mut Obj);

impl ObjRef {
    pub fn get(&self) -> &Obj {
        // SAFETY: see `Value::as_obj`.
        unsafe { &*self.0 }
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

pub struct Obj {
    pub marked: Cell<bool>,
    pub kind: ObjKind,
}

impl Obj {
    pub fn new(kind: ObjKind) -> Obj {
        Obj { marked: Cell::new(false), kind }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ObjKind::String(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Native(_) => "native function",
            ObjKind::Closure(_) => "closure",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound method",
        }
    }

    pub fn as_string(&self) -> Option<&LoxString> {
        match &self.kind {
            ObjKind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match &self.kind {
            ObjKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Closure> {
        match &self.kind {
            ObjKind::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&Class> {
        match &self.kind {
            ObjKind::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&Instance> {
        match &self.kind {
            ObjKind::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method(&self) -> Option<&BoundMethod> {
        match &self.kind {
            ObjKind::BoundMethod(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&NativeFunction> {
        match &self.kind {
            ObjKind::Native(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&Upvalue> {
        match &self.kind {
            ObjKind::Upvalue(u) => Some(u),
            _ => None,
        }
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ObjKind::String(s) => write!(f, "{}", s.value),
            ObjKind::Function(func) => match &func.name {
                Some(name) => write!(f, "<fn {}>", name),
                None => write!(f, "<script>"),
            },
            ObjKind::Native(_) => write!(f, "<native fn>"),
            ObjKind::Closure(c) => match &c.function.get().as_function().unwrap().name {
                Some(name) => write!(f, "<fn {}>", name),
                None => write!(f, "<script>"),
            },
            ObjKind::Upvalue(_) => write!(f, "upvalue"),
            ObjKind::Class(c) => write!(f, "{}", c.name),
            ObjKind::Instance(i) => write!(f, "{} instance", i.class.get().as_class().unwrap().name),
            ObjKind::BoundMethod(b) => {
                let closure = b.method.get().as_closure().unwrap();
                match &closure.function.get().as_function().unwrap().name {
                    Some(name) => write!(f, "<fn {}>", name),
                    None => write!(f, "<script>"),
                }
            }
        }
    }
}

pub enum ObjKind {
    String(LoxString),
    Function(Function),
    Native(NativeFunction),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

/// Interned string: `hash` is computed once at construction (FNV-1a, see
/// [`crate::table`]) so every subsequent table lookup and equality check is
/// a single integer compare.
pub struct LoxString {
    pub value: String,
    pub hash: u32,
}

impl LoxString {
    pub fn new(value: String) -> LoxString {
        let hash = fnv1a_hash(value.as_bytes());
        LoxString { value, hash }
    }
}

pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

pub struct Function {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<String>,
}

impl Function {
    pub fn new(name: Option<String>) -> Function {
        Function {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

pub struct NativeFunction {
    pub name: &'static str,
    pub arity: usize,
    pub function: NativeFn,
}

/// An upvalue is open while it still points into a live stack slot, and
/// closed once the frame that owned that slot returns — at which point the
/// value is copied out of the stack and into `closed`, and `location`
/// becomes irrelevant. Represented as an enum rather than a raw pointer plus
/// sentinel, which is the idiomatic Rust rendition of the same state
/// machine the original's `next`-linked open-upvalue list encodes.
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

pub struct Class {
    pub name: String,
    pub methods: RefCell<Table>,
}

impl Class {
    pub fn new(name: String) -> Class {
        Class { name, methods: RefCell::new(Table::new()) }
    }
}

pub struct Instance {
    pub class: ObjRef,
    pub fields: RefCell<Table>,
}

impl Instance {
    pub fn new(class: ObjRef) -> Instance {
        Instance { class, fields: RefCell::new(Table::new()) }
    }
}

pub struct BoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}
