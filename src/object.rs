use std::cell::{Cell, RefCell};
use std::fmt;

use crate::chunk::Chunk;
use crate::gc::GcRef;
use crate::table::{fnv1a, Table};
use crate::value::Value;

/// Common header every heap object carries: a mark bit for the collector
/// and (for strings only — see `ObjKind::Str`) a cached content hash used
/// both as a table probe key and to dedupe against the interner.
pub struct Obj {
    pub marked: Cell<bool>,
    pub hash: u32,
    pub kind: ObjKind,
}

impl Obj {
    pub fn new(kind: ObjKind) -> Self {
        let hash = match &kind {
            ObjKind::Str(s) => fnv1a(s),
            _ => 0,
        };
        Self {
            marked: Cell::new(false),
            hash,
            kind,
        }
    }
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

#[derive(Clone, Copy)]
pub enum UpvalueState {
    /// Still shared with a live stack slot, indexed from the bottom of the
    /// value stack (not relative to any one frame, since the upvalue may
    /// outlive the frame that created it).
    Open(usize),
    Closed(Value),
}

pub struct Function {
    pub name: Option<GcRef<Obj>>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: Option<GcRef<Obj>>) -> Self {
        Self {
            name,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
        }
    }
}

pub struct Closure {
    pub function: GcRef<Obj>,
    pub upvalues: Vec<GcRef<Obj>>,
}

pub struct Class {
    pub name: GcRef<Obj>,
    pub methods: Table,
}

pub struct Instance {
    pub class: GcRef<Obj>,
    pub fields: Table,
}

#[derive(Clone, Copy)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: GcRef<Obj>,
}

pub enum ObjKind {
    Str(String),
    Function(Function),
    Upvalue(RefCell<UpvalueState>),
    Closure(Closure),
    Native(NativeFn),
    Class(RefCell<Class>),
    Instance(RefCell<Instance>),
    BoundMethod(BoundMethod),
}

impl GcRef<Obj> {
    pub fn as_str(&self) -> &str {
        match &self.kind {
            ObjKind::Str(s) => s.as_str(),
            _ => unreachable!("as_str called on a non-string object"),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ObjKind::Str(_) => "string",
            ObjKind::Function(_) => "function",
            ObjKind::Upvalue(_) => "upvalue",
            ObjKind::Closure(_) => "closure",
            ObjKind::Native(_) => "native fn",
            ObjKind::Class(_) => "class",
            ObjKind::Instance(_) => "instance",
            ObjKind::BoundMethod(_) => "bound method",
        }
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ObjKind::Str(s) => write!(f, "{s}"),
            ObjKind::Function(func) => match &func.name {
                Some(name) => write!(f, "<fn {}>", name.as_str()),
                None => write!(f, "<script>"),
            },
            ObjKind::Upvalue(_) => write!(f, "upvalue"),
            ObjKind::Closure(c) => {
                if let ObjKind::Function(func) = &c.function.kind {
                    match &func.name {
                        Some(name) => write!(f, "<fn {}>", name.as_str()),
                        None => write!(f, "<script>"),
                    }
                } else {
                    unreachable!("closure always wraps a function")
                }
            }
            ObjKind::Native(_) => write!(f, "<native fn>"),
            ObjKind::Class(c) => write!(f, "{}", c.borrow().name.as_str()),
            ObjKind::Instance(i) => {
                let instance = i.borrow();
                if let ObjKind::Class(c) = &instance.class.kind {
                    write!(f, "{} instance", c.borrow().name.as_str())
                } else {
                    unreachable!("instance always wraps a class")
                }
            }
            ObjKind::BoundMethod(b) => {
                if let ObjKind::Closure(c) = &b.method.kind {
                    if let ObjKind::Function(func) = &c.function.kind {
                        match &func.name {
                            Some(name) => return write!(f, "<fn {}>", name.as_str()),
                            None => return write!(f, "<script>"),
                        }
                    }
                }
                unreachable!("bound method always wraps a closure")
            }
        }
    }
}
