//! The stack-based virtual machine: a fetch-dispatch loop over a `Chunk`'s
//! byte stream, a value stack, a call-frame stack, and the runtime half of
//! closures/upvalues/classes. Dispatch is a plain `match` over `OpCode` —
//! the teacher's own bytecode VM dispatches the same way, and the technique
//! is unobservable from outside the VM regardless.

use std::cell::RefCell;
use std::io::Write;

use crate::chunk::OpCode;
use crate::error::{Backtrace, RuntimeError};
use crate::gc::{GcRef, GcRoots, Heap};
use crate::natives;
use crate::object::{BoundMethod, Class, Closure, Instance, Obj, ObjKind, UpvalueState};
use crate::table::Table;
use crate::value::Value;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: GcRef<Obj>,
    ip: usize,
    slots_base: usize,
}

/// Runs `f` with a borrow of the `Function` a closure wraps. Every access to
/// a heap object's payload goes through a scope like this one instead of
/// returning a long-lived reference: `GcRef::deref`'s lifetime is tied to
/// the borrow of the (`Copy`) handle passed in, not to the allocation it
/// points at, so nothing here ever outlives the closure call.
fn with_function<R>(closure: GcRef<Obj>, f: impl FnOnce(&crate::object::Function) -> R) -> R {
    match &closure.kind {
        ObjKind::Closure(c) => match &c.function.kind {
            ObjKind::Function(func) => f(func),
            _ => unreachable!("a closure always wraps a function"),
        },
        _ => unreachable!("with_function called on a non-closure"),
    }
}

fn closure_upvalue(closure: GcRef<Obj>, slot: usize) -> GcRef<Obj> {
    match &closure.kind {
        ObjKind::Closure(c) => c.upvalues[slot],
        _ => unreachable!("closure_upvalue called on a non-closure"),
    }
}

struct BootstrapRoots;
impl GcRoots for BootstrapRoots {
    fn mark_extra_roots(&self, _heap: &mut Heap) {}
}

/// Owns every runtime data structure: the value stack, the call-frame
/// stack, the globals table, the list of still-open upvalues, and the
/// interned `"init"` name used to recognize initializers. One `Vm` persists
/// across REPL lines so that globals (and the heap) survive between them.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<GcRef<Obj>>,
    init_string: GcRef<Obj>,
}

impl GcRoots for Vm {
    fn mark_extra_roots(&self, heap: &mut Heap) {
        for value in &self.stack {
            heap.mark_value(*value);
        }
        for frame in &self.frames {
            heap.mark_object(frame.closure);
        }
        for upvalue in &self.open_upvalues {
            heap.mark_object(*upvalue);
        }
        let globals: Vec<(GcRef<Obj>, Value)> = self.globals.iter_entries().collect();
        for (key, value) in globals {
            heap.mark_object(key);
            heap.mark_value(value);
        }
        heap.mark_object(self.init_string);
    }
}

impl Vm {
    pub fn new(heap: &mut Heap) -> Self {
        let init_string = heap.intern("init", &BootstrapRoots);
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
        };

        // Mirrors clox's `defineNative`: push the name and the fresh
        // native-fn value before inserting, so an allocation triggered by
        // either one can't collect the other out from under the insert.
        for (name, native) in natives::NATIVES {
            let name_obj = heap.intern(name, &vm);
            vm.push(Value::Obj(name_obj));
            let native_obj = heap.alloc(ObjKind::Native(*native), &vm);
            vm.push(Value::Obj(native_obj));
            vm.globals.insert(name_obj, Value::Obj(native_obj));
            vm.pop();
            vm.pop();
        }

        vm
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop on an empty value stack")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn read_byte(&mut self) -> u8 {
        let (closure, ip) = {
            let frame = self.frames.last().unwrap();
            (frame.closure, frame.ip)
        };
        let byte = with_function(closure, |f| f.chunk.code()[ip]);
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte();
        let closure = self.frames.last().unwrap().closure;
        with_function(closure, |f| f.chunk.constants()[idx as usize])
    }

    fn read_string(&mut self) -> GcRef<Obj> {
        match self.read_constant() {
            Value::Obj(o) => o,
            _ => unreachable!("identifier constants are always interned strings"),
        }
    }

    fn build_backtrace(&self) -> Backtrace {
        let mut backtrace = Backtrace::default();
        for frame in &self.frames {
            let (name, line) = with_function(frame.closure, |f| {
                let line = f.chunk.line_at(frame.ip.saturating_sub(1));
                (f.name.map(|n| n.as_str().to_string()), line)
            });
            backtrace.push(name, line);
        }
        backtrace
    }

    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::new(message.into(), self.build_backtrace())
    }

    /// Shares an already-open upvalue pointing at `stack_index`, or opens a
    /// new one. The list stays sorted by `location` descending (deepest
    /// slots first), matching the order the source's own open-upvalue list
    /// is kept in.
    fn capture_upvalue(&mut self, stack_index: usize, heap: &mut Heap) -> GcRef<Obj> {
        let mut insert_at = self.open_upvalues.len();
        for (i, upvalue) in self.open_upvalues.iter().enumerate() {
            let location = match &upvalue.kind {
                ObjKind::Upvalue(cell) => match *cell.borrow() {
                    UpvalueState::Open(idx) => idx,
                    UpvalueState::Closed(_) => unreachable!("open list holds only open upvalues"),
                },
                _ => unreachable!(),
            };
            if location == stack_index {
                return *upvalue;
            }
            if location < stack_index {
                insert_at = i;
                break;
            }
        }
        let upvalue = heap.alloc(
            ObjKind::Upvalue(RefCell::new(UpvalueState::Open(stack_index))),
            self,
        );
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `from`, lifting its value off
    /// the stack into its own `closed` field.
    fn close_upvalues(&mut self, from: usize) {
        let mut remaining = Vec::with_capacity(self.open_upvalues.len());
        for upvalue in self.open_upvalues.drain(..) {
            let location = match &upvalue.kind {
                ObjKind::Upvalue(cell) => match *cell.borrow() {
                    UpvalueState::Open(idx) => Some(idx),
                    UpvalueState::Closed(_) => None,
                },
                _ => unreachable!(),
            };
            match location {
                Some(idx) if idx >= from => {
                    let value = self.stack[idx];
                    if let ObjKind::Upvalue(cell) = &upvalue.kind {
                        *cell.borrow_mut() = UpvalueState::Closed(value);
                    }
                }
                _ => remaining.push(upvalue),
            }
        }
        self.open_upvalues = remaining;
    }

    fn call_closure(&mut self, closure: GcRef<Obj>, argc: usize) -> Result<(), String> {
        let arity = with_function(closure, |f| f.arity) as usize;
        if argc != arity {
            return Err(format!("Expected {arity} arguments but got {argc}."));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let slots_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots_base,
        });
        Ok(())
    }

    fn bind_method(
        &mut self,
        receiver: GcRef<Obj>,
        class: GcRef<Obj>,
        name: GcRef<Obj>,
        heap: &mut Heap,
    ) -> Result<(), String> {
        let method = match &class.kind {
            ObjKind::Class(cell) => cell.borrow().methods.get(name),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(method)) => {
                let bound = heap.alloc(
                    ObjKind::BoundMethod(BoundMethod {
                        receiver: Value::Obj(receiver),
                        method,
                    }),
                    self,
                );
                self.pop();
                self.push(Value::Obj(bound));
                Ok(())
            }
            _ => Err(format!("Undefined property '{}'.", name.as_str())),
        }
    }

    fn invoke_from_class(&mut self, class: GcRef<Obj>, name: GcRef<Obj>, argc: usize) -> Result<(), String> {
        let method = match &class.kind {
            ObjKind::Class(cell) => cell.borrow().methods.get(name),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(closure)) => self.call_closure(closure, argc),
            _ => Err(format!("Undefined property '{}'.", name.as_str())),
        }
    }

    fn invoke(&mut self, name: GcRef<Obj>, argc: usize, heap: &mut Heap) -> Result<(), String> {
        let receiver = self.peek(argc);
        let instance = match receiver.as_obj() {
            Some(obj) if matches!(obj.kind, ObjKind::Instance(_)) => obj,
            _ => return Err("Only instances have methods.".to_string()),
        };
        let field = match &instance.kind {
            ObjKind::Instance(cell) => cell.borrow().fields.get(name),
            _ => unreachable!(),
        };
        if let Some(value) = field {
            let stack_len = self.stack.len();
            self.stack[stack_len - argc - 1] = value;
            return self.call_value(value, argc, heap);
        }
        let class = match &instance.kind {
            ObjKind::Instance(cell) => cell.borrow().class,
            _ => unreachable!(),
        };
        self.invoke_from_class(class, name, argc)
    }

    fn call_value(&mut self, callee: Value, argc: usize, heap: &mut Heap) -> Result<(), String> {
        let obj = match callee.as_obj() {
            Some(obj) => obj,
            None => return Err("Can only call functions and classes.".to_string()),
        };
        match &obj.kind {
            ObjKind::Closure(_) => self.call_closure(obj, argc),
            ObjKind::Native(native) => {
                let native = *native;
                let base = self.stack.len() - argc;
                let result = native(&self.stack[base..])?;
                self.stack.truncate(base - 1);
                self.push(result);
                Ok(())
            }
            ObjKind::Class(class_cell) => {
                let init = class_cell.borrow().methods.get(self.init_string);
                let instance = heap.alloc(
                    ObjKind::Instance(RefCell::new(Instance {
                        class: obj,
                        fields: Table::new(),
                    })),
                    self,
                );
                let stack_len = self.stack.len();
                self.stack[stack_len - argc - 1] = Value::Obj(instance);
                match init {
                    Some(Value::Obj(initializer)) => self.call_closure(initializer, argc),
                    _ => {
                        if argc != 0 {
                            Err(format!("Expected 0 arguments but got {argc}."))
                        } else {
                            Ok(())
                        }
                    }
                }
            }
            ObjKind::BoundMethod(bound) => {
                let bound = *bound;
                let stack_len = self.stack.len();
                self.stack[stack_len - argc - 1] = bound.receiver;
                self.call_closure(bound.method, argc)
            }
            _ => Err("Can only call functions and classes.".to_string()),
        }
    }

    /// Compiles nothing — runs an already-compiled top-level `Function` to
    /// completion. Resets the stacks first so a REPL can reuse one `Vm`
    /// across lines while keeping `globals` (and the heap) alive between
    /// them.
    pub fn interpret(
        &mut self,
        function: GcRef<Obj>,
        heap: &mut Heap,
        stdout: &mut dyn Write,
    ) -> Result<(), RuntimeError> {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        let closure = heap.alloc(
            ObjKind::Closure(Closure {
                function,
                upvalues: Vec::new(),
            }),
            self,
        );
        self.push(Value::Obj(closure));
        if let Err(msg) = self.call_closure(closure, 0) {
            return Err(self.runtime_error(msg));
        }
        self.run(heap, stdout)
    }

    fn run(&mut self, heap: &mut Heap, stdout: &mut dyn Write) -> Result<(), RuntimeError> {
        loop {
            let byte = self.read_byte();
            let op = OpCode::try_from(byte).expect("the compiler emits only valid opcodes");

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                name.as_str()
                            )))
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if self.globals.insert(name, value) {
                        self.globals.delete(name);
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            name.as_str()
                        )));
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                    self.pop();
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue = closure_upvalue(closure, slot);
                    let value = match &upvalue.kind {
                        ObjKind::Upvalue(cell) => match *cell.borrow() {
                            UpvalueState::Open(idx) => self.stack[idx],
                            UpvalueState::Closed(v) => v,
                        },
                        _ => unreachable!(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames.last().unwrap().closure;
                    let upvalue = closure_upvalue(closure, slot);
                    let value = self.peek(0);
                    match &upvalue.kind {
                        ObjKind::Upvalue(cell) => {
                            let mut state = cell.borrow_mut();
                            match &mut *state {
                                UpvalueState::Open(idx) => self.stack[*idx] = value,
                                UpvalueState::Closed(v) => *v = value,
                            }
                        }
                        _ => unreachable!(),
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Bool(a > b));
                        }
                        _ => return Err(self.runtime_error("Operands must be numbers.")),
                    }
                }
                OpCode::Less => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Bool(a < b));
                        }
                        _ => return Err(self.runtime_error("Operands must be numbers.")),
                    }
                }
                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if a.is_string() && b.is_string() {
                        let concatenated =
                            format!("{}{}", a.as_obj().unwrap().as_str(), b.as_obj().unwrap().as_str());
                        self.pop();
                        self.pop();
                        let interned = heap.intern(&concatenated, &*self);
                        self.push(Value::Obj(interned));
                    } else if let (Value::Number(x), Value::Number(y)) = (a, b) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(x + y));
                    } else {
                        return Err(self.runtime_error("Operands must be two numbers or two strings."));
                    }
                }
                OpCode::Subtract => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a - b));
                        }
                        _ => return Err(self.runtime_error("Operands must be numbers.")),
                    }
                }
                OpCode::Multiply => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a * b));
                        }
                        _ => return Err(self.runtime_error("Operands must be numbers.")),
                    }
                }
                OpCode::Divide => {
                    match (self.peek(1), self.peek(0)) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a / b));
                        }
                        _ => return Err(self.runtime_error("Operands must be numbers.")),
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                }
                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::Print => {
                    let value = self.pop();
                    writeln!(stdout, "{value}").expect("write to stdout");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    if let Err(msg) = self.call_value(callee, argc, heap) {
                        return Err(self.runtime_error(msg));
                    }
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    if let Err(msg) = self.invoke(name, argc, heap) {
                        return Err(self.runtime_error(msg));
                    }
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop().as_obj().expect("super is always a class");
                    if let Err(msg) = self.invoke_from_class(superclass, name, argc) {
                        return Err(self.runtime_error(msg));
                    }
                }
                OpCode::Closure => {
                    let function_obj = self.read_constant().as_obj().expect("closure constant is a function");
                    let upvalue_count = with_function(function_obj, |f| f.upvalue_count) as usize;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.frames.last().unwrap().slots_base;
                            upvalues.push(self.capture_upvalue(base + index, heap));
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            upvalues.push(closure_upvalue(enclosing, index));
                        }
                    }
                    let closure_obj = heap.alloc(
                        ObjKind::Closure(Closure {
                            function: function_obj,
                            upvalues,
                        }),
                        &*self,
                    );
                    self.push(Value::Obj(closure_obj));
                }
                OpCode::CloseUpvalue => {
                    let idx = self.stack.len() - 1;
                    self.close_upvalues(idx);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slots_base);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slots_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class_obj = heap.alloc(
                        ObjKind::Class(RefCell::new(Class {
                            name,
                            methods: Table::new(),
                        })),
                        &*self,
                    );
                    self.push(Value::Obj(class_obj));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let super_obj = match superclass.as_obj() {
                        Some(obj) if matches!(obj.kind, ObjKind::Class(_)) => obj,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let subclass = self.peek(0).as_obj().expect("subclass is always a class");
                    if let (ObjKind::Class(super_cell), ObjKind::Class(sub_cell)) =
                        (&super_obj.kind, &subclass.kind)
                    {
                        super_cell
                            .borrow()
                            .methods
                            .copy_all_into(&mut sub_cell.borrow_mut().methods);
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = self.peek(1).as_obj().expect("method target is always a class");
                    if let ObjKind::Class(cell) = &class.kind {
                        cell.borrow_mut().methods.insert(name, method);
                    }
                    self.pop();
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let instance = match receiver.as_obj() {
                        Some(obj) if matches!(obj.kind, ObjKind::Instance(_)) => obj,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let field = match &instance.kind {
                        ObjKind::Instance(cell) => cell.borrow().fields.get(name),
                        _ => unreachable!(),
                    };
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value);
                        }
                        None => {
                            let class = match &instance.kind {
                                ObjKind::Instance(cell) => cell.borrow().class,
                                _ => unreachable!(),
                            };
                            if let Err(msg) = self.bind_method(instance, class, name, heap) {
                                return Err(self.runtime_error(msg));
                            }
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    let receiver = self.peek(1);
                    let instance = match receiver.as_obj() {
                        Some(obj) if matches!(obj.kind, ObjKind::Instance(_)) => obj,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    if let ObjKind::Instance(cell) = &instance.kind {
                        cell.borrow_mut().fields.insert(name, value);
                    }
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_obj().expect("super is always a class");
                    let receiver = self.peek(0).as_obj().expect("this is always an instance");
                    if let Err(msg) = self.bind_method(receiver, superclass, name, heap) {
                        return Err(self.runtime_error(msg));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn run_source(source: &str) -> Result<String, RuntimeError> {
        let mut heap = Heap::new();
        let mut vm = Vm::new(&mut heap);
        let function = compile(source, &mut heap, &vm).expect("source should compile");
        let mut stdout = Vec::new();
        vm.interpret(function, &mut heap, &mut stdout)?;
        Ok(String::from_utf8(stdout).unwrap())
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(run_source("print 1 + 2 * 3;").unwrap(), "7\n");
    }

    #[test]
    fn scope_shadowing() {
        let out = run_source("var x = 1; { var x = 2; print x; } print x;").unwrap();
        assert_eq!(out, "2\n1\n");
    }

    #[test]
    fn recursion_via_globals() {
        let out = run_source(
            "fun fact(n) { if (n <= 1) return 1; return n * fact(n - 1); } print fact(5);",
        )
        .unwrap();
        assert_eq!(out, "120\n");
    }

    #[test]
    fn closure_captures_and_persists_upvalue() {
        let out = run_source(
            "fun makeCounter() { var i = 0; fun count() { i = i + 1; return i; } return count; } \
             var c = makeCounter(); print c(); print c(); print c();",
        )
        .unwrap();
        assert_eq!(out, "1\n2\n3\n");
    }

    #[test]
    fn string_interning_gives_content_equality() {
        assert_eq!(run_source("print \"ab\" + \"c\" == \"abc\";").unwrap(), "true\n");
    }

    #[test]
    fn classes_inheritance_and_super() {
        let out = run_source(
            "class A { greet() { print \"A\"; } } \
             class B < A { greet() { super.greet(); print \"B\"; } } \
             B().greet();",
        )
        .unwrap();
        assert_eq!(out, "A\nB\n");
    }

    #[test]
    fn short_circuit_and_skips_right_operand() {
        let out = run_source("fun f() { print \"called\"; return true; } print false and f();").unwrap();
        assert_eq!(out, "false\n");
    }

    #[test]
    fn short_circuit_or_skips_right_operand() {
        let out = run_source("fun f() { print \"called\"; return true; } print true or f();").unwrap();
        assert_eq!(out, "true\n");
    }

    #[test]
    fn assignment_is_idempotent() {
        assert_eq!(run_source("var x = 1; x = x; print x;").unwrap(), "1\n");
    }

    #[test]
    fn classes_support_init_and_fields() {
        let out = run_source(
            "class Point { init(x, y) { this.x = x; this.y = y; } sum() { return this.x + this.y; } } \
             var p = Point(1, 2); print p.sum();",
        )
        .unwrap();
        assert_eq!(out, "3\n");
    }

    #[test]
    fn adding_number_and_string_is_a_runtime_error() {
        let err = run_source("1 + \"a\";").unwrap_err();
        assert_eq!(err.message, "Operands must be two numbers or two strings.");
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let err = run_source("print undefinedThing;").unwrap_err();
        assert_eq!(err.message, "Undefined variable 'undefinedThing'.");
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let err = run_source("var x = 1; x();").unwrap_err();
        assert_eq!(err.message, "Can only call functions and classes.");
    }

    #[test]
    fn runtime_error_backtrace_lists_deepest_frame_first() {
        let err = run_source("fun f() { return 1 + \"a\"; } f();").unwrap_err();
        let printed = format!("{}", err.backtrace);
        let lines: Vec<&str> = printed.lines().collect();
        assert!(lines[0].contains("in f()"));
        assert!(lines[1].contains("in script"));
    }

    #[test]
    fn division_by_zero_is_not_a_runtime_error() {
        assert_eq!(run_source("print 1 / 0;").unwrap(), "inf\n");
    }
}
