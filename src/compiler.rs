//! The single-pass compiler: a Pratt (precedence-climbing) parser that emits
//! bytecode directly as it parses, with no intermediate AST. Scope
//! resolution (locals, upvalues, globals) happens inline as each identifier
//! is parsed.

use crate::chunk::OpCode;
use crate::error::CompileError;
use crate::gc::{GcRef, GcRoots, Heap};
use crate::object::{Function, Obj, ObjKind};
use crate::scanner::Scanner;
use crate::token::{Token, TokenType};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

type ParseFn<'src, 'r> = fn(&mut Compiler<'src, 'r>, &mut Heap, bool);

struct ParseRule<'src, 'r> {
    prefix: Option<ParseFn<'src, 'r>>,
    infix: Option<ParseFn<'src, 'r>>,
    precedence: Precedence,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Everything that's per-function during compilation: the function being
/// built, its locals (stack-slot order) and upvalue descriptors, and the
/// current scope depth. Nested function compilers push a new frame rather
/// than recursing into a separate `Compiler` value, so the single `Compiler`
/// struct stays the only thing the parser methods borrow.
struct FunctionFrame<'src> {
    function: Function,
    function_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FunctionFrame<'src> {
    fn new(function_type: FunctionType, name: Option<GcRef<Obj>>) -> Self {
        let receiver_name = match function_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        Self {
            function: Function::new(name),
            function_type,
            locals: vec![Local {
                name: Token::synthetic(TokenType::Identifier, receiver_name),
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassFrame {
    has_superclass: bool,
}

pub struct Compiler<'src, 'r> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    frames: Vec<FunctionFrame<'src>>,
    classes: Vec<ClassFrame>,
    errors: Vec<CompileError>,
    /// Whatever the VM this compile feeds into considers its own roots
    /// (globals, stack, open upvalues, the `"init"` name string). A
    /// collection can run at any allocation made while compiling — every
    /// one of `Heap::alloc`/`Heap::intern`'s `stress_gc` or threshold
    /// checks can trigger it — and without this, such a collection would
    /// only see the in-progress function(s) being compiled, not anything
    /// the VM already has reachable, and could free it out from under the
    /// VM (see `mark_extra_roots` below).
    vm_roots: &'r dyn GcRoots,
}

impl<'src, 'r> GcRoots for Compiler<'src, 'r> {
    fn mark_extra_roots(&self, heap: &mut Heap) {
        for frame in &self.frames {
            if let Some(name) = frame.function.name {
                heap.mark_object(name);
            }
            for c in frame.function.chunk.constants() {
                heap.mark_value(*c);
            }
        }
        self.vm_roots.mark_extra_roots(heap);
    }
}

/// Compiles `source` into a top-level script function, or every accumulated
/// diagnostic if compilation failed. The returned function is not yet
/// executable on its own — the VM wraps it in a `Closure` before calling it.
/// `vm_roots` is the VM this compilation feeds into (or any other root set
/// already live on the heap): every allocation made while compiling marks it
/// alongside the compiler's own in-progress frames, so a collection
/// triggered mid-compile can't free a global, the interned `"init"` name, or
/// anything else only the VM still references.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    vm_roots: &dyn GcRoots,
) -> Result<GcRef<Obj>, Vec<CompileError>> {
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: Token::synthetic(TokenType::Eof, ""),
        current: Token::synthetic(TokenType::Eof, ""),
        had_error: false,
        panic_mode: false,
        frames: vec![FunctionFrame::new(FunctionType::Script, None)],
        classes: Vec::new(),
        errors: Vec::new(),
        vm_roots,
    };

    compiler.advance();
    while !compiler.check(TokenType::Eof) {
        compiler.declaration(heap);
    }
    compiler.emit_return();

    let frame = compiler.frames.pop().unwrap();
    if compiler.had_error {
        return Err(compiler.errors);
    }

    Compiler::pin_constants(heap, &frame.function);
    let function_obj = heap.alloc(ObjKind::Function(frame.function), &compiler);
    Ok(function_obj)
}

impl<'src, 'r> Compiler<'src, 'r> {
    /// Marks a not-yet-wrapped `Function`'s constants and name as reachable.
    /// Needed only at the moment a function is about to be boxed into a
    /// heap object: up to that point its constants are rooted through the
    /// compiler's frame stack, but the frame is popped just before this call
    /// so its constants would otherwise be unprotected for the one
    /// allocation that wraps them.
    fn pin_constants(heap: &mut Heap, function: &Function) {
        if let Some(name) = function.name {
            heap.mark_object(name);
        }
        for c in function.chunk.constants() {
            heap.mark_value(*c);
        }
    }

    fn get_rule(kind: TokenType) -> ParseRule<'src, 'r> {
        use TokenType::*;
        match kind {
            LeftParen => ParseRule {
                prefix: Some(Self::grouping),
                infix: Some(Self::call),
                precedence: Precedence::Call,
            },
            Dot => ParseRule {
                prefix: None,
                infix: Some(Self::dot),
                precedence: Precedence::Call,
            },
            Minus => ParseRule {
                prefix: Some(Self::unary),
                infix: Some(Self::binary),
                precedence: Precedence::Term,
            },
            Plus => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Term,
            },
            Slash | Star => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Factor,
            },
            Bang => ParseRule {
                prefix: Some(Self::unary),
                infix: None,
                precedence: Precedence::None,
            },
            BangEqual | EqualEqual => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Equality,
            },
            Greater | GreaterEqual | Less | LessEqual => ParseRule {
                prefix: None,
                infix: Some(Self::binary),
                precedence: Precedence::Comparison,
            },
            Identifier => ParseRule {
                prefix: Some(Self::variable),
                infix: None,
                precedence: Precedence::None,
            },
            TokenType::String => ParseRule {
                prefix: Some(Self::string),
                infix: None,
                precedence: Precedence::None,
            },
            Number => ParseRule {
                prefix: Some(Self::number),
                infix: None,
                precedence: Precedence::None,
            },
            And => ParseRule {
                prefix: None,
                infix: Some(Self::and_),
                precedence: Precedence::And,
            },
            Or => ParseRule {
                prefix: None,
                infix: Some(Self::or_),
                precedence: Precedence::Or,
            },
            False | True | Nil => ParseRule {
                prefix: Some(Self::literal),
                infix: None,
                precedence: Precedence::None,
            },
            This => ParseRule {
                prefix: Some(Self::this_),
                infix: None,
                precedence: Precedence::None,
            },
            Super => ParseRule {
                prefix: Some(Self::super_),
                infix: None,
                precedence: Precedence::None,
            },
            _ => ParseRule {
                prefix: None,
                infix: None,
                precedence: Precedence::None,
            },
        }
    }

    // -- token stream -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenType::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenType) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenType) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenType, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message.to_string());
        }
    }

    fn error_at_current(&mut self, message: impl Into<String>) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: impl Into<String>) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = if token.kind == TokenType::Eof {
            "end".to_string()
        } else {
            format!("'{}'", token.lexeme)
        };
        self.errors.push(CompileError::new(token.line, at, message.into()));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenType::Eof {
            if self.previous.kind == TokenType::Semicolon {
                return;
            }
            match self.current.kind {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- bytecode emission --------------------------------------------------

    fn current_chunk(&mut self) -> &mut crate::chunk::Chunk {
        &mut self.frames.last_mut().unwrap().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk().write_op(op, line);
    }

    fn emit_bytes(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        self.current_chunk().patch_byte(offset, bytes[0]);
        self.current_chunk().patch_byte(offset + 1, bytes[1]);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    fn emit_return(&mut self) {
        let function_type = self.frames.last().unwrap().function_type;
        if function_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Ok(idx) => idx,
            Err(()) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_bytes(OpCode::Constant, idx);
    }

    fn identifier_constant(&mut self, name: &str, heap: &mut Heap) -> u8 {
        let interned = heap.intern(name, &*self);
        self.make_constant(Value::Obj(interned))
    }

    // -- scope / variable resolution ----------------------------------------

    fn begin_scope(&mut self) {
        self.frames.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frames.last_mut().unwrap().scope_depth -= 1;
        let depth = self.frames.last().unwrap().scope_depth;
        loop {
            let pending = {
                let frame = self.frames.last().unwrap();
                match frame.locals.last() {
                    Some(local) if local.depth > depth => Some(local.is_captured),
                    _ => None,
                }
            };
            match pending {
                Some(is_captured) => {
                    if is_captured {
                        self.emit_op(OpCode::CloseUpvalue);
                    } else {
                        self.emit_op(OpCode::Pop);
                    }
                    self.frames.last_mut().unwrap().locals.pop();
                }
                None => break,
            }
        }
    }

    fn declare_variable(&mut self) {
        let depth = self.frames.last().unwrap().scope_depth;
        if depth == 0 {
            return;
        }
        let name = self.previous;
        let mut duplicate = false;
        for local in self.frames.last().unwrap().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.frames.last().unwrap().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.frames.last_mut().unwrap().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        let found = {
            let frame = &self.frames[frame_idx];
            frame
                .locals
                .iter()
                .enumerate()
                .rev()
                .find(|(_, local)| local.name.lexeme == name)
                .map(|(i, local)| (i as u8, local.depth == -1))
        };
        match found {
            Some((idx, uninitialized)) => {
                if uninitialized {
                    self.error("Can't read local variable in its own initializer.");
                }
                Some(idx)
            }
            None => None,
        }
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing_idx = frame_idx - 1;
        if let Some(local_idx) = self.resolve_local(enclosing_idx, name) {
            self.frames[enclosing_idx].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, local_idx, true));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing_idx, name) {
            return Some(self.add_upvalue(frame_idx, upvalue_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        {
            let frame = &self.frames[frame_idx];
            for (i, up) in frame.upvalues.iter().enumerate() {
                if up.index == index && up.is_local == is_local {
                    return i as u8;
                }
            }
            if frame.upvalues.len() >= 256 {
                self.error("Too many closure variables in function.");
                return 0;
            }
        }
        self.frames[frame_idx]
            .upvalues
            .push(UpvalueDesc { index, is_local });
        let count = self.frames[frame_idx].upvalues.len();
        self.frames[frame_idx].function.upvalue_count = count as u8;
        (count - 1) as u8
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool, heap: &mut Heap) {
        let lexeme = name.lexeme.to_string();
        let frame_idx = self.frames.len() - 1;

        let (get_op, set_op, slot) = if let Some(slot) = self.resolve_local(frame_idx, &lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(frame_idx, &lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let idx = self.identifier_constant(&lexeme, heap);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression(heap);
            self.emit_bytes(set_op, slot);
        } else {
            self.emit_bytes(get_op, slot);
        }
    }

    fn parse_variable(&mut self, message: &str, heap: &mut Heap) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
        if self.frames.last().unwrap().scope_depth > 0 {
            return 0;
        }
        let lexeme = self.previous.lexeme.to_string();
        self.identifier_constant(&lexeme, heap)
    }

    fn define_variable(&mut self, global_idx: u8) {
        if self.frames.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal, global_idx);
    }

    // -- declarations and statements -----------------------------------------

    fn declaration(&mut self, heap: &mut Heap) {
        if self.match_token(TokenType::Class) {
            self.class_declaration(heap);
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration(heap);
        } else if self.match_token(TokenType::Var) {
            self.var_declaration(heap);
        } else {
            self.statement(heap);
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_str = class_name.lexeme.to_string();
        let name_idx = self.identifier_constant(&name_str, heap);
        self.declare_variable();
        self.emit_bytes(OpCode::Class, name_idx);
        self.define_variable(name_idx);

        self.classes.push(ClassFrame {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            let super_name = self.previous;
            self.named_variable(super_name, false, heap);
            if super_name.lexeme == class_name.lexeme {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local(Token::synthetic(TokenType::Super, "super"));
            self.define_variable(0);
            self.named_variable(class_name, false, heap);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false, heap);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method(heap);
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self, heap: &mut Heap) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name_str = self.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&name_str, heap);
        let function_type = if name_str == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type, heap);
        self.emit_bytes(OpCode::Method, name_idx);
    }

    fn fun_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable("Expect function name.", heap);
        self.mark_initialized();
        self.function(FunctionType::Function, heap);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType, heap: &mut Heap) {
        let name_str = self.previous.lexeme.to_string();
        let name_obj = heap.intern(&name_str, &*self);
        self.frames.push(FunctionFrame::new(function_type, Some(name_obj)));

        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                let arity = self.frames.last().unwrap().function.arity;
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.frames.last_mut().unwrap().function.arity += 1;
                }
                let param = self.parse_variable("Expect parameter name.", heap);
                self.define_variable(param);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block(heap);

        self.emit_return();
        let frame = self.frames.pop().unwrap();
        let upvalues_desc: Vec<(bool, u8)> = frame
            .upvalues
            .iter()
            .map(|u| (u.is_local, u.index))
            .collect();

        Self::pin_constants(heap, &frame.function);
        let function_obj = heap.alloc(ObjKind::Function(frame.function), &*self);
        let const_idx = self.make_constant(Value::Obj(function_obj));
        self.emit_bytes(OpCode::Closure, const_idx);
        for (is_local, index) in upvalues_desc {
            self.emit_byte(if is_local { 1 } else { 0 });
            self.emit_byte(index);
        }
    }

    fn var_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable("Expect variable name.", heap);
        if self.match_token(TokenType::Equal) {
            self.expression(heap);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self, heap: &mut Heap) {
        if self.match_token(TokenType::Print) {
            self.print_statement(heap);
        } else if self.match_token(TokenType::For) {
            self.for_statement(heap);
        } else if self.match_token(TokenType::If) {
            self.if_statement(heap);
        } else if self.match_token(TokenType::Return) {
            self.return_statement(heap);
        } else if self.match_token(TokenType::While) {
            self.while_statement(heap);
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block(heap);
            self.end_scope();
        } else {
            self.expression_statement(heap);
        }
    }

    fn print_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn block(&mut self, heap: &mut Heap) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration(heap);
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn if_statement(&mut self, heap: &mut Heap) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression(heap);
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenType::Else) {
            self.statement(heap);
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self, heap: &mut Heap) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression(heap);
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self, heap: &mut Heap) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // no initializer
        } else if self.match_token(TokenType::Var) {
            self.var_declaration(heap);
        } else {
            self.expression_statement(heap);
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression(heap);
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression(heap);
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement(heap);
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self, heap: &mut Heap) {
        if self.frames.last().unwrap().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.frames.last().unwrap().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression(heap);
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // -- expressions --------------------------------------------------------

    fn expression(&mut self, heap: &mut Heap) {
        self.parse_precedence(Precedence::Assignment, heap);
    }

    fn parse_precedence(&mut self, precedence: Precedence, heap: &mut Heap) {
        self.advance();
        let prefix_rule = match Self::get_rule(self.previous.kind).prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, heap, can_assign);

        while precedence <= Self::get_rule(self.current.kind).precedence {
            self.advance();
            let infix_rule = Self::get_rule(self.previous.kind).infix.unwrap();
            infix_rule(self, heap, can_assign);
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _heap: &mut Heap, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().expect("scanner only emits well-formed numbers");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, heap: &mut Heap, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let interned = heap.intern(contents, &*self);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self, _heap: &mut Heap, _can_assign: bool) {
        match self.previous.kind {
            TokenType::False => self.emit_op(OpCode::False),
            TokenType::True => self.emit_op(OpCode::True),
            TokenType::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, heap: &mut Heap, _can_assign: bool) {
        self.expression(heap);
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary, heap);
        match op_kind {
            TokenType::Bang => self.emit_op(OpCode::Not),
            TokenType::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let rule_precedence = Self::get_rule(op_kind).precedence;
        self.parse_precedence(rule_precedence.next(), heap);
        match op_kind {
            TokenType::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenType::EqualEqual => self.emit_op(OpCode::Equal),
            TokenType::Greater => self.emit_op(OpCode::Greater),
            TokenType::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenType::Less => self.emit_op(OpCode::Less),
            TokenType::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And, heap);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or, heap);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, heap: &mut Heap, _can_assign: bool) {
        let argc = self.argument_list(heap);
        self.emit_bytes(OpCode::Call, argc);
    }

    fn argument_list(&mut self, heap: &mut Heap) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression(heap);
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn dot(&mut self, heap: &mut Heap, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name_str = self.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&name_str, heap);

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression(heap);
            self.emit_bytes(OpCode::SetProperty, name_idx);
        } else if self.match_token(TokenType::LeftParen) {
            let argc = self.argument_list(heap);
            self.emit_bytes(OpCode::Invoke, name_idx);
            self.emit_byte(argc);
        } else {
            self.emit_bytes(OpCode::GetProperty, name_idx);
        }
    }

    fn variable(&mut self, heap: &mut Heap, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign, heap);
    }

    fn this_(&mut self, heap: &mut Heap, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let tok = Token::synthetic(TokenType::This, "this");
        self.named_variable(tok, false, heap);
    }

    fn super_(&mut self, heap: &mut Heap, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let method_str = self.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&method_str, heap);

        let this_tok = Token::synthetic(TokenType::This, "this");
        self.named_variable(this_tok, false, heap);
        if self.match_token(TokenType::LeftParen) {
            let argc = self.argument_list(heap);
            let super_tok = Token::synthetic(TokenType::Super, "super");
            self.named_variable(super_tok, false, heap);
            self.emit_bytes(OpCode::SuperInvoke, name_idx);
            self.emit_byte(argc);
        } else {
            let super_tok = Token::synthetic(TokenType::Super, "super");
            self.named_variable(super_tok, false, heap);
            self.emit_bytes(OpCode::GetSuper, name_idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    fn compile_ok(source: &str) -> Heap {
        let mut heap = Heap::new();
        let vm = Vm::new(&mut heap);
        match compile(source, &mut heap, &vm) {
            Ok(_) => heap,
            Err(errors) => panic!("unexpected compile errors: {:?}", errors.iter().map(|e| e.to_string()).collect::<Vec<_>>()),
        }
    }

    fn compile_err(source: &str) -> Vec<CompileError> {
        let mut heap = Heap::new();
        let vm = Vm::new(&mut heap);
        match compile(source, &mut heap, &vm) {
            Ok(_) => panic!("expected a compile error"),
            Err(errors) => errors,
        }
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        compile_ok("print 1 + 2 * 3;");
    }

    #[test]
    fn compiles_classes_and_inheritance() {
        compile_ok(
            "class A { greet() { print \"A\"; } } \
             class B < A { greet() { super.greet(); print \"B\"; } } \
             B().greet();",
        );
    }

    #[test]
    fn compiles_closures() {
        compile_ok(
            "fun makeCounter() { var i = 0; fun count() { i = i + 1; return i; } return count; } \
             var c = makeCounter(); print c();",
        );
    }

    #[test]
    fn unterminated_paren_is_a_compile_error() {
        let errors = compile_err("print (1 + 2;");
        assert!(errors.iter().any(|e| e.message.contains("Expect ')'")));
    }

    #[test]
    fn this_outside_class_is_a_compile_error() {
        let errors = compile_err("fun f() { print this; }");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("Can't use 'this' outside of a class.")));
    }

    #[test]
    fn self_inheritance_is_a_compile_error() {
        let errors = compile_err("class A < A {}");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("A class can't inherit from itself.")));
    }

    #[test]
    fn shadowing_a_local_in_the_same_scope_is_a_compile_error() {
        let errors = compile_err("{ var a = 1; var a = 2; }");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("Already a variable with this name in this scope.")));
    }

    #[test]
    fn returning_a_value_from_top_level_is_a_compile_error() {
        let errors = compile_err("return 1;");
        assert!(errors
            .iter()
            .any(|e| e.message.contains("Can't return from top-level code.")));
    }
}
