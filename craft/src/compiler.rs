//! Single-pass Pratt parser and scope resolver.
//!
//! There is no separate AST: parsing a construct emits its bytecode directly
//! into the function currently being compiled. Scope resolution (locals,
//! upvalues, classes) happens inline as a side effect of parsing, the same
//! way the teacher's own recursive-descent parser threads codegen through
//! its grammar methods instead of building a tree first.

use std::fmt;

use crate::chunk::OpCode;
use crate::heap::Heap;
use crate::lexer::{Lexer, ScanErrorType, Token, TokenType};
use crate::object::{Function, FunctionType, ObjKind, ObjRef};
use crate::reporting::Location;
use crate::trace_parser;
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;

#[derive(Debug, Clone)]
pub struct ParserError {
    pub error: ParseErrorType,
    pub loc: Location,
}

#[derive(Debug, Clone)]
pub enum ParseErrorType {
    Scan(ScanErrorType),
    Message(String),
}

impl fmt::Display for ParseErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseErrorType::Scan(e) => write!(f, "{}", e),
            ParseErrorType::Message(m) => write!(f, "{}", m),
        }
    }
}

fn msg(s: impl Into<String>) -> ParseErrorType {
    ParseErrorType::Message(s.into())
}

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Debug)]
#[repr(u8)]
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
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// One in-progress function. Chained through `enclosing` the way the
/// original's global `current` pointer chains through nested `fun`/`method`
/// bodies; the chain itself is a GC root while any of it is mid-compile.
struct FunctionCompiler<'src> {
    enclosing: Option<Box<FunctionCompiler<'src>>>,
    function: Function,
    fn_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FunctionCompiler<'src> {
    fn new(fn_type: FunctionType, name: Option<String>, enclosing: Option<Box<FunctionCompiler<'src>>>) -> Self {
        let slot0_name = if matches!(fn_type, FunctionType::Method | FunctionType::Initializer) { "this" } else { "" };
        FunctionCompiler {
            enclosing,
            function: Function::new(name),
            fn_type,
            locals: vec![Local { name: slot0_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Marks GC roots reachable from an in-progress function chain: each
/// function's constant pool (which may already hold heap-allocated strings
/// and nested `Function` objects from finished inner compiles).
fn mark_compiler_chain(fc: &FunctionCompiler, heap: &mut Heap) {
    for value in &fc.function.chunk.constants {
        heap.mark_value(*value);
    }
    if let Some(enclosing) = &fc.enclosing {
        mark_compiler_chain(enclosing, heap);
    }
}

fn maybe_collect(heap: &mut Heap, fc: &FunctionCompiler) {
    heap.maybe_collect(|h| mark_compiler_chain(fc, h));
}

struct ClassCompiler {
    enclosing: Option<Box<ClassCompiler>>,
    has_superclass: bool,
}

struct Parser<'a, 'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<ParserError>,
    heap: &'a mut Heap,
    current_fn: Box<FunctionCompiler<'src>>,
    class_compiler: Option<Box<ClassCompiler>>,
}

impl<'a, 'src> Parser<'a, 'src> {
    fn new(source: &'src str, heap: &'a mut Heap) -> Self {
        let bogus = Token { kind: TokenType::Eof, lexeme: "", line: 0 };
        let mut parser = Parser {
            lexer: Lexer::new(source),
            current: bogus,
            previous: bogus,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            heap,
            current_fn: Box::new(FunctionCompiler::new(FunctionType::Script, None, None)),
            class_compiler: None,
        };
        parser.advance();
        parser
    }

    // ----- token stream -----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            match self.lexer.next_token() {
                Ok(tok) => {
                    self.current = tok;
                    trace_parser!("advance -> {:?} '{}'", tok.kind, tok.lexeme);
                    break;
                }
                Err(scan_err) => {
                    let loc = scan_err.loc;
                    self.error_at(loc, ParseErrorType::Scan(scan_err.error));
                }
            }
        }
    }

    fn check(&self, kind: TokenType) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenType) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenType, message: &str) -> Result<(), ParserError> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error_at_current(msg(message)))
        }
    }

    // ----- error handling -----

    fn error_at(&mut self, loc: Location, kind: ParseErrorType) -> ParserError {
        let err = ParserError { error: kind, loc };
        if !self.panic_mode {
            self.panic_mode = true;
            self.had_error = true;
            self.errors.push(err.clone());
        }
        err
    }

    fn error_at_current(&mut self, kind: ParseErrorType) -> ParserError {
        self.error_at(self.current.loc(), kind)
    }

    fn error_at_previous(&mut self, kind: ParseErrorType) -> ParserError {
        self.error_at(self.previous.loc(), kind)
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
                _ => self.advance(),
            }
        }
    }

    // ----- chunk emission -----

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_fn.function.chunk.write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op_byte(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        if self.current_fn.fn_type == FunctionType::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_fn.function.chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) -> Result<(), ParserError> {
        let jump = self.current_fn.function.chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            return Err(self.error_at_previous(msg("Too much code to jump over.")));
        }
        self.current_fn.function.chunk.patch_jump(offset);
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize) -> Result<(), ParserError> {
        self.emit_op(OpCode::Loop);
        let offset = self.current_fn.function.chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(self.error_at_previous(msg("Loop body too large.")));
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
        Ok(())
    }

    fn make_constant(&mut self, value: Value) -> Result<u8, ParserError> {
        let index = self.current_fn.function.chunk.add_constant(value);
        if index > u8::MAX as usize {
            Err(self.error_at_previous(msg("Too many constants in one chunk.")))
        } else {
            Ok(index as u8)
        }
    }

    fn emit_constant(&mut self, value: Value) -> Result<(), ParserError> {
        let index = self.make_constant(value)?;
        self.emit_op_byte(OpCode::Constant, index);
        Ok(())
    }

    fn identifier_constant(&mut self, name: &str) -> Result<u8, ParserError> {
        maybe_collect(self.heap, &self.current_fn);
        let interned = self.heap.intern_string(name);
        self.make_constant(Value::Obj(interned))
    }

    // ----- function compiler stack -----

    fn begin_function(&mut self, fn_type: FunctionType, name: Option<String>) {
        let old = std::mem::replace(&mut self.current_fn, Box::new(FunctionCompiler::new(FunctionType::Script, None, None)));
        self.current_fn = Box::new(FunctionCompiler::new(fn_type, name, Some(old)));
    }

    /// Finishes the active function compiler, returning its completed
    /// `Function` and upvalue descriptors, and restores `current_fn` to the
    /// enclosing compiler.
    fn end_function(&mut self) -> (Function, Vec<UpvalueDesc>) {
        self.emit_return();
        let finished = std::mem::replace(&mut self.current_fn, Box::new(FunctionCompiler::new(FunctionType::Script, None, None)));
        let enclosing = finished.enclosing;
        let upvalues = finished.upvalues;
        let function = finished.function;
        if let Some(enclosing) = enclosing {
            self.current_fn = enclosing;
        }
        trace_parser!("end_function {:?}", function.name);
        (function, upvalues)
    }

    fn begin_scope(&mut self) {
        self.current_fn.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_fn.scope_depth -= 1;
        let depth = self.current_fn.scope_depth;
        while let Some(local) = self.current_fn.locals.last() {
            if local.depth <= depth {
                break;
            }
            if self.current_fn.locals.last().unwrap().is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_fn.locals.pop();
        }
    }

    // ----- variables -----

    fn declare_variable(&mut self) -> Result<(), ParserError> {
        if self.current_fn.scope_depth == 0 {
            return Ok(());
        }
        let name = self.previous.lexeme;
        let depth = self.current_fn.scope_depth;
        for local in self.current_fn.locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                return Err(self.error_at_previous(msg(format!("Already a variable with the name '{}' in this scope.", name))));
            }
        }
        self.add_local(name)
    }

    fn add_local(&mut self, name: &'src str) -> Result<(), ParserError> {
        if self.current_fn.locals.len() >= MAX_LOCALS {
            return Err(self.error_at_previous(msg("Too many local variables in function.")));
        }
        self.current_fn.locals.push(Local { name, depth: -1, is_captured: false });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        if self.current_fn.scope_depth == 0 {
            return;
        }
        let depth = self.current_fn.scope_depth;
        self.current_fn.locals.last_mut().unwrap().depth = depth;
    }

    fn parse_variable(&mut self, error_message: &str) -> Result<u8, ParserError> {
        self.consume(TokenType::Identifier, error_message)?;
        self.declare_variable()?;
        if self.current_fn.scope_depth > 0 {
            return Ok(0);
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_fn.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(fc: &FunctionCompiler<'src>, name: &str) -> Result<Option<usize>, String> {
        for (i, local) in fc.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(format!("Can't read local variable '{}' in its own initializer.", name));
                }
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn resolve_upvalue(fc: &mut FunctionCompiler<'src>, name: &str) -> Result<Option<u8>, String> {
        let enclosing = match fc.enclosing.as_mut() {
            Some(e) => e,
            None => return Ok(None),
        };
        if let Some(slot) = Self::resolve_local(enclosing, name)? {
            enclosing.locals[slot].is_captured = true;
            return Ok(Some(Self::add_upvalue(fc, slot as u8, true)?));
        }
        if let Some(up) = Self::resolve_upvalue(enclosing, name)? {
            return Ok(Some(Self::add_upvalue(fc, up, false)?));
        }
        Ok(None)
    }

    /// Deduplicates by `(index, is_local)`: returns the existing upvalue only
    /// when both match the candidate, never the first index seen.
    fn add_upvalue(fc: &mut FunctionCompiler<'src>, index: u8, is_local: bool) -> Result<u8, String> {
        for (i, up) in fc.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if fc.upvalues.len() >= MAX_UPVALUES {
            return Err("Too many closure variables in function.".to_string());
        }
        fc.upvalues.push(UpvalueDesc { index, is_local });
        fc.function.upvalue_count = fc.upvalues.len();
        Ok((fc.upvalues.len() - 1) as u8)
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) -> Result<(), ParserError> {
        let local = Self::resolve_local(&self.current_fn, name).map_err(|e| self.error_at_previous(msg(e)))?;
        let (get_op, set_op, arg) = if let Some(slot) = local {
            (OpCode::GetLocal, OpCode::SetLocal, slot as u8)
        } else if let Some(up) = Self::resolve_upvalue(&mut self.current_fn, name).map_err(|e| self.error_at_previous(msg(e)))? {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, up)
        } else {
            let idx = self.identifier_constant(name)?;
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression()?;
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
        Ok(())
    }

    // ----- declarations & statements -----

    fn declaration(&mut self) {
        let result = if self.match_token(TokenType::Class) {
            self.class_declaration()
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration()
        } else if self.match_token(TokenType::Var) {
            self.var_declaration()
        } else {
            self.statement()
        };
        let _ = result;
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) -> Result<(), ParserError> {
        self.consume(TokenType::Identifier, "Expect class name.")?;
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name)?;
        self.declare_variable()?;

        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.class_compiler = Some(Box::new(ClassCompiler { enclosing: self.class_compiler.take(), has_superclass: false }));

        // `class_compiler` must be popped no matter how `class_body` exits,
        // or the next top-level declaration compiles against a class that
        // failed to finish. Mirrors `endCompiler`'s unconditional cleanup.
        let result = self.class_body(class_name);

        let finished_class = self.class_compiler.take().unwrap();
        self.class_compiler = finished_class.enclosing;
        result
    }

    fn class_body(&mut self, class_name: &'src str) -> Result<(), ParserError> {
        let mut opened_super_scope = false;
        let result = self.class_body_inner(class_name, &mut opened_super_scope);
        if opened_super_scope {
            self.end_scope();
        }
        result
    }

    fn class_body_inner(&mut self, class_name: &'src str, opened_super_scope: &mut bool) -> Result<(), ParserError> {
        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.")?;
            let super_name = self.previous.lexeme;
            self.named_variable(super_name, false)?;
            if super_name == class_name {
                return Err(self.error_at_previous(msg("A class can't inherit from itself.")));
            }
            self.begin_scope();
            *opened_super_scope = true;
            self.add_local("super")?;
            self.define_variable(0);

            self.named_variable(class_name, false)?;
            self.emit_op(OpCode::Inherit);
            self.class_compiler.as_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false)?;
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.")?;
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method()?;
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.")?;
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    fn method(&mut self) -> Result<(), ParserError> {
        self.consume(TokenType::Identifier, "Expect method name.")?;
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name)?;
        let fn_type = if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(fn_type, name.to_string())?;
        self.emit_op_byte(OpCode::Method, constant);
        Ok(())
    }

    fn fun_declaration(&mut self) -> Result<(), ParserError> {
        let global = self.parse_variable("Expect function name.")?;
        self.mark_initialized();
        let name = self.previous.lexeme.to_string();
        self.function(FunctionType::Function, name)?;
        self.define_variable(global);
        Ok(())
    }

    fn function(&mut self, fn_type: FunctionType, name: String) -> Result<(), ParserError> {
        self.begin_function(fn_type, Some(name));

        // `end_function` must run on every exit path, not just success, or
        // a bail-out partway through the parameter list or body (missing
        // paren/brace, bad parameter name, too many parameters) leaves
        // `current_fn` pointing at this abandoned compiler. Everything
        // parsed afterward — up to the next `synchronize()` — would then
        // land in the wrong function's locals/scope/chunk. Matches
        // `endCompiler`'s unconditional call regardless of error state.
        match self.function_body() {
            Ok(()) => {
                // Collect (if due) while the finished body's constants are
                // still reachable through `current_fn`, not after
                // `end_function` detaches them from the compiler chain.
                maybe_collect(self.heap, &self.current_fn);
                let (function, upvalues) = self.end_function();
                let function_ref = self.heap.alloc(ObjKind::Function(function));
                let constant = self.make_constant(Value::Obj(function_ref))?;
                self.emit_op_byte(OpCode::Closure, constant);
                for up in upvalues {
                    self.emit_byte(if up.is_local { 1 } else { 0 });
                    self.emit_byte(up.index);
                }
                Ok(())
            }
            Err(err) => {
                self.end_function();
                Err(err)
            }
        }
    }

    fn function_body(&mut self) -> Result<(), ParserError> {
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.")?;
        if !self.check(TokenType::RightParen) {
            loop {
                self.current_fn.function.arity += 1;
                if self.current_fn.function.arity > MAX_ARGS {
                    return Err(self.error_at_current(msg("Can't have more than 255 parameters.")));
                }
                let constant = self.parse_variable("Expect parameter name.")?;
                self.define_variable(constant);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.")?;
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.")?;
        self.block()
    }

    fn var_declaration(&mut self) -> Result<(), ParserError> {
        let global = self.parse_variable("Expect variable name.")?;
        if self.match_token(TokenType::Equal) {
            self.expression()?;
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.")?;
        self.define_variable(global);
        Ok(())
    }

    fn statement(&mut self) -> Result<(), ParserError> {
        if self.match_token(TokenType::Print) {
            self.print_statement()
        } else if self.match_token(TokenType::For) {
            self.for_statement()
        } else if self.match_token(TokenType::If) {
            self.if_statement()
        } else if self.match_token(TokenType::Return) {
            self.return_statement()
        } else if self.match_token(TokenType::While) {
            self.while_statement()
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            let result = self.block();
            self.end_scope();
            result
        } else {
            self.expression_statement()
        }
    }

    fn print_statement(&mut self) -> Result<(), ParserError> {
        self.expression()?;
        self.consume(TokenType::Semicolon, "Expect ';' after value.")?;
        self.emit_op(OpCode::Print);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), ParserError> {
        if self.current_fn.fn_type == FunctionType::Script {
            return Err(self.error_at_previous(msg("Can't return from top-level code.")));
        }
        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.current_fn.fn_type == FunctionType::Initializer {
                return Err(self.error_at_previous(msg("Can't return a value from an initializer.")));
            }
            self.expression()?;
            self.consume(TokenType::Semicolon, "Expect ';' after return value.")?;
            self.emit_op(OpCode::Return);
        }
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), ParserError> {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(TokenType::RightParen, "Expect ')' after condition.")?;

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement()?;

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump)?;
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenType::Else) {
            self.statement()?;
        }
        self.patch_jump(else_jump)?;
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), ParserError> {
        let loop_start = self.current_fn.function.chunk.code.len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(TokenType::RightParen, "Expect ')' after condition.")?;

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement()?;
        self.emit_loop(loop_start)?;

        self.patch_jump(exit_jump)?;
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<(), ParserError> {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.")?;
        if self.match_token(TokenType::Semicolon) {
            // no initializer
        } else if self.match_token(TokenType::Var) {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.current_fn.function.chunk.code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression()?;
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.")?;
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_fn.function.chunk.code.len();
            self.expression()?;
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.")?;

            self.emit_loop(loop_start)?;
            loop_start = increment_start;
            self.patch_jump(body_jump)?;
        }

        self.statement()?;
        self.emit_loop(loop_start)?;

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump)?;
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
        Ok(())
    }

    fn block(&mut self) -> Result<(), ParserError> {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.")
    }

    fn expression_statement(&mut self) -> Result<(), ParserError> {
        self.expression()?;
        self.consume(TokenType::Semicolon, "Expect ';' after expression.")?;
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    // ----- expressions -----

    fn expression(&mut self) -> Result<(), ParserError> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<(), ParserError> {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        self.prefix(self.previous.kind, can_assign)?;

        while precedence <= Self::precedence_of(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign)?;
        }

        if can_assign && self.match_token(TokenType::Equal) {
            return Err(self.error_at_previous(msg("Invalid assignment target.")));
        }
        Ok(())
    }

    fn precedence_of(kind: TokenType) -> Precedence {
        use TokenType::*;
        match kind {
            Minus | Plus => Precedence::Term,
            Slash | Star | Caret => Precedence::Factor,
            BangEqual | EqualEqual => Precedence::Equality,
            Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
            And => Precedence::And,
            Or => Precedence::Or,
            LeftParen | Dot => Precedence::Call,
            _ => Precedence::None,
        }
    }

    fn prefix(&mut self, kind: TokenType, can_assign: bool) -> Result<(), ParserError> {
        use TokenType::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(kind),
            Number => self.number(),
            String => self.string_literal(),
            Identifier => self.named_variable(self.previous.lexeme, can_assign),
            Nil | True | False => self.literal(kind),
            This => self.this_expr(),
            Super => self.super_expr(),
            _ => Err(self.error_at_previous(msg("Expect expression."))),
        }
    }

    fn infix(&mut self, kind: TokenType, can_assign: bool) -> Result<(), ParserError> {
        use TokenType::*;
        match kind {
            Plus | Minus | Star | Slash | Caret | BangEqual | EqualEqual | Greater | GreaterEqual | Less | LessEqual => self.binary(kind),
            And => self.and_expr(),
            Or => self.or_expr(),
            LeftParen => self.call_expr(),
            Dot => self.dot_expr(can_assign),
            _ => unreachable!("infix dispatched for a token with no infix rule"),
        }
    }

    fn grouping(&mut self) -> Result<(), ParserError> {
        self.expression()?;
        self.consume(TokenType::RightParen, "Expect ')' after expression.")
    }

    fn unary(&mut self, kind: TokenType) -> Result<(), ParserError> {
        self.parse_precedence(Precedence::Unary)?;
        match kind {
            TokenType::Minus => self.emit_op(OpCode::Negate),
            TokenType::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn binary(&mut self, kind: TokenType) -> Result<(), ParserError> {
        let next_precedence = Self::precedence_of(kind).next();
        self.parse_precedence(next_precedence)?;
        match kind {
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            TokenType::Caret => self.emit_op(OpCode::Exponent),
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
            _ => unreachable!(),
        }
        Ok(())
    }

    fn number(&mut self) -> Result<(), ParserError> {
        let n: f64 = self.previous.lexeme.parse().map_err(|_| self.error_at_previous(msg("Invalid number literal.")))?;
        self.emit_constant(Value::Number(n))
    }

    fn string_literal(&mut self) -> Result<(), ParserError> {
        let lexeme = self.previous.lexeme;
        let s = &lexeme[1..lexeme.len() - 1];
        maybe_collect(self.heap, &self.current_fn);
        let interned = self.heap.intern_string(s);
        self.emit_constant(Value::Obj(interned))
    }

    fn literal(&mut self, kind: TokenType) -> Result<(), ParserError> {
        match kind {
            TokenType::Nil => self.emit_op(OpCode::Nil),
            TokenType::True => self.emit_op(OpCode::True),
            TokenType::False => self.emit_op(OpCode::False),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn and_expr(&mut self) -> Result<(), ParserError> {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)
    }

    fn or_expr(&mut self) -> Result<(), ParserError> {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump)?;
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)
    }

    fn argument_list(&mut self) -> Result<u8, ParserError> {
        let mut count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression()?;
                if count >= MAX_ARGS {
                    return Err(self.error_at_previous(msg("Can't have more than 255 arguments.")));
                }
                count += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.")?;
        Ok(count as u8)
    }

    fn call_expr(&mut self) -> Result<(), ParserError> {
        let argc = self.argument_list()?;
        self.emit_op_byte(OpCode::Call, argc);
        Ok(())
    }

    fn dot_expr(&mut self, can_assign: bool) -> Result<(), ParserError> {
        self.consume(TokenType::Identifier, "Expect property name after '.'.")?;
        let name = self.identifier_constant(self.previous.lexeme)?;

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression()?;
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.match_token(TokenType::LeftParen) {
            let argc = self.argument_list()?;
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
        Ok(())
    }

    fn this_expr(&mut self) -> Result<(), ParserError> {
        if self.class_compiler.is_none() {
            return Err(self.error_at_previous(msg("Can't use 'this' outside of a class.")));
        }
        self.named_variable("this", false)
    }

    fn super_expr(&mut self) -> Result<(), ParserError> {
        match &self.class_compiler {
            None => return Err(self.error_at_previous(msg("Can't use 'super' outside of a class."))),
            Some(cc) if !cc.has_superclass => {
                return Err(self.error_at_previous(msg("Can't use 'super' in a class with no superclass.")));
            }
            _ => {}
        }
        self.consume(TokenType::Dot, "Expect '.' after 'super'.")?;
        self.consume(TokenType::Identifier, "Expect superclass method name.")?;
        let name = self.identifier_constant(self.previous.lexeme)?;

        self.named_variable("this", false)?;
        if self.match_token(TokenType::LeftParen) {
            let argc = self.argument_list()?;
            self.named_variable("super", false)?;
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false)?;
            self.emit_op_byte(OpCode::GetSuper, name);
        }
        Ok(())
    }
}

/// Compiles `source` into a top-level script `Function`, heap-allocated and
/// returned by reference. On failure, returns every error collected during
/// the pass (panic-mode recovery keeps parsing through to EOF).
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<ParserError>> {
    let mut parser = Parser::new(source, heap);

    while !parser.check(TokenType::Eof) {
        parser.declaration();
    }
    let had_error = parser.had_error;
    maybe_collect(parser.heap, &parser.current_fn);
    let (function, _upvalues) = parser.end_function();

    if had_error {
        Err(parser.errors)
    } else {
        Ok(heap.alloc(ObjKind::Function(function)))
    }
}
