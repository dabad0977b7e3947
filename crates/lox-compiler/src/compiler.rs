//! Single-pass Pratt-parsing compiler: consumes tokens from the [`Scanner`]
//! and emits bytecode directly into a [`Chunk`] as it goes -- there is no
//! intermediate AST.

use lox_core::{Chunk, Heap, OpCode, Value};

use crate::scanner::{Scanner, Token, TokenKind};

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
    /// One step up, used to make binary operators left-associative by
    /// parsing their right operand at `precedence + 1`.
    fn next(self) -> Precedence {
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

/// The precedence at which a token kind binds as an infix operator; `None`
/// for everything that isn't one (ends the climb in `parse_precedence`).
fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Minus | Plus => Precedence::Term,
        Slash | Star => Precedence::Factor,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        _ => Precedence::None,
    }
}

struct Local<'src> {
    name: Token<'src>,
    /// `-1` means declared but not yet initialized: the name is reserved so
    /// `var x = x;` cannot read the outer `x` through it, but reads of this
    /// slot are a compile error until `mark_initialized` runs.
    depth: i32,
}

struct ParserState<'src> {
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

pub struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    parser: ParserState<'src>,
    chunk: Chunk,
    heap: &'heap mut Heap,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
}

const MAX_LOCALS: usize = 256;
const MAX_CONSTANTS: usize = 256;

/// Compiles `source` into a [`Chunk`], interning any string literals and
/// global-variable names into `heap`. Errors are reported to stderr as they
/// are found (clox's accumulate-and-continue model); the `Result` only
/// communicates whether compilation succeeded overall.
pub fn compile(source: &str, heap: &mut Heap) -> Result<Chunk, ()> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    compiler.end_compiler();

    if compiler.parser.had_error {
        Err(())
    } else {
        Ok(compiler.chunk)
    }
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    fn new(source: &'src str, heap: &'heap mut Heap) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Compiler {
            scanner: Scanner::new(source),
            parser: ParserState {
                previous: placeholder,
                current: placeholder,
                had_error: false,
                panic_mode: false,
            },
            chunk: Chunk::new(),
            heap,
            locals: Vec::new(),
            scope_depth: 0,
        }
    }

    // ---- token stream plumbing ----------------------------------------

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.scanner.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let message = self.parser.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.parser.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.parser.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        eprintln!("[line {}] Error{}: {}", token.line, location, message);
        tracing::debug!(line = token.line, detail = message, "compile error reported, entering panic mode");
        self.parser.had_error = true;
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.parser.current.kind {
                Class | Fun | Var | For | If | While | Print | Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- declarations & statements --------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Pop);
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.scope_depth -= 1;
        while let Some(local) = self.locals.last() {
            if local.depth > self.scope_depth {
                self.emit_op(OpCode::Pop);
                self.locals.pop();
            } else {
                break;
            }
        }
    }

    // ---- variables -------------------------------------------------------

    fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.consume(TokenKind::Identifier, error_message);
        let name = self.parser.previous;
        self.declare_variable(name);
        if self.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name)
    }

    fn identifier_constant(&mut self, name: Token<'src>) -> u8 {
        let obj = self.heap.copy_string(name.lexeme);
        let index = self.chunk.add_constant(Value::Obj(obj));
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn declare_variable(&mut self, name: Token<'src>) {
        if self.scope_depth == 0 {
            return;
        }
        for local in self.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.scope_depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                self.error("A variable with this name already exists in the same scope.");
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.locals.len() >= MAX_LOCALS {
            self.error("Only a maximum of 256 local variables is supported.");
            return;
        }
        self.locals.push(Local { name, depth: -1 });
    }

    fn define_variable(&mut self, global: u8) {
        if self.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal, global);
    }

    /// Updates the just-declared local's depth in place, rather than
    /// replacing the `Local` by value -- losing that update would make
    /// `end_scope` think the local belongs to an outer scope.
    fn mark_initialized(&mut self) {
        if let Some(local) = self.locals.last_mut() {
            local.depth = self.scope_depth;
        }
    }

    fn resolve_local(&mut self, name: &Token<'src>) -> Option<u8> {
        for (slot, local) in self.locals.iter().enumerate().rev() {
            if local.name.lexeme == name.lexeme {
                if local.depth == -1 {
                    self.error("Can't read a local variable in its own initializer.");
                }
                return Some(slot as u8);
            }
        }
        None
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let line = name.line;
        let (get_op, set_op, index) = match self.resolve_local(&name) {
            Some(slot) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            None => {
                let index = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, index)
            }
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes_at(set_op, index, line);
        } else {
            self.emit_bytes_at(get_op, index, line);
        }
    }

    // ---- expressions -------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.parser.previous.kind, can_assign) {
            self.error("Expect expression");
            return;
        }

        while precedence <= infix_precedence(self.parser.current.kind) {
            self.advance();
            self.infix_rule(self.parser.previous.kind);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Dispatches a prefix parselet for `kind` (the token just consumed as
    /// `self.parser.previous`). Returns `false` if `kind` has no prefix
    /// position at all, so the caller can report "Expect expression".
    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string(),
            False | True | Nil => self.literal(),
            Identifier => self.variable(can_assign),
            _ => return false,
        }
        true
    }

    /// Dispatches an infix parselet for `kind` (the operator just consumed
    /// as `self.parser.previous`); every token reaching here has positive
    /// `infix_precedence`, so `binary` is the only infix parselet needed.
    fn infix_rule(&mut self, kind: TokenKind) {
        self.binary(kind);
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.parser.previous.kind;
        let line = self.parser.previous.line;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op_at(OpCode::Negate, line),
            TokenKind::Bang => self.emit_op_at(OpCode::Not, line),
            _ => unreachable!("unary() only dispatched for - and !"),
        }
    }

    fn binary(&mut self, operator: TokenKind) {
        let line = self.parser.previous.line;
        self.parse_precedence(infix_precedence(operator).next());
        match operator {
            TokenKind::Plus => self.emit_op_at(OpCode::Add, line),
            TokenKind::Minus => self.emit_op_at(OpCode::Subtract, line),
            TokenKind::Star => self.emit_op_at(OpCode::Multiply, line),
            TokenKind::Slash => self.emit_op_at(OpCode::Divide, line),
            TokenKind::EqualEqual => self.emit_op_at(OpCode::Equal, line),
            TokenKind::BangEqual => {
                self.emit_op_at(OpCode::Equal, line);
                self.emit_op_at(OpCode::Not, line);
            }
            TokenKind::Greater => self.emit_op_at(OpCode::Greater, line),
            TokenKind::GreaterEqual => {
                self.emit_op_at(OpCode::Less, line);
                self.emit_op_at(OpCode::Not, line);
            }
            TokenKind::Less => self.emit_op_at(OpCode::Less, line),
            TokenKind::LessEqual => {
                self.emit_op_at(OpCode::Greater, line);
                self.emit_op_at(OpCode::Not, line);
            }
            _ => unreachable!("binary() only dispatched for arithmetic/comparison operators"),
        }
    }

    fn number(&mut self) {
        let line = self.parser.previous.line;
        let value: f64 = self
            .parser
            .previous
            .lexeme
            .parse()
            .expect("scanner only emits well-formed number lexemes");
        self.emit_constant(Value::Number(value), line);
    }

    fn string(&mut self) {
        let line = self.parser.previous.line;
        let lexeme = self.parser.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let obj = self.heap.copy_string(content);
        self.emit_constant(Value::Obj(obj), line);
    }

    fn literal(&mut self) {
        let line = self.parser.previous.line;
        match self.parser.previous.kind {
            TokenKind::False => self.emit_op_at(OpCode::False, line),
            TokenKind::True => self.emit_op_at(OpCode::True, line),
            TokenKind::Nil => self.emit_op_at(OpCode::Nil, line),
            _ => unreachable!("literal() only dispatched for false/true/nil"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous;
        self.named_variable(name, can_assign);
    }

    // ---- emission -------------------------------------------------------

    fn emit_op(&mut self, op: OpCode) {
        let line = self.parser.previous.line;
        self.emit_op_at(op, line);
    }

    fn emit_op_at(&mut self, op: OpCode, line: usize) {
        self.chunk.write_op(op, line);
    }

    fn emit_bytes(&mut self, op: OpCode, operand: u8) {
        let line = self.parser.previous.line;
        self.emit_bytes_at(op, operand, line);
    }

    fn emit_bytes_at(&mut self, op: OpCode, operand: u8, line: usize) {
        self.chunk.write_op(op, line);
        self.chunk.write(operand, line);
    }

    fn emit_constant(&mut self, value: Value, line: usize) {
        let index = self.chunk.add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return;
        }
        self.chunk.write_op(OpCode::Constant, line);
        self.chunk.write(index as u8, line);
    }

    fn end_compiler(&mut self) {
        let line = self.parser.previous.line;
        self.emit_op_at(OpCode::Return, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> Chunk {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect("expected successful compilation")
    }

    fn op_count(chunk: &Chunk, op: OpCode) -> usize {
        let mut count = 0;
        let mut i = 0;
        while i < chunk.code.len() {
            let current = OpCode::from_byte(chunk.code[i]).unwrap();
            if current == op {
                count += 1;
            }
            i += operand_width(current) + 1;
        }
        count
    }

    fn operand_width(op: OpCode) -> usize {
        use OpCode::*;
        match op {
            Constant | GetLocal | SetLocal | GetGlobal | DefineGlobal | SetGlobal => 1,
            _ => 0,
        }
    }

    fn ordered_ops(chunk: &Chunk) -> Vec<OpCode> {
        let mut ops = Vec::new();
        let mut i = 0;
        while i < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[i]).unwrap();
            ops.push(op);
            i += operand_width(op) + 1;
        }
        ops
    }

    #[test]
    fn arithmetic_precedence_emits_multiply_before_add() {
        let chunk = compile_ok("print 1 + 2 * 3;");
        let positions: Vec<OpCode> = ordered_ops(&chunk)
            .into_iter()
            .filter(|op| matches!(op, OpCode::Add | OpCode::Multiply))
            .collect();
        assert_eq!(positions, vec![OpCode::Multiply, OpCode::Add]);
    }

    #[test]
    fn every_chunk_ends_in_return() {
        let chunk = compile_ok("print 1;");
        assert_eq!(*chunk.code.last().unwrap(), OpCode::Return as u8);
    }

    #[test]
    fn expression_statement_pops_its_value() {
        let chunk = compile_ok("1 + 1;");
        assert_eq!(op_count(&chunk, OpCode::Pop), 1);
    }

    #[test]
    fn block_scoped_local_shadows_and_is_popped_on_scope_exit() {
        let chunk = compile_ok("var a = 1; { var a = 2; print a; } print a;");
        // one OP_POP for the block-scoped local going out of scope
        assert!(op_count(&chunk, OpCode::Pop) >= 1);
        assert_eq!(op_count(&chunk, OpCode::GetLocal), 1);
        assert_eq!(op_count(&chunk, OpCode::GetGlobal), 1);
    }

    #[test]
    fn reading_local_in_its_own_initializer_is_a_compile_error() {
        let mut heap = Heap::new();
        let result = compile("{ var a = a; }", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn invalid_assignment_target_is_a_compile_error() {
        let mut heap = Heap::new();
        let result = compile("1 + 2 = 3;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn redeclaring_a_name_in_the_same_scope_is_a_compile_error() {
        let mut heap = Heap::new();
        let result = compile("{ var a = 1; var a = 2; }", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn string_literals_intern_identically() {
        use std::rc::Rc;

        let mut heap = Heap::new();
        let chunk = compile("print \"hi\" == \"hi\";", &mut heap).unwrap();
        let objs: Vec<_> = chunk
            .constants
            .iter()
            .filter_map(|v| match v {
                Value::Obj(obj) => Some(obj.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(objs.len(), 2);
        assert!(Rc::ptr_eq(&objs[0], &objs[1]));
    }
}
