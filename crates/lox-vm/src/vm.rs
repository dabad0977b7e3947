//! Stack-based opcode dispatch loop.
//!
//! `Vm` owns everything that must survive across REPL lines -- the value
//! stack, the globals table, and the heap (string interning + object
//! ownership). `interpret` executes one already-compiled [`Chunk`]; the
//! caller is responsible for compiling source into that chunk using the
//! same `Heap` (see `Vm::heap_mut`), so identifiers and string literals
//! intern consistently across lines.

use std::rc::Rc;

use lox_core::{Chunk, Heap, ObjString, OpCode, Table, Value};

const STACK_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

pub struct Vm {
    stack: Vec<Value>,
    globals: Table,
    heap: Heap,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Vm {
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
            heap: Heap::new(),
        }
    }

    /// The heap the VM's globals and prior program runs have interned into --
    /// callers compile new source against this same heap so identifiers and
    /// string literals keep interning consistently across REPL lines.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn interpret(&mut self, chunk: &Chunk) -> InterpretResult {
        self.run(chunk)
    }

    fn run(&mut self, chunk: &Chunk) -> InterpretResult {
        let mut ip: usize = 0;

        loop {
            let byte = chunk.code[ip];
            let op = match OpCode::from_byte(byte) {
                Some(op) => op,
                None => return self.runtime_error(chunk, ip, "Unknown opcode."),
            };
            tracing::trace!(ip, ?op, stack_top = ?self.stack.last(), "dispatch");
            ip += 1;

            match op {
                OpCode::Constant => {
                    let index = chunk.code[ip] as usize;
                    ip += 1;
                    let value = chunk.constants[index].clone();
                    if let Err(result) = self.push_checked(chunk, ip, value) {
                        return result;
                    }
                }
                OpCode::Nil => {
                    if let Err(result) = self.push_checked(chunk, ip, Value::Nil) {
                        return result;
                    }
                }
                OpCode::True => {
                    if let Err(result) = self.push_checked(chunk, ip, Value::Bool(true)) {
                        return result;
                    }
                }
                OpCode::False => {
                    if let Err(result) = self.push_checked(chunk, ip, Value::Bool(false)) {
                        return result;
                    }
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = chunk.code[ip] as usize;
                    ip += 1;
                    let value = self.stack[slot].clone();
                    if let Err(result) = self.push_checked(chunk, ip, value) {
                        return result;
                    }
                }
                OpCode::SetLocal => {
                    let slot = chunk.code[ip] as usize;
                    ip += 1;
                    self.stack[slot] = self.peek(0).clone();
                }
                OpCode::GetGlobal => {
                    let index = chunk.code[ip] as usize;
                    ip += 1;
                    let name = Self::read_string_constant(chunk, index).clone();
                    match self.globals.get(&name) {
                        Some(value) => {
                            if let Err(result) = self.push_checked(chunk, ip, value) {
                                return result;
                            }
                        }
                        None => {
                            let message = format!("Undefined variable '{}'.", name.as_str());
                            return self.runtime_error(chunk, ip, &message);
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let index = chunk.code[ip] as usize;
                    ip += 1;
                    let name = Self::read_string_constant(chunk, index).clone();
                    let value = self.peek(0).clone();
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let index = chunk.code[ip] as usize;
                    ip += 1;
                    let name = Self::read_string_constant(chunk, index).clone();
                    let value = self.peek(0).clone();
                    if self.globals.set(name.clone(), value) {
                        self.globals.delete(&name);
                        let message = format!("Undefined variable '{}'.", name.as_str());
                        return self.runtime_error(chunk, ip, &message);
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    if let Err(result) = self.push_checked(chunk, ip, Value::Bool(a == b)) {
                        return result;
                    }
                }
                OpCode::Greater => {
                    if let Err(result) =
                        self.binary_number_op(chunk, ip, |a, b| Value::Bool(a > b))
                    {
                        return result;
                    }
                }
                OpCode::Less => {
                    if let Err(result) =
                        self.binary_number_op(chunk, ip, |a, b| Value::Bool(a < b))
                    {
                        return result;
                    }
                }
                OpCode::Add => {
                    if let Err(result) = self.add(chunk, ip) {
                        return result;
                    }
                }
                OpCode::Subtract => {
                    if let Err(result) =
                        self.binary_number_op(chunk, ip, |a, b| Value::Number(a - b))
                    {
                        return result;
                    }
                }
                OpCode::Multiply => {
                    if let Err(result) =
                        self.binary_number_op(chunk, ip, |a, b| Value::Number(a * b))
                    {
                        return result;
                    }
                }
                OpCode::Divide => {
                    if let Err(result) =
                        self.binary_number_op(chunk, ip, |a, b| Value::Number(a / b))
                    {
                        return result;
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    let falsey = value.is_falsey();
                    if let Err(result) = self.push_checked(chunk, ip, Value::Bool(falsey)) {
                        return result;
                    }
                }
                OpCode::Negate => {
                    let operand = match self.peek(0).as_number() {
                        Some(n) => n,
                        None => return self.runtime_error(chunk, ip, "Operand must be a number."),
                    };
                    self.pop();
                    if let Err(result) = self.push_checked(chunk, ip, Value::Number(-operand)) {
                        return result;
                    }
                }
                OpCode::Print => {
                    let value = self.pop();
                    println!("{value}");
                }
                OpCode::Return => {
                    return InterpretResult::Ok;
                }
            }
        }
    }

    fn add(&mut self, chunk: &Chunk, ip: usize) -> Result<(), InterpretResult> {
        if self.peek(1).is_number() && self.peek(0).is_number() {
            let b = self.pop();
            let a = self.pop();
            let sum = a.as_number().unwrap() + b.as_number().unwrap();
            return self.push_checked(chunk, ip, Value::Number(sum));
        }
        if self.peek(1).is_string() && self.peek(0).is_string() {
            let b = self.pop();
            let a = self.pop();
            let mut concatenated = String::with_capacity(a.as_str().unwrap().len() + b.as_str().unwrap().len());
            concatenated.push_str(a.as_str().unwrap());
            concatenated.push_str(b.as_str().unwrap());
            let obj = self.heap.take_string(concatenated);
            return self.push_checked(chunk, ip, Value::Obj(obj));
        }
        Err(self.runtime_error(chunk, ip, "Operands must be two numbers or two strings."))
    }

    fn binary_number_op<F>(&mut self, chunk: &Chunk, ip: usize, f: F) -> Result<(), InterpretResult>
    where
        F: FnOnce(f64, f64) -> Value,
    {
        let (a, b) = match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(self.runtime_error(chunk, ip, "Operands must be numbers.")),
        };
        self.pop();
        self.pop();
        self.push_checked(chunk, ip, f(a, b))
    }

    fn push_checked(
        &mut self,
        chunk: &Chunk,
        ip: usize,
        value: Value,
    ) -> Result<(), InterpretResult> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error(chunk, ip, "Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack
            .pop()
            .expect("compiler never emits a pop past the stack's known-balanced depth")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn read_string_constant(chunk: &Chunk, index: usize) -> &Rc<ObjString> {
        match &chunk.constants[index] {
            Value::Obj(name) => name,
            _ => unreachable!("identifier constants are always interned strings"),
        }
    }

    fn runtime_error(&mut self, chunk: &Chunk, ip: usize, message: &str) -> InterpretResult {
        let line = chunk.lines.get(ip.saturating_sub(1)).copied().unwrap_or(0);
        eprintln!("{message}");
        eprintln!("[line {line}] in script");
        tracing::trace!(line, detail = message, "runtime error, resetting stack");
        self.stack.clear();
        InterpretResult::RuntimeError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executes_constant_arithmetic_and_leaves_result_on_stack() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Number(1.0)) as u8;
        let b = chunk.add_constant(Value::Number(2.0)) as u8;
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(a, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(b, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        assert_eq!(vm.interpret(&chunk), InterpretResult::Ok);
        assert_eq!(vm.stack, vec![Value::Number(3.0)]);
    }

    #[test]
    fn string_concatenation_interns_the_result() {
        let mut chunk = Chunk::new();
        let mut heap = Heap::new();
        let a = heap.copy_string("foo");
        let b = heap.copy_string("bar");
        let a_idx = chunk.add_constant(Value::Obj(a)) as u8;
        let b_idx = chunk.add_constant(Value::Obj(b)) as u8;
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(a_idx, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(b_idx, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        assert_eq!(vm.interpret(&chunk), InterpretResult::Ok);
        assert_eq!(vm.stack.len(), 1);
        assert_eq!(vm.stack[0].as_str(), Some("foobar"));
    }

    #[test]
    fn negating_a_string_is_a_runtime_error() {
        let mut heap = Heap::new();
        let s = heap.copy_string("abc");
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Obj(s)) as u8;
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(idx, 1);
        chunk.write_op(OpCode::Negate, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        assert_eq!(vm.interpret(&chunk), InterpretResult::RuntimeError);
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn define_and_get_global_round_trips() {
        let mut heap = Heap::new();
        let name = heap.copy_string("x");
        let mut chunk = Chunk::new();
        let name_idx = chunk.add_constant(Value::Obj(name)) as u8;
        let value_idx = chunk.add_constant(Value::Number(10.0)) as u8;
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(value_idx, 1);
        chunk.write_op(OpCode::DefineGlobal, 1);
        chunk.write(name_idx, 1);
        chunk.write_op(OpCode::GetGlobal, 1);
        chunk.write(name_idx, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        assert_eq!(vm.interpret(&chunk), InterpretResult::Ok);
        assert_eq!(vm.stack, vec![Value::Number(10.0)]);
    }

    #[test]
    fn reading_undefined_global_is_a_runtime_error() {
        let mut heap = Heap::new();
        let name = heap.copy_string("missing");
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Obj(name)) as u8;
        chunk.write_op(OpCode::GetGlobal, 1);
        chunk.write(idx, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        assert_eq!(vm.interpret(&chunk), InterpretResult::RuntimeError);
    }

    #[test]
    fn assigning_an_undefined_global_is_a_runtime_error_and_does_not_define_it() {
        let mut heap = Heap::new();
        let name = heap.copy_string("y");
        let mut chunk = Chunk::new();
        let name_idx = chunk.add_constant(Value::Obj(name)) as u8;
        let value_idx = chunk.add_constant(Value::Number(1.0)) as u8;
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(value_idx, 1);
        chunk.write_op(OpCode::SetGlobal, 1);
        chunk.write(name_idx, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        assert_eq!(vm.interpret(&chunk), InterpretResult::RuntimeError);
    }

    #[test]
    fn stack_overflow_is_a_runtime_error_and_resets_the_stack() {
        let mut chunk = Chunk::new();
        for _ in 0..300 {
            chunk.write_op(OpCode::True, 1);
        }
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        assert_eq!(vm.interpret(&chunk), InterpretResult::RuntimeError);
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn local_slots_round_trip_through_get_and_set() {
        let mut chunk = Chunk::new();
        let value_idx = chunk.add_constant(Value::Number(1.0)) as u8;
        let new_value_idx = chunk.add_constant(Value::Number(5.0)) as u8;
        chunk.write_op(OpCode::Constant, 1); // slot 0
        chunk.write(value_idx, 1);
        chunk.write_op(OpCode::Constant, 1); // pushes new value
        chunk.write(new_value_idx, 1);
        chunk.write_op(OpCode::SetLocal, 1); // stack[0] = 5
        chunk.write(0, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::GetLocal, 1);
        chunk.write(0, 1);
        chunk.write_op(OpCode::Return, 1);

        let mut vm = Vm::new();
        assert_eq!(vm.interpret(&chunk), InterpretResult::Ok);
        assert_eq!(vm.stack, vec![Value::Number(5.0)]);
    }
}
