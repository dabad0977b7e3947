//! Stack-based bytecode interpreter: executes a [`lox_core::Chunk`] against
//! a persistent value stack, globals table, and heap.

pub mod vm;

pub use vm::{InterpretResult, Vm};
