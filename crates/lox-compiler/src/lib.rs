//! Scanner and single-pass compiler: turns Lox source text into a
//! [`lox_core::Chunk`] of bytecode, interning identifiers and string
//! literals into a shared [`lox_core::Heap`] as it goes.

pub mod compiler;
pub mod scanner;

pub use compiler::compile;
pub use scanner::{Scanner, Token, TokenKind};
