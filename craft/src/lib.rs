//! `craft`: a single-pass compiler and stack-based virtual machine for a
//! small dynamically-typed, class-based scripting language.
//!
//! The crate is split the way the language's reference implementation is:
//! a [`lexer`] feeding a [`compiler`] that emits [`chunk`] bytecode directly
//! (no intermediate AST), executed by a [`vm`]. Every heap value lives
//! behind the mark-sweep [`heap`], addressed through [`object::ObjRef`].

pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod heap;
pub mod lexer;
pub mod object;
pub mod repl;
pub mod reporting;
pub mod table;
pub mod trace;
pub mod value;
pub mod vm;

pub use reporting::SourceView;
pub use value::Value;
pub use vm::{InterpretResult, Vm};
