mod compiler;
mod consts;
mod elf;
mod emit;
mod expr;
mod host;
mod kind;
mod lexer;
mod limits;
mod preproc;
mod program;
mod stmt;
mod symbols;

pub use compiler::*;
pub use elf::*;
pub use emit::*;
pub use host::*;
pub use kind::*;
pub use lexer::*;
pub use limits::*;
pub use preproc::*;
pub use program::*;
pub use symbols::*;

pub use consts::{builtin_const, fold_ident, ident_maybe_const};
