//! Instruction set, code unit builder and the virtual machine.
//!
//! # Module Structure
//!
//! - `op` - Opcode catalog and operand layouts
//! - `builder` - `CodeBuilder` for emitting code units
//! - `vm` - Stack-based interpreter that executes code units

pub use builder::{CodeBuilder, JumpLabel};
pub use op::{
    CALL_VARARGS_KWARGS, MAKE_FUNCTION_CLOSURE, MAKE_FUNCTION_DEFAULTS, MAKE_FUNCTION_KWDEFAULTS, Opcode, Operands,
};

mod builder;
pub(crate) mod op;
pub(crate) mod vm;
