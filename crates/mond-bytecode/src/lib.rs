//! Bytecode model: instruction encoding, operand layouts, unlinked
//! modules, the programmatic builder, and the binary chunk format.

pub mod builder;
pub mod chunk;
pub mod module;
pub mod opcode;
pub mod operands;
