//! The inputs of the middle end. Parsing and type checking happen elsewhere;
//! what arrives here is a typed AST arena, the symbol table and the type
//! annotations of every expression node. [`coder::AstCoder`] is the single
//! place new nodes are manufactured.

pub mod ast;
pub mod coder;
pub mod intern;
pub mod symbol;
pub mod types;
