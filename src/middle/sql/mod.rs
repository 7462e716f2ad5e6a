//! Translation of SQL statements and expressions into imperative AST

pub mod decompose;
pub mod group_by;
pub mod optimize;
pub mod translate;

pub use translate::translate_module;
