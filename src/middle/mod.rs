//! The middle end proper. SQL is translated into plain AST first, then the
//! whole module is analyzed for global variable use, and finally every
//! function is lowered into SSA form IL.

pub mod il;
pub mod sql;
pub mod use_analysis;
