//! Middle end of a HareScript compiler. Takes a type checked AST module and
//! produces an SSA form IL module for a bytecode emitter.

pub mod diagnostics;
pub mod error;
pub mod frontend;
pub mod index;
pub mod middle;
pub mod options;

use crate::{
    diagnostics::ErrorHandler,
    error::Result,
    frontend::{ast, symbol::SymbolTable, types::TypeStorage},
    middle::{
        il::{self, generator::generate_module, pretty_print::pretty_print_module, verify::verify_module},
        sql::translate_module,
        use_analysis::UseAnalysis,
    },
    options::CompilerOptions,
};

/// Runs the middle end over one module: SQL translation, use analysis and
/// IL generation, plus verification and printing when asked for.
///
/// User errors are reported to `diagnostics`; the returned module must not
/// be used when any were raised. An `Err` is an internal compiler error.
pub fn compile_module(
    ast: &mut ast::Ast,
    module: &ast::Module,
    symbols: &mut SymbolTable,
    types: &mut TypeStorage,
    options: &CompilerOptions,
    diagnostics: &mut dyn ErrorHandler,
) -> Result<il::Module> {
    symbols.register_builtins();

    translate_module(ast, module, symbols, types, options, diagnostics)?;

    let analysis = UseAnalysis::analyze(ast, module, symbols)?;
    tracing::debug!(
        module = %module.source_name,
        globals = analysis.globals.len(),
        "use analysis done"
    );

    let il = generate_module(ast, module, symbols, types, &analysis, options, diagnostics)?;

    if options.verify_il {
        verify_module(&il)?;
    }

    if options.print_il {
        pretty_print_module(&il, symbols);
    }

    Ok(il)
}
