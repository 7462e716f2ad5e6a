//! User facing diagnostics. The compiler core only raises typed codes with a
//! source position; turning them into prose belongs to the driver.
//! [`Diagnostics::emit`] is the minimal rendering used by tools and tests.

use colored::Colorize;

use crate::frontend::ast::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum ErrorCode {
    #[strum(to_string = "WHERE clause does not depend on any source")]
    IndependentWhere,
    #[strum(to_string = "SELECT expression does not depend on any source")]
    IndependentSelect,
    #[strum(to_string = "HAVING clause does not depend on any source")]
    IndependentHaving,
    #[strum(to_string = "ORDER BY expression does not depend on any source")]
    IndependentOrderBy,
    #[strum(to_string = "GROUP BY expression does not depend on any source")]
    IndependentGroupBy,
    #[strum(to_string = "temporary does not depend on any source")]
    IndependentTemporary,
    #[strum(to_string = "function must return a value")]
    FunctionMustReturnValue,
    #[strum(to_string = "multiple deinit macros in one library")]
    MultipleDeinitMacros,
    #[strum(to_string = "cannot write to read-only column")]
    WriteToReadOnlyColumn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum WarningCode {
    #[strum(to_string = "WHERE clause could only be partly optimized")]
    PartlyUnoptimizedWhere,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticCode {
    Error(ErrorCode),
    Warning(WarningCode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub position: Position,
    /// Extra message arguments (a column name, a function name)
    pub argument: Option<String>,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        matches!(self.code, DiagnosticCode::Error(_))
    }
}

/// The error handler collaborator every pass reports through.
pub trait ErrorHandler {
    fn add_error(&mut self, position: Position, code: ErrorCode, argument: Option<String>);

    fn add_warning(&mut self, position: Position, code: WarningCode, argument: Option<String>);
}

/// Collects diagnostics for one compilation unit so that multiple independent
/// errors surface in a single run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        self.list.iter().any(Diagnostic::is_error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.list.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = ErrorCode> + '_ {
        self.list.iter().filter_map(|d| match d.code {
            DiagnosticCode::Error(code) => Some(code),
            DiagnosticCode::Warning(_) => None,
        })
    }

    pub fn warnings(&self) -> impl Iterator<Item = WarningCode> + '_ {
        self.list.iter().filter_map(|d| match d.code {
            DiagnosticCode::Warning(code) => Some(code),
            DiagnosticCode::Error(_) => None,
        })
    }

    /// Prints all collected diagnostics to stderr
    pub fn emit(&self, source_name: &str) {
        for diagnostic in &self.list {
            let (label, message) = match diagnostic.code {
                DiagnosticCode::Error(code) => ("error".red(), code.to_string()),
                DiagnosticCode::Warning(code) => ("warning".yellow(), code.to_string()),
            };

            let message = match &diagnostic.argument {
                Some(argument) => format!("{message}: {argument}"),
                None => message,
            };

            eprintln!(
                "{}: {} {}",
                label,
                message,
                format!("(at {source_name}:{})", diagnostic.position).white()
            );
        }
    }
}

impl ErrorHandler for Diagnostics {
    fn add_error(&mut self, position: Position, code: ErrorCode, argument: Option<String>) {
        tracing::debug!(%position, ?code, "compile error");
        self.list.push(Diagnostic {
            code: DiagnosticCode::Error(code),
            position,
            argument,
        });
    }

    fn add_warning(&mut self, position: Position, code: WarningCode, argument: Option<String>) {
        tracing::debug!(%position, ?code, "compile warning");
        self.list.push(Diagnostic {
            code: DiagnosticCode::Warning(code),
            position,
            argument,
        });
    }
}
