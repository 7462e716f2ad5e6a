use bitflags::bitflags;
use hashbrown::HashMap;

use crate::{
    error::{InternalError, Result},
    frontend::{ast::Position, intern::InternedSymbol, types::VariableType},
    index::{IndexVec, simple_index},
};

simple_index! {
    /// Identifies a declaration in the [`SymbolTable`]
    pub struct SymbolId;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SymbolFlags: u32 {
        const PUBLIC = 1 << 0;
        const IMPORTED = 1 << 1;
        /// Pure function, or a variable that is never written after
        /// initialization
        const CONSTANT = 1 << 2;
        /// Calling this function never returns (ends the script)
        const TERMINATES = 1 << 3;
        /// Calls back into user code (function pointers, object methods)
        const EXECUTES_HARESCRIPT = 1 << 4;
        /// Does not touch any state outside its arguments
        const NO_STATE_MODIFY = 1 << 5;
        /// The last argument collects all extra arguments into an array
        const VAR_ARG = 1 << 6;
        const DEINIT_MACRO = 1 << 7;
        /// Aggregate function that counts rows instead of combining values
        const IS_COUNT = 1 << 8;
        /// Aggregate function, takes the array of all values in a group
        const AGGREGATE = 1 << 9;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: InternedSymbol,
    pub ty: VariableType,
    pub read_only: bool,
}

/// Column layout of a database table variable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDefinition {
    pub columns: Vec<TableColumn>,
}

impl TableDefinition {
    pub fn column(&self, name: InternedSymbol) -> Option<&TableColumn> {
        self.columns.iter().find(|column| column.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDef {
    pub ty: VariableType,
    /// Companion variable holding the iteration position (`#row`)
    pub counter: Option<SymbolId>,
    pub table: Option<TableDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    /// Argument variables, in declaration order
    pub arguments: Vec<SymbolId>,
    pub return_type: VariableType,
}

impl FunctionDef {
    pub fn is_macro(&self) -> bool {
        self.return_type == VariableType::NoReturn
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SymbolKind {
    Variable(VariableDef),
    Function(FunctionDef),
    ObjectType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: InternedSymbol,
    pub position: Position,
    pub flags: SymbolFlags,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn is_function(&self) -> bool {
        matches!(self.kind, SymbolKind::Function(_))
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.kind, SymbolKind::Variable(_))
    }
}

/// Name, argument types, return type and flags of a runtime builtin
type BuiltinSignature = (
    &'static str,
    &'static [VariableType],
    VariableType,
    SymbolFlags,
);

/// The functions the middle end calls on its own. Their names are the
/// contract with the runtime's builtin table and must not change.
const BUILTINS: &[BuiltinSignature] = {
    use VariableType::*;

    const PURE: SymbolFlags = SymbolFlags::NO_STATE_MODIFY;
    const STATEFUL: SymbolFlags = SymbolFlags::empty();

    &[
        (":THROWERROR", &[], NoReturn, STATEFUL),
        (":DEEPSET", &[], Variant, PURE),
        (":DEEPARRAYINSERT", &[], Variant, PURE),
        (":DEEPARRAYAPPEND", &[], Variant, PURE),
        (":DEEPARRAYDELETE", &[], Variant, PURE),
        (":ARRAYAPPEND", &[VariantArray, Variant], VariantArray, PURE),
        (":ARRAYINDEX", &[VariantArray, Integer], Variant, PURE),
        (":RECORDCELLCREATE", &[Record, String, Variant], Record, PURE),
        ("LENGTH", &[Variant], Integer, PURE),
        ("TOUPPERCASE", &[String], String, PURE),
        (
            "__HS_SQL_OPENCURSOR2",
            &[RecordArray, RecordArray, Integer, Integer],
            Integer,
            STATEFUL,
        ),
        ("__HS_SQL_GETACTION", &[Integer], Integer, STATEFUL),
        ("__HS_SQL_GETRECORD", &[Integer, Integer], Record, STATEFUL),
        (
            "__HS_SQL_REPORTFASE1RESULT",
            &[Integer, Boolean],
            NoReturn,
            STATEFUL,
        ),
        ("__HS_SQL_CLOSECURSOR", &[Integer], NoReturn, STATEFUL),
        ("__HS_SQL_DELETERECORD", &[Integer, Integer], NoReturn, STATEFUL),
        (
            "__HS_SQL_UPDATERECORD",
            &[Integer, Integer, Record],
            NoReturn,
            STATEFUL,
        ),
        ("__HS_SQL_INSERT", &[Table, Record], NoReturn, STATEFUL),
        (
            "__HS_SQL_GETGROUPPOSITION",
            &[RecordArray, Record],
            Integer,
            PURE,
        ),
        (
            "__HS_SQL_ORDERRESULT",
            &[RecordArray, BooleanArray, Integer],
            RecordArray,
            PURE,
        ),
    ]
};

#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: IndexVec<SymbolId, Symbol>,
    by_name: HashMap<InternedSymbol, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id]
    }

    pub fn name(&self, id: SymbolId) -> &'static str {
        self.symbols[id].name.value()
    }

    pub fn flags(&self, id: SymbolId) -> SymbolFlags {
        self.symbols[id].flags
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols.enumerate()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Adds a symbol. Named lookups see the most recent declaration of a name;
    /// scoping is the business of the front end.
    pub fn register(&mut self, symbol: Symbol) -> SymbolId {
        let name = symbol.name;
        let id = self.symbols.push(symbol);
        self.by_name.insert(name, id);
        id
    }

    pub fn register_variable(
        &mut self,
        name: &str,
        position: Position,
        ty: VariableType,
        flags: SymbolFlags,
    ) -> SymbolId {
        self.register(Symbol {
            name: InternedSymbol::uppercase(name),
            position,
            flags,
            kind: SymbolKind::Variable(VariableDef {
                ty,
                counter: None,
                table: None,
            }),
        })
    }

    pub fn register_table(
        &mut self,
        name: &str,
        position: Position,
        definition: TableDefinition,
        flags: SymbolFlags,
    ) -> SymbolId {
        self.register(Symbol {
            name: InternedSymbol::uppercase(name),
            position,
            flags,
            kind: SymbolKind::Variable(VariableDef {
                ty: VariableType::Table,
                counter: None,
                table: Some(definition),
            }),
        })
    }

    /// Registers a function together with a variable symbol per argument
    pub fn register_function(
        &mut self,
        name: &str,
        position: Position,
        arguments: &[(&str, VariableType)],
        return_type: VariableType,
        flags: SymbolFlags,
    ) -> SymbolId {
        let arguments = arguments
            .iter()
            .map(|(name, ty)| self.register_variable(name, position, *ty, SymbolFlags::empty()))
            .collect();

        self.register(Symbol {
            name: InternedSymbol::uppercase(name),
            position,
            flags,
            kind: SymbolKind::Function(FunctionDef {
                arguments,
                return_type,
            }),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(&InternedSymbol::uppercase(name)).copied()
    }

    /// Registers every runtime builtin the middle end may emit calls to.
    /// Already registered names are left alone.
    pub fn register_builtins(&mut self) {
        for (name, arguments, return_type, flags) in BUILTINS {
            if self.lookup(name).is_some() {
                continue;
            }

            let arguments = arguments
                .iter()
                .enumerate()
                .map(|(i, ty)| (format!("ARG{i}"), *ty))
                .collect::<Vec<_>>();
            let arguments = arguments
                .iter()
                .map(|(name, ty)| (name.as_str(), *ty))
                .collect::<Vec<_>>();

            self.register_function(
                name,
                Position::default(),
                &arguments,
                *return_type,
                *flags,
            );
        }
    }

    pub fn resolve_builtin(&self, name: &'static str) -> Result<SymbolId> {
        self.lookup(name)
            .filter(|id| self.get(*id).is_function())
            .ok_or(InternalError::UnknownBuiltin(name))
    }

    pub fn function(&self, id: SymbolId) -> Result<&FunctionDef> {
        match &self.symbols[id].kind {
            SymbolKind::Function(function) => Ok(function),
            _ => Err(InternalError::NotAFunction(id)),
        }
    }

    pub fn variable(&self, id: SymbolId) -> Option<&VariableDef> {
        match &self.symbols[id].kind {
            SymbolKind::Variable(variable) => Some(variable),
            _ => None,
        }
    }

    /// Type of a variable symbol, `VARIANT` for anything else
    pub fn variable_type(&self, id: SymbolId) -> VariableType {
        self.variable(id)
            .map(|variable| variable.ty)
            .unwrap_or(VariableType::Variant)
    }
}
