#![allow(dead_code)]

use hsilc::{
    compile_module,
    diagnostics::Diagnostics,
    error::Result,
    frontend::{
        ast::{Ast, Function, Module, NodeId, Position},
        coder::AstCoder,
        symbol::{SymbolFlags, SymbolId, SymbolTable},
        types::{TypeStorage, VariableType},
    },
    middle::il::{self, CodedFunction, InstructionKind},
    options::CompilerOptions,
};

pub const P: Position = Position::new(1, 1);

/// A compilation unit assembled by hand, the way a front end would hand it
/// over after type checking
pub struct Unit {
    pub ast: Ast,
    pub types: TypeStorage,
    pub symbols: SymbolTable,
    pub outside_state: SymbolId,
    pub initializer: SymbolId,
    pub functions: Vec<Function>,
}

impl Unit {
    pub fn new() -> Self {
        let mut symbols = SymbolTable::new();
        symbols.register_builtins();
        let outside_state =
            symbols.register_variable(":OUTSIDESTATE", P, VariableType::Variant, SymbolFlags::empty());
        let initializer =
            symbols.register_function(":INITFUNCTION", P, &[], VariableType::NoReturn, SymbolFlags::empty());

        Self {
            ast: Ast::new(),
            types: TypeStorage::new(),
            symbols,
            outside_state,
            initializer,
            functions: Vec::new(),
        }
    }

    pub fn local(&mut self, name: &str, ty: VariableType) -> SymbolId {
        self.symbols.register_variable(name, P, ty, SymbolFlags::empty())
    }

    pub fn coder(&mut self) -> AstCoder<'_> {
        AstCoder::new(&mut self.ast, &mut self.types, &mut self.symbols)
    }

    /// Builds the body of `function` with the coder
    pub fn define(&mut self, function: SymbolId, build: impl FnOnce(&mut AstCoder<'_>) -> Result<()>) {
        let body = {
            let mut coder = self.coder();
            coder.open_block(P);
            build(&mut coder).unwrap();
            let body = coder.close_block().unwrap();
            assert!(coder.is_balanced());
            body
        };

        self.functions.push(Function {
            symbol: function,
            position: P,
            body,
        });
    }

    pub fn module(&self) -> Module {
        Module {
            source_name: "test.whscr".to_owned(),
            functions: self.functions.clone(),
            initializer: self.initializer,
            outside_state: self.outside_state,
            loadlibs: Vec::new(),
        }
    }

    pub fn compile(&mut self, options: &CompilerOptions) -> (Result<il::Module>, Diagnostics) {
        let module = self.module();
        let mut diagnostics = Diagnostics::new();
        let result = compile_module(
            &mut self.ast,
            &module,
            &mut self.symbols,
            &mut self.types,
            options,
            &mut diagnostics,
        );
        (result, diagnostics)
    }

    pub fn body(&self, function: SymbolId) -> NodeId {
        self.functions
            .iter()
            .find(|f| f.symbol == function)
            .map(|f| f.body)
            .unwrap()
    }
}

pub fn verified() -> CompilerOptions {
    CompilerOptions {
        verify_il: true,
        ..Default::default()
    }
}

pub fn calls_to(function: &CodedFunction, symbols: &SymbolTable, name: &str) -> usize {
    function
        .cfg
        .blocks
        .iter()
        .flat_map(|block| &block.instructions)
        .filter(|instruction| {
            matches!(
                &instruction.kind,
                InstructionKind::FunctionCall { function, .. } if symbols.name(*function) == name
            )
        })
        .count()
}

pub fn count_instructions(function: &CodedFunction, predicate: impl Fn(&InstructionKind) -> bool) -> usize {
    function
        .cfg
        .blocks
        .iter()
        .flat_map(|block| &block.instructions)
        .filter(|instruction| predicate(&instruction.kind))
        .count()
}
