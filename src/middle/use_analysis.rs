//! Whole module analysis of global variable use. Decides which variables are
//! global (live across calls), and computes per function which globals it
//! reads and writes, transitively through the call graph.
//!
//! The result is a side table keyed by function symbol; the symbol table is
//! only read.

use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;

use crate::{
    error::Result,
    frontend::{
        ast::{self, Ast, LayerKind, NodeId, NodeKind, SqlSourceKind, visit::{self, Visitor}},
        symbol::{SymbolFlags, SymbolId, SymbolTable},
    },
};

/// Facts gathered for one function while the analysis runs
#[derive(Debug, Default, Clone)]
struct FunctionData {
    uses: HashSet<SymbolId>,
    defs: HashSet<SymbolId>,
    calls: HashSet<SymbolId>,
    callers: HashSet<SymbolId>,
    unprocessed_callees: usize,
    /// Distance from a root of the call graph, only used to order the
    /// reprocessing of recursive functions
    depth: usize,
    executes_user_code: bool,
    has_body: bool,
}

/// The frozen use/def facts of a function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionEffects {
    pub uses: Vec<SymbolId>,
    pub defs: Vec<SymbolId>,
    pub calls: Vec<SymbolId>,
    pub executes_user_code: bool,
}

#[derive(Debug)]
pub struct UseAnalysis {
    /// All global symbols, sorted
    pub globals: Vec<SymbolId>,
    pub outside_state: SymbolId,
    functions: HashMap<SymbolId, FunctionEffects>,
}

struct RawUseCollector<'a> {
    symbols: &'a SymbolTable,
    outside_state: SymbolId,
    data: FunctionData,
}

impl RawUseCollector<'_> {
    fn touch_outside_state(&mut self) {
        self.data.uses.insert(self.outside_state);
        self.data.defs.insert(self.outside_state);
    }

    /// A query that rewrites a record array variable writes that variable
    fn define_source_variable(&mut self, ast: &Ast, source: &ast::SqlSource) {
        if source.kind == SqlSourceKind::RecordArray {
            if let NodeKind::Variable(symbol) = ast.kind(source.expression) {
                self.data.defs.insert(*symbol);
            }
        }
        self.data.defs.insert(source.row);
    }
}

impl Visitor for RawUseCollector<'_> {
    fn visit_node(&mut self, ast: &Ast, id: NodeId) {
        match ast.kind(id) {
            NodeKind::Variable(symbol) => {
                if self.symbols.get(*symbol).is_variable() {
                    self.data.uses.insert(*symbol);
                }
            }
            NodeKind::Assignment { symbol, .. } | NodeKind::VariableDeclaration { symbol, .. } => {
                self.data.defs.insert(*symbol);
            }
            NodeKind::TryCatch {
                exception: Some(symbol),
                ..
            } => {
                self.data.defs.insert(*symbol);
            }
            NodeKind::DeepOperation(operation) => {
                self.data.uses.insert(operation.base);
                self.data.defs.insert(operation.base);

                if operation
                    .layers
                    .first()
                    .is_some_and(|layer| layer.kind == LayerKind::Object)
                {
                    self.data.executes_user_code = true;
                }
            }
            NodeKind::FunctionCall { function, .. } => {
                self.data.calls.insert(*function);
            }
            NodeKind::FunctionPtrCall { .. }
            | NodeKind::MakeFunctionPtr { .. }
            | NodeKind::ObjectMember { .. }
            | NodeKind::ObjectMemberAssign { .. }
            | NodeKind::ObjectMethodCall { .. } => {
                self.data.executes_user_code = true;
            }
            NodeKind::SqlSelect(select) => {
                self.touch_outside_state();
                for source in &select.sources {
                    self.data.defs.insert(source.row);
                }
                for (temporary, _) in &select.temporaries {
                    self.data.defs.insert(*temporary);
                }
            }
            NodeKind::SqlDelete(delete) => {
                self.touch_outside_state();
                self.define_source_variable(ast, &delete.source);
            }
            NodeKind::SqlUpdate(update) => {
                self.touch_outside_state();
                self.define_source_variable(ast, &update.source);
            }
            NodeKind::SqlInsert(insert) => {
                self.touch_outside_state();
                if let NodeKind::Variable(symbol) = ast.kind(insert.target) {
                    if insert.kind == SqlSourceKind::RecordArray {
                        self.data.defs.insert(*symbol);
                    }
                }
            }
            _ => {}
        }

        visit::walk_node(self, ast, id)
    }
}

impl UseAnalysis {
    pub fn analyze(ast: &Ast, module: &ast::Module, symbols: &SymbolTable) -> Result<Self> {
        let mut functions: HashMap<SymbolId, FunctionData> = HashMap::new();

        /* Step 1: raw uses, defs and calls of every function */

        for (id, symbol) in symbols.iter() {
            if symbol.is_function() {
                functions.insert(id, FunctionData::default());
            }
        }

        for function in &module.functions {
            symbols.function(function.symbol)?;

            let mut collector = RawUseCollector {
                symbols,
                outside_state: module.outside_state,
                data: FunctionData {
                    has_body: true,
                    ..Default::default()
                },
            };
            collector.visit_node(ast, function.body);

            functions.insert(function.symbol, collector.data);
        }

        /* Step 2: every def is also a use */

        for data in functions.values_mut() {
            let defs = data.defs.clone();
            data.uses.extend(defs);
        }

        /* Step 3: the global symbols */

        let mut globals: HashSet<SymbolId> = HashSet::new();
        globals.insert(module.outside_state);

        for data in functions.values() {
            globals.extend(data.uses.iter().copied().filter(|symbol| {
                symbols
                    .flags(*symbol)
                    .intersects(SymbolFlags::IMPORTED | SymbolFlags::PUBLIC)
            }));
        }

        if let Some(initializer) = functions.get(&module.initializer) {
            for symbol in &initializer.defs {
                let used_elsewhere = functions
                    .iter()
                    .any(|(id, data)| *id != module.initializer && data.uses.contains(symbol));

                if used_elsewhere {
                    globals.insert(*symbol);
                }
            }
        }

        let globals = globals.into_iter().sorted().collect::<Vec<_>>();
        let global_set = globals.iter().copied().collect::<HashSet<_>>();

        let imported_globals = globals
            .iter()
            .copied()
            .filter(|symbol| {
                *symbol == module.outside_state
                    || symbols.flags(*symbol).contains(SymbolFlags::IMPORTED)
            })
            .collect::<Vec<_>>();

        /* Step 4: locals never need cross function tracking */

        for data in functions.values_mut() {
            data.uses.retain(|symbol| global_set.contains(symbol));
            data.defs.retain(|symbol| global_set.contains(symbol));
        }

        /* Step 5: the inverse call graph */

        let edges = functions
            .iter()
            .flat_map(|(caller, data)| data.calls.iter().map(move |callee| (*caller, *callee)))
            .collect::<Vec<_>>();

        for (caller, callee) in edges {
            let Some(callee_data) = functions.get_mut(&callee) else {
                continue;
            };
            callee_data.callers.insert(caller);

            if let Some(caller_data) = functions.get_mut(&caller) {
                caller_data.unprocessed_callees += 1;
            }
        }

        /* Step 6: calling user code is contagious */

        for (id, data) in functions.iter_mut() {
            if symbols.flags(*id).contains(SymbolFlags::EXECUTES_HARESCRIPT) {
                data.executes_user_code = true;
            }
        }

        let mut worklist = functions
            .iter()
            .filter(|(_, data)| data.executes_user_code)
            .map(|(id, _)| *id)
            .sorted()
            .collect::<VecDeque<_>>();

        while let Some(function) = worklist.pop_front() {
            let callers = functions[&function].callers.iter().copied().sorted().collect::<Vec<_>>();

            for caller in callers {
                let data = functions.entry(caller).or_default();
                if !data.executes_user_code {
                    data.executes_user_code = true;
                    worklist.push_back(caller);
                }
            }
        }

        /* Step 7: conservative effects of opaque functions */

        let is_throw_error = |id: SymbolId| symbols.name(id) == ":THROWERROR";

        for (id, data) in functions.iter_mut() {
            let flags = symbols.flags(*id);
            if flags.contains(SymbolFlags::CONSTANT) {
                continue;
            }

            if data.executes_user_code {
                data.uses.extend(globals.iter().copied());
                data.defs.extend(globals.iter().copied());
            } else if !data.has_body && !flags.contains(SymbolFlags::NO_STATE_MODIFY) {
                data.uses.extend(imported_globals.iter().copied());
                data.defs.extend(imported_globals.iter().copied());
            }

            if flags.contains(SymbolFlags::TERMINATES) || is_throw_error(*id) {
                data.uses.insert(module.outside_state);
                data.defs.insert(module.outside_state);
            }
        }

        /* Step 8: propagate from callees to callers */

        Self::compute_depths(&mut functions);
        Self::propagate(&mut functions);

        /* Step 9: freeze */

        let functions = functions
            .into_iter()
            .map(|(id, data)| {
                let effects = FunctionEffects {
                    uses: data.uses.into_iter().sorted().collect(),
                    defs: data.defs.into_iter().sorted().collect(),
                    calls: data.calls.into_iter().sorted().collect(),
                    executes_user_code: data.executes_user_code,
                };
                (id, effects)
            })
            .collect::<HashMap<_, _>>();

        tracing::debug!(
            globals = globals.len(),
            functions = functions.len(),
            "global use analysis finished"
        );

        Ok(Self {
            globals,
            outside_state: module.outside_state,
            functions,
        })
    }

    /// Breadth first distance from the roots of the call graph. Functions
    /// that are only reachable through a cycle keep depth zero.
    fn compute_depths(functions: &mut HashMap<SymbolId, FunctionData>) {
        let mut queue = functions
            .iter()
            .filter(|(_, data)| data.callers.is_empty())
            .map(|(id, _)| *id)
            .sorted()
            .collect::<VecDeque<_>>();
        let mut seen = queue.iter().copied().collect::<HashSet<_>>();

        while let Some(function) = queue.pop_front() {
            let depth = functions[&function].depth;
            let callees = functions[&function].calls.iter().copied().sorted().collect::<Vec<_>>();

            for callee in callees {
                if !seen.insert(callee) {
                    continue;
                }
                if let Some(data) = functions.get_mut(&callee) {
                    data.depth = depth + 1;
                    queue.push_back(callee);
                }
            }
        }
    }

    fn merge_callee(functions: &mut HashMap<SymbolId, FunctionData>, caller: SymbolId, callee: SymbolId) -> bool {
        let Some(callee_data) = functions.get(&callee) else {
            return false;
        };
        let uses = callee_data.uses.iter().copied().collect::<Vec<_>>();
        let defs = callee_data.defs.iter().copied().collect::<Vec<_>>();

        let Some(caller_data) = functions.get_mut(&caller) else {
            return false;
        };
        let before = caller_data.uses.len() + caller_data.defs.len();
        caller_data.uses.extend(uses);
        caller_data.defs.extend(defs);
        before != caller_data.uses.len() + caller_data.defs.len()
    }

    fn propagate(functions: &mut HashMap<SymbolId, FunctionData>) {
        // Topological pass: a function is done once all its callees are
        let mut queue = functions
            .iter()
            .filter(|(_, data)| data.unprocessed_callees == 0)
            .map(|(id, _)| *id)
            .sorted()
            .collect::<VecDeque<_>>();

        while let Some(function) = queue.pop_front() {
            let callers = functions[&function].callers.iter().copied().sorted().collect::<Vec<_>>();

            for caller in callers {
                Self::merge_callee(functions, caller, function);

                let data = functions.entry(caller).or_default();
                data.unprocessed_callees = data.unprocessed_callees.saturating_sub(1);
                if data.unprocessed_callees == 0 {
                    queue.push_back(caller);
                }
            }
        }

        // Whatever is left sits on (or above) a recursion cycle. Iterate
        // deepest first until nothing changes anymore. This is a heuristic
        // order; shapes exist that need more rounds than a SCC based order.
        let remaining = functions
            .iter()
            .filter(|(_, data)| data.unprocessed_callees != 0)
            .map(|(id, data)| (*id, data.depth))
            .sorted_by(|(a_id, a_depth), (b_id, b_depth)| b_depth.cmp(a_depth).then(a_id.cmp(b_id)))
            .map(|(id, _)| id)
            .collect::<Vec<_>>();

        let mut round = 0;
        loop {
            let mut changed = false;

            for function in &remaining {
                let callees = functions[function].calls.iter().copied().sorted().collect::<Vec<_>>();
                for callee in callees {
                    changed |= Self::merge_callee(functions, *function, callee);
                }
            }

            round += 1;
            tracing::trace!(round, functions = remaining.len(), changed, "recursive use propagation");

            if !changed {
                break;
            }
        }
    }

    pub fn function(&self, symbol: SymbolId) -> Option<&FunctionEffects> {
        self.functions.get(&symbol)
    }

    pub fn is_global(&self, symbol: SymbolId) -> bool {
        self.globals.binary_search(&symbol).is_ok()
    }

    pub fn executes_user_code(&self, symbol: SymbolId) -> bool {
        self.functions
            .get(&symbol)
            .is_some_and(|effects| effects.executes_user_code)
    }

    /// Globals used and defined by a call to `symbol`. A function the
    /// analysis never saw is assumed to touch every global.
    pub fn effects(&self, symbol: SymbolId) -> (&[SymbolId], &[SymbolId]) {
        match self.functions.get(&symbol) {
            Some(effects) => (&effects.uses, &effects.defs),
            None => (&self.globals, &self.globals),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::frontend::{
        ast::{Constant, Function, Module, Position},
        types::VariableType,
    };

    struct Fixture {
        ast: Ast,
        symbols: SymbolTable,
        outside_state: SymbolId,
        initializer: SymbolId,
        functions: Vec<Function>,
    }

    const P: Position = Position::new(1, 1);

    impl Fixture {
        fn new() -> Self {
            let mut symbols = SymbolTable::new();
            symbols.register_builtins();
            let outside_state = symbols.register_variable(
                ":OUTSIDESTATE",
                P,
                VariableType::Variant,
                SymbolFlags::empty(),
            );
            let initializer =
                symbols.register_function(":INITFUNCTION", P, &[], VariableType::NoReturn, SymbolFlags::empty());

            Self {
                ast: Ast::new(),
                symbols,
                outside_state,
                initializer,
                functions: Vec::new(),
            }
        }

        fn read(&mut self, symbol: SymbolId) -> NodeId {
            let variable = self.ast.push(P, NodeKind::Variable(symbol));
            self.ast.push(P, NodeKind::ExpressionStatement(variable))
        }

        fn write(&mut self, symbol: SymbolId) -> NodeId {
            let value = self.ast.push(P, NodeKind::Constant(Constant::Integer(1)));
            self.ast.push(P, NodeKind::Assignment { symbol, value })
        }

        fn call(&mut self, function: SymbolId) -> NodeId {
            let call = self.ast.push(
                P,
                NodeKind::FunctionCall {
                    function,
                    arguments: vec![],
                },
            );
            self.ast.push(P, NodeKind::ExpressionStatement(call))
        }

        fn define(&mut self, symbol: SymbolId, statements: Vec<NodeId>) {
            let body = self.ast.push(P, NodeKind::Block(statements));
            self.functions.push(Function {
                symbol,
                position: P,
                body,
            });
        }

        fn analyze(&self) -> UseAnalysis {
            let module = Module {
                source_name: "test.whscr".to_owned(),
                functions: self.functions.clone(),
                initializer: self.initializer,
                outside_state: self.outside_state,
                loadlibs: vec![],
            };
            UseAnalysis::analyze(&self.ast, &module, &self.symbols).unwrap()
        }
    }

    #[test]
    fn initializer_variables_used_elsewhere_become_global() {
        let mut fx = Fixture::new();
        let shared = fx.symbols.register_variable("shared", P, VariableType::Integer, SymbolFlags::empty());
        let private = fx.symbols.register_variable("private", P, VariableType::Integer, SymbolFlags::empty());
        let reader = fx.symbols.register_function("reader", P, &[], VariableType::NoReturn, SymbolFlags::empty());

        let statements = vec![fx.write(shared), fx.write(private), fx.call(reader)];
        fx.define(fx.initializer, statements);
        let statements = vec![fx.read(shared)];
        fx.define(reader, statements);

        let analysis = fx.analyze();

        assert!(analysis.is_global(shared));
        assert!(!analysis.is_global(private));
        assert!(analysis.is_global(fx.outside_state));

        let (uses, defs) = analysis.effects(reader);
        assert_eq!(uses, &[shared]);
        assert!(defs.is_empty());

        // the initializer sees the read through its call
        let (uses, _) = analysis.effects(fx.initializer);
        assert!(uses.contains(&shared));
    }

    #[test]
    fn user_code_marks_callers_as_touching_everything() {
        let mut fx = Fixture::new();
        let global = fx.symbols.register_variable("g", P, VariableType::Integer, SymbolFlags::PUBLIC);
        let callback = fx.symbols.register_function("callback", P, &[], VariableType::NoReturn, SymbolFlags::empty());
        let indirect = fx.symbols.register_function("indirect", P, &[], VariableType::NoReturn, SymbolFlags::empty());
        let outer = fx.symbols.register_function("outer", P, &[], VariableType::NoReturn, SymbolFlags::empty());

        let statements = vec![fx.read(global)];
        fx.define(fx.initializer, statements);
        fx.define(callback, vec![]);

        let pointer = fx.ast.push(P, NodeKind::MakeFunctionPtr { function: callback });
        let call = fx.ast.push(
            P,
            NodeKind::FunctionPtrCall {
                pointer,
                arguments: vec![],
            },
        );
        let statement = fx.ast.push(P, NodeKind::ExpressionStatement(call));
        fx.define(indirect, vec![statement]);

        let statements = vec![fx.call(indirect)];
        fx.define(outer, statements);

        let analysis = fx.analyze();

        assert!(analysis.executes_user_code(indirect));
        assert!(analysis.executes_user_code(outer));
        assert!(!analysis.executes_user_code(callback));

        let (uses, defs) = analysis.effects(outer);
        assert_eq!(uses, analysis.globals.as_slice());
        assert_eq!(defs, analysis.globals.as_slice());
    }

    #[test]
    fn callback_runners_touch_every_global() {
        let mut fx = Fixture::new();
        let g = fx.symbols.register_variable("g", P, VariableType::Integer, SymbolFlags::empty());
        let reader = fx.symbols.register_function("reader", P, &[], VariableType::NoReturn, SymbolFlags::empty());
        let run_callbacks = fx.symbols.register_function(
            "runcallbacks",
            P,
            &[],
            VariableType::NoReturn,
            SymbolFlags::EXECUTES_HARESCRIPT,
        );
        let caller = fx.symbols.register_function("caller", P, &[], VariableType::NoReturn, SymbolFlags::empty());

        let statements = vec![fx.write(g)];
        fx.define(fx.initializer, statements);
        let statements = vec![fx.read(g)];
        fx.define(reader, statements);
        let statements = vec![fx.call(run_callbacks)];
        fx.define(caller, statements);

        let analysis = fx.analyze();

        assert!(analysis.is_global(g));
        assert!(analysis.executes_user_code(run_callbacks));
        assert!(analysis.executes_user_code(caller));

        for function in [run_callbacks, caller] {
            let (uses, defs) = analysis.effects(function);
            assert_eq!(uses, analysis.globals.as_slice());
            assert_eq!(defs, analysis.globals.as_slice());
        }
    }

    #[test]
    fn terminating_functions_touch_outside_state() {
        let mut fx = Fixture::new();
        let abort = fx.symbols.register_function(
            "abort",
            P,
            &[],
            VariableType::NoReturn,
            SymbolFlags::TERMINATES | SymbolFlags::NO_STATE_MODIFY,
        );
        fx.define(fx.initializer, vec![]);

        let analysis = fx.analyze();

        let (uses, defs) = analysis.effects(abort);
        assert_eq!(uses, &[fx.outside_state]);
        assert_eq!(defs, &[fx.outside_state]);

        let throw_error = fx.symbols.resolve_builtin(":THROWERROR").unwrap();
        assert!(analysis.effects(throw_error).1.contains(&fx.outside_state));
    }

    #[test]
    fn recursion_reaches_a_fixpoint() {
        let mut fx = Fixture::new();
        let a = fx.symbols.register_variable("a", P, VariableType::Integer, SymbolFlags::PUBLIC);
        let b = fx.symbols.register_variable("b", P, VariableType::Integer, SymbolFlags::PUBLIC);
        let even = fx.symbols.register_function("even", P, &[], VariableType::NoReturn, SymbolFlags::empty());
        let odd = fx.symbols.register_function("odd", P, &[], VariableType::NoReturn, SymbolFlags::empty());
        let top = fx.symbols.register_function("top", P, &[], VariableType::NoReturn, SymbolFlags::empty());

        fx.define(fx.initializer, vec![]);
        let statements = vec![fx.write(a), fx.call(odd)];
        fx.define(even, statements);
        let statements = vec![fx.read(b), fx.call(even)];
        fx.define(odd, statements);
        let statements = vec![fx.call(even)];
        fx.define(top, statements);

        let analysis = fx.analyze();

        for function in [even, odd, top] {
            let (uses, defs) = analysis.effects(function);
            assert_eq!(uses, &[a, b], "{}", fx.symbols.name(function));
            assert_eq!(defs, &[a], "{}", fx.symbols.name(function));
        }
    }

    #[derive(Debug, Clone)]
    enum Operation {
        Read(usize),
        Write(usize),
        Call(usize),
    }

    fn operation(globals: usize, functions: usize) -> impl Strategy<Value = Operation> {
        prop_oneof![
            (0..globals).prop_map(Operation::Read),
            (0..globals).prop_map(Operation::Write),
            (0..functions).prop_map(Operation::Call),
        ]
    }

    fn program() -> impl Strategy<Value = Vec<Vec<Operation>>> {
        (1usize..6, 1usize..7).prop_flat_map(|(globals, functions)| {
            prop::collection::vec(
                prop::collection::vec(operation(globals, functions), 0..6),
                functions,
            )
        })
    }

    proptest! {
        #[test]
        fn defs_are_uses_and_flow_to_callers(bodies in program()) {
            let mut fx = Fixture::new();
            let globals = (0..6)
                .map(|i| fx.symbols.register_variable(&format!("g{i}"), P, VariableType::Integer, SymbolFlags::PUBLIC))
                .collect::<Vec<_>>();
            let functions = (0..bodies.len())
                .map(|i| fx.symbols.register_function(&format!("f{i}"), P, &[], VariableType::NoReturn, SymbolFlags::empty()))
                .collect::<Vec<_>>();

            fx.define(fx.initializer, vec![]);
            for (function, body) in functions.iter().zip(&bodies) {
                let statements = body
                    .iter()
                    .map(|operation| match operation {
                        Operation::Read(g) => fx.read(globals[*g]),
                        Operation::Write(g) => fx.write(globals[*g]),
                        Operation::Call(f) => fx.call(functions[*f]),
                    })
                    .collect();
                fx.define(*function, statements);
            }

            let analysis = fx.analyze();

            for (function, body) in functions.iter().zip(&bodies) {
                let (uses, defs) = analysis.effects(*function);

                for def in defs {
                    prop_assert!(uses.contains(def));
                }

                for operation in body {
                    if let Operation::Call(callee) = operation {
                        let (callee_uses, callee_defs) = analysis.effects(functions[*callee]);
                        for used in callee_uses {
                            prop_assert!(uses.contains(used));
                        }
                        for defined in callee_defs {
                            prop_assert!(defs.contains(defined));
                        }
                    }
                }
            }
        }
    }
}
