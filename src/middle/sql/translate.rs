//! Replaces SQL nodes by imperative code. Queries over database tables (or
//! with conditions the query engine can evaluate) run through a cursor of the
//! runtime query engine; queries over record arrays without pushed down
//! conditions become plain nested loops.

use crate::{
    diagnostics::{ErrorCode, ErrorHandler},
    error::{InternalError, Result},
    frontend::{
        ast::{
            Ast, BinaryOperator, DeepOperation, DeepOperationKind, Layer, LayerKind, Module, NodeId,
            NodeKind, Position, SqlDelete, SqlInsert, SqlSelect, SqlSource, SqlSourceKind,
            SqlUpdate,
        },
        coder::AstCoder,
        intern::InternedSymbol,
        symbol::{SymbolId, SymbolTable},
        types::{TypeStorage, VariableType},
    },
    middle::sql::{
        decompose::{ColumnRef, DirectiveValue, QuerySources, TreeLevel, decompose},
        group_by::{Grouping, contains_aggregate},
        optimize::{ConstantFolder, ExpressionOptimizer},
    },
    options::CompilerOptions,
};

/// Cursor kinds understood by `__HS_SQL_OPENCURSOR2`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorKind {
    Select = 0,
    Delete = 1,
    Update = 2,
}

/// Action codes returned by `__HS_SQL_GETACTION`
const ACTION_EVALUATE: i32 = 0;
const ACTION_MATCHED: i32 = 1;

/// Column fetch phases: needed by the residual WHERE, or only for matches
const FASE_WHERE: i32 = 1;
const FASE_MATCHED: i32 = 2;

/// What happens with a row that satisfies the WHERE clause
enum RowAction {
    /// `result := result CONCAT [record]`
    Append { result: SymbolId, record: NodeId },
    Accumulate(Grouping),
    DeleteRecord,
    UpdateRecord { record: NodeId },
    /// Copy every kept row into `kept`, updating matched rows first
    Rebuild {
        kept: SymbolId,
        row: SymbolId,
        updates: Option<Vec<(InternedSymbol, NodeId)>>,
    },
}

struct Query {
    position: Position,
    kind: CursorKind,
    sources: Vec<SqlSource>,
    temporaries: Vec<(SymbolId, NodeId)>,
    where_clause: Option<NodeId>,
    limit: Option<NodeId>,
    /// Expressions evaluated for matched rows only
    outputs: Vec<NodeId>,
    pushdown: bool,
}

/// Referenced columns per source, in order of first use
#[derive(Debug, Default)]
struct TypeInfo {
    columns: Vec<(InternedSymbol, i32)>,
}

impl TypeInfo {
    fn add(&mut self, column: InternedSymbol, fase: i32) {
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = (*existing).min(fase),
            None => self.columns.push((column, fase)),
        }
    }

    fn number(&self, column: InternedSymbol) -> Option<usize> {
        self.columns.iter().position(|(name, _)| *name == column)
    }
}

fn whole_row() -> InternedSymbol {
    InternedSymbol::new("*")
}

fn collect_typeinfo(ast: &Ast, rows: &[SymbolId], roots: &[(NodeId, i32)]) -> Vec<TypeInfo> {
    let mut infos = rows.iter().map(|_| TypeInfo::default()).collect::<Vec<_>>();

    for (root, fase) in roots {
        let nodes = ast.descendants(*root);
        let mut through_column = Vec::new();

        for node in &nodes {
            let NodeKind::RecordColumn { record, column } = ast.kind(*node) else {
                continue;
            };
            let NodeKind::Variable(row) = ast.kind(*record) else {
                continue;
            };
            if let Some(source) = rows.iter().position(|r| r == row) {
                infos[source].add(*column, *fase);
                through_column.push(*record);
            }
        }

        for node in nodes {
            let NodeKind::Variable(row) = ast.kind(node) else {
                continue;
            };
            if through_column.contains(&node) {
                continue;
            }
            if let Some(source) = rows.iter().position(|r| r == row) {
                infos[source].add(whole_row(), *fase);
            }
        }
    }

    infos
}

struct Translator<'a, 'd> {
    coder: AstCoder<'a>,
    pushdown: bool,
    diagnostics: &'d mut dyn ErrorHandler,
}

/// Translates every SQL node in the bodies of the module's functions
pub fn translate_module(
    ast: &mut Ast,
    module: &Module,
    symbols: &mut SymbolTable,
    types: &mut TypeStorage,
    options: &CompilerOptions,
    diagnostics: &mut dyn ErrorHandler,
) -> Result<()> {
    let mut translator = Translator {
        coder: AstCoder::new(ast, types, symbols),
        pushdown: !options.no_sql_pushdown,
        diagnostics,
    };

    for function in &module.functions {
        let nodes = translator
            .coder
            .ast
            .descendants(function.body)
            .into_iter()
            .filter(|id| translator.coder.ast.kind(*id).is_sql())
            .collect::<Vec<_>>();

        tracing::debug!(
            function = translator.coder.symbols.name(function.symbol),
            statements = nodes.len(),
            "translating SQL"
        );

        // innermost first, so a nested query is plain code by the time its
        // parent copies it around
        for node in nodes.into_iter().rev() {
            translator.translate(node)?;
        }
    }

    Ok(())
}

impl Translator<'_, '_> {
    fn translate(&mut self, node: NodeId) -> Result<()> {
        let position = self.coder.ast.position(node);
        let kind = self.coder.ast.replace(node, NodeKind::Block(Vec::new()));

        let replacement = match kind {
            NodeKind::SqlSelect(select) => self.select(position, *select)?,
            NodeKind::SqlDelete(delete) => self.delete(position, *delete)?,
            NodeKind::SqlUpdate(update) => self.update(position, *update)?,
            NodeKind::SqlInsert(insert) => self.insert(position, *insert)?,
            other => {
                return Err(InternalError::UnexpectedNode {
                    kind: other.name(),
                    position,
                });
            }
        };

        self.coder.ast.replace(node, replacement);
        Ok(())
    }

    /// Closes the open block and takes its contents out of the arena
    fn close_statements(&mut self) -> Result<NodeKind> {
        let block = self.coder.close_block()?;
        Ok(self.coder.ast.replace(block, NodeKind::Block(Vec::new())))
    }

    fn append(&mut self, position: Position, array: SymbolId, element: NodeId) -> Result<()> {
        let ty = self.coder.symbols.variable_type(array);
        let current = self.coder.variable(position, array);
        let appended = self.coder.builtin(position, ":ARRAYAPPEND", vec![current, element])?;
        let appended = self.coder.cast(position, appended, ty);
        self.coder.assign(position, array, appended)?;
        Ok(())
    }

    /* Diagnostics */

    fn is_independent(&self, dependent: &[SymbolId], node: NodeId) -> bool {
        !self.coder.ast.references_any(node, dependent)
            && !contains_aggregate(self.coder.symbols, self.coder.ast, node)
    }

    fn check_where(&mut self, dependent: &[SymbolId], where_clause: Option<NodeId>) {
        let Some(where_clause) = where_clause else {
            return;
        };
        if self.coder.ast.kind(where_clause).as_boolean_constant() == Some(true) {
            return;
        }
        if self.is_independent(dependent, where_clause) {
            let position = self.coder.ast.position(where_clause);
            self.diagnostics.add_error(position, ErrorCode::IndependentWhere, None);
        }
    }

    fn check_select(&mut self, position: Position, select: &SqlSelect, dependent: &[SymbolId]) {
        self.check_where(dependent, select.where_clause);

        for (_, expression) in &select.temporaries {
            if self.is_independent(dependent, *expression) {
                let position = self.coder.ast.position(*expression);
                self.diagnostics.add_error(position, ErrorCode::IndependentTemporary, None);
            }
        }

        if !select.items.is_empty() && select.items.iter().all(|item| self.is_independent(dependent, item.expression)) {
            self.diagnostics.add_error(position, ErrorCode::IndependentSelect, None);
        }

        if let Some(having) = select.having {
            if self.is_independent(dependent, having) {
                let position = self.coder.ast.position(having);
                self.diagnostics.add_error(position, ErrorCode::IndependentHaving, None);
            }
        }

        for item in &select.order_by {
            if self.is_independent(dependent, item.expression) {
                let position = self.coder.ast.position(item.expression);
                self.diagnostics.add_error(position, ErrorCode::IndependentOrderBy, None);
            }
        }

        for key in &select.group_by {
            if self.is_independent(dependent, *key) {
                let position = self.coder.ast.position(*key);
                self.diagnostics.add_error(position, ErrorCode::IndependentGroupBy, None);
            }
        }
    }

    /// Reports assignments to read-only columns of a table variable
    fn check_writable(&mut self, position: Position, table: NodeId, columns: &[(InternedSymbol, NodeId)]) {
        let NodeKind::Variable(symbol) = self.coder.ast.kind(table) else {
            return;
        };
        let Some(definition) = self.coder.symbols.variable(*symbol).and_then(|v| v.table.as_ref()) else {
            return;
        };

        let read_only = columns
            .iter()
            .filter(|(name, _)| definition.column(*name).is_some_and(|c| c.read_only))
            .map(|(name, _)| name.value().to_owned())
            .collect::<Vec<_>>();

        for column in read_only {
            self.diagnostics
                .add_error(position, ErrorCode::WriteToReadOnlyColumn, Some(column));
        }
    }

    /* Statements */

    fn select(&mut self, position: Position, select: SqlSelect) -> Result<NodeKind> {
        let p = position;
        let dependent = select
            .sources
            .iter()
            .map(|source| source.row)
            .chain(select.temporaries.iter().map(|(symbol, _)| *symbol))
            .collect::<Vec<_>>();
        self.check_select(position, &select, &dependent);

        let grouping = Grouping::plan(&mut self.coder, &select, position);
        let ordered = !select.order_by.is_empty();
        let late_limit = ordered || grouping.is_some();

        let mut outputs = select.items.iter().map(|item| item.expression).collect::<Vec<_>>();
        outputs.extend(select.group_by.iter().copied());
        outputs.extend(select.having);
        outputs.extend(select.order_by.iter().map(|item| item.expression));

        self.coder.open_block(p);

        let result = self.coder.temporary("result", VariableType::RecordArray);
        let empty = self.coder.default_value(p, VariableType::RecordArray);
        self.coder.declare(p, result, Some(empty))?;

        let action = match grouping {
            Some(grouping) => {
                grouping.declare(&mut self.coder)?;
                RowAction::Accumulate(grouping)
            }
            None => {
                let order_cells = select
                    .order_by
                    .iter()
                    .enumerate()
                    .map(|(i, item)| (InternedSymbol::new(&format!("__ORDER{i}")), item.expression))
                    .collect::<Vec<_>>();

                let record = match select.sources.first() {
                    // without a select list the rows of the first source are returned
                    Some(first) if select.items.is_empty() => {
                        let mut record = self.coder.variable(p, first.row);
                        for (name, key) in order_cells {
                            let name = self.coder.string(p, name.value());
                            record = self.coder.builtin(p, ":RECORDCELLCREATE", vec![record, name, key])?;
                        }
                        record
                    }
                    _ => {
                        let cells = select
                            .items
                            .iter()
                            .map(|item| (item.name, item.expression))
                            .chain(order_cells)
                            .collect();
                        self.coder.record_constructor(p, cells)
                    }
                };
                RowAction::Append { result, record }
            }
        };

        let action = self.query(
            Query {
                position,
                kind: CursorKind::Select,
                sources: select.sources,
                temporaries: select.temporaries,
                where_clause: select.where_clause,
                limit: if late_limit { None } else { select.limit },
                outputs,
                pushdown: true,
            },
            action,
        )?;

        if let RowAction::Accumulate(grouping) = action {
            let having = select.having;
            let items = select.items.clone();
            let order_by = select.order_by.clone();

            grouping.for_each_group(&mut self.coder, |coder, group| {
                if let Some(having) = having {
                    let condition = grouping.rewrite(coder, having, group);
                    coder.open_if(p, condition);
                }

                let mut cells = items
                    .iter()
                    .map(|item| (item.name, grouping.rewrite(coder, item.expression, group)))
                    .collect::<Vec<_>>();
                for (i, item) in order_by.iter().enumerate() {
                    let key = grouping.rewrite(coder, item.expression, group);
                    cells.push((InternedSymbol::new(&format!("__ORDER{i}")), key));
                }
                let record = coder.record_constructor(p, cells);

                let current = coder.variable(p, result);
                let appended = coder.builtin(p, ":ARRAYAPPEND", vec![current, record])?;
                let appended = coder.cast(p, appended, VariableType::RecordArray);
                coder.assign(p, result, appended)?;

                if having.is_some() {
                    coder.close_if()?;
                }
                Ok(())
            })?;
        }

        if ordered || (late_limit && select.limit.is_some()) {
            let directions = select
                .order_by
                .iter()
                .map(|item| self.coder.boolean(p, item.ascending))
                .collect::<Vec<_>>();
            let directions = self.coder.array_constructor(p, VariableType::BooleanArray, directions);
            let limit = match select.limit {
                Some(limit) => limit,
                None => self.coder.integer(p, -1),
            };

            let current = self.coder.variable(p, result);
            let sorted = self
                .coder
                .builtin(p, "__HS_SQL_ORDERRESULT", vec![current, directions, limit])?;
            self.coder.assign(p, result, sorted)?;
        }

        let block = self.coder.close_block()?;
        let value = self.coder.variable(p, result);

        Ok(NodeKind::BlockExpression { block, result: value })
    }

    fn delete(&mut self, position: Position, delete: SqlDelete) -> Result<NodeKind> {
        let dependent = [delete.source.row];
        self.check_where(&dependent, delete.where_clause);

        self.coder.open_block(position);

        match delete.source.kind {
            SqlSourceKind::Table => {
                self.query(
                    Query {
                        position,
                        kind: CursorKind::Delete,
                        sources: vec![delete.source],
                        temporaries: Vec::new(),
                        where_clause: delete.where_clause,
                        limit: None,
                        outputs: Vec::new(),
                        pushdown: true,
                    },
                    RowAction::DeleteRecord,
                )?;
            }
            SqlSourceKind::RecordArray => self.rebuild(position, delete.source, delete.where_clause, None)?,
        }

        self.close_statements()
    }

    fn update(&mut self, position: Position, update: SqlUpdate) -> Result<NodeKind> {
        let dependent = [update.source.row];
        self.check_where(&dependent, update.where_clause);

        self.coder.open_block(position);

        match update.source.kind {
            SqlSourceKind::Table => {
                self.check_writable(position, update.source.expression, &update.assignments);

                let outputs = update.assignments.iter().map(|(_, value)| *value).collect();
                let record = self.coder.record_constructor(position, update.assignments);
                self.query(
                    Query {
                        position,
                        kind: CursorKind::Update,
                        sources: vec![update.source],
                        temporaries: Vec::new(),
                        where_clause: update.where_clause,
                        limit: None,
                        outputs,
                        pushdown: true,
                    },
                    RowAction::UpdateRecord { record },
                )?;
            }
            SqlSourceKind::RecordArray => self.rebuild(
                position,
                update.source,
                update.where_clause,
                Some(update.assignments),
            )?,
        }

        self.close_statements()
    }

    /// DELETE and UPDATE over a record array variable: copy the kept (and
    /// updated) rows into a new array, then store it back
    fn rebuild(
        &mut self,
        position: Position,
        source: SqlSource,
        where_clause: Option<NodeId>,
        updates: Option<Vec<(InternedSymbol, NodeId)>>,
    ) -> Result<()> {
        let NodeKind::Variable(array) = *self.coder.ast.kind(source.expression) else {
            return Err(InternalError::Malformed {
                position,
                message: "DELETE or UPDATE on a record array needs a variable".to_owned(),
            });
        };

        let ty = self.coder.symbols.variable_type(array);
        let kept = self.coder.temporary("kept", ty);
        let empty = self.coder.default_value(position, ty);
        self.coder.declare(position, kept, Some(empty))?;

        let row = source.row;
        let outputs = updates
            .iter()
            .flatten()
            .map(|(_, value)| *value)
            .collect();
        self.query(
            Query {
                position,
                kind: CursorKind::Select,
                sources: vec![source],
                temporaries: Vec::new(),
                where_clause,
                limit: None,
                outputs,
                pushdown: false,
            },
            RowAction::Rebuild { kept, row, updates },
        )?;

        let result = self.coder.variable(position, kept);
        self.coder.assign(position, array, result)?;
        Ok(())
    }

    fn insert(&mut self, position: Position, insert: SqlInsert) -> Result<NodeKind> {
        self.coder.open_block(position);

        match insert.kind {
            SqlSourceKind::Table => {
                self.check_writable(position, insert.target, &insert.values);

                let record = self.coder.record_constructor(position, insert.values);
                self.coder
                    .call_statement(position, "__HS_SQL_INSERT", vec![insert.target, record])?;
            }
            SqlSourceKind::RecordArray => {
                let NodeKind::Variable(array) = *self.coder.ast.kind(insert.target) else {
                    return Err(InternalError::Malformed {
                        position,
                        message: "INSERT into a record array needs a variable".to_owned(),
                    });
                };

                let record = self.coder.record_constructor(position, insert.values);
                self.coder.deep_operation(
                    position,
                    DeepOperation {
                        kind: DeepOperationKind::ArrayInsert { at: None },
                        base: array,
                        layers: Vec::new(),
                        value: Some(record),
                    },
                )?;
            }
        }

        self.close_statements()
    }

    /* Queries */

    /// Emits the loop over all matching rows of a query, running `action` per
    /// match. Returns the action for a second pass over grouped results.
    fn query(&mut self, query: Query, action: RowAction) -> Result<RowAction> {
        let p = query.position;
        let rows = query.sources.iter().map(|source| source.row).collect::<Vec<_>>();
        let dependent = rows
            .iter()
            .copied()
            .chain(query.temporaries.iter().map(|(symbol, _)| *symbol))
            .collect::<Vec<_>>();

        let mut fase_roots = query
            .where_clause
            .iter()
            .chain(query.temporaries.iter().map(|(_, expression)| expression))
            .map(|root| (*root, FASE_WHERE))
            .collect::<Vec<_>>();
        fase_roots.extend(query.outputs.iter().map(|root| (*root, FASE_MATCHED)));
        let typeinfo = collect_typeinfo(self.coder.ast, &rows, &fase_roots);

        let mut tree = {
            let sources = QuerySources {
                ast: self.coder.ast,
                symbols: self.coder.symbols,
                rows: rows.clone(),
                dependent,
            };
            decompose(
                &sources,
                query.where_clause,
                query.pushdown && self.pushdown,
                p,
                self.diagnostics,
            )
        };

        let simple = query.sources.iter().all(|s| s.kind == SqlSourceKind::RecordArray)
            && query.limit.is_none()
            && !tree.has_pushdown();

        tracing::debug!(
            sources = query.sources.len(),
            strategy = if simple { "iteration" } else { "cursor" },
            "query plan"
        );

        self.hoist_guards(p, &mut tree)?;
        let residual = self.residual(p, &tree)?;

        if simple {
            self.iterate(&query, residual, &action)?;
        } else {
            let conditions = self.conditions(p, &tree, &typeinfo)?;
            self.cursor(&query, &typeinfo, conditions, residual, &action)?;
        }

        Ok(action)
    }

    /// Evaluates every branch condition of the tree once, up front, under
    /// the guards of its ancestors. The tree then refers to the results.
    fn hoist_guards(&mut self, p: Position, tree: &mut TreeLevel) -> Result<()> {
        let count = Self::count_branches(tree);
        if count == 0 {
            return Ok(());
        }

        let symbols = (0..count)
            .map(|_| self.coder.temporary("where_guard", VariableType::Boolean))
            .collect::<Vec<_>>();
        for symbol in &symbols {
            let no = self.coder.boolean(p, false);
            self.coder.declare(p, *symbol, Some(no))?;
        }

        let mut next = symbols.into_iter();
        self.emit_guards(p, tree, &mut next)
    }

    fn count_branches(level: &TreeLevel) -> usize {
        level
            .branches
            .iter()
            .map(|b| 1 + Self::count_branches(&b.if_true) + Self::count_branches(&b.if_false))
            .sum()
    }

    fn emit_guards(
        &mut self,
        p: Position,
        level: &mut TreeLevel,
        symbols: &mut impl Iterator<Item = SymbolId>,
    ) -> Result<()> {
        for branch in &mut level.branches {
            let Some(symbol) = symbols.next() else {
                return Err(InternalError::Malformed {
                    position: p,
                    message: "branch guard count changed while hoisting".to_owned(),
                });
            };
            self.coder.assign(p, symbol, branch.condition)?;
            branch.condition = self.coder.variable(p, symbol);

            let has_inner = !branch.if_true.branches.is_empty() || !branch.if_false.branches.is_empty();
            if has_inner {
                let guard = self.coder.variable(p, symbol);
                self.coder.open_if(p, guard);
                self.emit_guards(p, &mut branch.if_true, symbols)?;
                self.coder.open_else()?;
                self.emit_guards(p, &mut branch.if_false, symbols)?;
                self.coder.close_if()?;
            }
        }
        Ok(())
    }

    /// The residual condition: the conjunction of everything not pushed
    /// down, in the branch structure of the WHERE clause
    fn residual(&mut self, p: Position, tree: &TreeLevel) -> Result<NodeId> {
        let condition = self.residual_level(p, tree)?;
        ConstantFolder.optimize(&mut self.coder, condition)
    }

    fn residual_level(&mut self, p: Position, level: &TreeLevel) -> Result<NodeId> {
        let mut parts = level.rest.clone();

        for branch in &level.branches {
            if !branch.if_true.has_rest() && !branch.if_false.has_rest() {
                continue;
            }
            let condition = self.coder.deep_copy(branch.condition);
            let if_true = self.residual_level(p, &branch.if_true)?;
            let if_false = self.residual_level(p, &branch.if_false)?;
            parts.push(self.coder.conditional(p, condition, if_true, if_false)?);
        }

        let mut parts = parts.into_iter();
        let Some(first) = parts.next() else {
            return Ok(self.coder.boolean(p, true));
        };
        parts.try_fold(first, |all, part| self.coder.binary(p, BinaryOperator::And, all, part))
    }

    /// The conditions for the query engine: a record array per level,
    /// concatenated with the conditions of the branches
    fn conditions(&mut self, p: Position, level: &TreeLevel, typeinfo: &[TypeInfo]) -> Result<NodeId> {
        let typeinfo_number = |column: &ColumnRef| -> Result<i32> {
            typeinfo
                .get(column.source)
                .and_then(|info| info.number(column.column))
                .map(|n| n as i32)
                .ok_or_else(|| InternalError::Malformed {
                    position: p,
                    message: format!("column {} missing from the query typeinfo", column.column),
                })
        };

        let mut records = Vec::new();

        for directive in &level.directives {
            let value = match directive.value {
                DirectiveValue::Expression(value) => value,
                DirectiveValue::Boolean(value) => self.coder.boolean(p, value),
            };
            let cells = vec![
                ("SINGLE", self.coder.boolean(p, true)),
                ("TABLENR", self.coder.integer(p, directive.column.source as i32)),
                ("TYPEINFONR", self.coder.integer(p, typeinfo_number(&directive.column)?)),
                ("VALUE", value),
                ("CASESENSITIVE", self.coder.boolean(p, !directive.column.uppercase)),
                ("CONDITION", self.coder.string(p, &directive.operator.to_string())),
            ];
            records.push(self.record(p, cells));
        }

        for relation in &level.relations {
            let cells = vec![
                ("SINGLE", self.coder.boolean(p, false)),
                ("TABLENR1", self.coder.integer(p, relation.left.source as i32)),
                ("TYPEINFONR1", self.coder.integer(p, typeinfo_number(&relation.left)?)),
                ("TABLENR2", self.coder.integer(p, relation.right.source as i32)),
                ("TYPEINFONR2", self.coder.integer(p, typeinfo_number(&relation.right)?)),
                ("CASESENSITIVE", self.coder.boolean(p, !relation.left.uppercase)),
                ("CONDITION", self.coder.string(p, &relation.operator.to_string())),
            ];
            records.push(self.record(p, cells));
        }

        let mut conditions = self.coder.array_constructor(p, VariableType::RecordArray, records);

        for branch in &level.branches {
            if !branch.if_true.has_pushdown() && !branch.if_false.has_pushdown() {
                continue;
            }
            let condition = self.coder.deep_copy(branch.condition);
            let if_true = self.conditions(p, &branch.if_true, typeinfo)?;
            let if_false = self.conditions(p, &branch.if_false, typeinfo)?;
            let selected = self.coder.conditional(p, condition, if_true, if_false)?;
            conditions = self.coder.binary(p, BinaryOperator::Concat, conditions, selected)?;
        }

        Ok(conditions)
    }

    fn record(&mut self, p: Position, cells: Vec<(&str, NodeId)>) -> NodeId {
        let cells = cells
            .into_iter()
            .map(|(name, value)| (InternedSymbol::new(name), value))
            .collect();
        self.coder.record_constructor(p, cells)
    }

    fn sources_array(&mut self, p: Position, query: &Query, typeinfo: &[TypeInfo]) -> NodeId {
        let sources = query
            .sources
            .iter()
            .zip(typeinfo)
            .map(|(source, info)| {
                let columns = info
                    .columns
                    .iter()
                    .map(|(name, fase)| {
                        let cells = vec![
                            ("NAME", self.coder.string(p, name.value())),
                            ("FASE", self.coder.integer(p, *fase)),
                        ];
                        self.record(p, cells)
                    })
                    .collect();
                let columns = self.coder.array_constructor(p, VariableType::RecordArray, columns);

                let cells = vec![
                    ("KIND", self.coder.string(p, &source.kind.to_string())),
                    ("SOURCE", source.expression),
                    ("TYPEINFO", columns),
                ];
                self.record(p, cells)
            })
            .collect();

        self.coder.array_constructor(p, VariableType::RecordArray, sources)
    }

    fn evaluate_temporaries(&mut self, p: Position, temporaries: &[(SymbolId, NodeId)], copy: bool) -> Result<()> {
        for (symbol, expression) in temporaries {
            let value = if copy {
                self.coder.deep_copy(*expression)
            } else {
                *expression
            };
            self.coder.declare(p, *symbol, Some(value))?;
        }
        Ok(())
    }

    /// Nested loops over record arrays with the whole WHERE evaluated inline
    fn iterate(&mut self, query: &Query, residual: NodeId, action: &RowAction) -> Result<()> {
        let p = query.position;
        let mut indices = Vec::new();

        for source in &query.sources {
            let ty = self
                .coder
                .type_of(source.expression)
                .unwrap_or(VariableType::RecordArray);
            let array = self.coder.temporary("rows", ty);
            let index = self.coder.temporary("row_index", VariableType::Integer);
            self.coder.declare(p, array, Some(source.expression))?;
            let zero = self.coder.integer(p, 0);
            self.coder.declare(p, index, Some(zero))?;
            indices.push(index);

            let read = self.coder.variable(p, index);
            let all = self.coder.variable(p, array);
            let length = self.coder.builtin(p, "LENGTH", vec![all])?;
            let more = self.coder.binary(p, BinaryOperator::Less, read, length)?;
            self.coder.open_loop(p, Some(more));

            let all = self.coder.variable(p, array);
            let read = self.coder.variable(p, index);
            let element = self.coder.builtin(p, ":ARRAYINDEX", vec![all, read])?;
            let element = self.coder.cast(p, element, VariableType::Record);
            self.coder.assign(p, source.row, element)?;
        }

        self.evaluate_temporaries(p, &query.temporaries, false)?;

        let unmatched = matches!(action, RowAction::Rebuild { .. });
        if self.coder.ast.kind(residual).as_boolean_constant() == Some(true) {
            self.matched(p, action, None)?;
        } else {
            self.coder.open_if(p, residual);
            self.matched(p, action, None)?;
            if unmatched {
                self.coder.open_else()?;
                self.unmatched(p, action)?;
            }
            self.coder.close_if()?;
        }

        for index in indices.into_iter().rev() {
            let read = self.coder.variable(p, index);
            let one = self.coder.integer(p, 1);
            let next = self.coder.binary(p, BinaryOperator::Add, read, one)?;
            let increment = self.coder.assignment_node(p, index, next);
            self.coder.close_loop(Some(increment))?;
        }

        Ok(())
    }

    /// The runtime query engine loop. The cursor is closed on every way out.
    fn cursor(
        &mut self,
        query: &Query,
        typeinfo: &[TypeInfo],
        conditions: NodeId,
        residual: NodeId,
        action: &RowAction,
    ) -> Result<()> {
        let p = query.position;

        let sources = self.sources_array(p, query, typeinfo);
        let limit = match query.limit {
            Some(limit) => limit,
            None => self.coder.integer(p, -1),
        };
        let kind = self.coder.integer(p, query.kind as i32);
        let open = self
            .coder
            .builtin(p, "__HS_SQL_OPENCURSOR2", vec![sources, conditions, limit, kind])?;
        let cursor = self.coder.temporary("cursor", VariableType::Integer);
        self.coder.declare(p, cursor, Some(open))?;

        self.coder.open_try(p);
        self.coder.open_loop(p, None);

        let action_code = self.coder.temporary("action", VariableType::Integer);
        let handle = self.coder.variable(p, cursor);
        let next = self.coder.builtin(p, "__HS_SQL_GETACTION", vec![handle])?;
        self.coder.declare(p, action_code, Some(next))?;

        let code = self.coder.variable(p, action_code);
        let evaluate = self.coder.integer(p, ACTION_EVALUATE);
        let is_evaluate = self.coder.binary(p, BinaryOperator::Equal, code, evaluate)?;
        self.coder.open_if(p, is_evaluate);
        {
            self.fetch_rows(p, cursor, &query.sources)?;
            self.evaluate_temporaries(p, &query.temporaries, false)?;
            let handle = self.coder.variable(p, cursor);
            self.coder
                .call_statement(p, "__HS_SQL_REPORTFASE1RESULT", vec![handle, residual])?;
        }
        self.coder.open_else()?;
        {
            let code = self.coder.variable(p, action_code);
            let matched = self.coder.integer(p, ACTION_MATCHED);
            let is_matched = self.coder.binary(p, BinaryOperator::Equal, code, matched)?;
            self.coder.open_if(p, is_matched);
            self.fetch_rows(p, cursor, &query.sources)?;
            self.evaluate_temporaries(p, &query.temporaries, true)?;
            self.matched(p, action, Some(cursor))?;
            self.coder.open_else()?;
            self.coder.break_loop(p)?;
            self.coder.close_if()?;
        }
        self.coder.close_if()?;

        self.coder.close_loop(None)?;

        let exception = self.coder.temporary("exception", VariableType::Object);
        self.coder.open_catch(Some(exception))?;
        let handle = self.coder.variable(p, cursor);
        self.coder.call_statement(p, "__HS_SQL_CLOSECURSOR", vec![handle])?;
        let caught = self.coder.variable(p, exception);
        self.coder.throw(p, caught, true)?;
        self.coder.close_try_catch()?;

        let handle = self.coder.variable(p, cursor);
        self.coder.call_statement(p, "__HS_SQL_CLOSECURSOR", vec![handle])?;
        Ok(())
    }

    fn fetch_rows(&mut self, p: Position, cursor: SymbolId, sources: &[SqlSource]) -> Result<()> {
        for (i, source) in sources.iter().enumerate() {
            let handle = self.coder.variable(p, cursor);
            let number = self.coder.integer(p, i as i32);
            let record = self.coder.builtin(p, "__HS_SQL_GETRECORD", vec![handle, number])?;
            self.coder.assign(p, source.row, record)?;
        }
        Ok(())
    }

    fn matched(&mut self, p: Position, action: &RowAction, cursor: Option<SymbolId>) -> Result<()> {
        match action {
            RowAction::Append { result, record } => self.append(p, *result, *record),
            RowAction::Accumulate(grouping) => grouping.accumulate(&mut self.coder),
            RowAction::DeleteRecord | RowAction::UpdateRecord { .. } => {
                let Some(cursor) = cursor else {
                    return Err(InternalError::Malformed {
                        position: p,
                        message: "table modification outside a cursor".to_owned(),
                    });
                };
                let handle = self.coder.variable(p, cursor);
                let source = self.coder.integer(p, 0);

                match action {
                    RowAction::UpdateRecord { record } => {
                        self.coder
                            .call_statement(p, "__HS_SQL_UPDATERECORD", vec![handle, source, *record])?;
                    }
                    _ => {
                        self.coder
                            .call_statement(p, "__HS_SQL_DELETERECORD", vec![handle, source])?;
                    }
                }
                Ok(())
            }
            RowAction::Rebuild { kept, row, updates } => {
                let Some(updates) = updates else {
                    // deleted
                    return Ok(());
                };

                // all new values are computed from the old row
                let values = updates
                    .iter()
                    .map(|(column, value)| {
                        let ty = self.coder.type_of(*value).unwrap_or(VariableType::Variant);
                        let symbol = self.coder.temporary("new_value", ty);
                        self.coder.declare(p, symbol, Some(*value))?;
                        Ok::<_, InternalError>((*column, symbol))
                    })
                    .collect::<Result<Vec<_>>>()?;

                for (column, symbol) in values {
                    let key = self.coder.string(p, column.value());
                    let value = self.coder.variable(p, symbol);
                    self.coder.deep_operation(
                        p,
                        DeepOperation {
                            kind: DeepOperationKind::Set,
                            base: *row,
                            layers: vec![Layer {
                                kind: LayerKind::Record,
                                key,
                            }],
                            value: Some(value),
                        },
                    )?;
                }

                let current = self.coder.variable(p, *row);
                self.append(p, *kept, current)
            }
        }
    }

    fn unmatched(&mut self, p: Position, action: &RowAction) -> Result<()> {
        if let RowAction::Rebuild { kept, row, .. } = action {
            let current = self.coder.variable(p, *row);
            self.append(p, *kept, current)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        diagnostics::Diagnostics,
        frontend::{
            ast::{Function, SelectItem},
            symbol::{SymbolFlags, TableColumn, TableDefinition},
        },
    };

    const P: Position = Position::new(7, 3);

    struct Fixture {
        ast: Ast,
        types: TypeStorage,
        symbols: SymbolTable,
        function: SymbolId,
        outside_state: SymbolId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut symbols = SymbolTable::new();
            symbols.register_builtins();
            let function = symbols.register_function("query", P, &[], VariableType::NoReturn, SymbolFlags::empty());
            let outside_state = symbols.register_variable(":outsidestate", P, VariableType::Variant, SymbolFlags::empty());

            Self {
                ast: Ast::new(),
                types: TypeStorage::new(),
                symbols,
                function,
                outside_state,
            }
        }

        fn coder(&mut self) -> AstCoder<'_> {
            AstCoder::new(&mut self.ast, &mut self.types, &mut self.symbols)
        }

        /// Wraps the statement in a function body and translates the module
        fn translate(&mut self, statement: NodeId, options: &CompilerOptions) -> (NodeId, Diagnostics) {
            let body = self.ast.push(P, NodeKind::Block(vec![statement]));
            let module = Module {
                source_name: "test.whscr".to_owned(),
                functions: vec![Function {
                    symbol: self.function,
                    position: P,
                    body,
                }],
                initializer: self.function,
                outside_state: self.outside_state,
                loadlibs: Vec::new(),
            };

            let mut diagnostics = Diagnostics::new();
            translate_module(
                &mut self.ast,
                &module,
                &mut self.symbols,
                &mut self.types,
                options,
                &mut diagnostics,
            )
            .unwrap();
            (body, diagnostics)
        }

        fn calls(&self, root: NodeId, name: &str) -> Vec<NodeId> {
            self.ast
                .descendants(root)
                .into_iter()
                .filter(|id| {
                    matches!(
                        self.ast.kind(*id),
                        NodeKind::FunctionCall { function, .. } if self.symbols.name(*function) == name
                    )
                })
                .collect()
        }

        fn has_sql(&self, root: NodeId) -> bool {
            self.ast
                .descendants(root)
                .into_iter()
                .any(|id| self.ast.kind(id).is_sql())
        }
    }

    fn column(coder: &mut AstCoder<'_>, row: SymbolId, name: &str, ty: VariableType) -> NodeId {
        let record = coder.variable(P, row);
        coder.record_column(P, record, InternedSymbol::new(name), ty)
    }

    fn select_statement(coder: &mut AstCoder<'_>, select: SqlSelect) -> NodeId {
        let query = coder.ast.push(P, NodeKind::SqlSelect(Box::new(select)));
        coder.types.set(query, VariableType::RecordArray);
        coder.ast.push(P, NodeKind::ExpressionStatement(query))
    }

    fn simple_select(sources: Vec<SqlSource>, items: Vec<SelectItem>, where_clause: Option<NodeId>) -> SqlSelect {
        SqlSelect {
            sources,
            temporaries: vec![],
            where_clause,
            items,
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
        }
    }

    #[test]
    fn record_array_query_iterates_without_a_cursor() {
        let mut fx = Fixture::new();
        let people = fx
            .symbols
            .register_variable("people", P, VariableType::RecordArray, SymbolFlags::empty());
        let row = fx.symbols.register_variable("p", P, VariableType::Record, SymbolFlags::empty());
        let threshold = fx
            .symbols
            .register_variable("threshold", P, VariableType::Integer, SymbolFlags::empty());

        let statement = {
            let mut coder = fx.coder();
            let source = coder.variable(P, people);
            let age = column(&mut coder, row, "AGE", VariableType::Integer);
            let limit = coder.variable(P, threshold);
            let one = coder.integer(P, 1);
            let plus = coder.binary(P, BinaryOperator::Add, limit, one).unwrap();
            // not a plain column comparison, stays in generated code
            let one = coder.integer(P, 1);
            let age_plus = coder.binary(P, BinaryOperator::Add, age, one).unwrap();
            let condition = coder.binary(P, BinaryOperator::Greater, age_plus, plus).unwrap();
            let name = column(&mut coder, row, "NAME", VariableType::String);

            select_statement(
                &mut coder,
                simple_select(
                    vec![SqlSource {
                        position: P,
                        kind: SqlSourceKind::RecordArray,
                        expression: source,
                        row,
                    }],
                    vec![SelectItem {
                        name: InternedSymbol::new("NAME"),
                        expression: name,
                    }],
                    Some(condition),
                ),
            )
        };

        let (body, diagnostics) = fx.translate(statement, &CompilerOptions::default());

        assert_eq!(diagnostics.iter().count(), 0);
        assert!(!fx.has_sql(body));
        assert!(fx.calls(body, "__HS_SQL_OPENCURSOR2").is_empty());
        assert_eq!(fx.calls(body, ":ARRAYINDEX").len(), 1);
        assert!(fx
            .ast
            .descendants(body)
            .into_iter()
            .any(|id| matches!(fx.ast.kind(id), NodeKind::BlockExpression { .. })));
    }

    fn person_table() -> TableDefinition {
        TableDefinition {
            columns: vec![
                TableColumn {
                    name: InternedSymbol::new("ID"),
                    ty: VariableType::Integer,
                    read_only: true,
                },
                TableColumn {
                    name: InternedSymbol::new("NAME"),
                    ty: VariableType::String,
                    read_only: false,
                },
            ],
        }
    }

    #[test]
    fn table_query_pushes_directives_into_the_cursor() {
        let mut fx = Fixture::new();
        let table = fx
            .symbols
            .register_table("person", P, person_table(), SymbolFlags::empty());
        let row = fx.symbols.register_variable("person", P, VariableType::Record, SymbolFlags::empty());

        let statement = {
            let mut coder = fx.coder();
            let source = coder.variable(P, table);
            let id = column(&mut coder, row, "ID", VariableType::Integer);
            let five = coder.integer(P, 5);
            let condition = coder.binary(P, BinaryOperator::Equal, id, five).unwrap();
            let name = column(&mut coder, row, "NAME", VariableType::String);

            select_statement(
                &mut coder,
                simple_select(
                    vec![SqlSource {
                        position: P,
                        kind: SqlSourceKind::Table,
                        expression: source,
                        row,
                    }],
                    vec![SelectItem {
                        name: InternedSymbol::new("NAME"),
                        expression: name,
                    }],
                    Some(condition),
                ),
            )
        };

        let (body, diagnostics) = fx.translate(statement, &CompilerOptions::default());

        assert!(!diagnostics.has_errors());
        assert!(!fx.has_sql(body));
        assert_eq!(fx.calls(body, "__HS_SQL_OPENCURSOR2").len(), 1);
        assert_eq!(fx.calls(body, "__HS_SQL_CLOSECURSOR").len(), 2);
        assert_eq!(fx.calls(body, "__HS_SQL_REPORTFASE1RESULT").len(), 1);

        let operators = fx
            .ast
            .descendants(body)
            .into_iter()
            .filter_map(|id| match fx.ast.kind(id) {
                NodeKind::RecordConstructor(cells) => cells
                    .iter()
                    .find(|(name, _)| name.value() == "CONDITION")
                    .map(|(_, value)| fx.ast.kind(*value).clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            operators,
            vec![NodeKind::Constant(crate::frontend::ast::Constant::String("=".to_owned()))]
        );
    }

    #[test]
    fn disabled_pushdown_keeps_the_condition_in_code() {
        let mut fx = Fixture::new();
        let people = fx
            .symbols
            .register_variable("people", P, VariableType::RecordArray, SymbolFlags::empty());
        let row = fx.symbols.register_variable("p", P, VariableType::Record, SymbolFlags::empty());

        let statement = {
            let mut coder = fx.coder();
            let source = coder.variable(P, people);
            let age = column(&mut coder, row, "AGE", VariableType::Integer);
            let five = coder.integer(P, 5);
            let condition = coder.binary(P, BinaryOperator::Equal, age, five).unwrap();

            select_statement(
                &mut coder,
                simple_select(
                    vec![SqlSource {
                        position: P,
                        kind: SqlSourceKind::RecordArray,
                        expression: source,
                        row,
                    }],
                    vec![],
                    Some(condition),
                ),
            )
        };

        let options = CompilerOptions {
            no_sql_pushdown: true,
            ..Default::default()
        };
        let (body, _) = fx.translate(statement, &options);

        assert!(fx.calls(body, "__HS_SQL_OPENCURSOR2").is_empty());
        assert!(fx.ast.descendants(body).into_iter().any(|id| matches!(
            fx.ast.kind(id),
            NodeKind::If { condition, .. } if matches!(
                fx.ast.kind(*condition),
                NodeKind::Binary { operator: BinaryOperator::Equal, .. }
            )
        )));
    }

    #[test]
    fn independent_where_is_reported() {
        let mut fx = Fixture::new();
        let people = fx
            .symbols
            .register_variable("people", P, VariableType::RecordArray, SymbolFlags::empty());
        let row = fx.symbols.register_variable("p", P, VariableType::Record, SymbolFlags::empty());

        let statement = {
            let mut coder = fx.coder();
            let source = coder.variable(P, people);
            let one = coder.integer(P, 1);
            let also_one = coder.integer(P, 1);
            let condition = coder.binary(P, BinaryOperator::Equal, one, also_one).unwrap();
            let name = column(&mut coder, row, "NAME", VariableType::String);

            select_statement(
                &mut coder,
                simple_select(
                    vec![SqlSource {
                        position: P,
                        kind: SqlSourceKind::RecordArray,
                        expression: source,
                        row,
                    }],
                    vec![SelectItem {
                        name: InternedSymbol::new("NAME"),
                        expression: name,
                    }],
                    Some(condition),
                ),
            )
        };

        let (_, diagnostics) = fx.translate(statement, &CompilerOptions::default());

        assert_eq!(diagnostics.errors().collect::<Vec<_>>(), vec![ErrorCode::IndependentWhere]);
    }

    #[test]
    fn update_of_read_only_column_is_reported() {
        let mut fx = Fixture::new();
        let table = fx
            .symbols
            .register_table("person", P, person_table(), SymbolFlags::empty());
        let row = fx.symbols.register_variable("person", P, VariableType::Record, SymbolFlags::empty());

        let statement = {
            let mut coder = fx.coder();
            let source = coder.variable(P, table);
            let id = coder.integer(P, 12);
            let name = coder.string(P, "Ada");
            coder.ast.push(
                P,
                NodeKind::SqlUpdate(Box::new(SqlUpdate {
                    source: SqlSource {
                        position: P,
                        kind: SqlSourceKind::Table,
                        expression: source,
                        row,
                    },
                    assignments: vec![(InternedSymbol::new("ID"), id), (InternedSymbol::new("NAME"), name)],
                    where_clause: None,
                })),
            )
        };

        let (body, diagnostics) = fx.translate(statement, &CompilerOptions::default());

        let errors = diagnostics.iter().filter(|d| d.is_error()).collect::<Vec<_>>();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].argument.as_deref(), Some("ID"));
        assert_eq!(fx.calls(body, "__HS_SQL_UPDATERECORD").len(), 1);
    }

    #[test]
    fn delete_from_record_array_rebuilds_the_array() {
        let mut fx = Fixture::new();
        let people = fx
            .symbols
            .register_variable("people", P, VariableType::RecordArray, SymbolFlags::empty());
        let row = fx.symbols.register_variable("p", P, VariableType::Record, SymbolFlags::empty());

        let statement = {
            let mut coder = fx.coder();
            let source = coder.variable(P, people);
            let age = column(&mut coder, row, "AGE", VariableType::Integer);
            let limit = coder.integer(P, 18);
            let condition = coder.binary(P, BinaryOperator::Less, age, limit).unwrap();
            coder.ast.push(
                P,
                NodeKind::SqlDelete(Box::new(SqlDelete {
                    source: SqlSource {
                        position: P,
                        kind: SqlSourceKind::RecordArray,
                        expression: source,
                        row,
                    },
                    where_clause: Some(condition),
                })),
            )
        };

        let (body, diagnostics) = fx.translate(statement, &CompilerOptions::default());

        assert!(!diagnostics.has_errors());
        assert!(fx.calls(body, "__HS_SQL_DELETERECORD").is_empty());
        assert!(fx
            .ast
            .descendants(body)
            .into_iter()
            .any(|id| matches!(fx.ast.kind(id), NodeKind::Assignment { symbol, .. } if *symbol == people)));
    }
}
