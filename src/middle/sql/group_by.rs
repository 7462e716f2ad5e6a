//! GROUP BY and aggregates. Matching rows are first collected into one
//! accumulator record per group (`__GROUP<n>` cells hold the key values,
//! `__AGG<n>` cells the arrays of aggregated values); a second loop over the
//! groups then evaluates HAVING and the select list with every grouped
//! expression and aggregate call redirected to the group record.

use crate::{
    error::Result,
    frontend::{
        ast::{
            Ast, BinaryOperator, Constant, DeepOperation, DeepOperationKind, Layer, LayerKind, NodeId,
            NodeKind, Position, SqlSelect, visit,
        },
        coder::AstCoder,
        intern::InternedSymbol,
        symbol::{SymbolFlags, SymbolId, SymbolTable},
        types::VariableType,
    },
};

/// One aggregate function call of the select list, HAVING or ORDER BY
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub call: NodeId,
    pub function: SymbolId,
    pub cell: InternedSymbol,
    /// The aggregated value, `None` for a row count
    pub argument: Option<NodeId>,
}

#[derive(Debug)]
pub struct Grouping {
    pub keys: Vec<NodeId>,
    pub aggregates: Vec<Aggregate>,
    /// The accumulator, a RECORD ARRAY with one record per group
    pub groups: SymbolId,
    position: Position,
}

fn key_cell(index: usize) -> InternedSymbol {
    InternedSymbol::new(&format!("__GROUP{index}"))
}

fn aggregate_cell(index: usize) -> InternedSymbol {
    InternedSymbol::new(&format!("__AGG{index}"))
}

pub fn is_aggregate(symbols: &SymbolTable, ast: &Ast, node: NodeId) -> bool {
    matches!(
        ast.kind(node),
        NodeKind::FunctionCall { function, .. } if symbols.flags(*function).contains(SymbolFlags::AGGREGATE)
    )
}

/// Whether an aggregate call occurs anywhere in the expression
pub fn contains_aggregate(symbols: &SymbolTable, ast: &Ast, node: NodeId) -> bool {
    ast.descendants(node)
        .into_iter()
        .any(|id| is_aggregate(symbols, ast, id))
}

impl Grouping {
    /// The grouping of a SELECT, `None` when it neither groups nor
    /// aggregates
    pub fn plan(coder: &mut AstCoder<'_>, select: &SqlSelect, position: Position) -> Option<Self> {
        let mut roots = select.items.iter().map(|item| item.expression).collect::<Vec<_>>();
        roots.extend(select.having);
        roots.extend(select.order_by.iter().map(|item| item.expression));

        let mut aggregates = Vec::new();
        for root in roots {
            for node in coder.ast.descendants(root) {
                let NodeKind::FunctionCall {
                    function,
                    arguments,
                } = coder.ast.kind(node)
                else {
                    continue;
                };
                let flags = coder.symbols.flags(*function);
                if !flags.contains(SymbolFlags::AGGREGATE) {
                    continue;
                }

                let argument = if flags.contains(SymbolFlags::IS_COUNT) {
                    None
                } else {
                    arguments.first().copied()
                };

                aggregates.push(Aggregate {
                    call: node,
                    function: *function,
                    cell: aggregate_cell(aggregates.len()),
                    argument,
                });
            }
        }

        if select.group_by.is_empty() && aggregates.is_empty() && select.having.is_none() {
            return None;
        }

        let groups = coder.temporary("groups", VariableType::RecordArray);

        tracing::debug!(
            keys = select.group_by.len(),
            aggregates = aggregates.len(),
            "grouped query"
        );

        Some(Self {
            keys: select.group_by.clone(),
            aggregates,
            groups,
            position,
        })
    }

    /// A fresh group record: key cells (when given) and empty accumulators
    fn group_record(&self, coder: &mut AstCoder<'_>, keys: Vec<NodeId>) -> NodeId {
        let p = self.position;
        let mut cells = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| (key_cell(i), key))
            .collect::<Vec<_>>();

        for aggregate in &self.aggregates {
            let empty = coder.default_value(p, VariableType::VariantArray);
            cells.push((aggregate.cell, empty));
        }

        coder.record_constructor(p, cells)
    }

    /// Declares the accumulator. Without GROUP BY all rows form one group,
    /// which exists even when no row matches.
    pub fn declare(&self, coder: &mut AstCoder<'_>) -> Result<()> {
        let p = self.position;

        let initial = if self.keys.is_empty() {
            let group = self.group_record(coder, Vec::new());
            coder.array_constructor(p, VariableType::RecordArray, vec![group])
        } else {
            coder.default_value(p, VariableType::RecordArray)
        };

        coder.declare(p, self.groups, Some(initial))?;
        Ok(())
    }

    /// Per matching row: find the group of the row, creating it when the row
    /// starts a new one, and append the aggregated values to its
    /// accumulators
    pub fn accumulate(&self, coder: &mut AstCoder<'_>) -> Result<()> {
        let p = self.position;

        let index = coder.temporary("group_position", VariableType::Integer);
        if self.keys.is_empty() {
            let zero = coder.integer(p, 0);
            coder.declare(p, index, Some(zero))?;
        } else {
            let fresh = coder.temporary("new_group", VariableType::Record);
            let record = self.group_record(coder, self.keys.clone());
            coder.declare(p, fresh, Some(record))?;

            // The lookup yields LENGTH(groups) for an unknown key
            let groups = coder.variable(p, self.groups);
            let key = coder.variable(p, fresh);
            let position = coder.builtin(p, "__HS_SQL_GETGROUPPOSITION", vec![groups, key])?;
            coder.declare(p, index, Some(position))?;

            let read = coder.variable(p, index);
            let groups = coder.variable(p, self.groups);
            let length = coder.builtin(p, "LENGTH", vec![groups])?;
            let is_new = coder.binary(p, BinaryOperator::Equal, read, length)?;
            coder.open_if(p, is_new);
            {
                let groups = coder.variable(p, self.groups);
                let record = coder.variable(p, fresh);
                let appended = coder.builtin(p, ":ARRAYAPPEND", vec![groups, record])?;
                let appended = coder.cast(p, appended, VariableType::RecordArray);
                coder.assign(p, self.groups, appended)?;
            }
            coder.close_if()?;
        }

        for aggregate in &self.aggregates {
            let value = match aggregate.argument {
                Some(argument) => argument,
                None => coder.integer(p, 1),
            };
            let at = coder.variable(p, index);
            let cell = coder.string(p, aggregate.cell.value());

            coder.deep_operation(
                p,
                DeepOperation {
                    kind: DeepOperationKind::ArrayInsert { at: None },
                    base: self.groups,
                    layers: vec![
                        Layer {
                            kind: LayerKind::Array,
                            key: at,
                        },
                        Layer {
                            kind: LayerKind::Record,
                            key: cell,
                        },
                    ],
                    value: Some(value),
                },
            )?;
        }

        Ok(())
    }

    /// A copy of `node` that reads grouped expressions and aggregates from
    /// the group record in `group`
    pub fn rewrite(&self, coder: &mut AstCoder<'_>, node: NodeId, group: SymbolId) -> NodeId {
        let p = coder.ast.position(node);

        if let Some(i) = self.keys.iter().position(|key| coder.ast.same_expression(*key, node)) {
            let ty = coder.types.get(node).unwrap_or(VariableType::Variant);
            let record = coder.variable(p, group);
            return coder.record_column(p, record, key_cell(i), ty);
        }

        if let Some(aggregate) = self.aggregates.iter().find(|a| a.call == node) {
            let record = coder.variable(p, group);
            let values = coder.record_column(p, record, aggregate.cell, VariableType::VariantArray);

            let NodeKind::FunctionCall { arguments, .. } = coder.ast.kind(node).clone() else {
                return values;
            };
            let rest = if aggregate.argument.is_some() {
                arguments.iter().skip(1).map(|a| coder.deep_copy(*a)).collect::<Vec<_>>()
            } else {
                Vec::new()
            };

            let ty = coder.types.get(node).unwrap_or(VariableType::Variant);
            let call = coder.ast.push(
                p,
                NodeKind::FunctionCall {
                    function: aggregate.function,
                    arguments: std::iter::once(values).chain(rest).collect(),
                },
            );
            coder.types.set(call, ty);
            return call;
        }

        let kind = coder.ast.kind(node).clone();
        let kind = visit::map_children(&kind, |child| self.rewrite(coder, child, group));

        let copy = coder.ast.push(p, kind);
        if let Ok(ty) = coder.types.get(node) {
            coder.types.set(copy, ty);
        }
        copy
    }

    /// Loops over the groups, binding each group record in turn. The body
    /// is built by `per_group`.
    pub fn for_each_group(
        &self,
        coder: &mut AstCoder<'_>,
        per_group: impl FnOnce(&mut AstCoder<'_>, SymbolId) -> Result<()>,
    ) -> Result<()> {
        let p = self.position;

        let group = coder.temporary("group", VariableType::Record);
        let index = coder.temporary("group_index", VariableType::Integer);
        let zero = coder.integer(p, 0);
        coder.declare(p, index, Some(zero))?;

        let read = coder.variable(p, index);
        let groups = coder.variable(p, self.groups);
        let length = coder.builtin(p, "LENGTH", vec![groups])?;
        let condition = coder.binary(p, BinaryOperator::Less, read, length)?;

        coder.open_loop(p, Some(condition));

        let groups = coder.variable(p, self.groups);
        let read = coder.variable(p, index);
        let element = coder.builtin(p, ":ARRAYINDEX", vec![groups, read])?;
        let element = coder.cast(p, element, VariableType::Record);
        coder.assign(p, group, element)?;

        per_group(coder, group)?;

        let read = coder.variable(p, index);
        let one = coder.constant(p, Constant::Integer(1));
        let next = coder.binary(p, BinaryOperator::Add, read, one)?;
        let increment = coder.assignment_node(p, index, next);
        coder.close_loop(Some(increment))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{
        ast::SelectItem,
        types::TypeStorage,
    };

    const P: Position = Position::new(2, 5);

    #[test]
    fn rewrite_redirects_keys_and_aggregates() {
        let mut ast = Ast::new();
        let mut types = TypeStorage::new();
        let mut symbols = SymbolTable::new();
        symbols.register_builtins();
        let row = symbols.register_variable("row", P, VariableType::Record, SymbolFlags::empty());
        let sum = symbols.register_function(
            "SUM",
            P,
            &[("values", VariableType::VariantArray)],
            VariableType::Integer,
            SymbolFlags::AGGREGATE | SymbolFlags::NO_STATE_MODIFY,
        );
        let mut coder = AstCoder::new(&mut ast, &mut types, &mut symbols);

        let kind = {
            let record = coder.variable(P, row);
            coder.record_column(P, record, InternedSymbol::new("KIND"), VariableType::String)
        };
        let amount = {
            let record = coder.variable(P, row);
            coder.record_column(P, record, InternedSymbol::new("AMOUNT"), VariableType::Integer)
        };
        let total = coder.call(P, sum, vec![amount]).unwrap();
        let kind_again = {
            let record = coder.variable(P, row);
            coder.record_column(P, record, InternedSymbol::new("KIND"), VariableType::String)
        };

        let select = SqlSelect {
            sources: vec![],
            temporaries: vec![],
            where_clause: None,
            items: vec![
                SelectItem {
                    name: InternedSymbol::new("KIND"),
                    expression: kind_again,
                },
                SelectItem {
                    name: InternedSymbol::new("TOTAL"),
                    expression: total,
                },
            ],
            group_by: vec![kind],
            having: None,
            order_by: vec![],
            limit: None,
        };

        let grouping = Grouping::plan(&mut coder, &select, P).unwrap();
        assert_eq!(grouping.aggregates.len(), 1);
        assert_eq!(grouping.aggregates[0].argument, Some(amount));

        let group = coder.temporary("group", VariableType::Record);

        let rewritten = grouping.rewrite(&mut coder, kind_again, group);
        let NodeKind::RecordColumn { record, column } = coder.ast.kind(rewritten) else {
            panic!("expected a group cell read");
        };
        assert_eq!(*column, InternedSymbol::new("__GROUP0"));
        assert_eq!(coder.ast.kind(*record), &NodeKind::Variable(group));

        let rewritten = grouping.rewrite(&mut coder, total, group);
        let NodeKind::FunctionCall {
            function,
            arguments,
        } = coder.ast.kind(rewritten)
        else {
            panic!("expected the aggregate call");
        };
        assert_eq!(*function, sum);
        assert!(matches!(
            coder.ast.kind(arguments[0]),
            NodeKind::RecordColumn { column, .. } if *column == InternedSymbol::new("__AGG0")
        ));
    }

    #[test]
    fn unknown_keys_start_a_new_group() {
        let mut ast = Ast::new();
        let mut types = TypeStorage::new();
        let mut symbols = SymbolTable::new();
        symbols.register_builtins();
        let row = symbols.register_variable("row", P, VariableType::Record, SymbolFlags::empty());
        let mut coder = AstCoder::new(&mut ast, &mut types, &mut symbols);

        let kind = {
            let record = coder.variable(P, row);
            coder.record_column(P, record, InternedSymbol::new("KIND"), VariableType::String)
        };
        let item = coder.deep_copy(kind);
        let select = SqlSelect {
            sources: vec![],
            temporaries: vec![],
            where_clause: None,
            items: vec![SelectItem {
                name: InternedSymbol::new("KIND"),
                expression: item,
            }],
            group_by: vec![kind],
            having: None,
            order_by: vec![],
            limit: None,
        };
        let grouping = Grouping::plan(&mut coder, &select, P).unwrap();

        coder.open_block(P);
        grouping.declare(&mut coder).unwrap();
        grouping.accumulate(&mut coder).unwrap();
        let block = coder.close_block().unwrap();

        let append = coder.symbols.resolve_builtin(":ARRAYAPPEND").unwrap();
        let appends = |ast: &Ast, root: NodeId| {
            ast.descendants(root)
                .into_iter()
                .filter(|id| match ast.kind(*id) {
                    NodeKind::Assignment { symbol, value } if *symbol == grouping.groups => ast
                        .descendants(*value)
                        .into_iter()
                        .any(|v| matches!(ast.kind(v), NodeKind::FunctionCall { function, .. } if *function == append)),
                    _ => false,
                })
                .count()
        };

        let ast = &*coder.ast;
        let conditional = ast
            .descendants(block)
            .into_iter()
            .find(|id| matches!(ast.kind(*id), NodeKind::If { .. }))
            .expect("a group creation branch");
        let NodeKind::If { then_branch, else_branch, .. } = ast.kind(conditional).clone() else {
            unreachable!();
        };

        assert_eq!(appends(ast, then_branch), 1);
        assert_eq!(else_branch, None);
        assert_eq!(appends(ast, block), 1);
    }

    #[test]
    fn plain_select_has_no_grouping() {
        let mut ast = Ast::new();
        let mut types = TypeStorage::new();
        let mut symbols = SymbolTable::new();
        let mut coder = AstCoder::new(&mut ast, &mut types, &mut symbols);

        let one = coder.integer(P, 1);
        let select = SqlSelect {
            sources: vec![],
            temporaries: vec![],
            where_clause: None,
            items: vec![SelectItem {
                name: InternedSymbol::new("ONE"),
                expression: one,
            }],
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
        };

        assert!(Grouping::plan(&mut coder, &select, P).is_none());
    }
}
