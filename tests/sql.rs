mod common;

use common::{P, Unit, calls_to, verified};
use hsilc::{
    diagnostics::ErrorCode,
    frontend::{
        ast::{BinaryOperator, Constant, NodeId, NodeKind, SelectItem, SqlSelect, SqlSource, SqlSourceKind},
        coder::AstCoder,
        intern::InternedSymbol,
        symbol::{SymbolFlags, SymbolId, TableColumn, TableDefinition},
        types::VariableType,
    },
    options::CompilerOptions,
};
use pretty_assertions::assert_eq;

fn table(columns: &[(&str, VariableType)]) -> TableDefinition {
    TableDefinition {
        columns: columns
            .iter()
            .map(|(name, ty)| TableColumn {
                name: InternedSymbol::new(name),
                ty: *ty,
                read_only: false,
            })
            .collect(),
    }
}

fn column(c: &mut AstCoder<'_>, row: SymbolId, name: &str, ty: VariableType) -> NodeId {
    let record = c.variable(P, row);
    c.record_column(P, record, InternedSymbol::new(name), ty)
}

fn source(c: &mut AstCoder<'_>, kind: SqlSourceKind, expression: SymbolId, row: SymbolId) -> SqlSource {
    SqlSource {
        position: P,
        kind,
        expression: c.variable(P, expression),
        row,
    }
}

fn select(c: &mut AstCoder<'_>, sources: Vec<SqlSource>, items: Vec<SelectItem>, where_clause: NodeId) -> NodeId {
    let query = c.ast.push(
        P,
        NodeKind::SqlSelect(Box::new(SqlSelect {
            sources,
            temporaries: vec![],
            where_clause: Some(where_clause),
            items,
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
        })),
    );
    c.types.set(query, VariableType::RecordArray);
    query
}

/// The operator strings of every condition record handed to the cursor
fn pushed_conditions(unit: &Unit, root: NodeId) -> Vec<String> {
    unit.ast
        .descendants(root)
        .into_iter()
        .filter_map(|id| match unit.ast.kind(id) {
            NodeKind::RecordConstructor(cells) => cells
                .iter()
                .find(|(name, _)| name.value() == "CONDITION")
                .and_then(|(_, value)| match unit.ast.kind(*value) {
                    NodeKind::Constant(Constant::String(operator)) => Some(operator.clone()),
                    _ => None,
                }),
            _ => None,
        })
        .collect()
}

struct Tables {
    f: SymbolId,
    x: SymbolId,
    found: SymbolId,
    t: SymbolId,
    t_row: SymbolId,
    t2: SymbolId,
    t2_row: SymbolId,
}

fn tables(unit: &mut Unit) -> Tables {
    let t = unit.symbols.register_table(
        "t",
        P,
        table(&[
            ("A", VariableType::Integer),
            ("B", VariableType::Integer),
            ("C", VariableType::String),
        ]),
        SymbolFlags::IMPORTED,
    );
    let t2 = unit
        .symbols
        .register_table("t2", P, table(&[("B", VariableType::Integer)]), SymbolFlags::IMPORTED);
    let f = unit.symbols.register_function(
        "f",
        P,
        &[("x", VariableType::Integer)],
        VariableType::NoReturn,
        SymbolFlags::empty(),
    );
    let x = unit.symbols.function(f).unwrap().arguments[0];

    Tables {
        f,
        x,
        found: unit.local("found", VariableType::RecordArray),
        t,
        t_row: unit.local("t", VariableType::Record),
        t2,
        t2_row: unit.local("t2", VariableType::Record),
    }
}

#[test]
fn guarded_where_pushes_both_arms_into_the_cursor() {
    let mut unit = Unit::new();
    let s = tables(&mut unit);

    // t.a = 5 AND (x > 3 ? t.b = t2.b : t.c LIKE '%foo%')
    unit.define(s.f, |c| {
        let a = column(c, s.t_row, "A", VariableType::Integer);
        let five = c.integer(P, 5);
        let directive = c.binary(P, BinaryOperator::Equal, a, five)?;

        let x = c.variable(P, s.x);
        let three = c.integer(P, 3);
        let guard = c.binary(P, BinaryOperator::Greater, x, three)?;
        let b = column(c, s.t_row, "B", VariableType::Integer);
        let b2 = column(c, s.t2_row, "B", VariableType::Integer);
        let relation = c.binary(P, BinaryOperator::Equal, b, b2)?;
        let text = column(c, s.t_row, "C", VariableType::String);
        let pattern = c.string(P, "%foo%");
        let like = c.binary(P, BinaryOperator::Like, text, pattern)?;
        let branch = c.conditional(P, guard, relation, like)?;

        let where_clause = c.binary(P, BinaryOperator::And, directive, branch)?;
        let item = column(c, s.t_row, "A", VariableType::Integer);
        let sources = vec![
            source(c, SqlSourceKind::Table, s.t, s.t_row),
            source(c, SqlSourceKind::Table, s.t2, s.t2_row),
        ];
        let query = select(
            c,
            sources,
            vec![SelectItem {
                name: InternedSymbol::new("A"),
                expression: item,
            }],
            where_clause,
        );
        c.assign(P, s.found, query)?;
        Ok(())
    });

    let (result, diagnostics) = unit.compile(&verified());
    let module = result.unwrap();
    assert_eq!(diagnostics.iter().count(), 0);

    let mut operators = pushed_conditions(&unit, unit.body(s.f));
    operators.sort();
    assert_eq!(operators, vec!["=", "=", "LIKE"]);

    let function = module.function(s.f).unwrap();
    assert_eq!(calls_to(function, &unit.symbols, "__HS_SQL_OPENCURSOR2"), 1);
    assert_eq!(calls_to(function, &unit.symbols, "__HS_SQL_REPORTFASE1RESULT"), 1);
}

#[test]
fn without_pushdown_the_cursor_gets_no_conditions() {
    let mut unit = Unit::new();
    let s = tables(&mut unit);

    unit.define(s.f, |c| {
        let a = column(c, s.t_row, "A", VariableType::Integer);
        let x = c.variable(P, s.x);
        let where_clause = c.binary(P, BinaryOperator::Equal, a, x)?;
        let item = column(c, s.t_row, "C", VariableType::String);
        let sources = vec![source(c, SqlSourceKind::Table, s.t, s.t_row)];
        let query = select(
            c,
            sources,
            vec![SelectItem {
                name: InternedSymbol::new("C"),
                expression: item,
            }],
            where_clause,
        );
        c.assign(P, s.found, query)?;
        Ok(())
    });

    let options = CompilerOptions {
        no_sql_pushdown: true,
        ..verified()
    };
    let (result, diagnostics) = unit.compile(&options);
    let module = result.unwrap();
    assert!(!diagnostics.has_errors());

    assert!(pushed_conditions(&unit, unit.body(s.f)).is_empty());
    let function = module.function(s.f).unwrap();
    assert_eq!(calls_to(function, &unit.symbols, "__HS_SQL_OPENCURSOR2"), 1);
}

#[test]
fn record_array_query_compiles_to_a_plain_loop() {
    let mut unit = Unit::new();
    let f = unit.symbols.register_function(
        "f",
        P,
        &[("people", VariableType::RecordArray), ("limit", VariableType::Integer)],
        VariableType::RecordArray,
        SymbolFlags::empty(),
    );
    let arguments = unit.symbols.function(f).unwrap().arguments.clone();
    let (people, limit) = (arguments[0], arguments[1]);
    let row = unit.local("p", VariableType::Record);

    unit.define(f, |c| {
        let age = column(c, row, "AGE", VariableType::Integer);
        let bound = c.variable(P, limit);
        let where_clause = c.binary(P, BinaryOperator::Greater, age, bound)?;
        let name = column(c, row, "NAME", VariableType::String);
        let sources = vec![source(c, SqlSourceKind::RecordArray, people, row)];
        let query = select(
            c,
            sources,
            vec![SelectItem {
                name: InternedSymbol::new("NAME"),
                expression: name,
            }],
            where_clause,
        );
        c.return_value(P, Some(query))?;
        Ok(())
    });

    let (result, diagnostics) = unit.compile(&verified());
    let module = result.unwrap();
    assert!(!diagnostics.has_errors());

    let function = module.function(f).unwrap();
    assert_eq!(calls_to(function, &unit.symbols, "__HS_SQL_OPENCURSOR2"), 0);
    assert_eq!(calls_to(function, &unit.symbols, ":ARRAYINDEX"), 1);
}

#[test]
fn independent_where_is_reported_through_the_pipeline() {
    let mut unit = Unit::new();
    let s = tables(&mut unit);

    unit.define(s.f, |c| {
        let x = c.variable(P, s.x);
        let three = c.integer(P, 3);
        let where_clause = c.binary(P, BinaryOperator::Greater, x, three)?;
        let item = column(c, s.t_row, "A", VariableType::Integer);
        let sources = vec![source(c, SqlSourceKind::Table, s.t, s.t_row)];
        let query = select(
            c,
            sources,
            vec![SelectItem {
                name: InternedSymbol::new("A"),
                expression: item,
            }],
            where_clause,
        );
        c.assign(P, s.found, query)?;
        Ok(())
    });

    let (_, diagnostics) = unit.compile(&CompilerOptions::default());

    assert_eq!(diagnostics.errors().collect::<Vec<_>>(), vec![ErrorCode::IndependentWhere]);
}

#[test]
fn grouped_query_creates_groups_and_filters_them_with_having() {
    let mut unit = Unit::new();
    let sum = unit.symbols.register_function(
        "sum",
        P,
        &[("values", VariableType::VariantArray)],
        VariableType::Integer,
        SymbolFlags::AGGREGATE | SymbolFlags::NO_STATE_MODIFY,
    );
    let f = unit.symbols.register_function(
        "f",
        P,
        &[("orders", VariableType::RecordArray)],
        VariableType::RecordArray,
        SymbolFlags::empty(),
    );
    let orders = unit.symbols.function(f).unwrap().arguments[0];
    let row = unit.local("o", VariableType::Record);

    // SELECT kind, total := SUM(amount) FROM orders AS o GROUP BY o.kind HAVING SUM(o.amount) > 10
    unit.define(f, |c| {
        let key = column(c, row, "KIND", VariableType::String);
        let kind = column(c, row, "KIND", VariableType::String);
        let amount = column(c, row, "AMOUNT", VariableType::Integer);
        let total = c.call(P, sum, vec![amount])?;
        let amount = column(c, row, "AMOUNT", VariableType::Integer);
        let filtered = c.call(P, sum, vec![amount])?;
        let ten = c.integer(P, 10);
        let having = c.binary(P, BinaryOperator::Greater, filtered, ten)?;
        let sources = vec![source(c, SqlSourceKind::RecordArray, orders, row)];

        let query = c.ast.push(
            P,
            NodeKind::SqlSelect(Box::new(SqlSelect {
                sources,
                temporaries: vec![],
                where_clause: None,
                items: vec![
                    SelectItem {
                        name: InternedSymbol::new("KIND"),
                        expression: kind,
                    },
                    SelectItem {
                        name: InternedSymbol::new("TOTAL"),
                        expression: total,
                    },
                ],
                group_by: vec![key],
                having: Some(having),
                order_by: vec![],
                limit: None,
            })),
        );
        c.types.set(query, VariableType::RecordArray);
        c.return_value(P, Some(query))?;
        Ok(())
    });

    let (result, diagnostics) = unit.compile(&verified());
    let module = result.unwrap();
    assert_eq!(diagnostics.iter().count(), 0);

    let ast = &unit.ast;
    let symbols = &unit.symbols;
    let nodes = ast.descendants(unit.body(f));
    let calls = |name: &str| {
        nodes
            .iter()
            .copied()
            .filter(|id| {
                matches!(ast.kind(*id), NodeKind::FunctionCall { function, .. } if symbols.name(*function) == name)
            })
            .collect::<Vec<_>>()
    };

    let [lookup] = calls("__HS_SQL_GETGROUPPOSITION")[..] else {
        panic!("expected a single group lookup");
    };
    let NodeKind::FunctionCall { arguments, .. } = ast.kind(lookup) else {
        unreachable!();
    };
    let NodeKind::Variable(groups) = *ast.kind(arguments[0]) else {
        panic!("group lookup does not read the accumulator");
    };

    // IF (position = LENGTH(groups)) groups := groups CONCAT [new group];
    let creations = nodes
        .iter()
        .filter_map(|id| match ast.kind(*id) {
            NodeKind::If {
                then_branch,
                else_branch: None,
                ..
            } => Some(*then_branch),
            _ => None,
        })
        .filter(|then_branch| {
            ast.descendants(*then_branch).into_iter().any(|id| {
                matches!(
                    ast.kind(id),
                    NodeKind::Assignment { symbol, value }
                        if *symbol == groups
                            && ast.descendants(*value).into_iter().any(|v| calls(":ARRAYAPPEND").contains(&v))
                )
            })
        })
        .count();
    assert_eq!(creations, 1);

    let function = module.function(f).unwrap();
    assert_eq!(calls_to(function, &unit.symbols, "__HS_SQL_GETGROUPPOSITION"), 1);
    assert_eq!(calls_to(function, &unit.symbols, "__HS_SQL_OPENCURSOR2"), 0);
    // the select list and HAVING each aggregate once per group
    assert_eq!(calls_to(function, &unit.symbols, "SUM"), 2);
}
