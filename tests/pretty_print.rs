mod common;

use common::{P, Unit, verified};
use hsilc::{
    frontend::{ast::BinaryOperator, symbol::SymbolFlags, types::VariableType},
    middle::il::pretty_print::format_function,
};
use indoc::indoc;
use pretty_assertions::assert_eq;

#[test]
fn prints_one_instruction_per_line() {
    let mut unit = Unit::new();
    let f = unit.symbols.register_function(
        "f",
        P,
        &[("a", VariableType::Integer)],
        VariableType::Integer,
        SymbolFlags::empty(),
    );
    let a = unit.symbols.function(f).unwrap().arguments[0];

    unit.define(f, |c| {
        let read = c.variable(P, a);
        let one = c.integer(P, 1);
        let sum = c.binary(P, BinaryOperator::Add, read, one)?;
        c.return_value(P, Some(sum))?;
        Ok(())
    });

    let (result, _) = unit.compile(&verified());
    let module = result.unwrap();
    let function = module.function(f).unwrap();

    let text = format_function(&module, &unit.symbols, function);
    let text = String::from_utf8(strip_ansi_escapes::strip(text)).unwrap();

    assert_eq!(
        text,
        indoc! {"
            function F(A:1) {
            .block_0:
                _t0:1 = const 1
                _t1:1 = A:1 + _t0:1
                return _t1:1 ; uses :OUTSIDESTATE:1
            }
        "}
    );
}
